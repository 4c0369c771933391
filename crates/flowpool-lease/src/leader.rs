//! Pool leader controller.
//!
//! Runs on every replica. Whichever replica holds the leader lease makes
//! sure one member lease exists per desired replica, each with the managed
//! labels and the current TTL and owner. The others do nothing.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::controller::{Controller, CycleGuard};
use crate::lease;
use crate::service::LeaseService;
use crate::LeaseError;

pub struct LeaderController {
    service: Arc<LeaseService>,
    pod_name: String,
    enabled: bool,
    job_name: String,
    guard: CycleGuard,
}

impl std::fmt::Debug for LeaderController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderController")
            .field("pod_name", &self.pod_name)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl LeaderController {
    pub fn new(service: Arc<LeaseService>, pod_name: impl Into<String>, enabled: bool) -> Self {
        let job_name = format!("flow-pool-leader-scheduler-{}", service.pool_name());
        if !enabled {
            info!(pool = service.pool_name(), "leader controller disabled");
        }
        Self {
            service,
            pod_name: pod_name.into(),
            enabled,
            job_name,
            guard: CycleGuard::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn leader_lease_name(&self) -> String {
        lease::leader_lease_name(self.service.pool_name())
    }

    /// Claims or renews the leader lease and, if held, reconciles every
    /// member lease. Returns whether this replica is the leader.
    ///
    /// A member lease that fails to reconcile is logged and skipped; the
    /// remaining ordinals are still processed.
    pub async fn reconcile(&self) -> Result<bool, LeaseError> {
        let leader_lease = self.leader_lease_name();
        if !self
            .service
            .try_acquire_leader_lease(&self.pod_name, &leader_lease)
            .await?
        {
            return Ok(false);
        }

        let pool = self.service.pool_name();
        debug!(lease = %leader_lease, pool, "pool leader reconciliation running");

        let Some(replicas) = self.service.desired_replicas().await? else {
            return Ok(true);
        };
        for ordinal in 0..u32::try_from(replicas).unwrap_or(0) {
            let name = lease::member_lease_name(pool, ordinal);
            match self.service.create_or_update_member_lease(&name).await {
                Ok(member) => debug!(lease = member.name(), pool, "member lease reconciled"),
                Err(e) => warn!(lease = %name, pool, "failed to reconcile member lease: {e}"),
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl Controller for LeaderController {
    fn job_name(&self) -> &str {
        &self.job_name
    }

    async fn run_cycle(&self) {
        if !self.enabled {
            return;
        }
        let Some(_token) = self.guard.try_enter() else {
            debug!(job = %self.job_name, "previous leader cycle still running, skipping");
            return;
        };

        match self.reconcile().await {
            Ok(true) => {}
            Ok(false) => debug!(pod = %self.pod_name, "not the leader, skipping reconcile"),
            Err(e) => warn!(pod = %self.pod_name, "leader reconcile failed: {e}"),
        }
    }

    async fn release(&self) {
        if !self.enabled {
            return;
        }
        let name = self.leader_lease_name();
        match self.service.release_lease(&self.pod_name, &name).await {
            Ok(true) => debug!(lease = %name, pod = %self.pod_name, "leader lease released"),
            Ok(false) => debug!(lease = %name, "leader lease changed during release"),
            Err(e) => debug!(lease = %name, "leader lease release failed: {e}"),
        }
    }
}
