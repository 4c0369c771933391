//! Pool member controller.
//!
//! Runs on every replica. Claims one member lease, keeps renewing it, and
//! tells listeners when it was acquired, lost, or released.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::controller::{Controller, CycleGuard};
use crate::events::{MemberLeaseEvent, MemberLeaseEventKind, MemberLeaseListener};
use crate::service::LeaseService;
use crate::LeaseError;

pub struct MemberController {
    service: Arc<LeaseService>,
    pod_name: String,
    enabled: bool,
    job_name: String,
    listeners: Vec<Arc<dyn MemberLeaseListener>>,
    lease_name: Mutex<Option<String>>,
    guard: CycleGuard,
}

impl std::fmt::Debug for MemberController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberController")
            .field("pod_name", &self.pod_name)
            .field("enabled", &self.enabled)
            .field("lease_name", &self.lease_name())
            .finish_non_exhaustive()
    }
}

impl MemberController {
    pub fn new(
        service: Arc<LeaseService>,
        pod_name: impl Into<String>,
        enabled: bool,
        listeners: Vec<Arc<dyn MemberLeaseListener>>,
    ) -> Self {
        let job_name = format!("flow-pool-member-scheduler-{}", service.pool_name());
        if !enabled {
            info!(pool = service.pool_name(), "member controller disabled");
        }
        Self {
            service,
            pod_name: pod_name.into(),
            enabled,
            job_name,
            listeners,
            lease_name: Mutex::new(None),
            guard: CycleGuard::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Name of the member lease this process holds, if any.
    pub fn lease_name(&self) -> Option<String> {
        self.lease_name
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn has_lease(&self) -> bool {
        self.lease_name().is_some()
    }

    fn set_lease_name(&self, name: Option<String>) {
        *self.lease_name.lock().unwrap_or_else(|e| e.into_inner()) = name;
    }

    fn emit(&self, kind: MemberLeaseEventKind, lease_name: &str) {
        let event = MemberLeaseEvent {
            kind,
            pool_name: self.service.pool_name().to_string(),
            pod_name: self.pod_name.clone(),
            lease_name: lease_name.to_string(),
        };
        for listener in &self.listeners {
            listener.on_member_lease_event(&event);
        }
    }

    /// Renews the held lease, or claims one if none is held. Returns whether
    /// a lease is held afterwards.
    ///
    /// A failed renewal clears the held lease and emits `Lost`; the next
    /// call starts over with a fresh acquisition.
    pub async fn acquire_lease(&self) -> Result<bool, LeaseError> {
        let pool = self.service.pool_name();

        if let Some(held) = self.lease_name() {
            if self
                .service
                .renew_lease_by_name(&held, &self.pod_name)
                .await?
                .is_some()
            {
                debug!(lease = %held, pod = %self.pod_name, "member lease renewed");
                return Ok(true);
            }
            warn!(lease = %held, pod = %self.pod_name, "member lease lost");
            self.set_lease_name(None);
            self.emit(MemberLeaseEventKind::Lost, &held);
            return Ok(false);
        }

        match self
            .service
            .try_acquire_member_lease(&self.pod_name, pool)
            .await?
        {
            Some(lease) => {
                let name = lease.name().to_string();
                info!(lease = %name, pod = %self.pod_name, pool, "member lease acquired");
                self.set_lease_name(Some(name.clone()));
                self.emit(MemberLeaseEventKind::Acquired, &name);
                Ok(true)
            }
            None => {
                warn!(
                    pod = %self.pod_name,
                    pool,
                    "no member lease available, not eligible for work yet"
                );
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Controller for MemberController {
    fn job_name(&self) -> &str {
        &self.job_name
    }

    async fn run_cycle(&self) {
        if !self.enabled {
            return;
        }
        let Some(_token) = self.guard.try_enter() else {
            debug!(job = %self.job_name, "previous member cycle still running, skipping");
            return;
        };

        if let Err(e) = self.acquire_lease().await {
            warn!(pod = %self.pod_name, "member lease cycle failed: {e}");
        }
    }

    async fn release(&self) {
        let Some(name) = self.lease_name() else {
            return;
        };
        match self.service.release_lease(&self.pod_name, &name).await {
            Ok(true) => {
                debug!(lease = %name, pod = %self.pod_name, "member lease released");
                self.set_lease_name(None);
                self.emit(MemberLeaseEventKind::Released, &name);
            }
            Ok(false) => debug!(lease = %name, "member lease changed during release"),
            Err(e) => debug!(lease = %name, "member lease release failed: {e}"),
        }
    }
}
