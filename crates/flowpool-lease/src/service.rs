//! Lease operations over the resource store.
//!
//! Every acquire path shares one availability rule (see
//! [`Lease::is_available_to`]) and one renewal routine. Conflicts on writes
//! mean another replica got there first: they surface as "not acquired"
//! (`Ok(None)` / `Ok(false)`), never as errors. Any other store failure is
//! returned to the caller, which is a controller cycle that logs it and
//! retries on its next tick.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::clock::Clock;
use crate::lease::{self, Lease, LeaseSpec};
use crate::meta::ObjectMeta;
use crate::settings::PoolSettings;
use crate::store::ResourceStore;
use crate::topology::PoolTopology;
use crate::LeaseError;

/// TTLs and scope for the leases a [`LeaseService`] manages.
#[derive(Debug, Clone)]
pub struct LeaseServiceConfig {
    pub namespace: String,
    pub pool_name: String,
    pub member_duration_secs: i32,
    pub leader_duration_secs: i32,
}

impl LeaseServiceConfig {
    pub fn from_settings(namespace: impl Into<String>, settings: &PoolSettings) -> Self {
        Self {
            namespace: namespace.into(),
            pool_name: settings.pool.name.clone(),
            member_duration_secs: settings.lease.member.duration_secs,
            leader_duration_secs: settings.lease.leader.duration_secs,
        }
    }
}

/// Create, acquire, renew and release pool leases.
pub struct LeaseService {
    store: Arc<dyn ResourceStore>,
    topology: Arc<dyn PoolTopology>,
    clock: Arc<dyn Clock>,
    config: LeaseServiceConfig,
}

impl std::fmt::Debug for LeaseService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LeaseService {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        topology: Arc<dyn PoolTopology>,
        clock: Arc<dyn Clock>,
        config: LeaseServiceConfig,
    ) -> Self {
        Self {
            store,
            topology,
            clock,
            config,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn pool_name(&self) -> &str {
        &self.config.pool_name
    }

    /// Ensures the member lease `name` exists with the configured TTL and
    /// pool labels, creating it unclaimed if absent.
    pub async fn create_or_update_member_lease(&self, name: &str) -> Result<Lease, LeaseError> {
        self.create_or_update_lease(name, false, self.config.member_duration_secs)
            .await
    }

    async fn create_or_update_leader_lease(&self, name: &str) -> Result<Lease, LeaseError> {
        self.create_or_update_lease(name, true, self.config.leader_duration_secs)
            .await
    }

    async fn create_or_update_lease(
        &self,
        name: &str,
        is_leader: bool,
        duration_secs: i32,
    ) -> Result<Lease, LeaseError> {
        let ns = self.namespace();
        let labels = lease::managed_labels(self.pool_name(), is_leader);

        if let Some(existing) = self.store.get_lease(ns, name).await? {
            debug!(lease = name, "lease exists, reconciling managed fields");
            return self.update_managed_fields(existing, labels, duration_secs).await;
        }

        let mut metadata = ObjectMeta::named(name, ns);
        metadata.labels = labels;
        metadata.owner_references = self.topology.lease_owner_references().await?;
        let to_create = Lease {
            metadata,
            spec: LeaseSpec {
                lease_duration_seconds: Some(duration_secs),
                ..LeaseSpec::default()
            },
        };

        debug!(lease = name, namespace = ns, "creating lease");
        match self.store.create_lease(&to_create).await {
            Ok(created) => Ok(created),
            Err(e) if e.is_conflict() => {
                // another replica created it first; take theirs
                debug!(lease = name, "lease created concurrently, re-reading");
                self.store
                    .get_lease(ns, name)
                    .await?
                    .ok_or_else(|| LeaseError::lease_not_found(name))
            }
            Err(e) => Err(e),
        }
    }

    /// Writes TTL and labels only when they drift from the target. Labels
    /// added by others are kept.
    async fn update_managed_fields(
        &self,
        existing: Lease,
        labels: BTreeMap<String, String>,
        duration_secs: i32,
    ) -> Result<Lease, LeaseError> {
        let mut merged = existing.metadata.labels.clone();
        merged.extend(labels);

        let ttl_differs = existing.spec.lease_duration_seconds != Some(duration_secs);
        let labels_differ = merged != existing.metadata.labels;
        if !ttl_differs && !labels_differ {
            return Ok(existing);
        }

        let mut updated = existing.clone();
        updated.metadata.labels = merged;
        updated.spec.lease_duration_seconds = Some(duration_secs);

        match self.store.update_lease(&updated).await {
            Ok(lease) => Ok(lease),
            Err(e) if e.is_conflict() => {
                let name = existing.name().to_string();
                debug!(lease = %name, "managed field update conflicted");
                let latest = self.store.get_lease(self.namespace(), &name).await?;
                Ok(latest.unwrap_or(existing))
            }
            Err(e) => Err(e),
        }
    }

    /// Claims or refreshes `lease` for `holder`.
    ///
    /// Returns `Ok(None)` if the conditional write lost a race. The caller
    /// is responsible for checking availability first.
    pub async fn renew_lease(
        &self,
        lease: &Lease,
        holder: &str,
    ) -> Result<Option<Lease>, LeaseError> {
        debug!(lease = lease.name(), holder, "renewing lease");
        let now = self.clock.now();
        let mut renewed = lease.clone();
        let spec = &mut renewed.spec;

        let previous = lease.holder();
        spec.renew_time = Some(now);
        spec.holder_identity = Some(holder.to_string());
        if spec.acquire_time.is_none() {
            spec.acquire_time = Some(now);
        }
        // an unclaimed lease being claimed is not a transition
        if previous.is_some_and(|p| p != holder) {
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
            spec.acquire_time = Some(now);
        }

        match self.store.update_lease(&renewed).await {
            Ok(stored) => {
                debug!(lease = stored.name(), holder, "lease renewed");
                Ok(Some(stored))
            }
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!(lease = lease.name(), holder, "lease renewal lost: {e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Renews the lease named `name` for `holder`, re-reading it first.
    /// Returns `Ok(None)` if it no longer exists, is held by someone else,
    /// or the write lost a race.
    pub async fn renew_lease_by_name(
        &self,
        name: &str,
        holder: &str,
    ) -> Result<Option<Lease>, LeaseError> {
        let Some(lease) = self.store.get_lease(self.namespace(), name).await? else {
            return Ok(None);
        };
        if !lease.is_available_to(holder, self.clock.now()) {
            return Ok(None);
        }
        self.renew_lease(&lease, holder).await
    }

    /// Attempts to become (or stay) the pool leader.
    pub async fn try_acquire_leader_lease(
        &self,
        holder: &str,
        leader_lease_name: &str,
    ) -> Result<bool, LeaseError> {
        debug!(lease = leader_lease_name, holder, "attempting to acquire leader lease");
        let existing = self
            .store
            .get_lease(self.namespace(), leader_lease_name)
            .await?;
        let lease = match existing {
            Some(lease) => lease,
            None => self.create_or_update_leader_lease(leader_lease_name).await?,
        };

        if !lease.is_available_to(holder, self.clock.now()) {
            return Ok(false);
        }
        Ok(self.renew_lease(&lease, holder).await?.is_some())
    }

    /// Claims a member lease of `pool` for `holder`.
    ///
    /// A lease `holder` already holds wins over any other, so a process
    /// keeps its identity across cycles. Otherwise the first available lease
    /// in name order is claimed. Returns `Ok(None)` when nothing could be
    /// claimed.
    pub async fn try_acquire_member_lease(
        &self,
        holder: &str,
        pool: &str,
    ) -> Result<Option<Lease>, LeaseError> {
        debug!(pool, holder, "attempting to acquire a member lease");
        let mut leases = self
            .store
            .list_leases(self.namespace(), &lease::member_selector(pool))
            .await?;
        if leases.is_empty() {
            return Ok(None);
        }
        leases.sort_by(|a, b| a.name().cmp(b.name()));

        for l in leases.iter().filter(|l| l.is_held_by(holder)) {
            if let Some(renewed) = self.renew_lease(l, holder).await? {
                return Ok(Some(renewed));
            }
        }

        let now = self.clock.now();
        for l in leases.iter().filter(|l| l.is_available_to(holder, now)) {
            if let Some(renewed) = self.renew_lease(l, holder).await? {
                return Ok(Some(renewed));
            }
        }

        Ok(None)
    }

    /// Like [`try_acquire_member_lease`](Self::try_acquire_member_lease) but
    /// first tries to renew `known_lease`, which this process held before.
    pub async fn try_acquire_member_lease_hinted(
        &self,
        holder: &str,
        pool: &str,
        known_lease: &str,
    ) -> Result<Option<Lease>, LeaseError> {
        if let Some(renewed) = self.renew_lease_by_name(known_lease, holder).await? {
            return Ok(Some(renewed));
        }
        debug!(lease = known_lease, holder, "known lease unavailable, scanning pool");
        self.try_acquire_member_lease(holder, pool).await
    }

    /// Gives up `holder`'s claim on `name`.
    ///
    /// Returns `Ok(true)` without writing when the lease is missing or held
    /// by someone else; that holder's claim is left alone, and when the
    /// lease is deleted before the write lands. Returns `Ok(false)` if the
    /// release write lost a race.
    pub async fn release_lease(&self, holder: &str, name: &str) -> Result<bool, LeaseError> {
        debug!(lease = name, holder, "attempting to release lease");
        let Some(mut lease) = self.store.get_lease(self.namespace(), name).await? else {
            return Ok(true);
        };
        if !lease.is_held_by(holder) {
            return Ok(true);
        }

        lease.spec.holder_identity = Some(String::new());
        lease.spec.renew_time = None;
        match self.store.update_lease(&lease).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => {
                debug!(lease = name, holder, "lease changed while releasing it");
                Ok(false)
            }
            Err(e) if e.is_not_found() => {
                debug!(lease = name, holder, "lease deleted while releasing it");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Desired member count, from the topology resolver.
    pub async fn desired_replicas(&self) -> Result<Option<i32>, LeaseError> {
        self.topology.desired_replicas().await
    }
}
