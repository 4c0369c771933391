//! In-process resource store.
//!
//! Behaves like the real store where it matters for coordination: every
//! write bumps a global resource version, updates with a stale version are
//! rejected with a conflict, and creates of an existing name conflict. Used
//! for single-process development and to simulate several replicas sharing
//! one store in tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::lease::Lease;
use crate::meta::{ObjectMeta, OwnerReference, Workload, WorkloadKind};
use crate::store::{selector_matches, ResourceStore};
use crate::LeaseError;

type LeaseKey = (String, String);
type WorkloadKey = (WorkloadKind, String, String);

#[derive(Default)]
struct Inner {
    leases: BTreeMap<LeaseKey, Lease>,
    workloads: HashMap<WorkloadKey, Workload>,
    version: u64,
    writes: u64,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// A [`ResourceStore`] held entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("MemoryStore")
            .field("leases", &inner.leases.len())
            .field("writes", &inner.writes)
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful lease creates and updates so far.
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    /// Snapshot of a stored lease.
    pub fn lease(&self, namespace: &str, name: &str) -> Option<Lease> {
        self.lock()
            .leases
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Snapshot of every lease in a namespace, ordered by name.
    pub fn leases(&self, namespace: &str) -> Vec<Lease> {
        self.lock()
            .leases
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, l)| l.clone())
            .collect()
    }

    /// Stores a lease as-is, bypassing version checks. The stored copy gets
    /// a fresh resource version. Does not count as a write.
    pub fn put_lease(&self, mut lease: Lease) -> Lease {
        let mut inner = self.lock();
        lease.metadata.resource_version = Some(inner.next_version());
        let key = (lease.metadata.namespace.clone(), lease.metadata.name.clone());
        inner.leases.insert(key, lease.clone());
        lease
    }

    /// Deletes a lease, as an operator or garbage collector would.
    pub fn remove_lease(&self, namespace: &str, name: &str) -> Option<Lease> {
        self.lock()
            .leases
            .remove(&(namespace.to_string(), name.to_string()))
    }

    pub fn put_workload(&self, workload: Workload) {
        let key = (
            workload.kind,
            workload.metadata.namespace.clone(),
            workload.metadata.name.clone(),
        );
        self.lock().workloads.insert(key, workload);
    }

    pub fn remove_workload(&self, kind: WorkloadKind, namespace: &str, name: &str) {
        self.lock()
            .workloads
            .remove(&(kind, namespace.to_string(), name.to_string()));
    }

    /// Seeds a Deployment → ReplicaSet → Pod ownership chain.
    pub fn seed_deployment(&self, namespace: &str, deployment: &str, replicas: i32, pod: &str) {
        let replica_set = format!("{deployment}-rs");

        let mut deploy_meta = ObjectMeta::named(deployment, namespace);
        deploy_meta.uid = Some(format!("uid-{deployment}"));
        self.put_workload(Workload {
            kind: WorkloadKind::Deployment,
            metadata: deploy_meta,
            replicas: Some(replicas),
        });

        let mut rs_meta = ObjectMeta::named(&replica_set, namespace);
        rs_meta.uid = Some(format!("uid-{replica_set}"));
        rs_meta.owner_references = vec![controller_ref("Deployment", deployment)];
        self.put_workload(Workload {
            kind: WorkloadKind::ReplicaSet,
            metadata: rs_meta,
            replicas: Some(replicas),
        });

        self.add_pod(namespace, deployment, pod);
    }

    /// Adds a pod owned by the ReplicaSet created by [`seed_deployment`](Self::seed_deployment).
    pub fn add_pod(&self, namespace: &str, deployment: &str, pod: &str) {
        let mut pod_meta = ObjectMeta::named(pod, namespace);
        pod_meta.owner_references = vec![controller_ref("ReplicaSet", &format!("{deployment}-rs"))];
        self.put_workload(Workload {
            kind: WorkloadKind::Pod,
            metadata: pod_meta,
            replicas: None,
        });
    }

    /// Changes `spec.replicas` on a seeded deployment.
    pub fn set_replicas(&self, namespace: &str, deployment: &str, replicas: i32) {
        let mut inner = self.lock();
        let key = (
            WorkloadKind::Deployment,
            namespace.to_string(),
            deployment.to_string(),
        );
        if let Some(d) = inner.workloads.get_mut(&key) {
            d.replicas = Some(replicas);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), LeaseError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LeaseError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }
}

fn controller_ref(kind: &str, name: &str) -> OwnerReference {
    OwnerReference {
        api_version: "apps/v1".into(),
        kind: kind.into(),
        name: name.into(),
        uid: format!("uid-{name}"),
        controller: Some(true),
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>, LeaseError> {
        self.check_available()?;
        Ok(self.lease(namespace, name))
    }

    async fn create_lease(&self, lease: &Lease) -> Result<Lease, LeaseError> {
        self.check_available()?;
        let mut inner = self.lock();
        let key = (lease.metadata.namespace.clone(), lease.metadata.name.clone());
        if inner.leases.contains_key(&key) {
            return Err(LeaseError::lease_conflict(&lease.metadata.name));
        }
        let mut stored = lease.clone();
        let version = inner.next_version();
        stored.metadata.uid = Some(format!("lease-uid-{version}"));
        stored.metadata.resource_version = Some(version);
        inner.leases.insert(key, stored.clone());
        inner.writes += 1;
        Ok(stored)
    }

    async fn update_lease(&self, lease: &Lease) -> Result<Lease, LeaseError> {
        self.check_available()?;
        let mut inner = self.lock();
        let key = (lease.metadata.namespace.clone(), lease.metadata.name.clone());
        let current_version = match inner.leases.get(&key) {
            Some(current) => current.metadata.resource_version.clone(),
            None => return Err(LeaseError::lease_not_found(&lease.metadata.name)),
        };
        // an update without a version is unconditional, as with the real API
        if lease.metadata.resource_version.is_some()
            && lease.metadata.resource_version != current_version
        {
            return Err(LeaseError::lease_conflict(&lease.metadata.name));
        }
        let mut stored = lease.clone();
        stored.metadata.resource_version = Some(inner.next_version());
        inner.leases.insert(key, stored.clone());
        inner.writes += 1;
        Ok(stored)
    }

    async fn list_leases(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Lease>, LeaseError> {
        self.check_available()?;
        Ok(self
            .lock()
            .leases
            .iter()
            .filter(|((ns, _), l)| ns == namespace && selector_matches(selector, &l.metadata.labels))
            .map(|(_, l)| l.clone())
            .collect())
    }

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>, LeaseError> {
        self.check_available()?;
        Ok(self
            .lock()
            .workloads
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned())
    }
}
