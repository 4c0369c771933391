//! The resource store seam.
//!
//! All cross-replica coordination goes through an implementation of
//! [`ResourceStore`]. The store must be strongly consistent per object and
//! must reject updates carrying a stale `resourceVersion` with
//! [`LeaseError::Conflict`](crate::LeaseError::Conflict) instead of
//! overwriting.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::lease::Lease;
use crate::meta::{Workload, WorkloadKind};
use crate::LeaseError;

/// CRUD access to leases plus read access to the workload objects that own
/// them.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Reads a lease. Returns `Ok(None)` if it does not exist.
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>, LeaseError>;

    /// Creates a lease. Fails with `Conflict` if one with the same name exists.
    async fn create_lease(&self, lease: &Lease) -> Result<Lease, LeaseError>;

    /// Conditionally replaces a lease. The write only succeeds if the
    /// stored `resourceVersion` still matches `lease.metadata.resource_version`.
    async fn update_lease(&self, lease: &Lease) -> Result<Lease, LeaseError>;

    /// Lists leases whose labels contain every pair in `selector`.
    async fn list_leases(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Lease>, LeaseError>;

    /// Reads a Pod, ReplicaSet or Deployment. Returns `Ok(None)` if absent.
    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>, LeaseError>;
}

/// Returns true if `labels` contains every pair in `selector`.
pub fn selector_matches(
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).map(|l| l == v).unwrap_or(false))
}

/// Renders a selector as `k1=v1,k2=v2` for list queries.
pub fn format_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
