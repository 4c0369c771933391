//! Pool topology: how many members the pool should have and which object
//! owns the leases.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::identity::ProcessIdentity;
use crate::meta::{OwnerReference, Workload, WorkloadKind};
use crate::store::ResourceStore;
use crate::LeaseError;

const DEPLOYMENT_API_VERSION: &str = "apps/v1";

/// Answers topology questions about the pool this process belongs to.
#[async_trait]
pub trait PoolTopology: Send + Sync {
    /// Desired replica count, or `None` if it cannot be determined.
    async fn desired_replicas(&self) -> Result<Option<i32>, LeaseError>;

    /// Owner references to attach to newly created leases.
    async fn lease_owner_references(&self) -> Result<Vec<OwnerReference>, LeaseError>;
}

/// Resolves the topology from the Deployment that (through its ReplicaSet)
/// controls the current pod.
pub struct DeploymentTopology {
    store: Arc<dyn ResourceStore>,
    identity: ProcessIdentity,
    cached_deployment: Mutex<Option<String>>,
}

impl DeploymentTopology {
    pub fn new(store: Arc<dyn ResourceStore>, identity: ProcessIdentity) -> Self {
        Self {
            store,
            identity,
            cached_deployment: Mutex::new(None),
        }
    }

    fn cached_name(&self) -> Option<String> {
        self.cached_deployment
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_cached_name(&self, name: Option<String>) {
        *self
            .cached_deployment
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = name;
    }

    /// Finds the Deployment controlling this pod. Returns `Ok(None)` when the
    /// pod is not part of a Deployment or a link in the chain is missing.
    async fn resolve_deployment(&self) -> Result<Option<Workload>, LeaseError> {
        let ns = self.identity.namespace.as_str();

        if let Some(name) = self.cached_name() {
            if let Some(d) = self
                .store
                .get_workload(WorkloadKind::Deployment, ns, &name)
                .await?
            {
                return Ok(Some(d));
            }
            debug!("cached deployment {name} no longer resolves, re-resolving");
            self.set_cached_name(None);
        }

        let pod_name = self.identity.pod_name.as_str();
        let Some(pod) = self
            .store
            .get_workload(WorkloadKind::Pod, ns, pod_name)
            .await?
        else {
            warn!("pod {pod_name} not found in namespace {ns}");
            return Ok(None);
        };

        let Some(rs_name) = pod.metadata.owner_name(WorkloadKind::ReplicaSet.as_str()) else {
            warn!("pod {pod_name} in namespace {ns} has no owning replica set");
            return Ok(None);
        };

        let Some(rs) = self
            .store
            .get_workload(WorkloadKind::ReplicaSet, ns, rs_name)
            .await?
        else {
            warn!("replica set {rs_name} not found in namespace {ns}");
            return Ok(None);
        };

        let Some(deployment_name) = rs.metadata.owner_name(WorkloadKind::Deployment.as_str())
        else {
            warn!("replica set {rs_name} in namespace {ns} has no owning deployment");
            return Ok(None);
        };

        let Some(deployment) = self
            .store
            .get_workload(WorkloadKind::Deployment, ns, deployment_name)
            .await?
        else {
            warn!("deployment {deployment_name} not found in namespace {ns}");
            return Ok(None);
        };

        self.set_cached_name(Some(deployment_name.to_string()));
        Ok(Some(deployment))
    }
}

#[async_trait]
impl PoolTopology for DeploymentTopology {
    async fn desired_replicas(&self) -> Result<Option<i32>, LeaseError> {
        Ok(self.resolve_deployment().await?.and_then(|d| d.replicas))
    }

    async fn lease_owner_references(&self) -> Result<Vec<OwnerReference>, LeaseError> {
        let Some(d) = self.resolve_deployment().await? else {
            return Ok(Vec::new());
        };
        Ok(vec![OwnerReference {
            api_version: DEPLOYMENT_API_VERSION.to_string(),
            kind: WorkloadKind::Deployment.as_str().to_string(),
            name: d.metadata.name,
            uid: d.metadata.uid.unwrap_or_default(),
            controller: Some(false),
        }])
    }
}

/// A fixed topology with no owning object, for development outside a
/// cluster.
#[derive(Debug, Clone)]
pub struct FixedTopology {
    replicas: i32,
}

impl FixedTopology {
    pub fn new(replicas: i32) -> Self {
        Self { replicas }
    }
}

impl Default for FixedTopology {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl PoolTopology for FixedTopology {
    async fn desired_replicas(&self) -> Result<Option<i32>, LeaseError> {
        Ok(Some(self.replicas))
    }

    async fn lease_owner_references(&self) -> Result<Vec<OwnerReference>, LeaseError> {
        Ok(Vec::new())
    }
}
