//! Kubernetes API resource store.
//!
//! Talks to the API server over plain REST: `coordination.k8s.io/v1` for
//! leases, `v1` pods and `apps/v1` replica sets and deployments for the
//! topology walk. Lease updates are `PUT`s carrying the object's
//! `resourceVersion`, so the API server enforces optimistic concurrency and
//! answers a stale write with 409.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use flowpool_lease::{
    format_selector, Lease, LeaseError, ObjectMeta, ResourceStore, Workload, WorkloadKind,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::KubernetesConfig;

const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
const SERVICE_PORT_ENV: &str = "KUBERNETES_SERVICE_PORT";
const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

const LEASE_API_VERSION: &str = "coordination.k8s.io/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest slice of an error response body kept in the error message.
const ERROR_BODY_LIMIT: usize = 256;

/// A [`ResourceStore`] backed by the Kubernetes API server.
pub struct KubeStore {
    client: reqwest::Client,
    base_url: String,
    token_file: Option<PathBuf>,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct LeaseList {
    #[serde(default)]
    items: Option<Vec<Lease>>,
}

#[derive(Deserialize)]
struct WorkloadObject {
    metadata: ObjectMeta,
    #[serde(default)]
    spec: WorkloadSpec,
}

#[derive(Default, Deserialize)]
struct WorkloadSpec {
    replicas: Option<i32>,
}

impl KubeStore {
    /// Builds a store from explicit settings, or from the in-cluster
    /// service account when no API server is configured.
    pub fn from_config(cfg: &KubernetesConfig) -> Result<Self, LeaseError> {
        if cfg.api_server.is_empty() {
            return Self::in_cluster();
        }
        let token_file = (!cfg.token_file.is_empty()).then(|| PathBuf::from(&cfg.token_file));
        let ca_file = (!cfg.ca_file.is_empty()).then(|| PathBuf::from(&cfg.ca_file));
        Self::new(cfg.api_server.clone(), token_file, ca_file.as_deref())
    }

    /// Uses the API server address injected into every pod and the pod's
    /// service account token and CA bundle.
    pub fn in_cluster() -> Result<Self, LeaseError> {
        let host = std::env::var(SERVICE_HOST_ENV).map_err(|_| {
            LeaseError::Configuration(format!(
                "{SERVICE_HOST_ENV} is not set. outside a cluster, set kubernetes.api_server"
            ))
        })?;
        let port = std::env::var(SERVICE_PORT_ENV).unwrap_or_else(|_| "443".into());
        let base_url = if host.contains(':') {
            format!("https://[{host}]:{port}")
        } else {
            format!("https://{host}:{port}")
        };

        let sa = Path::new(SERVICE_ACCOUNT_DIR);
        Self::new(base_url, Some(sa.join("token")), Some(&sa.join("ca.crt")))
    }

    pub fn new(
        base_url: impl Into<String>,
        token_file: Option<PathBuf>,
        ca_file: Option<&Path>,
    ) -> Result<Self, LeaseError> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(path) = ca_file {
            let pem = std::fs::read(path).map_err(|e| {
                LeaseError::Configuration(format!(
                    "failed to read CA bundle '{}': {e}",
                    path.display()
                ))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                LeaseError::Configuration(format!("invalid CA bundle '{}': {e}", path.display()))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| LeaseError::Configuration(format!("failed to build http client: {e}")))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!(api_server = %base_url, "using kubernetes resource store");
        Ok(Self {
            client,
            base_url,
            token_file,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Reads the bearer token. Projected service account tokens rotate, so
    /// the file is read per request.
    async fn bearer_token(&self) -> Result<Option<String>, LeaseError> {
        let Some(path) = &self.token_file else {
            return Ok(None);
        };
        let token = tokio::fs::read_to_string(path).await.map_err(|e| {
            LeaseError::Configuration(format!("failed to read token '{}': {e}", path.display()))
        })?;
        Ok(Some(token.trim().to_string()))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, LeaseError> {
        let req = match self.bearer_token().await? {
            Some(token) => req.bearer_auth(token),
            None => req,
        };
        req.send()
            .await
            .map_err(|e| LeaseError::Unavailable(e.to_string()))
    }
}

fn lease_collection_path(namespace: &str) -> String {
    format!("/apis/{LEASE_API_VERSION}/namespaces/{namespace}/leases")
}

fn lease_path(namespace: &str, name: &str) -> String {
    format!("{}/{name}", lease_collection_path(namespace))
}

fn workload_path(kind: WorkloadKind, namespace: &str, name: &str) -> String {
    match kind {
        WorkloadKind::Pod => format!("/api/v1/namespaces/{namespace}/pods/{name}"),
        WorkloadKind::ReplicaSet => {
            format!("/apis/apps/v1/namespaces/{namespace}/replicasets/{name}")
        }
        WorkloadKind::Deployment => {
            format!("/apis/apps/v1/namespaces/{namespace}/deployments/{name}")
        }
    }
}

/// Encodes a lease for a write, adding the type fields the API requires.
fn lease_body(lease: &Lease) -> Result<serde_json::Value, LeaseError> {
    let mut body = serde_json::to_value(lease)
        .map_err(|e| LeaseError::Decode(format!("lease {}: {e}", lease.name())))?;
    if let Some(obj) = body.as_object_mut() {
        obj.insert("apiVersion".into(), LEASE_API_VERSION.into());
        obj.insert("kind".into(), "Lease".into());
    }
    Ok(body)
}

/// Maps a non-success status to the store error vocabulary.
fn status_error(status: StatusCode, kind: &'static str, name: &str, body: &str) -> LeaseError {
    match status {
        StatusCode::CONFLICT => LeaseError::Conflict {
            kind,
            name: name.to_string(),
        },
        StatusCode::NOT_FOUND => LeaseError::NotFound {
            kind,
            name: name.to_string(),
        },
        _ => {
            let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
            LeaseError::Unavailable(format!("{kind} {name}: HTTP {status}: {body}"))
        }
    }
}

async fn decode<T: DeserializeOwned>(
    resp: reqwest::Response,
    kind: &'static str,
    name: &str,
) -> Result<T, LeaseError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(status_error(status, kind, name, &body));
    }
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| LeaseError::Unavailable(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| LeaseError::Decode(format!("{kind} {name}: {e}")))
}

async fn decode_optional<T: DeserializeOwned>(
    resp: reqwest::Response,
    kind: &'static str,
    name: &str,
) -> Result<Option<T>, LeaseError> {
    if resp.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    decode(resp, kind, name).await.map(Some)
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>, LeaseError> {
        let resp = self
            .send(self.client.get(self.url(&lease_path(namespace, name))))
            .await?;
        decode_optional(resp, "lease", name).await
    }

    async fn create_lease(&self, lease: &Lease) -> Result<Lease, LeaseError> {
        let path = lease_collection_path(&lease.metadata.namespace);
        debug!(lease = lease.name(), "creating lease");
        let resp = self
            .send(self.client.post(self.url(&path)).json(&lease_body(lease)?))
            .await?;
        decode(resp, "lease", lease.name()).await
    }

    async fn update_lease(&self, lease: &Lease) -> Result<Lease, LeaseError> {
        let path = lease_path(&lease.metadata.namespace, lease.name());
        let resp = self
            .send(self.client.put(self.url(&path)).json(&lease_body(lease)?))
            .await?;
        decode(resp, "lease", lease.name()).await
    }

    async fn list_leases(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Lease>, LeaseError> {
        let req = self
            .client
            .get(self.url(&lease_collection_path(namespace)))
            .query(&[("labelSelector", format_selector(selector))]);
        let list: LeaseList = decode(self.send(req).await?, "lease list", namespace).await?;
        Ok(list.items.unwrap_or_default())
    }

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>, LeaseError> {
        let resp = self
            .send(self.client.get(self.url(&workload_path(kind, namespace, name))))
            .await?;
        let object: Option<WorkloadObject> = decode_optional(resp, kind.as_str(), name).await?;
        Ok(object.map(|o| Workload {
            kind,
            metadata: o.metadata,
            replicas: o.spec.replicas,
        }))
    }
}
