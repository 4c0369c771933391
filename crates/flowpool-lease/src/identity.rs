//! Process identity resolution.
//!
//! The pod name is the holder identity written to leases and the namespace
//! scopes every store call. Both are resolved once at startup; in cluster
//! mode an unresolvable identity is a startup error, in local mode a
//! development identity is synthesized instead.

use std::path::PathBuf;

use tracing::{debug, info};

use crate::LeaseError;

pub const POD_NAME_ENV: &str = "POD_NAME";
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";
pub const HOSTNAME_ENV: &str = "HOSTNAME";

/// Where the service account namespace is mounted inside a pod.
pub const SERVICE_ACCOUNT_NAMESPACE_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// The resolved identity of this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub namespace: String,
    pub pod_name: String,
}

/// Resolves the identity of the current process.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self) -> Result<ProcessIdentity, LeaseError>;
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Sources consulted by both resolvers, in order.
struct Sources {
    env: EnvLookup,
    namespace_file: PathBuf,
    /// Namespace configured on the store client, last resort.
    fallback_namespace: Option<String>,
}

impl Sources {
    fn from_process(fallback_namespace: Option<String>) -> Self {
        Self {
            env: Box::new(|key| std::env::var(key).ok()),
            namespace_file: PathBuf::from(SERVICE_ACCOUNT_NAMESPACE_PATH),
            fallback_namespace,
        }
    }

    fn env(&self, key: &str) -> Option<String> {
        non_blank((self.env)(key))
    }

    fn namespace(&self) -> Option<String> {
        if let Some(ns) = self.env(POD_NAMESPACE_ENV) {
            return Some(ns);
        }
        match std::fs::read_to_string(&self.namespace_file) {
            Ok(contents) => {
                if let Some(ns) = non_blank(Some(contents)) {
                    return Some(ns);
                }
            }
            Err(e) => debug!(
                "service account namespace file {} unreadable: {e}",
                self.namespace_file.display()
            ),
        }
        non_blank(self.fallback_namespace.clone())
    }

    fn pod_name(&self) -> Option<String> {
        self.env(POD_NAME_ENV).or_else(|| self.env(HOSTNAME_ENV))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Resolver for processes running inside the cluster.
pub struct ClusterIdentityResolver {
    sources: Sources,
}

impl ClusterIdentityResolver {
    /// Reads the real environment and service account mount.
    pub fn new(fallback_namespace: Option<String>) -> Self {
        Self {
            sources: Sources::from_process(fallback_namespace),
        }
    }

    /// Uses the given environment lookup and namespace file instead of the
    /// process environment.
    pub fn with_sources(
        env: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
        namespace_file: impl Into<PathBuf>,
        fallback_namespace: Option<String>,
    ) -> Self {
        Self {
            sources: Sources {
                env: Box::new(env),
                namespace_file: namespace_file.into(),
                fallback_namespace,
            },
        }
    }
}

impl IdentityResolver for ClusterIdentityResolver {
    fn resolve(&self) -> Result<ProcessIdentity, LeaseError> {
        let namespace = self.sources.namespace().ok_or_else(|| {
            LeaseError::Configuration(format!(
                "cannot determine the current namespace. set {POD_NAMESPACE_ENV} via the \
                 downward API, mount the service account namespace file, or configure the \
                 client namespace explicitly"
            ))
        })?;
        let pod_name = self.sources.pod_name().ok_or_else(|| {
            LeaseError::Configuration(format!(
                "cannot determine the current pod name. set {POD_NAME_ENV} via the downward \
                 API or make sure {HOSTNAME_ENV} is set"
            ))
        })?;
        Ok(ProcessIdentity {
            namespace,
            pod_name,
        })
    }
}

/// Resolver for development outside a cluster. Uses the same sources as
/// [`ClusterIdentityResolver`] but never fails.
pub struct LocalIdentityResolver {
    sources: Sources,
}

impl LocalIdentityResolver {
    pub fn new() -> Self {
        Self {
            sources: Sources::from_process(None),
        }
    }

    pub fn with_sources(
        env: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
        namespace_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sources: Sources {
                env: Box::new(env),
                namespace_file: namespace_file.into(),
                fallback_namespace: None,
            },
        }
    }
}

impl Default for LocalIdentityResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityResolver for LocalIdentityResolver {
    fn resolve(&self) -> Result<ProcessIdentity, LeaseError> {
        let namespace = self
            .sources
            .namespace()
            .unwrap_or_else(|| "default".to_string());
        let pod_name = self
            .sources
            .pod_name()
            .unwrap_or_else(|| format!("dev-{}", std::process::id()));
        info!(%namespace, %pod_name, "using local development identity");
        Ok(ProcessIdentity {
            namespace,
            pod_name,
        })
    }
}
