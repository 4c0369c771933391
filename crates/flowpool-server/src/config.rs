//! Server configuration.
//!
//! `ServerConfig` is what the TOML file deserializes into. Pool settings
//! live in the same file under `[pool]`, `[lease]`, `[schedulers]` and
//! `[readiness]`; the remaining keys pick the store backend, the identity
//! source and the health endpoint.

use std::path::Path;
use std::time::Duration;

use flowpool_lease::{
    parse_duration, LeaseGroupConfig, PoolConfig, PoolSettings, ReadinessConfig,
    SchedulerGroupConfig,
};
use serde::{Deserialize, Serialize};

/// Where leases and workload objects are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// The Kubernetes API server.
    Kubernetes,
    /// An in-process store, for running a single replica locally.
    Memory,
}

/// How this process learns its pod name and namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMode {
    /// Injected environment and service account; fails if unresolvable.
    Cluster,
    /// Same sources, falling back to synthesized values.
    Local,
}

/// Parses a store mode name from a CLI string.
pub fn parse_store_mode(input: &str) -> Result<StoreMode, String> {
    match input.to_ascii_lowercase().as_str() {
        "kubernetes" | "k8s" => Ok(StoreMode::Kubernetes),
        "memory" => Ok(StoreMode::Memory),
        _ => Err(format!(
            "unknown store '{input}'. valid options: kubernetes, memory"
        )),
    }
}

/// Parses an identity mode name from a CLI string.
pub fn parse_identity_mode(input: &str) -> Result<IdentityMode, String> {
    match input.to_ascii_lowercase().as_str() {
        "cluster" => Ok(IdentityMode::Cluster),
        "local" => Ok(IdentityMode::Local),
        _ => Err(format!(
            "unknown identity mode '{input}'. valid options: cluster, local"
        )),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `kubernetes` or `memory`.
    pub store: String,
    /// `cluster` or `local`.
    pub identity: String,
    /// Namespace used when neither the environment nor the service account
    /// provide one. Empty means none.
    pub namespace: String,
    /// Address the health endpoint binds to.
    pub bind: String,
    /// Port for `/health/ready` and `/health/live`. 0 disables it.
    pub health_port: u16,
    /// How long startup waits for a member lease before giving up.
    pub await_lease_timeout: String,
    /// Upper bound on each shutdown step: draining a cycle, releasing a lease.
    pub shutdown_grace: String,
    /// Pool size assumed by the `memory` store, which has no deployment to
    /// read it from.
    pub replicas: i32,

    pub kubernetes: KubernetesConfig,
    pub pool: PoolConfig,
    pub lease: LeaseGroupConfig,
    pub schedulers: SchedulerGroupConfig,
    pub readiness: ReadinessConfig,
}

/// Kubernetes API access. All empty means in-cluster configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    /// API server URL, e.g. `https://127.0.0.1:6443`.
    pub api_server: String,
    /// File holding a bearer token. Re-read on every request.
    pub token_file: String,
    /// PEM bundle used to verify the API server.
    pub ca_file: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            store: "kubernetes".into(),
            identity: "cluster".into(),
            namespace: String::new(),
            bind: "0.0.0.0".into(),
            health_port: 8080,
            await_lease_timeout: "30s".into(),
            shutdown_grace: "10s".into(),
            replicas: 1,
            kubernetes: KubernetesConfig::default(),
            pool: PoolConfig::default(),
            lease: LeaseGroupConfig::default(),
            schedulers: SchedulerGroupConfig::default(),
            readiness: ReadinessConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file '{}': {e}", path.display()))?;
        toml::from_str(&raw)
            .map_err(|e| format!("invalid config file '{}': {e}", path.display()))
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            pool: self.pool.clone(),
            lease: self.lease.clone(),
            schedulers: self.schedulers.clone(),
            readiness: self.readiness.clone(),
        }
    }

    pub fn store_mode(&self) -> Result<StoreMode, String> {
        parse_store_mode(&self.store)
    }

    pub fn identity_mode(&self) -> Result<IdentityMode, String> {
        parse_identity_mode(&self.identity)
    }

    pub fn await_lease_timeout(&self) -> Result<Duration, String> {
        parse_duration(&self.await_lease_timeout)
    }

    pub fn shutdown_grace(&self) -> Result<Duration, String> {
        parse_duration(&self.shutdown_grace)
    }

    pub fn fallback_namespace(&self) -> Option<String> {
        (!self.namespace.is_empty()).then(|| self.namespace.clone())
    }

    /// Returns the health port, or `None` when disabled.
    pub fn health_port(&self) -> Option<u16> {
        (self.health_port != 0).then_some(self.health_port)
    }

    /// Rejects settings no replica could run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.pool.name.trim().is_empty() {
            return Err("pool name must not be empty".into());
        }
        if self.lease.member.duration_secs <= 0 || self.lease.leader.duration_secs <= 0 {
            return Err("lease durations must be positive".into());
        }
        if self.replicas < 0 {
            return Err("replicas must not be negative".into());
        }
        self.store_mode()?;
        self.identity_mode()?;
        self.await_lease_timeout()?;
        self.shutdown_grace()?;
        self.schedulers.leader.schedule()?;
        self.schedulers.member.schedule()?;
        Ok(())
    }
}
