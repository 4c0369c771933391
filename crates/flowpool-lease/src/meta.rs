//! Object metadata shared by leases and the workload objects the topology
//! resolver walks.
//!
//! Field names follow the Kubernetes JSON encoding so the same types travel
//! over the wire unchanged. Fields this crate does not manage are kept in
//! `extra` so read-modify-write never drops them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Metadata common to every stored object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Opaque version token used for conditional updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Returns the name of the owner of the given kind, preferring the
    /// reference marked as controller when several match.
    pub fn owner_name(&self, kind: &str) -> Option<&str> {
        let mut owners: Vec<&OwnerReference> = self
            .owner_references
            .iter()
            .filter(|o| o.kind == kind)
            .collect();
        owners.sort_by_key(|o| !o.controller.unwrap_or(false));
        owners.first().map(|o| o.name.as_str())
    }
}

/// Link from a dependent object to the object that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
}

/// Kinds of workload objects the topology resolver reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Pod,
    ReplicaSet,
    Deployment,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Pod => "Pod",
            WorkloadKind::ReplicaSet => "ReplicaSet",
            WorkloadKind::Deployment => "Deployment",
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Pod, ReplicaSet or Deployment reduced to what the topology resolver needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    pub kind: WorkloadKind,
    pub metadata: ObjectMeta,
    /// `spec.replicas`; always `None` for pods.
    pub replicas: Option<i32>,
}
