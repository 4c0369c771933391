//! The Lease object and pool naming conventions.
//!
//! A pool has one leader lease (`flow-pool-leader-<pool>`) and one member
//! lease per desired replica (`flow-pool-member-<pool>-<ordinal>`). Member
//! leases are never deleted here; they are re-claimed as replicas churn and
//! garbage collected through their owner reference when the deployment goes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::meta::ObjectMeta;

/// Label carrying the pool name on every lease this crate manages.
pub const POOL_NAME_LABEL: &str = "io.quarkiverse.flow.durable.k8s/pool";

/// Label distinguishing the leader lease (`"true"`) from member leases.
pub const IS_LEADER_LABEL: &str = "io.quarkiverse.flow.durable.k8s/is-leader";

/// Labels stamped on every managed lease in addition to the pool labels.
pub const BASE_LABELS: &[(&str, &str)] = &[
    ("app.kubernetes.io/managed-by", "quarkus-flow"),
    ("app.kubernetes.io/component", "durable"),
];

/// Name of the single leader lease for a pool.
pub fn leader_lease_name(pool: &str) -> String {
    format!("flow-pool-leader-{pool}")
}

/// Name of the member lease for the given ordinal.
pub fn member_lease_name(pool: &str, ordinal: u32) -> String {
    format!("flow-pool-member-{pool}-{ordinal:02}")
}

/// Label selector matching every member lease of a pool.
pub fn member_selector(pool: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (POOL_NAME_LABEL.to_string(), pool.to_string()),
        (IS_LEADER_LABEL.to_string(), "false".to_string()),
    ])
}

/// Full set of managed labels for a lease in `pool`.
pub fn managed_labels(pool: &str, is_leader: bool) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = BASE_LABELS
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    labels.insert(IS_LEADER_LABEL.to_string(), is_leader.to_string());
    labels.insert(POOL_NAME_LABEL.to_string(), pool.to_string());
    labels
}

/// A lease object as held by the resource store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: LeaseSpec,
}

/// Mutable claim state of a lease.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_duration_seconds: Option<i32>,
    #[serde(default, with = "micro_time", skip_serializing_if = "Option::is_none")]
    pub acquire_time: Option<OffsetDateTime>,
    #[serde(default, with = "micro_time", skip_serializing_if = "Option::is_none")]
    pub renew_time: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_transitions: Option<i32>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Current holder, treating blank identities as unheld.
    pub fn holder(&self) -> Option<&str> {
        self.spec
            .holder_identity
            .as_deref()
            .filter(|h| !h.trim().is_empty())
    }

    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder() == Some(identity)
    }

    /// Instant after which the current claim lapses, if the lease is claimed
    /// and has a TTL.
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        let renew = self.spec.renew_time?;
        let secs = self.spec.lease_duration_seconds?;
        Some(renew + time::Duration::seconds(i64::from(secs)))
    }

    /// Whether `requester` may claim this lease at `now`.
    ///
    /// A lease is available when nobody holds it, when the holder's claim
    /// has expired, or when the requester already holds it.
    pub fn is_available_to(&self, requester: &str, now: OffsetDateTime) -> bool {
        let Some(holder) = self.holder() else {
            return true;
        };
        match self.expires_at() {
            None => true,
            Some(expires) => expires < now || holder == requester,
        }
    }
}

/// Kubernetes `MicroTime` encoding: RFC 3339, UTC, six fractional digits.
pub(crate) mod micro_time {
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use time::format_description::well_known::Rfc3339;
    use time::macros::format_description;
    use time::{OffsetDateTime, UtcOffset};

    pub fn format(t: OffsetDateTime) -> Result<String, time::error::Format> {
        t.to_offset(UtcOffset::UTC).format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
    }

    pub fn serialize<S: Serializer>(
        value: &Option<OffsetDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(t) => serializer.serialize_some(&format(*t).map_err(S::Error::custom)?),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<OffsetDateTime>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.filter(|s| !s.is_empty())
            .map(|s| OffsetDateTime::parse(&s, &Rfc3339).map_err(D::Error::custom))
            .transpose()
    }
}
