//! Error types for lease coordination.

use std::time::Duration;

/// Errors that can occur while coordinating pool leases.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// A conditional write targeted a stale version of the object, or a
    /// create raced with another writer.
    #[error("conflict writing {kind} {name}")]
    Conflict { kind: &'static str, name: String },

    /// The object no longer exists in the store.
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// The resource store could not be reached or answered with an
    /// unexpected failure.
    #[error("resource store unavailable: {0}")]
    Unavailable(String),

    /// Startup configuration is missing or invalid.
    #[error("invalid pool configuration: {0}")]
    Configuration(String),

    /// Waiting for a member lease exceeded the caller's deadline.
    #[error("timed out waiting for member lease after {0:?}")]
    Timeout(Duration),

    /// The store returned an object that could not be decoded.
    #[error("failed to decode {0}")]
    Decode(String),
}

impl LeaseError {
    /// Returns true if this is an optimistic concurrency failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, LeaseError::Conflict { .. })
    }

    /// Returns true if the target object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LeaseError::NotFound { .. })
    }

    /// Creates a conflict error for a lease.
    pub fn lease_conflict(name: impl Into<String>) -> Self {
        LeaseError::Conflict {
            kind: "lease",
            name: name.into(),
        }
    }

    /// Creates a not-found error for a lease.
    pub fn lease_not_found(name: impl Into<String>) -> Self {
        LeaseError::NotFound {
            kind: "lease",
            name: name.into(),
        }
    }
}
