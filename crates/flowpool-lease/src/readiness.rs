//! Readiness of this process to accept work.
//!
//! A replica without a member lease has no stable identity, so by default
//! it reports itself not ready until the member controller binds one.

use serde::Serialize;

use crate::coordinator::MembershipCoordinator;
use crate::identity::ProcessIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReadinessStatus {
    Up,
    Down,
}

/// Inputs that don't change over the life of the process.
#[derive(Debug, Clone)]
pub struct ReadinessCheck {
    pub lease_enabled: bool,
    pub require_lease: bool,
    pub pool_name: String,
    pub identity: ProcessIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessReport {
    pub status: ReadinessStatus,
    pub lease_enabled: bool,
    pub lease_acquired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_name: Option<String>,
    pub pool_name: String,
    pub pod_name: String,
    pub pod_namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ReadinessReport {
    pub fn is_up(&self) -> bool {
        self.status == ReadinessStatus::Up
    }
}

impl ReadinessCheck {
    pub fn evaluate(&self, coordinator: &MembershipCoordinator) -> ReadinessReport {
        let mut report = ReadinessReport {
            status: ReadinessStatus::Up,
            lease_enabled: self.lease_enabled,
            lease_acquired: false,
            lease_name: None,
            pool_name: self.pool_name.clone(),
            pod_name: self.identity.pod_name.clone(),
            pod_namespace: self.identity.namespace.clone(),
            reason: None,
        };

        if !self.lease_enabled {
            report.reason = Some("member lease is not enabled".into());
            return report;
        }

        match coordinator.current_lease() {
            Some(lease) => {
                report.lease_acquired = true;
                report.lease_name = Some(lease);
            }
            None => {
                report.reason = Some("no member lease currently held".into());
                if self.require_lease {
                    report.status = ReadinessStatus::Down;
                }
            }
        }
        report
    }
}
