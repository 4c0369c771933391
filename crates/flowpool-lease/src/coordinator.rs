//! Process-local view of the member lease this process is bound to.
//!
//! Two states: unbound, or bound to a lease name. Subsystems that need a
//! stable identity (for example an execution engine's instance id) call
//! [`MembershipCoordinator::await_lease`] before starting.
//!
//! Waiters park on a single-use gate. Every transition to unbound installs
//! a fresh gate, so a waiter left over from an earlier binding is never
//! woken by a later, unrelated acquisition; it runs into its own timeout.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::events::{MemberLeaseEvent, MemberLeaseEventKind, MemberLeaseListener};
use crate::LeaseError;

/// Binding state of this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    Unbound,
    Bound(String),
}

#[derive(Default)]
struct Gate {
    lease: OnceLock<String>,
    notify: Notify,
}

impl Gate {
    fn open(&self, lease: &str) {
        let _ = self.lease.set(lease.to_string());
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> String {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking so an open() in between is not missed
            notified.as_mut().enable();
            if let Some(lease) = self.lease.get() {
                return lease.clone();
            }
            notified.await;
        }
    }
}

struct State {
    membership: Membership,
    gate: Arc<Gate>,
}

/// Tracks the member lease bound to this process.
pub struct MembershipCoordinator {
    state: Mutex<State>,
}

impl std::fmt::Debug for MembershipCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipCoordinator")
            .field("membership", &self.membership())
            .finish()
    }
}

impl Default for MembershipCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MembershipCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                membership: Membership::Unbound,
                gate: Arc::new(Gate::default()),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn membership(&self) -> Membership {
        self.lock().membership.clone()
    }

    /// Name of the bound lease, without waiting.
    pub fn current_lease(&self) -> Option<String> {
        match self.membership() {
            Membership::Bound(lease) => Some(lease),
            Membership::Unbound => None,
        }
    }

    /// Returns the bound lease, waiting up to `timeout` for the next
    /// acquisition if currently unbound.
    pub async fn await_lease(&self, timeout: Duration) -> Result<String, LeaseError> {
        let gate = {
            let state = self.lock();
            if let Membership::Bound(lease) = &state.membership {
                return Ok(lease.clone());
            }
            Arc::clone(&state.gate)
        };
        tokio::time::timeout(timeout, gate.wait())
            .await
            .map_err(|_| LeaseError::Timeout(timeout))
    }
}

impl MemberLeaseListener for MembershipCoordinator {
    fn on_member_lease_event(&self, event: &MemberLeaseEvent) {
        let mut state = self.lock();
        match event.kind {
            MemberLeaseEventKind::Acquired => {
                state.membership = Membership::Bound(event.lease_name.clone());
                state.gate.open(&event.lease_name);
                debug!(lease = %event.lease_name, "membership bound");
            }
            MemberLeaseEventKind::Lost | MemberLeaseEventKind::Released => {
                state.membership = Membership::Unbound;
                state.gate = Arc::new(Gate::default());
                debug!(lease = %event.lease_name, "membership unbound: {}", event.kind);
            }
        }
    }
}
