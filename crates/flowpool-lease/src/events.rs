//! Member lease lifecycle events.
//!
//! The member controller reports state changes to the listeners it was
//! constructed with. [`EventBus`] is a listener that fans events out over a
//! broadcast channel for the rest of the process.

use tokio::sync::broadcast;

/// What happened to this process's member lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberLeaseEventKind {
    /// A member lease was claimed.
    Acquired,
    /// A renewal failed; the lease may now belong to another replica.
    Lost,
    /// The lease was given up during shutdown.
    Released,
}

impl std::fmt::Display for MemberLeaseEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberLeaseEventKind::Acquired => write!(f, "acquired"),
            MemberLeaseEventKind::Lost => write!(f, "lost"),
            MemberLeaseEventKind::Released => write!(f, "released"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberLeaseEvent {
    pub kind: MemberLeaseEventKind,
    pub pool_name: String,
    pub pod_name: String,
    pub lease_name: String,
}

/// Receives member lease events synchronously from the member controller.
///
/// Implementations must not block; they run inside the controller cycle.
pub trait MemberLeaseListener: Send + Sync {
    fn on_member_lease_event(&self, event: &MemberLeaseEvent);
}

/// Broadcasts member lease events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MemberLeaseEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MemberLeaseEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl MemberLeaseListener for EventBus {
    fn on_member_lease_event(&self, event: &MemberLeaseEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event.clone());
    }
}
