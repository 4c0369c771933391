//! Membership binding as the rest of a process sees it: waiting for a lease,
//! readiness, and controllers running on their own schedule.

use std::sync::Arc;
use std::time::Duration;

use flowpool_lease::{
    spawn_controller, Controller, InitialDelay, LeaseError, Membership, ProcessIdentity,
    ReadinessCheck, ReadinessStatus, Schedule,
};

use crate::helpers::{member, pod, Cluster, NS, POOL};

fn readiness(pod_name: &str) -> ReadinessCheck {
    ReadinessCheck {
        lease_enabled: true,
        require_lease: true,
        pool_name: POOL.into(),
        identity: ProcessIdentity {
            namespace: NS.into(),
            pod_name: pod_name.into(),
        },
    }
}

#[tokio::test]
async fn await_lease_wakes_when_a_cycle_binds() {
    let cluster = Cluster::new(1);
    let replica = cluster.replica(&pod(0));

    let coordinator = Arc::clone(&replica.coordinator);
    let waiter = tokio::spawn(async move { coordinator.await_lease(Duration::from_secs(5)).await });

    replica.tick().await;
    assert_eq!(waiter.await.unwrap().unwrap(), member(0));
}

#[tokio::test]
async fn await_lease_times_out_when_the_pool_is_full() {
    let cluster = Cluster::new(1);
    let first = cluster.replica(&pod(0));
    first.tick().await;

    let second = cluster.replica(&pod(1));
    second.tick().await;
    let err = second
        .coordinator
        .await_lease(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, LeaseError::Timeout(_)));
}

#[tokio::test]
async fn readiness_follows_the_member_lease() {
    let cluster = Cluster::new(1);
    let replica = cluster.replica(&pod(0));
    let check = readiness(&replica.pod);

    let report = check.evaluate(&replica.coordinator);
    assert_eq!(report.status, ReadinessStatus::Down);
    assert_eq!(report.reason.as_deref(), Some("no member lease currently held"));

    replica.tick().await;
    let report = check.evaluate(&replica.coordinator);
    assert!(report.is_up());
    assert_eq!(report.lease_name, Some(member(0)));
    assert_eq!(report.pod_namespace, NS);

    replica.stop().await;
    let report = check.evaluate(&replica.coordinator);
    assert_eq!(report.status, ReadinessStatus::Down);
    assert!(!report.lease_acquired);
}

#[tokio::test(start_paused = true)]
async fn scheduled_controllers_bind_then_release_on_shutdown() {
    let cluster = Cluster::new(2);
    let replica = cluster.replica(&pod(0));
    let schedule = Schedule {
        interval: Duration::from_secs(10),
        initial_delay: InitialDelay::Fixed(Duration::ZERO),
    };

    let leader = spawn_controller(replica.leader.clone() as Arc<dyn Controller>, schedule);
    let member_handle = spawn_controller(replica.member.clone() as Arc<dyn Controller>, schedule);

    // the member may run before the leader has created anything; the next
    // tick picks it up
    let lease = replica
        .coordinator
        .await_lease(Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(lease, member(0));
    assert_eq!(cluster.leader(), Some(pod(0)));

    member_handle.shutdown(Duration::from_secs(1)).await;
    leader.shutdown(Duration::from_secs(1)).await;

    assert_eq!(replica.coordinator.membership(), Membership::Unbound);
    assert_eq!(cluster.member_holders()[&member(0)], None);
    assert_eq!(cluster.leader(), None);
}
