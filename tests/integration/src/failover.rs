//! Replicas that stop renewing: their leases expire and are picked up by
//! whoever is still running.

use flowpool_lease::{leader_lease_name, MemberLeaseEventKind, Membership};

use crate::helpers::{member, pod, tick_all, Cluster, POOL};

#[tokio::test]
async fn crashed_replica_lease_is_reclaimed_after_expiry() {
    let cluster = Cluster::new(3);
    let mut replicas = cluster.replicas(3);
    tick_all(&replicas).await;

    // web-1 dies without releasing; a replacement pod comes up
    let crashed = replicas.remove(1);
    assert_eq!(crashed.lease(), Some(member(1)));
    let replacement = cluster.replica(&pod(3));

    replacement.tick().await;
    assert_eq!(replacement.lease(), None);

    cluster.advance(20);
    tick_all(&replicas).await;
    replacement.tick().await;
    assert_eq!(replacement.lease(), None, "lease still within its TTL");

    cluster.advance(11);
    tick_all(&replicas).await;
    replacement.tick().await;
    assert_eq!(replacement.lease(), Some(member(1)));

    let lease = cluster.lease(&member(1));
    assert_eq!(lease.holder(), Some(pod(3).as_str()));
    assert_eq!(lease.spec.lease_transitions, Some(1));

    // survivors were never disturbed
    assert_eq!(replicas[0].lease(), Some(member(0)));
    assert_eq!(replicas[1].lease(), Some(member(2)));
}

#[tokio::test]
async fn leader_failover_keeps_the_pool_reconciled() {
    let cluster = Cluster::new(3);
    let replicas = cluster.replicas(3);
    tick_all(&replicas).await;
    assert_eq!(cluster.leader(), Some(pod(0)));

    // web-0 stops renewing; web-1 keeps running
    cluster.advance(10);
    replicas[1].tick().await;
    assert_eq!(cluster.leader(), Some(pod(0)));

    cluster.advance(6);
    replicas[1].tick().await;
    assert_eq!(cluster.leader(), Some(pod(1)));
    let leader = cluster.lease(&leader_lease_name(POOL));
    assert_eq!(leader.spec.lease_transitions, Some(1));

    // the new leader picks up scale changes
    cluster.set_replicas(4);
    replicas[1].tick().await;
    assert!(cluster.member_holders().contains_key(&member(3)));

    let newcomer = cluster.replica(&pod(3));
    newcomer.tick().await;
    assert_eq!(newcomer.lease(), Some(member(3)));
}

#[tokio::test]
async fn stalled_replica_learns_its_lease_was_taken() {
    let cluster = Cluster::new(2);
    let replicas = cluster.replicas(2);
    tick_all(&replicas).await;
    let mut events = replicas[1].events();

    // web-1 stalls past its TTL and web-2 takes its lease
    cluster.advance(31);
    replicas[0].tick().await;
    let thief = cluster.replica(&pod(2));
    thief.tick().await;
    assert_eq!(thief.lease(), Some(member(1)));

    replicas[1].tick().await;
    let event = events.try_recv().unwrap();
    assert_eq!(event.kind, MemberLeaseEventKind::Lost);
    assert_eq!(event.lease_name, member(1));
    assert_eq!(replicas[1].coordinator.membership(), Membership::Unbound);

    // next cycle goes back to claiming and finds the pool full
    replicas[1].tick().await;
    assert_eq!(replicas[1].lease(), None);
    assert!(events.try_recv().is_err());

    // the thief is never told anything
    assert_eq!(thief.lease(), Some(member(1)));
}

#[tokio::test]
async fn expired_but_untaken_lease_is_simply_renewed() {
    let cluster = Cluster::new(2);
    let replicas = cluster.replicas(2);
    tick_all(&replicas).await;
    let mut events = replicas[1].events();

    cluster.advance(45);
    replicas[1].tick().await;

    assert_eq!(replicas[1].lease(), Some(member(1)));
    assert!(events.try_recv().is_err());
    assert_eq!(cluster.lease(&member(1)).spec.lease_transitions, None);
}

#[tokio::test]
async fn store_outage_keeps_membership() {
    let cluster = Cluster::new(2);
    let replicas = cluster.replicas(2);
    tick_all(&replicas).await;

    cluster.store.set_unavailable(true);
    cluster.advance(10);
    tick_all(&replicas).await;
    assert_eq!(replicas[0].lease(), Some(member(0)));
    assert_eq!(replicas[1].lease(), Some(member(1)));

    cluster.store.set_unavailable(false);
    cluster.advance(10);
    tick_all(&replicas).await;
    assert_eq!(replicas[0].lease(), Some(member(0)));
    assert_eq!(replicas[1].lease(), Some(member(1)));
    assert_eq!(cluster.leader(), Some(pod(0)));
}
