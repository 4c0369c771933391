//! Steady-state pool behavior: leases get created, claimed once each, and
//! kept by the same replica across cycles.

use std::collections::BTreeSet;
use std::sync::Arc;

use flowpool_lease::{leader_lease_name, Controller, MemberLeaseEventKind};

use crate::helpers::{
    member, pod, tick_all, Cluster, LEADER_TTL_SECS, MEMBER_TTL_SECS, POOL,
};

#[tokio::test]
async fn every_replica_binds_a_distinct_member_lease() {
    let cluster = Cluster::new(3);
    let replicas = cluster.replicas(3);

    tick_all(&replicas).await;

    assert_eq!(cluster.leader(), Some(pod(0)));
    for (i, r) in replicas.iter().enumerate() {
        assert_eq!(r.lease(), Some(member(i as u32)), "replica {}", r.pod);
    }
    let holders = cluster.member_holders();
    assert_eq!(holders.len(), 3);
    let distinct: BTreeSet<_> = holders.values().flatten().collect();
    assert_eq!(distinct.len(), 3);
}

#[tokio::test]
async fn leases_carry_ttl_and_owner() {
    let cluster = Cluster::new(2);
    let replicas = cluster.replicas(2);
    tick_all(&replicas).await;

    let lease = cluster.lease(&member(1));
    assert_eq!(lease.spec.lease_duration_seconds, Some(MEMBER_TTL_SECS));
    assert_eq!(lease.metadata.owner_name("Deployment"), Some("web"));

    let leader = cluster.lease(&leader_lease_name(POOL));
    assert_eq!(leader.spec.lease_duration_seconds, Some(LEADER_TTL_SECS));
}

#[tokio::test]
async fn replicas_keep_their_lease_across_cycles() {
    let cluster = Cluster::new(3);
    let replicas = cluster.replicas(3);
    tick_all(&replicas).await;
    let first: Vec<_> = replicas.iter().map(|r| r.lease()).collect();

    for _ in 0..5 {
        cluster.advance(10);
        tick_all(&replicas).await;
    }

    let later: Vec<_> = replicas.iter().map(|r| r.lease()).collect();
    assert_eq!(first, later);
    for i in 0..3 {
        let lease = cluster.lease(&member(i));
        assert_eq!(lease.spec.lease_transitions, None, "{}", lease.name());
    }
}

#[tokio::test]
async fn renewals_emit_no_further_events() {
    let cluster = Cluster::new(1);
    let replica = cluster.replica(&pod(0));
    let mut events = replica.events();

    replica.tick().await;
    assert_eq!(events.try_recv().unwrap().kind, MemberLeaseEventKind::Acquired);

    cluster.advance(10);
    replica.tick().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn surplus_replica_waits_for_a_free_lease() {
    let cluster = Cluster::new(2);
    let replicas = cluster.replicas(3);
    tick_all(&replicas).await;

    assert_eq!(replicas[2].lease(), None);
    assert!(!replicas[2].member.has_lease());

    replicas[0].stop().await;
    assert_eq!(replicas[0].lease(), None);
    assert_eq!(cluster.member_holders()[&member(0)], None);

    // released, so no need to wait for expiry
    replicas[2].tick().await;
    assert_eq!(replicas[2].lease(), Some(member(0)));
    let lease = cluster.lease(&member(0));
    assert_eq!(lease.spec.lease_transitions, None);
}

#[tokio::test]
async fn scaling_the_deployment_resizes_the_pool() {
    let cluster = Cluster::new(2);
    let replicas = cluster.replicas(2);
    tick_all(&replicas).await;
    assert_eq!(cluster.member_holders().len(), 2);

    cluster.set_replicas(4);
    let extra = [cluster.replica(&pod(2)), cluster.replica(&pod(3))];
    replicas[0].tick().await;
    tick_all(&extra).await;

    let holders = cluster.member_holders();
    assert_eq!(holders.len(), 4);
    assert_eq!(extra[0].lease(), Some(member(2)));
    assert_eq!(extra[1].lease(), Some(member(3)));

    // scaling down leaves surplus leases in place
    cluster.set_replicas(1);
    replicas[0].tick().await;
    assert_eq!(cluster.member_holders().len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_share_a_lease() {
    let cluster = Cluster::new(2);
    let contenders = cluster.replicas(6);
    // let one replica create the pool before anyone claims
    contenders[0].leader.run_cycle().await;
    assert_eq!(cluster.member_holders().len(), 2);

    let handles: Vec<_> = contenders
        .iter()
        .map(|r| {
            let member = Arc::clone(&r.member);
            tokio::spawn(async move { member.acquire_lease().await.unwrap() })
        })
        .collect();
    let mut won = 0;
    for h in handles {
        if h.await.unwrap() {
            won += 1;
        }
    }

    assert_eq!(won, 2);
    let bound: Vec<_> = contenders.iter().filter_map(|r| r.lease()).collect();
    let distinct: BTreeSet<_> = bound.iter().collect();
    assert_eq!(bound.len(), 2);
    assert_eq!(distinct.len(), 2);

    let holders = cluster.member_holders();
    for r in contenders.iter().filter(|r| r.lease().is_some()) {
        let lease = r.lease().unwrap();
        assert_eq!(holders[&lease].as_deref(), Some(r.pod.as_str()));
    }
}
