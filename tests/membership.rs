mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use conclave::entry::MemberType;
use conclave::raft::VoteRequest;
use conclave::Role;
use fixtures::RaftRouter;
use pretty_assertions::assert_eq;

/// Configuration change: PASSIVE member, then promotion.
///
/// - adds server 4 to a running three-node cluster as PASSIVE: it receives the log but
///   is not part of the quorum and never grants votes.
/// - promotes server 4 to ACTIVE; afterwards its match index participates in commit
///   advancement, shown by committing with one of the original followers partitioned.
///
/// RUST_LOG=conclave,membership=trace cargo test --test membership
#[tokio::test(flavor = "multi_thread", worker_threads = 5)]
async fn passive_member_promotion() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    for id in 1..=3 {
        router.new_raft_node(id).await?;
    }
    router.bootstrap_cluster(&[1, 2, 3]).await?;

    let leader = router.wait_for_leader(Duration::from_secs(5), "initial election").await?;
    router.wait_for_log(&[1, 2, 3], 1, Some(Duration::from_secs(3)), "initial entry").await?;
    router.set(leader, 1, 1, "k", "v").await?;

    tracing::info!("--- adding server 4 as PASSIVE");
    router.new_raft_node(4).await?;
    // Server 4 is not bootstrapped: it waits in Inactive until the leader configures it.
    router.wait_for_role(&[4], Role::Inactive, None, "new server waits").await?;
    router.join(leader, fixtures::member(4, MemberType::Passive)).await?;

    // The join resolves at commit; the configuration entry sits at index 3 and the
    // passive server replicates and applies everything.
    router.wait_for_role(&[4], Role::Passive, Some(Duration::from_secs(3)), "configured passive").await?;
    router.wait_for_log(&[4], 3, Some(Duration::from_secs(5)), "passive caught up").await?;

    let metrics = router
        .wait_for_metrics(
            &leader,
            |m| {
                m.leader_metrics
                    .as_ref()
                    .map(|lm| lm.replication.get(&4).map(|r| r.matched.index >= 3).unwrap_or(false))
                    .unwrap_or(false)
            },
            Some(Duration::from_secs(3)),
            "leader replicates to the passive member",
        )
        .await?;
    // Quorum is still the three ACTIVE members.
    assert_eq!(metrics.configuration.active_ids(), vec![1, 2, 3]);
    assert_eq!(metrics.configuration.member_type(4), MemberType::Passive);
    assert_eq!(metrics.configuration.quorum(), 2);

    // A passive member answers votes without a grant.
    let node4 = router.get_node(4).await?;
    let current_term = node4.raft.metrics().borrow().current_term;
    let res = node4
        .raft
        .vote(VoteRequest {
            term: current_term,
            candidate: 9,
            last_log_index: 99,
            last_log_term: 99,
        })
        .await?;
    assert!(!res.voted, "passive members do not vote");

    tracing::info!("--- promoting server 4 to ACTIVE");
    let configuration = router.wait_for_metrics(&leader, |m| m.role == Role::Leader, None, "leader").await?.configuration;
    let members = vec![
        fixtures::active_member(1),
        fixtures::active_member(2),
        fixtures::active_member(3),
        fixtures::active_member(4),
    ];
    router.reconfigure(leader, configuration.index, members).await?;

    router.wait_for_role(&[4], Role::Follower, Some(Duration::from_secs(3)), "promoted to follower").await?;
    let metrics = router
        .wait_for_metrics(&leader, |m| m.configuration.active_ids().len() == 4, None, "promotion visible")
        .await?;
    assert_eq!(metrics.configuration.quorum(), 3);

    tracing::info!("--- committing with server 4 in the quorum");
    let bystander = (1..=3).find(|id| *id != leader).expect("a follower exists");
    router.isolate_node(bystander).await;

    // Quorum of 3 out of {leader, remaining follower, server 4}: only possible if the
    // promoted member's match index counts.
    let res = router.set(leader, 1, 2, "k2", "v2").await?;
    router
        .wait_for_metrics(
            &4,
            |m| m.last_applied >= res.index,
            Some(Duration::from_secs(3)),
            "promoted member applies the write",
        )
        .await?;
    let node4 = router.get_node(4).await?;
    assert_eq!(node4.state_machine.value("k2").await.as_deref(), Some("v2"));

    Ok(())
}
