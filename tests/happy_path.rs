mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use conclave::entry::EntryPayload;
use conclave::raft::OpenSessionRequest;
use conclave::Consistency;
use conclave::RaftError;
use conclave::Role;
use fixtures::RaftRouter;
use maplit::btreemap;
use pretty_assertions::assert_eq;

/// Three-node happy path.
///
/// - brings three ACTIVE servers online and bootstraps them.
/// - asserts one leader emerges in term 1 with its Initialize entry at index 1.
/// - writes a client command and asserts it lands at index 2 on all three logs and in
///   all three state machines.
/// - asserts the `(session, sequence)` deduplication contract and the three query
///   consistency levels.
///
/// RUST_LOG=conclave,happy_path=trace cargo test --test happy_path
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_happy_path() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    for id in 1..=3 {
        router.new_raft_node(id).await?;
    }

    // Pristine servers sit in Inactive until configured.
    router.wait_for_role(&[1, 2, 3], Role::Inactive, None, "pristine").await?;

    tracing::info!("--- bootstrapping cluster");
    router.bootstrap_cluster(&[1, 2, 3]).await?;

    let leader = router.wait_for_leader(Duration::from_secs(5), "initial election").await?;
    router.wait_for_log(&[1, 2, 3], 1, Some(Duration::from_secs(3)), "initial entry").await?;

    for metrics in router.latest_metrics().await {
        assert_eq!(metrics.current_term, 1, "node {} should be in term 1", metrics.id);
        assert_eq!(metrics.current_leader, Some(leader), "node {} should know the leader", metrics.id);
    }
    let init = router.log_entry(leader, 1).await?.expect("index 1 should exist");
    assert_eq!(init.term, 1);
    assert_eq!(init.payload, EntryPayload::Initialize);

    tracing::info!("--- writing through the leader");
    let res = router.set(leader, 1, 1, "x", "1").await?;
    assert_eq!(res.index, 2, "first client command should land at index 2");
    assert_eq!(res.result, b"".to_vec(), "no previous value for x");
    router.wait_for_log(&[1, 2, 3], 2, Some(Duration::from_secs(3)), "command replicated").await?;

    for id in 1..=3 {
        let entry = router.log_entry(id, 2).await?.expect("index 2 should exist");
        assert_eq!(entry.term, 1);
        assert_eq!(entry.payload, EntryPayload::Command {
            session: 1,
            sequence: 1,
            operation: b"set x 1".to_vec(),
        });
        let node = router.get_node(id).await?;
        assert_eq!(node.state_machine.value("x").await.as_deref(), Some("1"));
    }

    tracing::info!("--- duplicate commands return the cached result");
    let first = router.set(leader, 1, 2, "x", "2").await?;
    assert_eq!(first.result, b"1".to_vec(), "set returns the previous value");
    // A retry of sequence 2 carrying a different mutation must not execute it.
    let dup = router.command(leader, 1, 2, "set x 999".into()).await?;
    assert_eq!(dup.result, b"1".to_vec(), "duplicate returns the cached response");
    let node = router.get_node(leader).await?;
    assert_eq!(node.state_machine.value("x").await.as_deref(), Some("2"));

    tracing::info!("--- queries at all consistency levels");
    for consistency in [Consistency::Sequential, Consistency::LinearizableLease, Consistency::Linearizable] {
        let q = router.query(leader, "get x".into(), consistency).await?;
        assert_eq!(q.result, b"2".to_vec(), "query at {:?}", consistency);
    }
    assert_eq!(node.state_machine.dump().await, btreemap! { "x".to_string() => "2".to_string() });

    tracing::info!("--- session lifecycle");
    let sess = node.raft.open_session(OpenSessionRequest {
        client: "client-a".into(),
        timeout: 0,
    })
    .await?;
    assert!(sess.session > 2, "session id is the registering entry's index");
    assert!(node.state_machine.open_sessions().await.contains(&sess.session));

    tracing::info!("--- followers redirect clients");
    let follower = (1..=3).find(|id| *id != leader).expect("two followers exist");
    match router.set(follower, 1, 3, "y", "1").await {
        Err(RaftError::NoLeader { leader: hint }) => assert_eq!(hint, Some(leader)),
        other => panic!("expected NoLeader with a hint, got {:?}", other),
    }

    Ok(())
}
