mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use conclave::entry::EntryPayload;
use conclave::Role;
use fixtures::RaftRouter;
use pretty_assertions::assert_eq;

/// Conflicting suffix convergence.
///
/// - partitions the leader away after it has committed index 2.
/// - lets it append divergent entries which can never commit.
/// - the majority elects a new leader and commits different entries at those indices.
/// - on heal, the old leader steps down, its divergent suffix is truncated, and all
///   three logs converge (log matching).
///
/// RUST_LOG=conclave,log_conflict=trace cargo test --test log_conflict
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conflicting_suffix_is_truncated() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    for id in 1..=3 {
        router.new_raft_node(id).await?;
    }
    router.bootstrap_cluster(&[1, 2, 3]).await?;

    let old_leader = router.wait_for_leader(Duration::from_secs(5), "initial election").await?;
    router.wait_for_log(&[1, 2, 3], 1, Some(Duration::from_secs(3)), "initial entry").await?;
    router.set(old_leader, 1, 1, "k1", "v1").await?;
    router.wait_for_log(&[1, 2, 3], 2, Some(Duration::from_secs(3)), "first command").await?;

    tracing::info!(old_leader, "--- partitioning the leader");
    router.isolate_node(old_leader).await;

    // Divergent appends on the isolated leader; the completions can never arrive, so
    // they are detached and later resolve with a leader hint.
    for sequence in 2..=3 {
        let r = router.clone();
        tokio::spawn(async move {
            let _ = r.set(old_leader, 1, sequence, "divergent", "x").await;
        });
    }
    router
        .wait_for_metrics(
            &old_leader,
            |m| m.last_log_index >= 4,
            Some(Duration::from_secs(2)),
            "divergent entries appended",
        )
        .await?;

    // The majority side elects a replacement and commits different entries at the same
    // indices.
    let new_leader = router.wait_for_leader(Duration::from_secs(5), "majority re-election").await?;
    assert_ne!(new_leader, old_leader);
    router.set(new_leader, 2, 1, "k2", "v2").await?;

    let target = router
        .wait_for_metrics(&new_leader, |m| m.role == Role::Leader, None, "new leader settled")
        .await?
        .last_log_index;

    tracing::info!("--- healing the partition");
    router.restore_node(old_leader).await;

    router
        .wait_for_metrics(
            &old_leader,
            |m| m.role != Role::Leader,
            Some(Duration::from_secs(3)),
            "deposed leader steps down",
        )
        .await?;
    router.wait_for_log(&[1, 2, 3], target, Some(Duration::from_secs(5)), "logs converged").await?;

    // The divergent suffix is gone: index 3 now holds the new leader's term opener.
    let entry = router.log_entry(old_leader, 3).await?.expect("index 3 should exist");
    assert_eq!(entry.payload, EntryPayload::Initialize);
    assert!(entry.term > 1, "index 3 must come from the new leadership");

    router.assert_logs_match(&[1, 2, 3], target).await?;

    // The divergent write never reached any state machine.
    for id in 1..=3 {
        let node = router.get_node(id).await?;
        assert_eq!(node.state_machine.value("divergent").await, None);
        assert_eq!(node.state_machine.value("k2").await.as_deref(), Some("v2"));
    }

    Ok(())
}
