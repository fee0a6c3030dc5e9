mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use conclave::log::LogOptions;
use conclave::Config;
use conclave::Role;
use conclave::SnapshotPolicy;
use fixtures::RaftRouter;
use pretty_assertions::assert_eq;

/// Snapshot install to a fresh follower.
///
/// - a single-server cluster commits enough entries to cross the snapshot threshold and
///   compacts its log.
/// - a pristine server joins; its replication position lies before the leader's
///   `first_index`, so the leader streams the snapshot.
/// - the follower installs it, advances its own compaction boundary, and then accepts
///   ordinary AppendRequests for the remaining suffix.
///
/// RUST_LOG=conclave,snapshot_install=trace cargo test --test snapshot_install
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_streams_to_new_follower() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(
        Config::build("test".into())
            .heartbeat_interval(50)
            .election_timeout(250)
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(40))
            .validate()
            .expect("failed to build Raft config"),
    );
    // Small segments so compaction actually deletes files.
    let router = Arc::new(RaftRouter::with_log_options(config, LogOptions {
        max_segment_entries: 16,
        max_segment_bytes: 1024 * 1024,
    }));

    router.new_raft_node(1).await?;
    router.get_node(1).await?.raft.bootstrap(vec![fixtures::active_member(1)]).await?;
    router.wait_for_role(&[1], Role::Leader, Some(Duration::from_secs(3)), "single-voter leader").await?;

    tracing::info!("--- writing past the snapshot threshold");
    for sequence in 1..=60u64 {
        router.set(1, 1, sequence, &format!("x{}", sequence), &format!("{}", sequence)).await?;
    }
    let leader_metrics = router
        .wait_for_metrics(
            &1,
            |m| m.snapshot.index >= 40,
            Some(Duration::from_secs(5)),
            "snapshot taken",
        )
        .await?;

    let leader_node = router.get_node(1).await?;
    let first_index = leader_node.log.first_index().await;
    assert_eq!(first_index, leader_metrics.snapshot.index + 1, "log compacted behind the snapshot");

    tracing::info!("--- joining a pristine server");
    router.new_raft_node(2).await?;
    // The join resolves once server 2 has the configuration entry, which requires the
    // full snapshot-then-append catch-up to complete first.
    router.join(1, fixtures::active_member(2)).await?;

    let last_log = router
        .wait_for_metrics(&1, |m| m.role == Role::Leader, None, "leader settled")
        .await?
        .last_log_index;
    router.wait_for_log(&[2], last_log, Some(Duration::from_secs(5)), "follower fully caught up").await?;

    let m2 = router
        .wait_for_metrics(&2, |m| m.role == Role::Follower, Some(Duration::from_secs(3)), "follower role")
        .await?;
    assert!(m2.snapshot.index >= 40, "the follower holds the installed snapshot");

    let node2 = router.get_node(2).await?;
    assert_eq!(
        node2.log.first_index().await,
        m2.snapshot.index + 1,
        "the follower's log starts after the snapshot boundary"
    );

    // State from before the snapshot boundary arrived via the snapshot, the rest via
    // ordinary replication.
    assert_eq!(node2.state_machine.value("x1").await.as_deref(), Some("1"));
    assert_eq!(node2.state_machine.value("x60").await.as_deref(), Some("60"));
    assert_eq!(node2.state_machine.dump().await, leader_node.state_machine.dump().await);

    Ok(())
}
