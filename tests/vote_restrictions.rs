mod fixtures;

use std::sync::Arc;

use anyhow::Result;
use conclave::entry::EntryPayload;
use conclave::raft::AppendRequest;
use conclave::raft::PollRequest;
use conclave::raft::VoteRequest;
use conclave::Entry;
use fixtures::RaftRouter;
use pretty_assertions::assert_eq;

fn command_entry(index: u64, term: u64) -> Entry {
    Entry {
        index,
        term,
        timestamp: 0,
        payload: EntryPayload::Command {
            session: 9,
            sequence: index,
            operation: format!("set k{} v", index).into_bytes(),
        },
    }
}

/// Vote restrictions at the RPC level.
///
/// Drives a single live server (its configured peer never starts) directly through the
/// RPC surface:
/// - a candidate with a longer log but a stale last term is rejected (§5.4.1: last term
///   wins over index).
/// - an up-to-date candidate is granted, and the grant is durable before the response.
/// - at most one vote per term; the same candidate may re-request idempotently.
/// - polls never mutate persistent state.
///
/// RUST_LOG=conclave,vote_restrictions=trace cargo test --test vote_restrictions
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn vote_up_to_date_and_single_vote() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(fixtures::test_config()));
    router.new_raft_node(1).await?;
    let node = router.get_node(1).await?;

    // Two ACTIVE members, but server 2 never starts: server 1 can never win a pre-vote
    // quorum on its own, so its term stays wherever our RPCs put it.
    node.raft.bootstrap(vec![fixtures::active_member(1), fixtures::active_member(2)]).await?;

    // Build a ten-entry log ending in term 2 through the replication path.
    let entries: Vec<Entry> = (1..=10).map(|i| command_entry(i, 2)).collect();
    let res = node
        .raft
        .append(AppendRequest {
            term: 2,
            leader: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries,
            commit_index: 0,
        })
        .await?;
    assert!(res.succeeded);
    assert_eq!(res.log_index, 10);

    // Higher last index, lower last term: must be rejected.
    let res = node
        .raft
        .vote(VoteRequest {
            term: 3,
            candidate: 3,
            last_log_index: 12,
            last_log_term: 1,
        })
        .await?;
    assert!(!res.voted, "a stale last term must lose to a shorter, newer log");
    assert_eq!(res.term, 3, "the term observation itself still advances");
    let record = node.meta.load().await;
    assert_eq!(record.current_term, 3);
    assert_eq!(record.voted_for, None, "term advance clears the vote");

    // An up-to-date candidate in the same term is granted, durably.
    let res = node
        .raft
        .vote(VoteRequest {
            term: 3,
            candidate: 4,
            last_log_index: 10,
            last_log_term: 2,
        })
        .await?;
    assert!(res.voted);
    assert_eq!(node.meta.load().await.voted_for, Some(4), "the grant is persisted before responding");

    // Only one vote per term.
    let res = node
        .raft
        .vote(VoteRequest {
            term: 3,
            candidate: 5,
            last_log_index: 99,
            last_log_term: 9,
        })
        .await?;
    assert!(!res.voted, "a second candidate in the same term is refused");

    // The original candidate may ask again and still hold the vote.
    let res = node
        .raft
        .vote(VoteRequest {
            term: 3,
            candidate: 4,
            last_log_index: 10,
            last_log_term: 2,
        })
        .await?;
    assert!(res.voted);

    // Polls are non-binding: even at a higher term nothing is recorded.
    let res = node
        .raft
        .poll(PollRequest {
            term: 4,
            candidate: 6,
            last_log_index: 1,
            last_log_term: 1,
        })
        .await?;
    assert!(!res.accepted, "a stale log is not promised a vote");
    let record = node.meta.load().await;
    assert_eq!(record.current_term, 3, "polls never touch the term");
    assert_eq!(record.voted_for, Some(4), "polls never touch the vote");

    Ok(())
}
