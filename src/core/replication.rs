//! Leader-side handling of replication stream events.

use tokio::sync::oneshot;
use tracing_futures::Instrument;

use crate::core::LeaderState;
use crate::core::ReplicationState;
use crate::core::Role;
use crate::core::SnapshotState;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::network::RaftNetwork;
use crate::quorum;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationMetrics;
use crate::replication::ReplicationStream;
use crate::state_machine::Snapshot;
use crate::state_machine::StateMachine;
use crate::LogId;
use crate::MessageSummary;
use crate::ServerId;

impl<'a, N: RaftNetwork, M: StateMachine> LeaderState<'a, N, M> {
    /// Spawn a new replication stream returning its handle.
    #[tracing::instrument(level = "debug", skip(self), fields(target))]
    pub(super) fn spawn_replication_stream(&self, target: ServerId) -> ReplicationState {
        let replstream = ReplicationStream::new::<N, M>(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.network.clone(),
            self.core.log.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            matched: LogId::default(),
            remove_after_commit: None,
            replstream,
        }
    }

    /// Handle a replication event coming from one of the spawned streams.
    #[tracing::instrument(level = "trace", skip(self, event), fields(event = %event.summary()))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent<M::SnapshotData>) -> RaftResult<()> {
        match event {
            ReplicaEvent::UpdateMatchIndex { target, matched } => {
                self.handle_update_match_index(target, matched).await
            }
            ReplicaEvent::RevertToFollower { target, term } => {
                self.handle_revert_to_follower(target, term).await
            }
            ReplicaEvent::NeedsSnapshot { target, tx } => self.handle_needs_snapshot(target, tx).await,
            ReplicaEvent::Shutdown => {
                self.core.set_target_role(Role::Shutdown);
                Ok(())
            }
        }
    }

    /// Handle updated match index reports, advancing the commit index when a quorum of
    /// ACTIVE members has stored an entry of the current term (§5.4.2).
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_update_match_index(&mut self, target: ServerId, matched: LogId) -> RaftResult<()> {
        let commit_index = self.core.commit_index;
        let (matched, remove_after_commit) = match self.nodes.get_mut(&target) {
            Some(node) => {
                if matched > node.matched {
                    node.matched = matched;
                }
                (node.matched, node.remove_after_commit)
            }
            None => return Ok(()),
        };
        // A stream marked for removal is torn down once it has replicated the
        // configuration which removed it.
        if let Some(threshold) = remove_after_commit {
            if threshold <= commit_index && matched.index >= threshold {
                self.remove_replication_stream(target);
            }
        }
        if self.nodes.contains_key(&target) {
            self.leader_metrics.replication.insert(target, ReplicationMetrics { matched });
        }

        let potential = self.calc_potential_commit();
        self.commit_entries(potential).await?;
        self.leader_report_metrics();
        Ok(())
    }

    /// The highest index stored on a quorum of ACTIVE members.
    fn calc_potential_commit(&self) -> u64 {
        let active = self.core.cluster.configuration().active_ids();
        let mut indices: Vec<u64> = active
            .iter()
            .map(|id| {
                if *id == self.core.id {
                    self.core.last_log_id.index
                } else {
                    self.nodes.get(id).map(|n| n.matched.index).unwrap_or(0)
                }
            })
            .collect();
        if indices.is_empty() {
            return self.core.commit_index;
        }
        indices.sort_unstable_by(|a, b| b.cmp(a));
        indices[quorum::majority_of(indices.len()) - 1]
    }

    /// Advance the commit index to `potential` if permitted, completing pending client
    /// requests and configuration changes covered by it.
    ///
    /// An entry from an earlier term is never committed by match count alone; the guard
    /// holds commitment back until an entry of the current term reaches the quorum.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_entries(&mut self, potential: u64) -> RaftResult<()> {
        if potential <= self.core.commit_index {
            return Ok(());
        }
        match self.core.log.term_at(potential).await {
            Some(term) if term == self.core.current_term => {}
            _ => return Ok(()),
        }

        self.core.commit_index = potential;
        if self.core.first_commit_index.is_none() {
            self.core.first_commit_index = Some(potential);
        }
        self.core.log.commit(potential).await;
        tracing::debug!(commit_index = potential, "advancing commit index");

        // Propagate the new commit index to the streams so followers learn it promptly.
        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send((
                RaftEvent::UpdateCommitIndex {
                    commit_index: potential,
                },
                tracing::debug_span!("CH"),
            ));
        }

        // Complete committed client requests in index order.
        let mut committed = Vec::new();
        let awaiting = std::mem::take(&mut self.awaiting_committed);
        for pending in awaiting {
            if pending.entry.index <= potential {
                committed.push(pending);
            } else {
                self.awaiting_committed.push(pending);
            }
        }
        for pending in committed {
            self.client_request_post_commit(pending).await;
        }

        if self.core.cluster.needs_commit(self.core.commit_index) {
            let meta = self.core.meta.clone();
            self.core.cluster.commit(&meta).await?;
            self.handle_configuration_committed().await?;
        } else if self.pending_configuration.map(|index| index <= potential).unwrap_or(false) {
            // The configuration was already persisted (e.g. re-proposed on recovery).
            self.handle_configuration_committed().await?;
        }

        self.leader_report_metrics();
        Ok(())
    }

    /// A stream observed a higher term; revert to follower.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn handle_revert_to_follower(&mut self, target: ServerId, term: u64) -> RaftResult<()> {
        if term > self.core.current_term {
            self.core.update_next_election_timeout(false);
            self.core.update_current_term(term, None);
            self.core.save_hard_state().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_role(Role::Follower);
        }
        Ok(())
    }

    /// A stream needs a snapshot to bring its target up to speed.
    ///
    /// Answers with the current snapshot if one exists; otherwise forces a snapshot job
    /// and delivers the result once it lands.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    async fn handle_needs_snapshot(
        &mut self,
        target: ServerId,
        tx: oneshot::Sender<Snapshot<M::SnapshotData>>,
    ) -> RaftResult<()> {
        if let Some(snapshot) = self
            .core
            .state_machine
            .current_snapshot()
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?
        {
            let _ = tx.send(snapshot);
            return Ok(());
        }

        if self.core.snapshot_state.is_none() {
            self.core.trigger_log_compaction_if_needed(true);
        }
        let sender = match &self.core.snapshot_state {
            Some(SnapshotState::Snapshotting { sender, .. }) => sender.clone(),
            // Nothing to snapshot yet (nothing applied); the stream retries later.
            _ => return Ok(()),
        };

        let mut rx = sender.subscribe();
        let state_machine = self.core.state_machine.clone();
        tokio::spawn(
            async move {
                let _ = rx.recv().await;
                if let Ok(Some(snapshot)) = state_machine.current_snapshot().await {
                    let _ = tx.send(snapshot);
                }
            }
            .instrument(tracing::debug_span!("snapshot-wait", peer = target)),
        );
        Ok(())
    }
}
