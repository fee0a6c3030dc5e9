//! AppendRequest handling for replica roles.

use crate::core::RaftCore;
use crate::core::Role;
use crate::core::UpdateCurrentLeader;
use crate::entry::Entry;
use crate::entry::EntryPayload;
use crate::error::RaftResult;
use crate::network::RaftNetwork;
use crate::raft::AppendRequest;
use crate::raft::AppendResponse;
use crate::state_machine::StateMachine;
use crate::MessageSummary;
use crate::Update;

impl<N: RaftNetwork, M: StateMachine> RaftCore<N, M> {
    /// Handle an AppendRequest from the cluster leader.
    ///
    /// A stale term is rejected outright. Otherwise the election timer is re-armed, the
    /// leader claim is recorded, the §5.3 consistency check runs against `prev_log_index`,
    /// any conflicting suffix is truncated, the new entries are appended and flushed, and
    /// the commit index follows the leader's.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req = %req.summary()))]
    pub(super) async fn handle_append_request(&mut self, req: AppendRequest) -> RaftResult<AppendResponse> {
        if req.term < self.current_term {
            tracing::debug!({ req.term, self.current_term }, "AppendRequest from stale term");
            return Ok(AppendResponse {
                term: self.current_term,
                succeeded: false,
                log_index: self.last_log_id.index,
            });
        }

        self.update_next_election_timeout(true);

        let mut report_metrics = false;
        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }
        if self.current_leader != Some(req.leader) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader));
            report_metrics = true;
        }
        // A candidate or leader hearing from a live same-term leader stands down.
        if matches!(self.target_role, Role::Candidate | Role::Leader) {
            self.set_target_role(Role::Follower);
            report_metrics = true;
        }

        // Consistency check (§5.3): the entry preceding the batch must match the leader's
        // view, otherwise hint where replication should resume.
        if req.prev_log_index > 0 {
            match self.log.term_at(req.prev_log_index).await {
                Some(term) if term == req.prev_log_term => {}
                local => {
                    let hint = std::cmp::min(self.last_log_id.index, req.prev_log_index);
                    tracing::debug!(
                        prev_log_index = req.prev_log_index,
                        prev_log_term = req.prev_log_term,
                        ?local,
                        hint,
                        "log consistency check failed"
                    );
                    if report_metrics {
                        self.report_metrics(Update::Ignore);
                    }
                    return Ok(AppendResponse {
                        term: self.current_term,
                        succeeded: false,
                        log_index: hint,
                    });
                }
            }
        }

        self.append_log_entries(&req.entries).await?;

        let new_commit = std::cmp::min(req.commit_index, self.last_log_id.index);
        self.update_commit_index(new_commit).await?;

        self.report_metrics(Update::Ignore);
        Ok(AppendResponse {
            term: self.current_term,
            succeeded: true,
            log_index: self.last_log_id.index,
        })
    }

    /// Fold a batch of replicated entries into the local log.
    ///
    /// Entries already present with the same term are skipped (idempotent replays); the
    /// first entry disagreeing on term truncates the local suffix from that point.
    async fn append_log_entries(&mut self, entries: &[Entry]) -> RaftResult<()> {
        let first_index = self.log.first_index().await;
        let mut offset = entries.len();
        for (i, entry) in entries.iter().enumerate() {
            match self.log.term_at(entry.index).await {
                Some(term) if term == entry.term => continue,
                Some(conflict) => {
                    tracing::debug!(
                        index = entry.index,
                        local_term = conflict,
                        leader_term = entry.term,
                        "truncating conflicting suffix"
                    );
                    self.log
                        .truncate(entry.index - 1)
                        .await
                        .map_err(|err| self.map_fatal_storage_error(err.into()))?;
                    self.last_log_id = self.log.last_log_id().await;
                    offset = i;
                    break;
                }
                // Entries behind the compaction boundary are already covered by the
                // snapshot and immutable.
                None if entry.index < first_index => continue,
                None => {
                    offset = i;
                    break;
                }
            }
        }

        if offset >= entries.len() {
            return Ok(());
        }

        for entry in &entries[offset..] {
            self.log.append(entry).await.map_err(|err| self.map_fatal_storage_error(err.into()))?;
            self.last_log_id = entry.log_id();
            // Configuration entries take effect as soon as they are appended, not at
            // commit (§6).
            if matches!(entry.payload, EntryPayload::Configuration { .. }) {
                self.install_log_configuration(entry);
            }
        }
        self.log.flush().await.map_err(|err| self.map_fatal_storage_error(err.into()))?;
        Ok(())
    }
}
