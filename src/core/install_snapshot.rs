//! InstallRequest handling: receiving a snapshot streamed by the leader.

use tokio::io::AsyncWriteExt;

use crate::core::RaftCore;
use crate::core::Role;
use crate::core::SnapshotState;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::network::RaftNetwork;
use crate::raft::InstallRequest;
use crate::raft::InstallResponse;
use crate::state_machine::SnapshotMeta;
use crate::state_machine::StateMachine;
use crate::MessageSummary;
use crate::Update;

impl<N: RaftNetwork, M: StateMachine> RaftCore<N, M> {
    /// Handle an InstallRequest carrying a chunk of the leader's snapshot (§7).
    ///
    /// Chunks must arrive contiguously; the response's `next_offset` is authoritative,
    /// so a receiver seeing a gap answers with the offset it expects instead of failing
    /// the stream, and 0 demands a restart. The stream identity is the snapshot's
    /// `(index, term)` pair.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req = %req.summary()))]
    pub(super) async fn handle_install_request(&mut self, req: InstallRequest) -> RaftResult<InstallResponse> {
        if req.term < self.current_term {
            return Ok(InstallResponse {
                term: self.current_term,
                next_offset: 0,
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
        if matches!(self.target_role, Role::Candidate | Role::Leader) {
            self.set_target_role(Role::Follower);
            report_metrics = true;
        }
        if report_metrics {
            self.report_metrics(Update::Ignore);
        }

        let id = SnapshotMeta {
            index: req.snapshot_index,
            term: req.snapshot_term,
        };

        match self.snapshot_state.take() {
            None => self.begin_installing_snapshot(req, id).await,
            Some(SnapshotState::Snapshotting { handle, .. }) => {
                // Installation from the leader preempts a local snapshot job.
                handle.abort();
                self.begin_installing_snapshot(req, id).await
            }
            Some(SnapshotState::Streaming { offset, id: current, snapshot }) => {
                if current == id {
                    if req.offset != offset {
                        // Out of order; point the leader at the resume offset.
                        self.snapshot_state = Some(SnapshotState::Streaming {
                            offset,
                            id: current,
                            snapshot,
                        });
                        return Ok(InstallResponse {
                            term: self.current_term,
                            next_offset: offset,
                        });
                    }
                    return self.continue_installing_snapshot(req, offset, id, snapshot).await;
                }
                if req.offset == 0 {
                    // A different snapshot from scratch replaces the current stream.
                    return self.begin_installing_snapshot(req, id).await;
                }
                // Mid-stream chunk of an unknown snapshot; demand a restart.
                Ok(InstallResponse {
                    term: self.current_term,
                    next_offset: 0,
                })
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, req, id))]
    async fn begin_installing_snapshot(
        &mut self,
        req: InstallRequest,
        id: SnapshotMeta,
    ) -> RaftResult<InstallResponse> {
        if req.offset > 0 {
            return Ok(InstallResponse {
                term: self.current_term,
                next_offset: 0,
            });
        }

        let mut snapshot =
            self.state_machine.begin_receiving_snapshot().await.map_err(|err| self.map_fatal_storage_error(err))?;
        snapshot.as_mut().write_all(&req.data).await.map_err(|err| RaftError::Storage(err.into()))?;
        let next_offset = req.data.len() as u64;

        if req.complete {
            self.finalize_snapshot_installation(id, snapshot).await?;
            return Ok(InstallResponse {
                term: self.current_term,
                next_offset,
            });
        }

        self.snapshot_state = Some(SnapshotState::Streaming {
            offset: next_offset,
            id,
            snapshot,
        });
        Ok(InstallResponse {
            term: self.current_term,
            next_offset,
        })
    }

    #[tracing::instrument(level = "debug", skip(self, req, id, snapshot))]
    async fn continue_installing_snapshot(
        &mut self,
        req: InstallRequest,
        mut offset: u64,
        id: SnapshotMeta,
        mut snapshot: Box<M::SnapshotData>,
    ) -> RaftResult<InstallResponse> {
        if let Err(err) = snapshot.as_mut().write_all(&req.data).await {
            self.snapshot_state = Some(SnapshotState::Streaming { offset, id, snapshot });
            return Err(RaftError::Storage(err.into()));
        }
        offset += req.data.len() as u64;

        if req.complete {
            self.finalize_snapshot_installation(id, snapshot).await?;
        } else {
            self.snapshot_state = Some(SnapshotState::Streaming { offset, id, snapshot });
        }
        Ok(InstallResponse {
            term: self.current_term,
            next_offset: offset,
        })
    }

    /// Finalize the installation of a fully received snapshot.
    ///
    /// The state machine swaps in the snapshot contents; the log keeps any suffix which
    /// agrees with the snapshot boundary and is otherwise restarted beyond it.
    #[tracing::instrument(level = "debug", skip(self, snapshot), fields(snapshot = %id.log_id()))]
    async fn finalize_snapshot_installation(
        &mut self,
        id: SnapshotMeta,
        mut snapshot: Box<M::SnapshotData>,
    ) -> RaftResult<()> {
        snapshot.as_mut().shutdown().await.map_err(|err| self.map_fatal_storage_error(err.into()))?;
        self.state_machine
            .install_snapshot(&id, snapshot)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        let boundary = id.log_id();
        match self.log.term_at(boundary.index).await {
            Some(term) if term == boundary.term => {
                self.log.commit(boundary.index).await;
                self.log.compact(boundary.index).await.map_err(|err| self.map_fatal_storage_error(err.into()))?;
            }
            _ => {
                self.log.reset(boundary).await.map_err(|err| self.map_fatal_storage_error(err.into()))?;
                self.last_log_id = boundary;
            }
        }
        if self.last_log_id.index < boundary.index {
            self.last_log_id = boundary;
        }
        self.last_applied = boundary;
        self.snapshot_last_log_id = boundary;
        if boundary.index > self.commit_index {
            self.commit_index = boundary.index;
            if self.first_commit_index.is_none() {
                self.first_commit_index = Some(boundary.index);
            }
        }
        self.report_metrics(Update::Ignore);
        tracing::info!(snapshot = %boundary, "snapshot installed");
        Ok(())
    }
}
