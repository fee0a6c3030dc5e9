//! Vote and pre-vote handling, and the candidate's campaign.

use tokio::sync::mpsc;
use tracing_futures::Instrument;

use crate::core::Ballot;
use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::Role;
use crate::core::UpdateCurrentLeader;
use crate::entry::MemberType;
use crate::error::RaftResult;
use crate::network::RaftNetwork;
use crate::raft::PollRequest;
use crate::raft::PollResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::state_machine::StateMachine;
use crate::ServerId;
use crate::Update;

impl<N: RaftNetwork, M: StateMachine> RaftCore<N, M> {
    /// Check if the given candidate log position is at least as up-to-date as ours (§5.4.1):
    /// the higher last term wins, then the higher last index.
    pub(super) fn is_log_up_to_date(&self, last_log_term: u64, last_log_index: u64) -> bool {
        last_log_term > self.last_log_id.term
            || (last_log_term == self.last_log_id.term && last_log_index >= self.last_log_id.index)
    }

    /// Handle a VoteRequest.
    ///
    /// A vote is granted only if the term is current, no conflicting vote was cast this
    /// term, and the candidate's log is up-to-date; the `(term, voted_for)` pair is
    /// persisted before the grant leaves this server. Non-ACTIVE members never grant.
    #[tracing::instrument(level = "debug", skip(self, req), fields(candidate = req.candidate, term = req.term))]
    pub(super) async fn handle_vote_request(&mut self, req: VoteRequest) -> RaftResult<VoteResponse> {
        if req.term < self.current_term {
            tracing::debug!(
                { candidate = req.candidate, term = req.term, current = self.current_term },
                "vote request with stale term"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                voted: false,
            });
        }

        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.update_current_leader(UpdateCurrentLeader::Unknown);
            self.save_hard_state().await?;
            if matches!(self.target_role, Role::Candidate | Role::Leader) {
                self.set_target_role(Role::Follower);
            }
            self.report_metrics(Update::Ignore);
        }

        if self.cluster.local_type() != MemberType::Active {
            return Ok(VoteResponse {
                term: self.current_term,
                voted: false,
            });
        }

        if !self.is_log_up_to_date(req.last_log_term, req.last_log_index) {
            tracing::debug!(candidate = req.candidate, "rejecting vote: candidate log is not up-to-date");
            return Ok(VoteResponse {
                term: self.current_term,
                voted: false,
            });
        }

        match self.voted_for {
            None => {
                self.voted_for = Some(req.candidate);
                // The vote must be durable before the response is visible (§5.4.1).
                self.save_hard_state().await?;
                self.update_next_election_timeout(false);
                self.report_metrics(Update::Ignore);
                tracing::debug!(candidate = req.candidate, term = self.current_term, "vote granted");
                Ok(VoteResponse {
                    term: self.current_term,
                    voted: true,
                })
            }
            Some(candidate) if candidate == req.candidate => Ok(VoteResponse {
                term: self.current_term,
                voted: true,
            }),
            Some(_) => Ok(VoteResponse {
                term: self.current_term,
                voted: false,
            }),
        }
    }

    /// Handle a PollRequest (pre-vote).
    ///
    /// Non-binding: mutates nothing and persists nothing. The answer mirrors what a
    /// VoteRequest at the next term would receive from this server right now.
    #[tracing::instrument(level = "debug", skip(self, req), fields(candidate = req.candidate, term = req.term))]
    pub(super) fn handle_poll_request(&self, req: &PollRequest) -> PollResponse {
        let accepted = req.term >= self.current_term
            && self.cluster.local_type() == MemberType::Active
            && matches!(self.target_role, Role::Follower | Role::Candidate)
            && self.is_log_up_to_date(req.last_log_term, req.last_log_index);
        PollResponse {
            term: self.current_term,
            accepted,
        }
    }
}

impl<'a, N: RaftNetwork, M: StateMachine> CandidateState<'a, N, M> {
    /// Send PollRequests to all ACTIVE peers in parallel, at the current (un-incremented)
    /// term.
    #[tracing::instrument(level = "trace", skip(self, tx_ballot))]
    pub(super) fn spawn_parallel_poll_requests(&self, tx_ballot: &mpsc::UnboundedSender<(Ballot, ServerId)>) {
        let rpc = PollRequest {
            term: self.core.current_term,
            candidate: self.core.id,
            last_log_index: self.core.last_log_id.index,
            last_log_term: self.core.last_log_id.term,
        };
        for target in self.active_peers() {
            let rpc = rpc.clone();
            let network = self.core.network.clone();
            let tx = tx_ballot.clone();
            tokio::spawn(
                async move {
                    match network.send_poll(target, rpc).await {
                        Ok(res) => {
                            let _ = tx.send((Ballot::Poll(res), target));
                        }
                        Err(err) => tracing::warn!(peer = target, error = %err, "error sending PollRequest"),
                    }
                }
                .instrument(tracing::debug_span!("poll", peer = target)),
            );
        }
    }

    /// Send VoteRequests to all ACTIVE peers in parallel, at the freshly incremented term.
    #[tracing::instrument(level = "trace", skip(self, tx_ballot))]
    pub(super) fn spawn_parallel_vote_requests(&self, tx_ballot: &mpsc::UnboundedSender<(Ballot, ServerId)>) {
        let rpc = VoteRequest {
            term: self.core.current_term,
            candidate: self.core.id,
            last_log_index: self.core.last_log_id.index,
            last_log_term: self.core.last_log_id.term,
        };
        for target in self.active_peers() {
            let rpc = rpc.clone();
            let network = self.core.network.clone();
            let tx = tx_ballot.clone();
            tokio::spawn(
                async move {
                    match network.send_vote(target, rpc).await {
                        Ok(res) => {
                            let _ = tx.send((Ballot::Vote(res), target));
                        }
                        Err(err) => tracing::warn!(peer = target, error = %err, "error sending VoteRequest"),
                    }
                }
                .instrument(tracing::debug_span!("vote", peer = target)),
            );
        }
    }

    fn active_peers(&self) -> Vec<ServerId> {
        self.core
            .cluster
            .configuration()
            .active_ids()
            .into_iter()
            .filter(|id| *id != self.core.id)
            .collect()
    }

    /// The pre-vote quorum granted; increment the term, vote for ourselves, persist, and
    /// request binding votes.
    #[tracing::instrument(level = "debug", skip(self, tx_ballot), fields(id = self.core.id))]
    pub(super) async fn start_election(
        &mut self,
        tx_ballot: &mpsc::UnboundedSender<(Ballot, ServerId)>,
    ) -> RaftResult<()> {
        self.in_vote_phase = true;
        self.core.update_next_election_timeout(false);
        self.core.current_term += 1;
        self.core.voted_for = Some(self.core.id);
        self.core.update_current_leader(UpdateCurrentLeader::Unknown);
        self.core.save_hard_state().await?;
        self.core.report_metrics(Update::Update(None));
        tracing::info!(id = self.core.id, term = self.core.current_term, "campaigning for leadership");

        self.spawn_parallel_vote_requests(tx_ballot);
        if self.votes_granted >= self.votes_needed {
            // Single-member quorum.
            self.become_leader();
        }
        Ok(())
    }

    /// Handle a pre-vote ballot from a peer.
    #[tracing::instrument(level = "debug", skip(self, res, tx_ballot), fields(peer = target))]
    pub(super) async fn handle_poll_response(
        &mut self,
        res: PollResponse,
        target: ServerId,
        tx_ballot: &mpsc::UnboundedSender<(Ballot, ServerId)>,
    ) -> RaftResult<()> {
        if res.term > self.core.current_term {
            self.core.update_current_term(res.term, None);
            self.core.save_hard_state().await?;
            self.core.set_target_role(Role::Follower);
            return Ok(());
        }
        if self.in_vote_phase || !res.accepted {
            return Ok(());
        }
        self.pre_votes_granted += 1;
        if self.pre_votes_granted >= self.votes_needed {
            self.start_election(tx_ballot).await?;
        }
        Ok(())
    }

    /// Handle a binding vote from a peer.
    #[tracing::instrument(level = "debug", skip(self, res), fields(peer = target))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: ServerId) -> RaftResult<()> {
        if res.term > self.core.current_term {
            tracing::debug!({ res.term }, "reverting to follower due to greater term observed in VoteResponse");
            self.core.update_current_term(res.term, None);
            self.core.save_hard_state().await?;
            self.core.set_target_role(Role::Follower);
            return Ok(());
        }
        if !self.in_vote_phase || !res.voted {
            return Ok(());
        }
        self.votes_granted += 1;
        if self.votes_granted >= self.votes_needed {
            self.become_leader();
        }
        Ok(())
    }

    fn become_leader(&mut self) {
        tracing::info!(id = self.core.id, term = self.core.current_term, "election won");
        self.core.set_target_role(Role::Leader);
    }
}
