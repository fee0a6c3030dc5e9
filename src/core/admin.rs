//! Cluster formation and membership change handling.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::time::timeout;
use tokio::time::Duration;
use tracing_futures::Instrument;

use crate::core::client::PendingEntry;
use crate::core::client::Responder;
use crate::core::InactiveState;
use crate::core::LeaderState;
use crate::core::RaftCore;
use crate::core::Role;
use crate::core::UpdateCurrentLeader;
use crate::entry::Configuration;
use crate::entry::Entry;
use crate::entry::EntryPayload;
use crate::entry::Member;
use crate::entry::MemberType;
use crate::error::BootstrapError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::network::RaftNetwork;
use crate::raft::AdminResponse;
use crate::raft::ConfigureRequest;
use crate::raft::ConfigureResponse;
use crate::raft::JoinRequest;
use crate::raft::LeaveRequest;
use crate::raft::ReconfigureRequest;
use crate::raft::ResponseTx;
use crate::state_machine::StateMachine;
use crate::MessageSummary;
use crate::Update;

impl<'a, N: RaftNetwork, M: StateMachine> InactiveState<'a, N, M> {
    /// Handle a bootstrap command on a pristine server.
    #[tracing::instrument(level = "debug", skip(self, members))]
    pub(super) async fn handle_bootstrap(&mut self, members: Vec<Member>) -> Result<(), BootstrapError> {
        if self.core.last_log_id.index != 0 || self.core.current_term != 0 {
            tracing::error!(
                { last_log_index = self.core.last_log_id.index, term = self.core.current_term },
                "rejecting bootstrap: server already carries state"
            );
            return Err(BootstrapError::NotAllowed);
        }
        if !members.iter().any(|m| m.id == self.core.id) {
            return Err(BootstrapError::LocalMemberMissing);
        }

        // Index 0 marks the formation configuration. It is never written to the log;
        // every server of the initial cluster installs it via its own bootstrap, and it
        // is persisted once the commit index covers it.
        let configuration = Configuration {
            index: 0,
            term: 0,
            timestamp: crate::timestamp_millis(),
            members,
        };
        self.core.cluster.configure(configuration);

        let active = self.core.cluster.configuration().active_ids();
        match self.core.cluster.local_type() {
            MemberType::Active if active.len() == 1 => {
                // The only voter: become leader without an election.
                self.core.current_term += 1;
                self.core.voted_for = Some(self.core.id);
                self.core.set_target_role(Role::Leader);
                self.core.save_hard_state().await?;
            }
            // Everyone else waits for their randomized election timer; ties at formation
            // would otherwise make every server campaign at once.
            _ => self.core.set_target_role(Role::Follower), // Maps through the member type.
        }
        self.core.report_metrics(Update::Update(None));
        Ok(())
    }
}

impl<N: RaftNetwork, M: StateMachine> RaftCore<N, M> {
    /// Handle a ConfigureRequest pushed by the leader.
    ///
    /// Valid in every role; this is the only request an Inactive server accepts, and how
    /// a newly joined server leaves Inactive.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req = %req.summary()))]
    pub(super) async fn handle_configure_request(&mut self, req: ConfigureRequest) -> RaftResult<ConfigureResponse> {
        if req.term < self.current_term {
            return Ok(ConfigureResponse {
                term: self.current_term,
            });
        }
        self.update_term_and_leader(req.term, Some(req.leader)).await?;
        // A candidate or leader hearing from a live same-term leader stands down.
        if matches!(self.target_role, Role::Candidate | Role::Leader) {
            self.set_target_role(Role::Follower);
            self.report_metrics(Update::Ignore);
        }

        let configuration = Configuration {
            index: req.index,
            term: req.term,
            timestamp: req.timestamp,
            members: req.members,
        };
        let outcome = self.cluster.configure(configuration);
        if outcome.installed {
            if self.cluster.needs_commit(self.commit_index) {
                let meta = self.meta.clone();
                self.cluster.commit(&meta).await?;
            }
            if outcome.local_type_changed && self.target_role != Role::Leader {
                self.set_target_role(Role::Follower);
            }
            self.report_metrics(Update::Ignore);
        }

        Ok(ConfigureResponse {
            term: self.current_term,
        })
    }

    /// Install the configuration carried by a log entry the moment it is appended.
    ///
    /// A leader observing its own demotion here defers the transition until the entry
    /// commits; every other role transitions immediately.
    pub(super) fn install_log_configuration(&mut self, entry: &Entry) {
        let members = match &entry.payload {
            EntryPayload::Configuration { members } => members.clone(),
            _ => return,
        };
        let configuration = Configuration {
            index: entry.index,
            term: entry.term,
            timestamp: entry.timestamp,
            members,
        };
        let outcome = self.cluster.configure(configuration);
        if outcome.installed && outcome.local_type_changed && self.target_role != Role::Leader {
            self.set_target_role(Role::Follower);
        }
    }
}

impl<'a, N: RaftNetwork, M: StateMachine> LeaderState<'a, N, M> {
    /// Handle a request to add a single member.
    #[tracing::instrument(level = "debug", skip(self, tx), fields(member = rpc.member.id))]
    pub(super) async fn handle_join(&mut self, rpc: JoinRequest, tx: ResponseTx<AdminResponse>) {
        let current = self.core.cluster.configuration();
        if current.contains(rpc.member.id) {
            // Idempotent: joining an existing member answers with the current roster.
            let _ = tx.send(Ok(self.current_admin_response()));
            return;
        }
        let mut members = current.members.clone();
        members.push(rpc.member);
        self.change_configuration(members, tx).await;
    }

    /// Handle a request to remove a single member.
    #[tracing::instrument(level = "debug", skip(self, tx), fields(member = rpc.member.id))]
    pub(super) async fn handle_leave(&mut self, rpc: LeaveRequest, tx: ResponseTx<AdminResponse>) {
        let current = self.core.cluster.configuration();
        if !current.contains(rpc.member.id) {
            let _ = tx.send(Ok(self.current_admin_response()));
            return;
        }
        let members: Vec<Member> =
            current.members.iter().filter(|m| m.id != rpc.member.id).cloned().collect();
        self.change_configuration(members, tx).await;
    }

    /// Handle a request to replace the membership wholesale.
    #[tracing::instrument(level = "debug", skip(self, rpc, tx))]
    pub(super) async fn handle_reconfigure(&mut self, rpc: ReconfigureRequest, tx: ResponseTx<AdminResponse>) {
        if rpc.index != self.core.cluster.configuration().index {
            let _ = tx.send(Err(RaftError::ConfigurationError(format!(
                "configuration index {} is stale, current is {}",
                rpc.index,
                self.core.cluster.configuration().index
            ))));
            return;
        }
        self.change_configuration(rpc.members, tx).await;
    }

    /// Validate and append a configuration change.
    async fn change_configuration(&mut self, members: Vec<Member>, tx: ResponseTx<AdminResponse>) {
        if self.pending_configuration.is_some() {
            let _ = tx.send(Err(RaftError::ConfigurationError(
                "a configuration change is already in progress".into(),
            )));
            return;
        }
        if members.is_empty() {
            let _ = tx.send(Err(RaftError::ConfigurationError(
                "the cluster must retain at least one member".into(),
            )));
            return;
        }

        let old_active: BTreeSet<_> = self.core.cluster.configuration().active_ids().into_iter().collect();
        let new_active: BTreeSet<_> = members
            .iter()
            .filter(|m| m.member_type == MemberType::Active)
            .map(|m| m.id)
            .collect();
        if new_active.is_empty() {
            let _ = tx.send(Err(RaftError::ConfigurationError(
                "the cluster requires at least one ACTIVE member".into(),
            )));
            return;
        }
        // Single-member change rule: quorum safety holds only when the voting set shifts
        // by at most one server per committed configuration.
        let delta = old_active.symmetric_difference(&new_active).count();
        if delta > 1 {
            let _ = tx.send(Err(RaftError::ConfigurationError(format!(
                "{} ACTIVE members changed; at most one may change per reconfiguration",
                delta
            ))));
            return;
        }

        self.append_configuration(members, Some(tx)).await;
    }

    /// Append a configuration entry, install it, adjust replication and start it towards
    /// commit.
    pub(super) async fn append_configuration(
        &mut self,
        members: Vec<Member>,
        resp_tx: Option<ResponseTx<AdminResponse>>,
    ) {
        let payload = EntryPayload::Configuration { members };
        let entry = match self.append_payload_to_log(payload).await {
            Ok(entry) => entry,
            Err(err) => {
                if let Some(tx) = resp_tx {
                    let _ = tx.send(Err(err));
                }
                return;
            }
        };

        self.pending_configuration = Some(entry.index);
        self.core.install_log_configuration(&entry);
        if self.core.cluster.local_type() != MemberType::Active {
            self.is_stepping_down = true;
        }
        self.update_replication_streams(entry.index);
        self.broadcast_configuration();

        let pending = PendingEntry {
            entry: Arc::new(entry),
            responder: Responder::Admin(resp_tx),
        };
        self.replicate_client_request(pending).await;
    }

    /// Reconcile replication streams with the freshly installed configuration: spawn
    /// streams for new replicating members, mark removed ones for teardown at commit.
    pub(super) fn update_replication_streams(&mut self, configuration_index: u64) {
        let targets: BTreeSet<_> = self
            .core
            .cluster
            .configuration()
            .replication_ids()
            .into_iter()
            .filter(|id| *id != self.core.id)
            .collect();

        for target in targets.iter() {
            if !self.nodes.contains_key(target) {
                tracing::debug!(peer = *target, "spawning replication stream for new member");
                let state = self.spawn_replication_stream(*target);
                self.nodes.insert(*target, state);
            }
        }
        for (id, node) in self.nodes.iter_mut() {
            if targets.contains(id) {
                node.remove_after_commit = None;
            } else {
                node.remove_after_commit = Some(configuration_index);
            }
        }
    }

    /// Push the current configuration to all remote members.
    ///
    /// RESERVE and still-Inactive members receive no AppendRequests, so this is the only
    /// path by which they learn membership; for everyone else it is a cheap no-op.
    pub(super) fn broadcast_configuration(&self) {
        let configuration = self.core.cluster.configuration().clone();
        let ttl = Duration::from_millis(self.core.config.heartbeat_interval);
        for member in configuration.members.iter().filter(|m| m.id != self.core.id) {
            let rpc = ConfigureRequest {
                index: configuration.index,
                term: self.core.current_term,
                timestamp: configuration.timestamp,
                leader: self.core.id,
                members: configuration.members.clone(),
            };
            let network = self.core.network.clone();
            let target = member.id;
            tokio::spawn(
                async move {
                    if let Ok(Err(err)) = timeout(ttl, network.send_configure(target, rpc)).await {
                        tracing::debug!(peer = target, error = %err, "error sending ConfigureRequest");
                    }
                }
                .instrument(tracing::debug_span!("configure", peer = target)),
            );
        }
    }

    /// Actions taken once a configuration entry commits: tear down streams for removed
    /// members, publish the roster, and step down if this leader was demoted or removed.
    pub(super) async fn handle_configuration_committed(&mut self) -> RaftResult<()> {
        self.pending_configuration = None;

        let commit_index = self.core.commit_index;
        let removable: Vec<_> = self
            .nodes
            .iter()
            .filter(|(_, node)| {
                node.remove_after_commit
                    .map(|threshold| threshold <= commit_index && node.matched.index >= threshold)
                    .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();
        for target in removable {
            self.remove_replication_stream(target);
        }

        self.broadcast_configuration();

        if self.is_stepping_down || self.core.cluster.local_type() != MemberType::Active {
            tracing::info!(id = self.core.id, "leader stepping down after configuration commit");
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_role(Role::Follower);
        }
        self.leader_report_metrics();
        Ok(())
    }

    pub(super) fn remove_replication_stream(&mut self, target: crate::ServerId) {
        if let Some(node) = self.nodes.remove(&target) {
            tracing::debug!(peer = target, "removing replication stream");
            let _ = node.replstream.repl_tx.send((crate::replication::RaftEvent::Terminate, tracing::debug_span!("CH")));
            self.leader_metrics.replication.remove(&target);
        }
    }

    fn current_admin_response(&self) -> AdminResponse {
        let configuration = self.core.cluster.configuration();
        AdminResponse {
            index: configuration.index,
            term: configuration.term,
            members: configuration.members.clone(),
        }
    }
}
