//! The core logic of a Raft server.

mod admin;
mod append;
mod client;
mod install_snapshot;
mod replication;
mod vote;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::AbortHandle;
use futures::future::Abortable;
use futures::stream::FuturesOrdered;
use futures::stream::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::cluster::Cluster;
use crate::config::Config;
use crate::config::SnapshotPolicy;
use crate::core::client::PendingEntry;
use crate::entry::MemberType;
use crate::error::BootstrapError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::log::Log;
use crate::meta::MetaStore;
use crate::metrics::LeaderMetrics;
use crate::metrics::RaftMetrics;
use crate::network::RaftNetwork;
use crate::raft::MetadataResponse;
use crate::raft::RaftMsg;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::state_machine::SnapshotMeta;
use crate::state_machine::StateMachine;
use crate::LogId;
use crate::ServerId;
use crate::Update;

/// The core type implementing the Raft protocol.
///
/// One spawned task owns this value exclusively; every RPC handler, timer arm and
/// completion runs on that task, which is what upholds the single-writer invariant over
/// the term, log and configuration state.
pub struct RaftCore<N: RaftNetwork, M: StateMachine> {
    /// This server's ID.
    id: ServerId,
    /// This server's runtime config.
    config: Arc<Config>,
    /// The live cluster roster.
    cluster: Cluster,
    /// The `RaftNetwork` implementation.
    network: Arc<N>,
    /// The replicated log.
    log: Arc<Log>,
    /// The persistent term/vote/configuration record.
    meta: Arc<MetaStore>,
    /// The state-machine executor.
    state_machine: Arc<M>,

    /// The role the main loop should be running.
    target_role: Role,

    /// The index of the highest log entry known to be committed cluster-wide.
    ///
    /// Always starts at 0 on boot; it is re-learned from the leader (or from a quorum
    /// when this server leads) and never persisted.
    commit_index: u64,
    /// The first commit index observed during this process lifetime.
    first_commit_index: Option<u64>,
    /// The id of the highest log entry applied to the state machine.
    last_applied: LogId,

    /// The current term.
    ///
    /// Monotonically non-decreasing; any observation of a higher term clears `voted_for`
    /// and `current_leader` and forces a transition out of Candidate/Leader.
    current_term: u64,
    /// The ID of the current cluster leader, if known.
    current_leader: Option<ServerId>,
    /// The candidate which received this server's vote in `current_term`, if any.
    voted_for: Option<ServerId>,

    /// The id of the last entry appended to the log.
    last_log_id: LogId,

    /// The server's current snapshot activity, if any.
    snapshot_state: Option<SnapshotState<M::SnapshotData>>,
    /// The id of the last entry covered by the current snapshot.
    snapshot_last_log_id: LogId,

    /// Outstanding apply work: at most one task replicating committed entries to the
    /// state machine. Keeping this off the hot path lets AppendRequest handling return
    /// without waiting on the state machine.
    replicate_to_sm_handle: FuturesOrdered<JoinHandle<anyhow::Result<Option<LogId>>>>,

    /// The last time a heartbeat was received.
    last_heartbeat: Option<Instant>,
    /// The deadline of the armed election timer.
    next_election_timeout: Option<Instant>,

    tx_compaction: mpsc::Sender<SnapshotUpdate>,
    rx_compaction: mpsc::Receiver<SnapshotUpdate>,

    rx_api: mpsc::UnboundedReceiver<(RaftMsg, Span)>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<N: RaftNetwork, M: StateMachine> RaftCore<N, M> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: ServerId,
        config: Arc<Config>,
        network: Arc<N>,
        log: Arc<Log>,
        meta: Arc<MetaStore>,
        state_machine: Arc<M>,
        rx_api: mpsc::UnboundedReceiver<(RaftMsg, Span)>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let (tx_compaction, rx_compaction) = mpsc::channel(1);
        let this = Self {
            id,
            config,
            cluster: Cluster::new(id, None),
            network,
            log,
            meta,
            state_machine,
            target_role: Role::Inactive,
            commit_index: 0,
            first_commit_index: None,
            last_applied: LogId::default(),
            current_term: 0,
            current_leader: None,
            voted_for: None,
            last_log_id: LogId::default(),
            snapshot_state: None,
            snapshot_last_log_id: LogId::default(),
            replicate_to_sm_handle: FuturesOrdered::new(),
            last_heartbeat: None,
            next_election_timeout: None,
            tx_compaction,
            rx_compaction,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id, cluster = %self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("raft server is initializing");

        let record = self.meta.load().await;
        self.current_term = record.current_term;
        self.voted_for = record.voted_for;
        self.cluster = Cluster::new(self.id, record.configuration);

        self.last_log_id = self.log.last_log_id().await;
        self.last_applied =
            self.state_machine.last_applied().await.map_err(|err| self.map_fatal_storage_error(err))?;
        // It is unsafe to carry a commit index across restarts; it is re-learned from the
        // leader's AppendRequests or re-derived from a quorum when this server leads.
        self.commit_index = 0;

        if let Some(snapshot) =
            self.state_machine.current_snapshot().await.map_err(|err| self.map_fatal_storage_error(err))?
        {
            let boundary = snapshot.meta.log_id();
            self.snapshot_last_log_id = boundary;
            self.log
                .restore_compaction(boundary)
                .await
                .map_err(|err| self.map_fatal_storage_error(err.into()))?;
            self.last_log_id = self.log.last_log_id().await;
            if self.last_applied.index < boundary.index {
                self.last_applied = boundary;
            }
        }

        // A configuration entry appended after the last committed one takes effect
        // immediately, even before commit.
        if let Some(cfg) =
            self.log.latest_configuration().await.map_err(|err| self.map_fatal_storage_error(err.into()))?
        {
            self.cluster.configure(cfg);
        }

        self.target_role = self.default_role();
        if self.target_role == Role::Follower {
            // Startup grace on top of the usual randomized timeout, so that a restarted
            // server does not drive up the term before communication is established.
            let inst =
                Instant::now() + Duration::from_millis(1000 + self.config.new_rand_election_timeout());
            self.next_election_timeout = Some(inst);
        }

        tracing::debug!(id = self.id, role = ?self.target_role, "initial role");
        self.report_metrics(Update::Update(None));

        loop {
            match &self.target_role {
                Role::Leader => LeaderState::new(&mut self).run().await?,
                Role::Candidate => CandidateState::new(&mut self).run().await?,
                Role::Follower => FollowerState::new(&mut self).run().await?,
                Role::Passive => PassiveState::new(&mut self).run().await?,
                Role::Reserve => ReserveState::new(&mut self).run().await?,
                Role::Inactive => InactiveState::new(&mut self).run().await?,
                Role::Shutdown => {
                    tracing::info!("server has shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// The role dictated by this server's member type in the current configuration.
    fn default_role(&self) -> Role {
        match self.cluster.local_type() {
            MemberType::Active => Role::Follower,
            MemberType::Passive => Role::Passive,
            MemberType::Reserve => Role::Reserve,
            MemberType::Inactive => Role::Inactive,
        }
    }

    /// Update the main loop's target role, mapping `Follower` through the local member
    /// type so that non-voting members land in their proper role.
    fn set_target_role(&mut self, role: Role) {
        let role = if role == Role::Follower { self.default_role() } else { role };
        if role != self.target_role {
            tracing::debug!(id = self.id, from = ?self.target_role, to = ?role, "role transition");
        }
        self.target_role = role;
    }

    /// Report a metrics payload on the current state of the Raft server.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&mut self, leader_metrics: Update<Option<&LeaderMetrics>>) {
        let leader_metrics = match leader_metrics {
            Update::Update(v) => v.cloned(),
            Update::Ignore => self.tx_metrics.borrow().leader_metrics.clone(),
        };

        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            role: self.target_role,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            commit_index: self.commit_index,
            last_applied: self.last_applied.index,
            current_leader: self.current_leader,
            configuration: self.cluster.configuration().clone(),
            snapshot: self.snapshot_last_log_id,
            leader_metrics,
        });

        if let Err(err) = res {
            tracing::error!(error = %err, id = self.id, "error reporting metrics");
        }
    }

    /// Save the server's current hard state to the meta store.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> RaftResult<()> {
        let term = self.current_term;
        let voted_for = self.voted_for;
        self.meta
            .save_vote(term, voted_for)
            .await
            .map_err(|err| self.map_fatal_storage_error(err.into()))
    }

    /// Get the next election timeout, generating a new value if not armed.
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Arm a fresh randomized election timeout.
    ///
    /// If `heartbeat` is true, also record the heartbeat arrival time.
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        self.next_election_timeout =
            Some(now + Duration::from_millis(self.config.new_rand_election_timeout()));
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    /// Update the value of the `current_leader` property.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => self.current_leader = Some(self.id),
            UpdateCurrentLeader::OtherNode(target) => self.current_leader = Some(target),
            UpdateCurrentLeader::Unknown => self.current_leader = None,
        }
    }

    /// Update the current term, clearing the vote if the term advances.
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<ServerId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Observe a term and leader claim carried by an incoming request.
    ///
    /// A higher term always updates state: the term advances, the vote clears, the meta
    /// store is updated and the server falls back to the role its member type dictates.
    /// An equal term records the leader. Term observations are never errors; a stale term
    /// is signalled by the calling handler in its response.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn update_term_and_leader(&mut self, term: u64, leader: Option<ServerId>) -> RaftResult<()> {
        if term > self.current_term {
            self.update_current_term(term, None);
            self.update_current_leader(UpdateCurrentLeader::Unknown);
            self.save_hard_state().await?;
            if matches!(self.target_role, Role::Candidate | Role::Leader) {
                self.set_target_role(Role::Follower);
            }
        }
        if term == self.current_term {
            if let Some(leader) = leader {
                if self.current_leader != Some(leader) {
                    self.update_current_leader(UpdateCurrentLeader::OtherNode(leader));
                }
            }
        }
        Ok(())
    }

    /// Trigger the shutdown sequence due to a non-recoverable storage error.
    ///
    /// Once durability can no longer be trusted the only safe move is to stop
    /// participating; the server transitions to Shutdown.
    #[tracing::instrument(level = "trace", skip(self))]
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!(error = ?err, id = self.id, "fatal storage error, shutting down");
        self.set_target_role(Role::Shutdown);
        RaftError::Storage(err)
    }

    /// Answer a metadata request from the local view.
    fn handle_metadata(&self) -> MetadataResponse {
        MetadataResponse {
            leader: self.current_leader,
            members: self.cluster.configuration().members.clone(),
        }
    }

    /// Raise the commit index, persisting a covered configuration and scheduling apply.
    async fn update_commit_index(&mut self, new_commit: u64) -> RaftResult<()> {
        if new_commit <= self.commit_index {
            return Ok(());
        }
        self.commit_index = new_commit;
        if self.first_commit_index.is_none() {
            self.first_commit_index = Some(new_commit);
        }
        self.log.commit(new_commit).await;
        if self.cluster.needs_commit(self.commit_index) {
            let meta = self.meta.clone();
            self.cluster.commit(&meta).await?;
        }
        self.replicate_to_state_machine_if_needed();
        Ok(())
    }

    /// Spawn a task applying committed entries to the state machine, if any are due and
    /// no apply task is already outstanding.
    #[tracing::instrument(level = "trace", skip(self))]
    fn replicate_to_state_machine_if_needed(&mut self) {
        if self.commit_index <= self.last_applied.index {
            return;
        }
        if !self.replicate_to_sm_handle.is_empty() {
            // The running task's completion handler re-checks for more work.
            return;
        }
        let log = self.log.clone();
        let state_machine = self.state_machine.clone();
        let start = self.last_applied.index + 1;
        let stop = self.commit_index + 1;
        let handle = tokio::spawn(
            async move {
                let entries = log.entries(start, stop).await.map_err(anyhow::Error::new)?;
                if entries.is_empty() {
                    return Ok(None);
                }
                state_machine.apply(&entries).await?;
                Ok(entries.last().map(|e| e.log_id()))
            }
            .instrument(tracing::debug_span!("apply")),
        );
        self.replicate_to_sm_handle.push_back(handle);
    }

    /// Handle the output of an async task replicating entries to the state machine.
    #[tracing::instrument(level = "trace", skip(self, res))]
    fn handle_replicate_to_sm_result(&mut self, res: anyhow::Result<Option<LogId>>) -> RaftResult<()> {
        let last_applied = res.map_err(|err| self.map_fatal_storage_error(err))?;
        if let Some(last_applied) = last_applied {
            if last_applied.index > self.last_applied.index {
                self.last_applied = last_applied;
            }
        }
        self.report_metrics(Update::Ignore);
        self.trigger_log_compaction_if_needed(false);
        self.replicate_to_state_machine_if_needed();
        Ok(())
    }

    /// Trigger a snapshot job if the policy threshold has been crossed.
    ///
    /// If `force` is true the threshold check is skipped.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) fn trigger_log_compaction_if_needed(&mut self, force: bool) {
        if self.snapshot_state.is_some() {
            return;
        }
        let SnapshotPolicy::LogsSinceLast(threshold) = &self.config.snapshot_policy;
        if self.last_applied.index == 0 || self.last_applied.index < self.snapshot_last_log_id.index {
            return;
        }
        if !force && self.last_applied.index < self.snapshot_last_log_id.index + *threshold {
            return;
        }

        let state_machine = self.state_machine.clone();
        let (handle, reg) = AbortHandle::new_pair();
        let (chan_tx, _) = broadcast::channel(1);
        let tx_compaction = self.tx_compaction.clone();
        self.snapshot_state = Some(SnapshotState::Snapshotting {
            handle,
            sender: chan_tx.clone(),
        });
        tokio::spawn(
            async move {
                let f = state_machine.snapshot();
                let res = Abortable::new(f, reg).await;
                match res {
                    Ok(Ok(snapshot)) => {
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotComplete(snapshot.meta.log_id()));
                        let _ = chan_tx.send(snapshot.meta.index);
                    }
                    Ok(Err(err)) => {
                        tracing::error!(error = %err, "error while generating snapshot");
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotFailed);
                    }
                    Err(_aborted) => {
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotFailed);
                    }
                }
            }
            .instrument(tracing::debug_span!("compaction")),
        );
    }

    /// Fold a snapshot job's outcome into the server's snapshot state.
    async fn update_snapshot_state(&mut self, update: SnapshotUpdate) {
        if let SnapshotUpdate::SnapshotComplete(log_id) = update {
            self.snapshot_last_log_id = log_id;
            if let Err(err) = self.log.compact(log_id.index).await {
                tracing::error!(error = %err, "error compacting log behind snapshot");
            }
            self.report_metrics(Update::Ignore);
        }
        // Anything other than an in-progress installation stream is dropped here.
        if let Some(state @ SnapshotState::Streaming { .. }) = self.snapshot_state.take() {
            self.snapshot_state = Some(state);
        }
    }

    /// Complete every channel carried by `msg` with the given error.
    fn reject_msg<F: Fn() -> RaftError>(&self, msg: RaftMsg, err: F) {
        match msg {
            RaftMsg::Append { tx, .. } => {
                let _ = tx.send(Err(err()));
            }
            RaftMsg::Vote { tx, .. } => {
                let _ = tx.send(Err(err()));
            }
            RaftMsg::Poll { tx, .. } => {
                let _ = tx.send(Err(err()));
            }
            RaftMsg::Install { tx, .. } => {
                let _ = tx.send(Err(err()));
            }
            RaftMsg::Configure { tx, .. } => {
                let _ = tx.send(Err(err()));
            }
            RaftMsg::Command { tx, .. } => {
                let _ = tx.send(Err(err()));
            }
            RaftMsg::Query { tx, .. } => {
                let _ = tx.send(Err(err()));
            }
            RaftMsg::OpenSession { tx, .. } => {
                let _ = tx.send(Err(err()));
            }
            RaftMsg::CloseSession { tx, .. } => {
                let _ = tx.send(Err(err()));
            }
            RaftMsg::KeepAlive { tx, .. } => {
                let _ = tx.send(Err(err()));
            }
            RaftMsg::Metadata { tx } => {
                let _ = tx.send(Err(err()));
            }
            RaftMsg::Join { tx, .. } => {
                let _ = tx.send(Err(err()));
            }
            RaftMsg::Leave { tx, .. } => {
                let _ = tx.send(Err(err()));
            }
            RaftMsg::Reconfigure { tx, .. } => {
                let _ = tx.send(Err(err()));
            }
            RaftMsg::Bootstrap { tx, .. } => {
                let _ = tx.send(Err(BootstrapError::NotAllowed));
            }
        }
    }

    /// Reject a request which is not valid in the current role.
    fn reject_illegal(&self, msg: RaftMsg) {
        let role = self.target_role;
        self.reject_msg(msg, move || RaftError::IllegalMemberState(role));
    }

    /// Reject a client or admin request with a redirect hint towards the leader.
    fn reject_not_leader(&self, msg: RaftMsg) {
        let leader = self.current_leader.filter(|l| *l != self.id);
        self.reject_msg(msg, move || RaftError::NoLeader { leader });
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(ServerId),
    ThisNode,
}

/// The current snapshot activity of the server.
pub(self) enum SnapshotState<S> {
    /// A snapshot of local state is being written.
    Snapshotting {
        /// A handle to abort the job if installation from the leader preempts it.
        handle: AbortHandle,
        /// Notifies waiting tasks of the job's completion with the covered index.
        sender: broadcast::Sender<u64>,
    },
    /// A snapshot is being streamed in from the leader.
    Streaming {
        /// The byte offset expected next.
        offset: u64,
        /// The identity of the snapshot being received.
        id: SnapshotMeta,
        /// The write handle for the incoming stream.
        snapshot: Box<S>,
    },
}

/// An update on a snapshot creation process.
#[derive(Debug)]
pub(self) enum SnapshotUpdate {
    /// Snapshot creation finished successfully, covering the given log id.
    SnapshotComplete(LogId),
    /// Snapshot creation failed.
    SnapshotFailed,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible roles of a Raft server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Not participating in the cluster; waits to be configured.
    Inactive,
    /// Tracked in the configuration but holds no log; answers metadata only.
    Reserve,
    /// A non-voting log replica.
    Passive,
    /// A voting member replicating entries from the leader.
    Follower,
    /// Campaigning to become the cluster leader.
    Candidate,
    /// The cluster leader.
    Leader,
    /// The server is shutting down.
    Shutdown,
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    pub fn is_passive(&self) -> bool {
        matches!(self, Self::Passive)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Role::Inactive => "inactive",
            Role::Reserve => "reserve",
            Role::Passive => "passive",
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
            Role::Shutdown => "shutdown",
        };
        write!(f, "{}", name)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// A replication stream as tracked by the leader.
struct ReplicationState {
    /// The id of the last entry known replicated to the target.
    pub matched: LogId,
    /// When set, the stream is torn down once the configuration entry at this index is
    /// committed and replicated to the target.
    pub remove_after_commit: Option<u64>,
    pub replstream: ReplicationStream,
}

/// Volatile state specific to the Raft leader.
struct LeaderState<'a, N: RaftNetwork, M: StateMachine> {
    pub(super) core: &'a mut RaftCore<N, M>,
    /// Replication streams keyed by target member id (ACTIVE and PASSIVE members).
    pub(super) nodes: BTreeMap<ServerId, ReplicationState>,
    /// True once this leader has observed its removal or demotion and will step down at
    /// the next configuration commit.
    pub(super) is_stepping_down: bool,
    /// The index of an appended but not yet committed configuration entry. Only one
    /// configuration change may be in flight at a time.
    pub(super) pending_configuration: Option<u64>,

    pub leader_metrics: LeaderMetrics,

    pub(super) replication_rx: mpsc::UnboundedReceiver<(ReplicaEvent<M::SnapshotData>, Span)>,
    pub(super) replication_tx: mpsc::UnboundedSender<(ReplicaEvent<M::SnapshotData>, Span)>,

    /// Entries appended locally and awaiting a cluster quorum.
    pub(super) awaiting_committed: Vec<PendingEntry>,
}

impl<'a, N: RaftNetwork, M: StateMachine> LeaderState<'a, N, M> {
    pub(self) fn new(core: &'a mut RaftCore<N, M>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        let pending_configuration = if core.cluster.configuration().index > core.commit_index {
            Some(core.cluster.configuration().index)
        } else {
            None
        };
        Self {
            core,
            nodes: BTreeMap::new(),
            is_stepping_down: false,
            pending_configuration,
            leader_metrics: LeaderMetrics::default(),
            replication_tx,
            replication_rx,
            awaiting_committed: Vec::new(),
        }
    }

    /// Transition to the Raft leader role.
    #[tracing::instrument(level = "trace", skip(self), fields(id = self.core.id, raft_role = "leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        let targets: Vec<ServerId> = self
            .core
            .cluster
            .configuration()
            .replication_ids()
            .into_iter()
            .filter(|id| *id != self.core.id)
            .collect();
        for target in targets {
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(target, state);
        }

        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.leader_report_metrics();

        // Per §8, commit an initial entry as part of becoming the cluster leader.
        self.commit_initial_leader_entry().await?;

        loop {
            if !self.core.target_role.is_leader() {
                tracing::info!(id = self.core.id, role = ?self.core.target_role, "leaving leader role");
                for node in self.nodes.values() {
                    let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                }
                // Pending client operations can not complete under this leader any more;
                // give callers a retry-able error with the freshest leader hint.
                let leader = self.core.current_leader.filter(|l| *l != self.core.id);
                for pending in self.awaiting_committed.drain(..) {
                    pending.responder.reject(RaftError::NoLeader { leader });
                }
                return Ok(());
            }

            tokio::select! {
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::Append { rpc, tx } => {
                            let _ = tx.send(self.core.handle_append_request(rpc).await);
                        }
                        RaftMsg::Vote { rpc, tx } => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::Poll { rpc, tx } => {
                            let _ = tx.send(Ok(self.core.handle_poll_request(&rpc)));
                        }
                        RaftMsg::Install { rpc, tx } => {
                            let _ = tx.send(self.core.handle_install_request(rpc).await);
                        }
                        RaftMsg::Configure { rpc, tx } => {
                            let _ = tx.send(self.core.handle_configure_request(rpc).await);
                        }
                        RaftMsg::Command { rpc, tx } => {
                            self.handle_command(rpc, tx).await;
                        }
                        RaftMsg::Query { rpc, tx } => {
                            self.handle_query(rpc, tx).await;
                        }
                        RaftMsg::OpenSession { rpc, tx } => {
                            self.handle_open_session(rpc, tx).await;
                        }
                        RaftMsg::CloseSession { rpc, tx } => {
                            self.handle_close_session(rpc, tx).await;
                        }
                        RaftMsg::KeepAlive { rpc, tx } => {
                            self.handle_keep_alive(rpc, tx).await;
                        }
                        RaftMsg::Metadata { tx } => {
                            let _ = tx.send(Ok(self.core.handle_metadata()));
                        }
                        RaftMsg::Join { rpc, tx } => {
                            self.handle_join(rpc, tx).await;
                        }
                        RaftMsg::Leave { rpc, tx } => {
                            self.handle_leave(rpc, tx).await;
                        }
                        RaftMsg::Reconfigure { rpc, tx } => {
                            self.handle_reconfigure(rpc, tx).await;
                        }
                        RaftMsg::Bootstrap { tx, .. } => {
                            let _ = tx.send(Err(BootstrapError::NotAllowed));
                        }
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => {
                    self.core.update_snapshot_state(update).await;
                }
                Some((event, span)) = self.replication_rx.recv() => {
                    let _ent = span.enter();
                    self.handle_replica_event(event).await?;
                }
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    // Errors herein will trigger shutdown, so no need to process the error.
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result);
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_role(Role::Shutdown);
                }
            }
        }
    }

    /// Report metrics with leader specific state.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn leader_report_metrics(&mut self) {
        self.core.report_metrics(Update::Update(Some(&self.leader_metrics)));
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft server in candidate role.
struct CandidateState<'a, N: RaftNetwork, M: StateMachine> {
    core: &'a mut RaftCore<N, M>,
    /// Pre-vote grants received this round, including our own.
    pre_votes_granted: u64,
    /// Binding votes received this round, including our own.
    votes_granted: u64,
    /// The quorum size for this round.
    votes_needed: u64,
    /// Whether the pre-vote quorum has been reached and binding votes are in flight.
    in_vote_phase: bool,
}

impl<'a, N: RaftNetwork, M: StateMachine> CandidateState<'a, N, M> {
    pub(self) fn new(core: &'a mut RaftCore<N, M>) -> Self {
        Self {
            core,
            pre_votes_granted: 0,
            votes_granted: 0,
            votes_needed: 0,
            in_vote_phase: false,
        }
    }

    /// Run the candidate loop.
    ///
    /// Each round opens with a non-binding poll of the ACTIVE members; only a pre-vote
    /// quorum increments the term and requests binding votes. Rounds are separated by
    /// fresh randomized timeouts, which is what breaks ties between candidates.
    #[tracing::instrument(level = "trace", skip(self), fields(id = self.core.id, raft_role = "candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Each iteration of the outer loop represents a new poll round.
        loop {
            if !self.core.target_role.is_candidate() {
                return Ok(());
            }

            self.votes_needed = self.core.cluster.configuration().quorum() as u64;
            self.pre_votes_granted = 1; // We implicitly accept our own poll.
            self.votes_granted = 1; // We will vote for ourselves once the term advances.
            self.in_vote_phase = false;
            self.core.update_next_election_timeout(false);
            self.core.report_metrics(Update::Update(None));

            let (tx_ballot, mut rx_ballot) = mpsc::unbounded_channel();
            self.spawn_parallel_poll_requests(&tx_ballot);
            if self.pre_votes_granted >= self.votes_needed {
                // Single-member quorum: skip straight to the election.
                self.start_election(&tx_ballot).await?;
            }

            // Inner processing loop for this round.
            loop {
                if !self.core.target_role.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());

                tokio::select! {
                    // The round has timed out; start over with a new poll.
                    _ = timeout_fut => break,
                    Some((ballot, peer)) = rx_ballot.recv() => match ballot {
                        Ballot::Poll(res) => self.handle_poll_response(res, peer, &tx_ballot).await?,
                        Ballot::Vote(res) => self.handle_vote_response(res, peer).await?,
                    },
                    Some((msg, span)) = self.core.rx_api.recv() => {
                        let _ent = span.enter();
                        match msg {
                            RaftMsg::Append { rpc, tx } => {
                                let _ = tx.send(self.core.handle_append_request(rpc).await);
                            }
                            RaftMsg::Vote { rpc, tx } => {
                                let _ = tx.send(self.core.handle_vote_request(rpc).await);
                            }
                            RaftMsg::Poll { rpc, tx } => {
                                let _ = tx.send(Ok(self.core.handle_poll_request(&rpc)));
                            }
                            RaftMsg::Install { rpc, tx } => {
                                let _ = tx.send(self.core.handle_install_request(rpc).await);
                            }
                            RaftMsg::Configure { rpc, tx } => {
                                let _ = tx.send(self.core.handle_configure_request(rpc).await);
                            }
                            RaftMsg::Metadata { tx } => {
                                let _ = tx.send(Ok(self.core.handle_metadata()));
                            }
                            msg => self.core.reject_not_leader(msg),
                        }
                    },
                    Some(update) = self.core.rx_compaction.recv() => {
                        self.core.update_snapshot_state(update).await;
                    }
                    Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                        let _ = self.core.handle_replicate_to_sm_result(repl_sm_result);
                    }
                    Ok(_) = &mut self.core.rx_shutdown => {
                        self.core.set_target_role(Role::Shutdown);
                    }
                }
            }
        }
    }
}

/// A response to one of a candidate's outbound ballots.
pub(self) enum Ballot {
    Poll(crate::raft::PollResponse),
    Vote(crate::raft::VoteResponse),
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft server in follower role.
pub struct FollowerState<'a, N: RaftNetwork, M: StateMachine> {
    core: &'a mut RaftCore<N, M>,
}

impl<'a, N: RaftNetwork, M: StateMachine> FollowerState<'a, N, M> {
    pub(self) fn new(core: &'a mut RaftCore<N, M>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level = "trace", skip(self), fields(id = self.core.id, raft_role = "follower"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics(Update::Update(None));
        loop {
            if !self.core.target_role.is_follower() {
                return Ok(());
            }
            // The deadline is re-armed by every valid heartbeat and granted vote.
            let election_timeout = sleep_until(self.core.get_next_election_timeout());

            tokio::select! {
                _ = election_timeout => self.core.set_target_role(Role::Candidate),
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::Append { rpc, tx } => {
                            let _ = tx.send(self.core.handle_append_request(rpc).await);
                        }
                        RaftMsg::Vote { rpc, tx } => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::Poll { rpc, tx } => {
                            let _ = tx.send(Ok(self.core.handle_poll_request(&rpc)));
                        }
                        RaftMsg::Install { rpc, tx } => {
                            let _ = tx.send(self.core.handle_install_request(rpc).await);
                        }
                        RaftMsg::Configure { rpc, tx } => {
                            let _ = tx.send(self.core.handle_configure_request(rpc).await);
                        }
                        RaftMsg::Metadata { tx } => {
                            let _ = tx.send(Ok(self.core.handle_metadata()));
                        }
                        msg => self.core.reject_not_leader(msg),
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => {
                    self.core.update_snapshot_state(update).await;
                }
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result);
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_role(Role::Shutdown);
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft server in passive role.
///
/// A passive server replicates the log but never votes and never times out into an
/// election; vote and poll requests are answered without a grant.
pub struct PassiveState<'a, N: RaftNetwork, M: StateMachine> {
    core: &'a mut RaftCore<N, M>,
}

impl<'a, N: RaftNetwork, M: StateMachine> PassiveState<'a, N, M> {
    pub(self) fn new(core: &'a mut RaftCore<N, M>) -> Self {
        Self { core }
    }

    /// Run the passive loop.
    #[tracing::instrument(level = "trace", skip(self), fields(id = self.core.id, raft_role = "passive"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics(Update::Update(None));
        loop {
            if !self.core.target_role.is_passive() {
                return Ok(());
            }

            tokio::select! {
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::Append { rpc, tx } => {
                            let _ = tx.send(self.core.handle_append_request(rpc).await);
                        }
                        RaftMsg::Vote { rpc, tx } => {
                            // The member-type guard answers without a grant.
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::Poll { rpc, tx } => {
                            let _ = tx.send(Ok(self.core.handle_poll_request(&rpc)));
                        }
                        RaftMsg::Install { rpc, tx } => {
                            let _ = tx.send(self.core.handle_install_request(rpc).await);
                        }
                        RaftMsg::Configure { rpc, tx } => {
                            let _ = tx.send(self.core.handle_configure_request(rpc).await);
                        }
                        RaftMsg::Metadata { tx } => {
                            let _ = tx.send(Ok(self.core.handle_metadata()));
                        }
                        msg => self.core.reject_not_leader(msg),
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => {
                    self.core.update_snapshot_state(update).await;
                }
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result);
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_role(Role::Shutdown);
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft server in reserve role.
///
/// Reserve members hold no log; they track the configuration and answer metadata.
pub struct ReserveState<'a, N: RaftNetwork, M: StateMachine> {
    core: &'a mut RaftCore<N, M>,
}

impl<'a, N: RaftNetwork, M: StateMachine> ReserveState<'a, N, M> {
    pub(self) fn new(core: &'a mut RaftCore<N, M>) -> Self {
        Self { core }
    }

    /// Run the reserve loop.
    #[tracing::instrument(level = "trace", skip(self), fields(id = self.core.id, raft_role = "reserve"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics(Update::Update(None));
        loop {
            if self.core.target_role != Role::Reserve {
                return Ok(());
            }

            tokio::select! {
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::Configure { rpc, tx } => {
                            let _ = tx.send(self.core.handle_configure_request(rpc).await);
                        }
                        RaftMsg::Metadata { tx } => {
                            let _ = tx.send(Ok(self.core.handle_metadata()));
                        }
                        msg => self.core.reject_illegal(msg),
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => {
                    self.core.update_snapshot_state(update).await;
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_role(Role::Shutdown);
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft server in inactive role.
///
/// Terminal until configured: every request other than a ConfigureRequest (or a
/// bootstrap of a pristine server) is rejected. An inactive server does not learn the
/// commit index from replication; it only observes configurations pushed to it.
pub struct InactiveState<'a, N: RaftNetwork, M: StateMachine> {
    core: &'a mut RaftCore<N, M>,
}

impl<'a, N: RaftNetwork, M: StateMachine> InactiveState<'a, N, M> {
    pub(self) fn new(core: &'a mut RaftCore<N, M>) -> Self {
        Self { core }
    }

    /// Run the inactive loop.
    #[tracing::instrument(level = "trace", skip(self), fields(id = self.core.id, raft_role = "inactive"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.report_metrics(Update::Update(None));
        loop {
            if self.core.target_role != Role::Inactive {
                return Ok(());
            }

            tokio::select! {
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::Configure { rpc, tx } => {
                            let _ = tx.send(self.core.handle_configure_request(rpc).await);
                        }
                        RaftMsg::Bootstrap { members, tx } => {
                            let _ = tx.send(self.handle_bootstrap(members).await);
                        }
                        msg => self.core.reject_illegal(msg),
                    }
                },
                Some(update) = self.core.rx_compaction.recv() => {
                    self.core.update_snapshot_state(update).await;
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    self.core.set_target_role(Role::Shutdown);
                }
            }
        }
    }
}
