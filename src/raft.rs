//! Public Raft interface and protocol data types.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::RaftCore;
use crate::entry::Consistency;
use crate::entry::Entry;
use crate::entry::Member;
use crate::error::BootstrapError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::log::Log;
use crate::meta::MetaStore;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::network::RaftNetwork;
use crate::state_machine::StateMachine;
use crate::MessageSummary;
use crate::ServerId;

struct RaftInner<N: RaftNetwork, M: StateMachine> {
    tx_api: mpsc::UnboundedSender<(RaftMsg, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_m: std::marker::PhantomData<M>,
}

/// The Raft API.
///
/// This type is the interface to a running Raft server. It spawns the server's core task
/// and relays requests to it over channels; every handler returns a completion future
/// which resolves when the core has produced the response.
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone itself is very
/// cheap and helps to facilitate use with async workflows.
///
/// ### shutting down
/// If any of the interfaces returns `RaftError::ShuttingDown`, the node is halting
/// (potentially for data safety reasons due to a storage error) and `shutdown` should be
/// called to await the core's exit.
pub struct Raft<N: RaftNetwork, M: StateMachine> {
    inner: Arc<RaftInner<N, M>>,
}

impl<N: RaftNetwork, M: StateMachine> Raft<N, M> {
    /// Create and spawn a new Raft task.
    ///
    /// `id` must be stable across restarts of this server and non-zero. `log` and `meta`
    /// must be rooted in storage private to this server; `network` and `state_machine`
    /// are the application-provided collaborators.
    #[tracing::instrument(level = "trace", skip(config, network, log, meta, state_machine), fields(cluster = %config.cluster_name))]
    pub fn new(
        id: ServerId,
        config: Arc<Config>,
        network: Arc<N>,
        log: Arc<Log>,
        meta: Arc<MetaStore>,
        state_machine: Arc<M>,
    ) -> Self {
        assert!(id != 0, "server ids must be non-zero");
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle =
            RaftCore::spawn(id, config, network, log, meta, state_machine, rx_api, tx_metrics, rx_shutdown);
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_m: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Relay a message to the core task and await its completion.
    async fn call<T, F>(&self, build: F) -> RaftResult<T>
    where F: FnOnce(oneshot::Sender<RaftResult<T>>) -> RaftMsg {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send((build(tx), span)).map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit an AppendRequest to this Raft node.
    ///
    /// These are sent by the cluster leader to replicate log entries (§5.3), and as
    /// heartbeats (§5.2).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc = %rpc.summary()))]
    pub async fn append(&self, rpc: AppendRequest) -> RaftResult<AppendResponse> {
        self.call(|tx| RaftMsg::Append { rpc, tx }).await
    }

    /// Submit a VoteRequest to this Raft node.
    ///
    /// These are sent by candidates gathering votes (§5.2).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> RaftResult<VoteResponse> {
        self.call(|tx| RaftMsg::Vote { rpc, tx }).await
    }

    /// Submit a PollRequest (pre-vote) to this Raft node.
    ///
    /// Polls are non-binding: they never mutate term or vote state on the receiver.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn poll(&self, rpc: PollRequest) -> RaftResult<PollResponse> {
        self.call(|tx| RaftMsg::Poll { rpc, tx }).await
    }

    /// Submit a chunk of a snapshot to this Raft node (§7).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc = %rpc.summary()))]
    pub async fn install(&self, rpc: InstallRequest) -> RaftResult<InstallResponse> {
        self.call(|tx| RaftMsg::Install { rpc, tx }).await
    }

    /// Submit a cluster configuration to this Raft node.
    ///
    /// Leaders send these to members which do not receive AppendRequests (RESERVE and
    /// not-yet-activated members) so that every server converges on the membership.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc = %rpc.summary()))]
    pub async fn configure(&self, rpc: ConfigureRequest) -> RaftResult<ConfigureResponse> {
        self.call(|tx| RaftMsg::Configure { rpc, tx }).await
    }

    /// Submit a client command to update the replicated state machine (§5.1).
    ///
    /// The command is appended to the log, committed to the cluster and applied; the
    /// state machine's result is returned. Commands are ordered per session by
    /// `(session, sequence)` and a duplicate pair returns the cached result.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn command(&self, rpc: CommandRequest) -> RaftResult<CommandResponse> {
        self.call(|tx| RaftMsg::Command { rpc, tx }).await
    }

    /// Submit a client query.
    ///
    /// The requested [`Consistency`] decides whether the query is answered from local
    /// state, after a leadership lease check, or through placement in the log.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn query(&self, rpc: QueryRequest) -> RaftResult<QueryResponse> {
        self.call(|tx| RaftMsg::Query { rpc, tx }).await
    }

    /// Register a new client session. The returned session id is the index of the log
    /// entry which recorded the registration.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn open_session(&self, rpc: OpenSessionRequest) -> RaftResult<OpenSessionResponse> {
        self.call(|tx| RaftMsg::OpenSession { rpc, tx }).await
    }

    /// Close a client session.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn close_session(&self, rpc: CloseSessionRequest) -> RaftResult<CloseSessionResponse> {
        self.call(|tx| RaftMsg::CloseSession { rpc, tx }).await
    }

    /// Heartbeat a batch of client sessions.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn keep_alive(&self, rpc: KeepAliveRequest) -> RaftResult<KeepAliveResponse> {
        self.call(|tx| RaftMsg::KeepAlive { rpc, tx }).await
    }

    /// Fetch cluster metadata from this server's local view.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn metadata(&self) -> RaftResult<MetadataResponse> {
        self.call(|tx| RaftMsg::Metadata { tx }).await
    }

    /// Add a member to the cluster (§6).
    ///
    /// Fails unless this node is the leader. The response carries the configuration the
    /// change produced.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(member = rpc.member.id))]
    pub async fn join(&self, rpc: JoinRequest) -> RaftResult<AdminResponse> {
        self.call(|tx| RaftMsg::Join { rpc, tx }).await
    }

    /// Remove a member from the cluster (§6).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(member = rpc.member.id))]
    pub async fn leave(&self, rpc: LeaveRequest) -> RaftResult<AdminResponse> {
        self.call(|tx| RaftMsg::Leave { rpc, tx }).await
    }

    /// Replace the cluster membership (§6).
    ///
    /// At most one ACTIVE member may be added or removed per change; `rpc.index` must
    /// match the current configuration to guard against concurrent changes.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn reconfigure(&self, rpc: ReconfigureRequest) -> RaftResult<AdminResponse> {
        self.call(|tx| RaftMsg::Reconfigure { rpc, tx }).await
    }

    /// Bootstrap a pristine node with an initial cluster membership.
    ///
    /// Valid only while the node is Inactive with an empty log at term 0. Every server of
    /// the initial cluster should be bootstrapped with the same membership; Raft
    /// guarantees the first elected leader propagates only its own configuration. A
    /// single-member ACTIVE bootstrap assumes leadership without an election.
    #[tracing::instrument(level = "debug", skip(self, members))]
    pub async fn bootstrap(&self, members: Vec<Member>) -> Result<(), BootstrapError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::Bootstrap { members, tx }, span))
            .map_err(|_| BootstrapError::RaftError(RaftError::ShuttingDown))?;
        rx.await.map_err(|_| BootstrapError::RaftError(RaftError::ShuttingDown)).and_then(|res| res)
    }

    /// Get the ID of the current leader from this Raft node.
    ///
    /// This is based on the node's local observation and may be stale; it is intended for
    /// routing client requests, not for guarding reads.
    pub async fn current_leader(&self) -> Option<ServerId> {
        self.inner.rx_metrics.borrow().current_leader
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// // wait for log entry 3 to be received and applied:
    /// r.wait(None).log(3, "entry 3").await?;
    ///
    /// // wait for this node to observe server 2 as leader:
    /// r.wait(None).current_leader(2, "leader 2").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or_else(|| Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown this Raft node.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<N: RaftNetwork, M: StateMachine> Clone for Raft<N, M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type ResponseTx<T> = oneshot::Sender<RaftResult<T>>;

/// A message coming from the Raft API.
pub(crate) enum RaftMsg {
    Append { rpc: AppendRequest, tx: ResponseTx<AppendResponse> },
    Vote { rpc: VoteRequest, tx: ResponseTx<VoteResponse> },
    Poll { rpc: PollRequest, tx: ResponseTx<PollResponse> },
    Install { rpc: InstallRequest, tx: ResponseTx<InstallResponse> },
    Configure { rpc: ConfigureRequest, tx: ResponseTx<ConfigureResponse> },
    Command { rpc: CommandRequest, tx: ResponseTx<CommandResponse> },
    Query { rpc: QueryRequest, tx: ResponseTx<QueryResponse> },
    OpenSession { rpc: OpenSessionRequest, tx: ResponseTx<OpenSessionResponse> },
    CloseSession { rpc: CloseSessionRequest, tx: ResponseTx<CloseSessionResponse> },
    KeepAlive { rpc: KeepAliveRequest, tx: ResponseTx<KeepAliveResponse> },
    Metadata { tx: ResponseTx<MetadataResponse> },
    Join { rpc: JoinRequest, tx: ResponseTx<AdminResponse> },
    Leave { rpc: LeaveRequest, tx: ResponseTx<AdminResponse> },
    Reconfigure { rpc: ReconfigureRequest, tx: ResponseTx<AdminResponse> },
    Bootstrap { members: Vec<Member>, tx: oneshot::Sender<Result<(), BootstrapError>> },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the cluster leader to replicate log entries (§5.3), and as a heartbeat (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader: ServerId,
    /// The index of the log entry immediately preceding the new entries.
    pub prev_log_index: u64,
    /// The term of the entry at `prev_log_index`.
    pub prev_log_term: u64,
    /// The new log entries to store. Empty for heartbeats; batched for efficiency.
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub commit_index: u64,
}

impl MessageSummary for AppendRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader={}, prev={}-{}, commit={}, n={}",
            self.term,
            self.leader,
            self.prev_log_term,
            self.prev_log_index,
            self.commit_index,
            self.entries.len()
        )
    }
}

/// The response to an `AppendRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendResponse {
    /// The responding server's current term, for the leader to update itself.
    pub term: u64,
    /// True if the follower contained an entry matching `prev_log_index`/`prev_log_term`
    /// and stored the payload.
    pub succeeded: bool,
    /// On success, the follower's last log index. On failure, a back-off hint: the leader
    /// resumes replication from this index.
    pub log_index: u64,
}

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate: ServerId,
    /// The index of the candidate's last log entry (§5.4).
    pub last_log_index: u64,
    /// The term of the candidate's last log entry (§5.4).
    pub last_log_term: u64,
}

/// The response to a `VoteRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding server, for the candidate to update itself.
    pub term: u64,
    /// Whether the candidate received a vote from the responder.
    pub voted: bool,
}

/// A non-binding pre-vote, sent before a candidate increments its term.
///
/// Prevents a server isolated behind a partition from driving up the cluster term.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollRequest {
    /// The polling server's current term (not yet incremented).
    pub term: u64,
    /// The polling server's ID.
    pub candidate: ServerId,
    /// The index of the polling server's last log entry.
    pub last_log_index: u64,
    /// The term of the polling server's last log entry.
    pub last_log_term: u64,
}

/// The response to a `PollRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollResponse {
    /// The current term of the responding server.
    pub term: u64,
    /// Whether the responder would vote for the sender in an election.
    pub accepted: bool,
}

/// An RPC sent by the leader to stream chunks of a snapshot to a follower (§7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID.
    pub leader: ServerId,
    /// The index of the last entry covered by the snapshot.
    pub snapshot_index: u64,
    /// The term of that entry.
    pub snapshot_term: u64,
    /// The byte offset of this chunk within the snapshot.
    pub offset: u64,
    /// The raw bytes of the snapshot chunk, starting at `offset`.
    pub data: Vec<u8>,
    /// True if this is the last chunk of the snapshot.
    pub complete: bool,
}

impl MessageSummary for InstallRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader={}, snapshot={}-{}, offset={}, len={}, complete={}",
            self.term,
            self.leader,
            self.snapshot_term,
            self.snapshot_index,
            self.offset,
            self.data.len(),
            self.complete
        )
    }
}

/// The response to an `InstallRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallResponse {
    /// The receiving server's current term.
    pub term: u64,
    /// The byte offset the receiver expects next. On a non-contiguous chunk this is the
    /// authoritative resume point; 0 demands a restart of the stream.
    pub next_offset: u64,
}

/// A cluster configuration pushed by the leader to members outside the replication flow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigureRequest {
    /// The index of the configuration entry.
    pub index: u64,
    /// The leader's current term.
    pub term: u64,
    /// The timestamp of the configuration entry.
    pub timestamp: u64,
    /// The leader's ID.
    pub leader: ServerId,
    /// The full member roster.
    pub members: Vec<Member>,
}

impl MessageSummary for ConfigureRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader={}, index={}, members={:?}",
            self.term,
            self.leader,
            self.index,
            self.members.iter().map(|m| m.id).collect::<Vec<_>>()
        )
    }
}

/// The response to a `ConfigureRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigureResponse {
    /// The responding server's current term.
    pub term: u64,
}

/// A request to add a single member to the cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinRequest {
    pub member: Member,
}

/// A request to remove a single member from the cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub member: Member,
}

/// A request to replace the cluster membership wholesale.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconfigureRequest {
    /// The index of the configuration this change was computed against.
    pub index: u64,
    pub members: Vec<Member>,
}

/// The response to a configuration change request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminResponse {
    /// The index of the configuration entry the change produced.
    pub index: u64,
    /// The term of that entry.
    pub term: u64,
    /// The resulting member roster.
    pub members: Vec<Member>,
}

/// A client request to mutate the replicated state machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandRequest {
    /// The client's session id.
    pub session: u64,
    /// The client's sequence number for this command, used for deduplication.
    pub sequence: u64,
    /// The application-defined operation payload.
    pub operation: Vec<u8>,
}

/// The response to a `CommandRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    /// The log index at which the command was recorded.
    pub index: u64,
    /// The highest session event index as of this command.
    pub event_index: u64,
    /// The state machine's result.
    pub result: Vec<u8>,
}

/// A client read request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    pub session: u64,
    pub sequence: u64,
    pub operation: Vec<u8>,
    pub consistency: Consistency,
}

/// The response to a `QueryRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    /// The last applied index observed by the read.
    pub index: u64,
    /// The state machine's result.
    pub result: Vec<u8>,
}

/// A client session heartbeat.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    /// The sessions being kept alive.
    pub sessions: Vec<u64>,
    /// For each session, the highest command sequence for which a response was received.
    pub command_sequences: Vec<u64>,
    /// For each session, the highest event index received.
    pub event_indexes: Vec<u64>,
}

/// The response to a `KeepAliveRequest`, carrying routing hints for the client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    /// The current leader, if known.
    pub leader: Option<ServerId>,
    /// The current member roster.
    pub members: Vec<Member>,
}

/// A request to register a new client session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenSessionRequest {
    /// An application-defined client identity.
    pub client: String,
    /// The requested session timeout in milliseconds; the server may lengthen it.
    pub timeout: u64,
}

/// The response to an `OpenSessionRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    /// The new session id: the index of the entry which recorded the registration.
    pub session: u64,
    /// The granted session timeout in milliseconds.
    pub timeout: u64,
}

/// A request to close a client session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    pub session: u64,
}

/// The response to a `CloseSessionRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloseSessionResponse {
    pub session: u64,
}

/// The response to a metadata request: the cluster as seen from the local server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataResponse {
    /// The current leader, if known.
    pub leader: Option<ServerId>,
    /// The current member roster.
    pub members: Vec<Member>,
}
