//! Fixtures for testing Raft.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use conclave::async_trait::async_trait;
use conclave::entry::Member;
use conclave::entry::MemberType;
use conclave::log::Log;
use conclave::log::LogOptions;
use conclave::meta::MetaStore;
use conclave::metrics::RaftMetrics;
use conclave::metrics::Wait;
use conclave::network::RaftNetwork;
use conclave::raft::AppendRequest;
use conclave::raft::AppendResponse;
use conclave::raft::CommandRequest;
use conclave::raft::CommandResponse;
use conclave::raft::ConfigureRequest;
use conclave::raft::ConfigureResponse;
use conclave::raft::InstallRequest;
use conclave::raft::InstallResponse;
use conclave::raft::JoinRequest;
use conclave::raft::PollRequest;
use conclave::raft::PollResponse;
use conclave::raft::QueryRequest;
use conclave::raft::QueryResponse;
use conclave::raft::ReconfigureRequest;
use conclave::raft::VoteRequest;
use conclave::raft::VoteResponse;
use conclave::state_machine::ApplyError;
use conclave::state_machine::ApplyResult;
use conclave::state_machine::Snapshot;
use conclave::state_machine::SnapshotMeta;
use conclave::state_machine::StateMachine;
use conclave::Config;
use conclave::Consistency;
use conclave::Entry;
use conclave::EntryPayload;
use conclave::LogId;
use conclave::Raft;
use conclave::RaftError;
use conclave::Role;
use conclave::ServerId;
use tempfile::TempDir;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// A concrete Raft type used during testing.
pub type KvRaft = Raft<RaftRouter, KvStateMachine>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A small runtime config tuned for fast tests.
pub fn test_config() -> Arc<Config> {
    Arc::new(
        Config::build("test".into())
            .heartbeat_interval(50)
            .election_timeout(250)
            .validate()
            .expect("failed to build Raft config"),
    )
}

/// An ACTIVE member record for the given id.
pub fn active_member(id: ServerId) -> Member {
    Member::new(id, format!("127.0.0.1:{}", 7000 + id), MemberType::Active)
}

/// A member record of the given type for the given id.
pub fn member(id: ServerId, member_type: MemberType) -> Member {
    Member::new(id, format!("127.0.0.1:{}", 7000 + id), member_type)
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A session-aware key-value state machine.
///
/// Operations are utf-8 strings: `set <key> <value>` returns the previous value,
/// `get <key>` returns the current value. Commands are deduplicated per session on
/// their sequence number: a repeated `(session, sequence)` pair returns the cached
/// result without re-executing.
pub struct KvStateMachine {
    snapshot_dir: PathBuf,
    inner: RwLock<KvInner>,
}

#[derive(Default, serde::Serialize, serde::Deserialize)]
struct KvInner {
    kv: BTreeMap<String, String>,
    /// Open sessions: session id (the registering entry's index) to granted timeout.
    sessions: BTreeMap<u64, u64>,
    /// Per session, the most recent command sequence and its cached response.
    last_responses: BTreeMap<u64, (u64, Vec<u8>)>,
    last_applied: LogId,
}

impl KvInner {
    fn execute(&mut self, operation: &[u8]) -> ApplyResult {
        let op = String::from_utf8_lossy(operation);
        let mut parts = op.split_whitespace();
        match parts.next() {
            Some("set") => {
                let key = parts.next().unwrap_or_default().to_string();
                let value = parts.collect::<Vec<_>>().join(" ");
                let previous = self.kv.insert(key, value);
                Ok(previous.unwrap_or_default().into_bytes())
            }
            Some("get") => self.read(operation),
            _ => Err(ApplyError::Command(format!("unknown operation: {}", op))),
        }
    }

    fn read(&self, operation: &[u8]) -> ApplyResult {
        let op = String::from_utf8_lossy(operation);
        let mut parts = op.split_whitespace();
        match parts.next() {
            Some("get") => {
                let key = parts.next().unwrap_or_default();
                Ok(self.kv.get(key).cloned().unwrap_or_default().into_bytes())
            }
            _ => Err(ApplyError::Query(format!("unknown query: {}", op))),
        }
    }
}

impl KvStateMachine {
    pub fn new(snapshot_dir: impl Into<PathBuf>) -> Result<Self> {
        let snapshot_dir = snapshot_dir.into();
        std::fs::create_dir_all(&snapshot_dir)?;
        let mut inner = KvInner::default();
        if let Some((_, path)) = latest_snapshot_file(&snapshot_dir)? {
            let data = std::fs::read(path)?;
            inner = serde_json::from_slice(&data)?;
        }
        Ok(Self {
            snapshot_dir,
            inner: RwLock::new(inner),
        })
    }

    /// The current value of a key.
    pub async fn value(&self, key: &str) -> Option<String> {
        self.inner.read().await.kv.get(key).cloned()
    }

    /// A copy of the whole keyspace.
    pub async fn dump(&self) -> BTreeMap<String, String> {
        self.inner.read().await.kv.clone()
    }

    /// The ids of the currently open sessions.
    pub async fn open_sessions(&self) -> Vec<u64> {
        self.inner.read().await.sessions.keys().copied().collect()
    }

    fn snapshot_path(&self, meta: &SnapshotMeta) -> PathBuf {
        self.snapshot_dir.join(format!("{}-{}.snapshot", meta.index, meta.term))
    }

    fn incoming_path(&self) -> PathBuf {
        self.snapshot_dir.join("incoming.snapshot")
    }
}

/// Find the snapshot file with the highest covered index in a directory.
fn latest_snapshot_file(dir: &std::path::Path) -> Result<Option<(SnapshotMeta, PathBuf)>> {
    let mut best: Option<(SnapshotMeta, PathBuf)> = None;
    for dirent in std::fs::read_dir(dir)? {
        let dirent = dirent?;
        let name = dirent.file_name();
        let name = name.to_string_lossy();
        let stem = match name.strip_suffix(".snapshot") {
            Some(stem) => stem,
            None => continue,
        };
        let mut parts = stem.splitn(2, '-');
        let meta = match (
            parts.next().and_then(|s| s.parse::<u64>().ok()),
            parts.next().and_then(|s| s.parse::<u64>().ok()),
        ) {
            (Some(index), Some(term)) => SnapshotMeta { index, term },
            _ => continue,
        };
        if best.as_ref().map(|(b, _)| meta.index > b.index).unwrap_or(true) {
            best = Some((meta, dirent.path()));
        }
    }
    Ok(best)
}

#[async_trait]
impl StateMachine for KvStateMachine {
    type SnapshotData = tokio::fs::File;

    async fn apply(&self, entries: &[Entry]) -> Result<Vec<ApplyResult>> {
        let mut inner = self.inner.write().await;
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let result = match &entry.payload {
                EntryPayload::Command { session, sequence, operation } => {
                    match inner.last_responses.get(session) {
                        Some((last_sequence, cached)) if *last_sequence == *sequence => Ok(cached.clone()),
                        _ => {
                            let result = inner.execute(operation);
                            if let Ok(bytes) = &result {
                                inner.last_responses.insert(*session, (*sequence, bytes.clone()));
                            }
                            result
                        }
                    }
                }
                EntryPayload::Query { operation, .. } => inner.read(operation),
                EntryPayload::OpenSession { timeout, .. } => {
                    inner.sessions.insert(entry.index, *timeout);
                    Ok(Vec::new())
                }
                EntryPayload::CloseSession { session } => match inner.sessions.remove(session) {
                    Some(_) => {
                        inner.last_responses.remove(session);
                        Ok(Vec::new())
                    }
                    None => Err(ApplyError::UnknownSession(*session)),
                },
                EntryPayload::KeepAlive { .. } => Ok(Vec::new()),
                EntryPayload::Initialize | EntryPayload::Configuration { .. } => Ok(Vec::new()),
            };
            inner.last_applied = entry.log_id();
            results.push(result);
        }
        Ok(results)
    }

    async fn query(&self, operation: &[u8]) -> Result<ApplyResult> {
        Ok(self.inner.read().await.read(operation))
    }

    async fn last_applied(&self) -> Result<LogId> {
        Ok(self.inner.read().await.last_applied)
    }

    async fn snapshot(&self) -> Result<Snapshot<Self::SnapshotData>> {
        let (meta, data) = {
            let inner = self.inner.read().await;
            let meta = SnapshotMeta {
                index: inner.last_applied.index,
                term: inner.last_applied.term,
            };
            (meta, serde_json::to_vec(&*inner)?)
        };
        let path = self.snapshot_path(&meta);
        let pending = self.snapshot_dir.join("pending.snapshot");
        tokio::fs::write(&pending, &data).await?;
        tokio::fs::rename(&pending, &path).await?;
        let file = tokio::fs::File::open(&path).await?;
        Ok(Snapshot {
            meta,
            snapshot: Box::new(file),
        })
    }

    async fn current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>> {
        match latest_snapshot_file(&self.snapshot_dir)? {
            Some((meta, path)) => {
                let file = tokio::fs::File::open(&path).await?;
                Ok(Some(Snapshot {
                    meta,
                    snapshot: Box::new(file),
                }))
            }
            None => Ok(None),
        }
    }

    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.incoming_path())
            .await?;
        Ok(Box::new(file))
    }

    async fn install_snapshot(&self, meta: &SnapshotMeta, _snapshot: Box<Self::SnapshotData>) -> Result<()> {
        let data = tokio::fs::read(self.incoming_path()).await?;
        let mut loaded: KvInner = serde_json::from_slice(&data)?;
        loaded.last_applied = LogId {
            term: meta.term,
            index: meta.index,
        };
        tokio::fs::rename(self.incoming_path(), self.snapshot_path(meta)).await?;
        *self.inner.write().await = loaded;
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// Everything backing one in-process Raft server.
pub struct TestNode {
    pub raft: KvRaft,
    pub log: Arc<Log>,
    pub meta: Arc<MetaStore>,
    pub state_machine: Arc<KvStateMachine>,
    _dir: TempDir,
}

/// A type which emulates a network transport and implements the `RaftNetwork` trait.
pub struct RaftRouter {
    /// The Raft runtime config which all nodes are using.
    config: Arc<Config>,
    /// Log sizing applied to every node this router creates.
    log_options: LogOptions,
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<ServerId, Arc<TestNode>>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<ServerId>>,
}

impl RaftRouter {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_log_options(config, LogOptions {
            max_segment_entries: 256,
            max_segment_bytes: 4 * 1024 * 1024,
        })
    }

    pub fn with_log_options(config: Arc<Config>, log_options: LogOptions) -> Self {
        Self {
            config,
            log_options,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
        }
    }

    /// Create and register a new Raft server bearing the given ID, backed by a fresh
    /// temporary storage directory.
    pub async fn new_raft_node(self: &Arc<Self>, id: ServerId) -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = Arc::new(Log::open(dir.path().join("log"), self.log_options.clone()).await?);
        let meta = Arc::new(MetaStore::open(dir.path()).await?);
        let state_machine = Arc::new(KvStateMachine::new(dir.path().join("snapshots"))?);
        let raft = Raft::new(id, self.config.clone(), self.clone(), log.clone(), meta.clone(), state_machine.clone());
        let node = Arc::new(TestNode {
            raft,
            log,
            meta,
            state_machine,
            _dir: dir,
        });
        self.routing_table.write().await.insert(id, node);
        Ok(())
    }

    /// Get the node bearing the given ID.
    pub async fn get_node(&self, id: ServerId) -> Result<Arc<TestNode>> {
        let rt = self.routing_table.read().await;
        rt.get(&id).cloned().with_context(|| format!("node {} not found in routing table", id))
    }

    /// Remove the target node from the routing table and isolation set.
    pub async fn remove_node(&self, id: ServerId) -> Option<Arc<TestNode>> {
        let node = self.routing_table.write().await.remove(&id);
        self.isolated_nodes.write().await.remove(&id);
        node
    }

    /// Isolate the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn isolate_node(&self, id: ServerId) {
        self.isolated_nodes.write().await.insert(id);
    }

    /// Restore the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn restore_node(&self, id: ServerId) {
        self.isolated_nodes.write().await.remove(&id);
    }

    /// Bootstrap every listed server with the same all-ACTIVE membership.
    pub async fn bootstrap_cluster(&self, ids: &[ServerId]) -> Result<()> {
        let members: Vec<Member> = ids.iter().map(|id| active_member(*id)).collect();
        let rt = self.routing_table.read().await;
        for id in ids {
            let node = rt.get(id).with_context(|| format!("node {} not found", id))?;
            node.raft.bootstrap(members.clone()).await?;
        }
        Ok(())
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.read().await;
        rt.values().map(|node| node.raft.metrics().borrow().clone()).collect()
    }

    /// Get the ID of the current, non-isolated leader.
    pub async fn leader(&self) -> Option<ServerId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics().await.into_iter().find_map(|m| {
            if m.role == Role::Leader && !isolated.contains(&m.id) {
                Some(m.id)
            } else {
                None
            }
        })
    }

    /// Wait until a non-isolated leader emerges.
    pub async fn wait_for_leader(&self, timeout: Duration, msg: &str) -> Result<ServerId> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if Instant::now() > deadline {
                return Err(anyhow!("timeout waiting for a cluster leader: {}", msg));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait(&self, node_id: &ServerId, timeout: Option<Duration>) -> Result<Wait> {
        let node = self.get_node(*node_id).await?;
        Ok(node.raft.wait(timeout))
    }

    /// Wait for metrics until it satisfies some condition.
    #[tracing::instrument(level = "info", skip(self, func))]
    pub async fn wait_for_metrics<T>(
        &self,
        node_id: &ServerId,
        func: T,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<RaftMetrics>
    where
        T: Fn(&RaftMetrics) -> bool + Send,
    {
        let wait = self.wait(node_id, timeout).await?;
        let res = wait.metrics(func, msg).await?;
        Ok(res)
    }

    /// Wait for the specified nodes to have appended and applied up to `want_log`.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_log(
        &self,
        node_ids: &[ServerId],
        want_log: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids {
            self.wait(id, timeout).await?.log(want_log, msg).await?;
        }
        Ok(())
    }

    /// Wait for the specified nodes to assume the given role.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_role(
        &self,
        node_ids: &[ServerId],
        want_role: Role,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids {
            self.wait(id, timeout).await?.role(want_role, msg).await?;
        }
        Ok(())
    }

    /// Send a `set` command to the target node.
    pub async fn set(
        &self,
        target: ServerId,
        session: u64,
        sequence: u64,
        key: &str,
        value: &str,
    ) -> Result<CommandResponse, RaftError> {
        self.command(target, session, sequence, format!("set {} {}", key, value)).await
    }

    /// Send a client command to the target node.
    pub async fn command(
        &self,
        target: ServerId,
        session: u64,
        sequence: u64,
        operation: String,
    ) -> Result<CommandResponse, RaftError> {
        let node = match self.routing_table.read().await.get(&target) {
            Some(node) => node.clone(),
            None => return Err(RaftError::NoLeader { leader: None }),
        };
        node.raft
            .command(CommandRequest {
                session,
                sequence,
                operation: operation.into_bytes(),
            })
            .await
    }

    /// Send a client query to the target node.
    pub async fn query(
        &self,
        target: ServerId,
        operation: String,
        consistency: Consistency,
    ) -> Result<QueryResponse, RaftError> {
        let node = match self.routing_table.read().await.get(&target) {
            Some(node) => node.clone(),
            None => return Err(RaftError::NoLeader { leader: None }),
        };
        node.raft
            .query(QueryRequest {
                session: 0,
                sequence: 0,
                operation: operation.into_bytes(),
                consistency,
            })
            .await
    }

    /// Ask the target (expected leader) to add a member.
    pub async fn join(&self, target: ServerId, new_member: Member) -> Result<(), RaftError> {
        let node = self.routing_table.read().await.get(&target).cloned();
        let node = node.ok_or(RaftError::NoLeader { leader: None })?;
        node.raft.join(JoinRequest { member: new_member }).await?;
        Ok(())
    }

    /// Ask the target (expected leader) to replace the membership.
    pub async fn reconfigure(&self, target: ServerId, index: u64, members: Vec<Member>) -> Result<(), RaftError> {
        let node = self.routing_table.read().await.get(&target).cloned();
        let node = node.ok_or(RaftError::NoLeader { leader: None })?;
        node.raft.reconfigure(ReconfigureRequest { index, members }).await?;
        Ok(())
    }

    /// Read the log entry at `index` on the given node.
    pub async fn log_entry(&self, node_id: ServerId, index: u64) -> Result<Option<Entry>> {
        let node = self.get_node(node_id).await?;
        Ok(node.log.get(index).await?)
    }

    /// Assert that every listed node holds an identical log over `[first, last]`.
    pub async fn assert_logs_match(&self, node_ids: &[ServerId], last: u64) -> Result<()> {
        let mut reference: Option<(ServerId, Vec<Entry>)> = None;
        for id in node_ids {
            let node = self.get_node(*id).await?;
            let first = node.log.first_index().await;
            let entries = node.log.entries(first, last + 1).await?;
            match &reference {
                None => reference = Some((*id, entries)),
                Some((ref_id, ref_entries)) => {
                    // Compare the overlap; a node may have compacted a longer prefix.
                    let offset = ref_entries.len().saturating_sub(entries.len());
                    assert_eq!(
                        &ref_entries[offset..],
                        entries.as_slice(),
                        "logs diverge between node {} and node {}",
                        ref_id,
                        id
                    );
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RaftNetwork for RaftRouter {
    async fn send_append(&self, target: ServerId, rpc: AppendRequest) -> Result<AppendResponse> {
        self.check_reachable(rpc.leader, target).await?;
        let node = self.get_node(target).await?;
        Ok(node.raft.append(rpc).await?)
    }

    async fn send_vote(&self, target: ServerId, rpc: VoteRequest) -> Result<VoteResponse> {
        self.check_reachable(rpc.candidate, target).await?;
        let node = self.get_node(target).await?;
        Ok(node.raft.vote(rpc).await?)
    }

    async fn send_poll(&self, target: ServerId, rpc: PollRequest) -> Result<PollResponse> {
        self.check_reachable(rpc.candidate, target).await?;
        let node = self.get_node(target).await?;
        Ok(node.raft.poll(rpc).await?)
    }

    async fn send_install(&self, target: ServerId, rpc: InstallRequest) -> Result<InstallResponse> {
        self.check_reachable(rpc.leader, target).await?;
        let node = self.get_node(target).await?;
        Ok(node.raft.install(rpc).await?)
    }

    async fn send_configure(&self, target: ServerId, rpc: ConfigureRequest) -> Result<ConfigureResponse> {
        self.check_reachable(rpc.leader, target).await?;
        let node = self.get_node(target).await?;
        Ok(node.raft.configure(rpc).await?)
    }
}

impl RaftRouter {
    async fn check_reachable(&self, source: ServerId, target: ServerId) -> Result<()> {
        let isolated = self.isolated_nodes.read().await;
        if isolated.contains(&source) || isolated.contains(&target) {
            return Err(anyhow!("node {} -> {} is partitioned", source, target));
        }
        Ok(())
    }
}
