//! Replication stream: the leader's per-peer appender.

use std::io::SeekFrom;
use std::sync::Arc;

use futures::future::FutureExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::interval;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::entry::Entry;
use crate::log::Log;
use crate::network::RaftNetwork;
use crate::raft::AppendRequest;
use crate::raft::InstallRequest;
use crate::state_machine::Snapshot;
use crate::state_machine::StateMachine;
use crate::LogId;
use crate::MessageSummary;
use crate::ServerId;

/// The base delay for exponential back-off after a transport failure, in milliseconds.
const BACKOFF_BASE_MS: u64 = 50;
/// The back-off ceiling, in milliseconds.
const BACKOFF_MAX_MS: u64 = 1000;

/// Replication progress towards one peer, as published in the leader metrics.
#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationMetrics {
    pub matched: LogId,
}

/// The public handle to a spawned replication stream.
pub(crate) struct ReplicationStream {
    /// The channel used for communicating with the replication task.
    pub repl_tx: mpsc::UnboundedSender<(RaftEvent, Span)>,
}

impl ReplicationStream {
    /// Create a new replication stream for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<N: RaftNetwork, M: StateMachine>(
        id: ServerId,
        target: ServerId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        log: Arc<Log>,
        raft_core_tx: mpsc::UnboundedSender<(ReplicaEvent<M::SnapshotData>, Span)>,
    ) -> Self {
        ReplicationCore::<N, M>::spawn(id, target, term, config, last_log, commit_index, network, log, raft_core_tx)
    }
}

/// A task driving replication to a single target peer.
///
/// Requests towards a peer are never stacked: one request is in flight at a time, and
/// pending work accumulates in the buffers until the previous send resolves. Transport
/// errors back off exponentially; rejections walk `next_index` backwards following the
/// peer's hint.
struct ReplicationCore<N: RaftNetwork, M: StateMachine> {
    //////////////////////////////////////////////////////////////////////////
    // Static Fields /////////////////////////////////////////////////////////
    /// The ID of this Raft server.
    id: ServerId,
    /// The ID of the target peer.
    target: ServerId,
    /// The term of the leadership this stream serves; never changes over its lifetime.
    term: u64,

    /// A channel for sending events to the leader.
    raft_core_tx: mpsc::UnboundedSender<(ReplicaEvent<M::SnapshotData>, Span)>,
    /// A channel for receiving events from the leader.
    repl_rx: mpsc::UnboundedReceiver<(RaftEvent, Span)>,

    network: Arc<N>,
    log: Arc<Log>,
    config: Arc<Config>,
    max_payload_entries: usize,

    //////////////////////////////////////////////////////////////////////////
    // Dynamic Fields ////////////////////////////////////////////////////////
    /// The state of this replication stream.
    target_state: TargetReplState,

    /// The index of the leader's most recently appended entry.
    last_log_index: u64,
    /// The cluster commit index as last communicated by the leader.
    commit_index: u64,

    /// The index of the next entry to send to the peer.
    ///
    /// Initialized to the leader's last log index + 1 and decremented following the
    /// peer's rejection hints until the logs agree (§5.3).
    next_index: u64,
    /// The identity of the entry at `next_index - 1`, sent as the consistency check.
    prev_log: LogId,
    /// The id of the last entry known replicated to the peer.
    matched: LogId,

    /// Consecutive transport failures towards the peer.
    failures: u32,

    /// Entries streaming in from the leader, waiting to be sent.
    replication_buffer: Vec<Arc<Entry>>,
    /// The entries of the in-flight (or about-to-be-sent) request; retained until the
    /// peer confirms receipt so they can be retransmitted.
    outbound_buffer: Vec<OutboundEntry>,

    heartbeat: Interval,
    heartbeat_timeout: Duration,
    install_snapshot_timeout: Duration,
}

impl<N: RaftNetwork, M: StateMachine> ReplicationCore<N, M> {
    #[allow(clippy::too_many_arguments)]
    pub(self) fn spawn(
        id: ServerId,
        target: ServerId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        log: Arc<Log>,
        raft_core_tx: mpsc::UnboundedSender<(ReplicaEvent<M::SnapshotData>, Span)>,
    ) -> ReplicationStream {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let heartbeat_timeout = Duration::from_millis(config.heartbeat_interval);
        let install_snapshot_timeout = Duration::from_millis(config.install_snapshot_timeout);
        let max_payload_entries = config.max_payload_entries as usize;
        let this = Self {
            id,
            target,
            term,
            raft_core_tx,
            repl_rx,
            network,
            log,
            config,
            max_payload_entries,
            target_state: TargetReplState::Lagging,
            last_log_index: last_log.index,
            commit_index,
            next_index: last_log.index + 1,
            prev_log: last_log,
            matched: LogId::default(),
            failures: 0,
            replication_buffer: Vec::new(),
            outbound_buffer: Vec::new(),
            heartbeat: interval(heartbeat_timeout),
            heartbeat_timeout,
            install_snapshot_timeout,
        };
        let _handle = tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")));
        ReplicationStream { repl_tx }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(id = self.id, peer = self.target))]
    async fn main(mut self) {
        // Perform an initial heartbeat; it doubles as the probe establishing where the
        // peer's log stands.
        self.send_append_entries().await;

        loop {
            match &self.target_state {
                TargetReplState::LineRate => self.line_rate_loop().await,
                TargetReplState::Lagging => self.lagging_loop().await,
                TargetReplState::Snapshotting => SnapshottingState::new(&mut self).run().await,
                TargetReplState::Shutdown => return,
            }
        }
    }

    /// Send an AppendRequest to the target, processing its response.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_append_entries(&mut self) {
        // Attempt to fill the send buffer from the replication buffer.
        if self.outbound_buffer.is_empty() {
            let repl_len = self.replication_buffer.len();
            if repl_len > 0 {
                let chunk_size = std::cmp::min(repl_len, self.max_payload_entries);
                self.outbound_buffer
                    .extend(self.replication_buffer.drain(..chunk_size).map(OutboundEntry::Arc));
            }
        }

        let payload = AppendRequest {
            term: self.term,
            leader: self.id,
            prev_log_index: self.prev_log.index,
            prev_log_term: self.prev_log.term,
            entries: self.outbound_buffer.iter().map(|entry| entry.as_ref().clone()).collect(),
            commit_index: self.commit_index,
        };

        let res = match timeout(self.heartbeat_timeout, self.network.send_append(self.target, payload)).await {
            Ok(Ok(res)) => {
                self.failures = 0;
                res
            }
            Ok(Err(err)) => {
                tracing::warn!(peer = self.target, error = %err, "error sending AppendRequest");
                self.backoff().await;
                return;
            }
            Err(_) => {
                tracing::warn!(peer = self.target, "timeout while sending AppendRequest");
                self.backoff().await;
                return;
            }
        };

        // A higher term ends this leadership; hand control back to the core.
        if res.term > self.term {
            tracing::debug!({ res.term }, "append entries failed, reverting to follower");
            let _ = self.raft_core_tx.send((
                ReplicaEvent::RevertToFollower {
                    target: self.target,
                    term: res.term,
                },
                tracing::debug_span!("CH"),
            ));
            self.target_state = TargetReplState::Shutdown;
            return;
        }

        if res.succeeded {
            let last_log_id = self.outbound_buffer.last().map(|last| last.as_ref().log_id());
            self.outbound_buffer.clear();
            match last_log_id {
                Some(log_id) => {
                    self.next_index = log_id.index + 1;
                    self.matched = log_id;
                    self.prev_log = log_id;
                }
                None => {
                    // An empty heartbeat succeeded, so the peer holds our prev entry.
                    if self.prev_log.index > self.matched.index {
                        self.matched = self.prev_log;
                    }
                }
            }
            let _ = self.raft_core_tx.send((
                ReplicaEvent::UpdateMatchIndex {
                    target: self.target,
                    matched: self.matched,
                },
                tracing::debug_span!("CH"),
            ));

            // If the peer has fallen too far behind the live feed, catch it up from
            // storage instead of buffering without bound.
            let is_lagging = self
                .last_log_index
                .checked_sub(self.matched.index)
                .map(|diff| diff > self.config.replication_lag_threshold)
                .unwrap_or(false);
            if is_lagging {
                self.target_state = TargetReplState::Lagging;
            }
            return;
        }

        // Rejected: the consistency check failed. Resume from the peer's hint (§5.3).
        self.outbound_buffer.clear();
        self.next_index = std::cmp::max(1, res.log_index);
        tracing::debug!(peer = self.target, next_index = self.next_index, "append rejected, backing off");
        if !self.refresh_prev().await {
            // The entry preceding next_index is gone; only a snapshot can help.
            self.target_state = TargetReplState::Snapshotting;
            return;
        }
        self.target_state = TargetReplState::Lagging;
    }

    /// Re-derive `prev_log` for the current `next_index`.
    ///
    /// Returns false when the preceding entry has been compacted away, in which case the
    /// peer needs a snapshot.
    async fn refresh_prev(&mut self) -> bool {
        let prev_index = self.next_index - 1;
        if prev_index == 0 {
            self.prev_log = LogId::default();
            return true;
        }
        match self.log.term_at(prev_index).await {
            Some(term) => {
                self.prev_log = LogId::new(term, prev_index);
                true
            }
            None => false,
        }
    }

    /// Sleep out the exponential transport back-off.
    async fn backoff(&mut self) {
        self.failures += 1;
        let exp = self.failures.min(5);
        let delay = std::cmp::min(BACKOFF_BASE_MS << (exp - 1), BACKOFF_MAX_MS);
        sleep(Duration::from_millis(delay)).await;
    }

    /// Fully drain the channel coming in from the leader.
    pub(self) fn drain_raft_rx(&mut self, first: RaftEvent, span: Span) {
        let mut event_opt = Some((first, span));
        let mut iters = 0;
        loop {
            // Just ensure we don't get stuck draining a REALLY hot replication feed.
            if iters > self.max_payload_entries {
                return;
            }

            let (event, span) = match event_opt.take() {
                Some(event) => event,
                None => return,
            };
            let _ent = span.enter();

            match event {
                RaftEvent::UpdateCommitIndex { commit_index } => {
                    self.commit_index = commit_index;
                }
                RaftEvent::Replicate { entry, commit_index } => {
                    self.commit_index = commit_index;
                    self.last_log_index = entry.index;
                    if self.target_state == TargetReplState::LineRate {
                        self.replication_buffer.push(entry);
                    }
                }
                RaftEvent::Terminate => {
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
            }

            if let Some(event_span) = self.repl_rx.recv().now_or_never() {
                event_opt = event_span;
            }
            iters += 1;
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "line-rate"))]
    pub async fn line_rate_loop(&mut self) {
        loop {
            if self.target_state != TargetReplState::LineRate {
                return;
            }

            // We always prioritize draining our buffers first.
            let next_buf_index = self
                .outbound_buffer
                .first()
                .map(|entry| entry.as_ref().index)
                .or_else(|| self.replication_buffer.first().map(|entry| entry.index));

            if let Some(index) = next_buf_index {
                // Bridge any gap which opened while this stream was transitioning.
                if self.next_index != index {
                    self.frontload_outbound_buffer(self.next_index, index).await;
                    if self.target_state != TargetReplState::LineRate {
                        return;
                    }
                }
                self.send_append_entries().await;
                continue;
            }

            // An empty buffer with appended entries outstanding means this stream missed
            // live Replicate events; fall back to storage.
            if self.next_index <= self.last_log_index {
                self.frontload_outbound_buffer(self.next_index, self.last_log_index + 1).await;
                if self.target_state != TargetReplState::LineRate {
                    return;
                }
                self.send_append_entries().await;
                continue;
            }

            tokio::select! {
                _ = self.heartbeat.tick() => self.send_append_entries().await,
                event_span = self.repl_rx.recv() => {
                    match event_span {
                        Some((event, span)) => self.drain_raft_rx(event, span),
                        None => self.target_state = TargetReplState::Shutdown,
                    }
                }
            }
        }
    }

    /// Pull `[start, stop)` from storage to the front of the outbound buffer.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn frontload_outbound_buffer(&mut self, start: u64, stop: u64) {
        let entries = match self.log.entries(start, stop).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error = %err, "error while frontloading outbound buffer");
                let _ = self.raft_core_tx.send((ReplicaEvent::Shutdown, tracing::debug_span!("CH")));
                self.target_state = TargetReplState::Shutdown;
                return;
            }
        };
        if entries.first().map(|e| e.index) != Some(start) {
            // The range has been compacted away under us.
            self.target_state = TargetReplState::Snapshotting;
            return;
        }

        // Prepend.
        self.outbound_buffer.reverse();
        self.outbound_buffer.extend(entries.into_iter().rev().map(OutboundEntry::Raw));
        self.outbound_buffer.reverse();
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "lagging"))]
    pub async fn lagging_loop(&mut self) {
        self.replication_buffer.clear();
        self.outbound_buffer.clear();
        loop {
            if self.target_state != TargetReplState::Lagging {
                return;
            }
            // The range we still owe the peer may already be compacted.
            if self.next_index < self.log.first_index().await {
                self.target_state = TargetReplState::Snapshotting;
                return;
            }
            if self.is_up_to_speed() {
                self.target_state = TargetReplState::LineRate;
                return;
            }

            self.prep_outbound_buffer_from_storage().await;
            if self.target_state != TargetReplState::Lagging {
                return;
            }
            self.send_append_entries().await;
            if self.is_up_to_speed() {
                self.target_state = TargetReplState::LineRate;
                return;
            }

            if let Some(Some((event, span))) = self.repl_rx.recv().now_or_never() {
                self.drain_raft_rx(event, span);
            }
        }
    }

    /// Check if this replication stream has caught up enough to ride the live feed.
    fn is_up_to_speed(&self) -> bool {
        self.next_index > self.commit_index
    }

    /// Prep the outbound buffer with the next payload of entries from storage.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn prep_outbound_buffer_from_storage(&mut self) {
        if !self.outbound_buffer.is_empty() {
            return;
        }
        if !self.refresh_prev().await {
            self.target_state = TargetReplState::Snapshotting;
            return;
        }

        let available = self.last_log_index.saturating_sub(self.next_index) + 1;
        let stop = self.next_index + std::cmp::min(available, self.max_payload_entries as u64);
        let entries = match self.log.entries(self.next_index, stop).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error = %err, "error fetching logs from storage");
                let _ = self.raft_core_tx.send((ReplicaEvent::Shutdown, tracing::debug_span!("CH")));
                self.target_state = TargetReplState::Shutdown;
                return;
            }
        };
        if entries.first().map(|e| e.index) != Some(self.next_index) {
            self.target_state = TargetReplState::Snapshotting;
            return;
        }
        self.outbound_buffer.extend(entries.into_iter().map(OutboundEntry::Raw));
    }
}

/// A type which wraps the two possible forms of an outbound entry for replication.
enum OutboundEntry {
    /// An entry owned by an Arc, hot off the replication stream from the leader.
    Arc(Arc<Entry>),
    /// An entry which was fetched directly from storage.
    Raw(Entry),
}

impl AsRef<Entry> for OutboundEntry {
    fn as_ref(&self) -> &Entry {
        match self {
            Self::Arc(inner) => inner.as_ref(),
            Self::Raw(inner) => inner,
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The state of the replication stream.
#[derive(Eq, PartialEq)]
enum TargetReplState {
    /// The replication stream is running at line rate.
    LineRate,
    /// The replication stream is lagging behind.
    Lagging,
    /// The replication stream is streaming a snapshot over to the target.
    Snapshotting,
    /// The replication stream is shutting down.
    Shutdown,
}

/// An event from the leader to a replication stream.
pub(crate) enum RaftEvent {
    Replicate {
        /// The most recent entry appended to the leader's log.
        entry: Arc<Entry>,
        /// The index of the highest log entry known to be committed in the cluster.
        commit_index: u64,
    },
    /// A new commit index value.
    UpdateCommitIndex { commit_index: u64 },
    Terminate,
}

/// An event coming from a replication stream.
pub(crate) enum ReplicaEvent<S>
where S: tokio::io::AsyncRead + tokio::io::AsyncSeek + Send + Unpin + 'static
{
    /// An update to the target's match index.
    UpdateMatchIndex { target: ServerId, matched: LogId },
    /// The stream observed a higher term; the leader must revert to follower.
    RevertToFollower { target: ServerId, term: u64 },
    /// The target needs a snapshot to catch up.
    NeedsSnapshot {
        target: ServerId,
        /// The channel for delivering the snapshot handle.
        tx: oneshot::Sender<Snapshot<S>>,
    },
    /// A critical storage error; the server must shut down.
    Shutdown,
}

impl<S: tokio::io::AsyncRead + tokio::io::AsyncSeek + Send + Unpin + 'static> MessageSummary for ReplicaEvent<S> {
    fn summary(&self) -> String {
        match self {
            ReplicaEvent::UpdateMatchIndex { target, matched } => {
                format!("UpdateMatchIndex: target: {}, matched: {}", target, matched)
            }
            ReplicaEvent::RevertToFollower { target, term } => {
                format!("RevertToFollower: target: {}, term: {}", target, term)
            }
            ReplicaEvent::NeedsSnapshot { target, .. } => {
                format!("NeedsSnapshot: target: {}", target)
            }
            ReplicaEvent::Shutdown => "Shutdown".to_string(),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// Snapshot streaming specific state.
struct SnapshottingState<'a, N: RaftNetwork, M: StateMachine> {
    replication_core: &'a mut ReplicationCore<N, M>,
    snapshot: Option<Snapshot<M::SnapshotData>>,
    snapshot_fetch_rx: Option<oneshot::Receiver<Snapshot<M::SnapshotData>>>,
}

impl<'a, N: RaftNetwork, M: StateMachine> SnapshottingState<'a, N, M> {
    pub fn new(replication_core: &'a mut ReplicationCore<N, M>) -> Self {
        Self {
            replication_core,
            snapshot: None,
            snapshot_fetch_rx: None,
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "snapshotting"))]
    pub async fn run(mut self) {
        self.replication_core.replication_buffer.clear();
        self.replication_core.outbound_buffer.clear();

        loop {
            if self.replication_core.target_state != TargetReplState::Snapshotting {
                return;
            }

            // If we don't have any of the components we need, request the current snapshot.
            if self.snapshot.is_none() && self.snapshot_fetch_rx.is_none() {
                let (tx, rx) = oneshot::channel();
                let _ = self.replication_core.raft_core_tx.send((
                    ReplicaEvent::NeedsSnapshot {
                        target: self.replication_core.target,
                        tx,
                    },
                    tracing::debug_span!("CH"),
                ));
                self.snapshot_fetch_rx = Some(rx);
            }

            // Wait for the snapshot to arrive, heartbeating the peer in the meantime.
            if let Some(snapshot_fetch_rx) = self.snapshot_fetch_rx.take() {
                self.wait_for_snapshot(snapshot_fetch_rx).await;
                continue;
            }

            if let Some(snapshot) = self.snapshot.take() {
                if let Err(err) = self.stream_snapshot(snapshot).await {
                    tracing::warn!(error = %err, "error streaming snapshot to target");
                }
                continue;
            }
        }
    }

    /// Wait for a snapshot response from the leader.
    ///
    /// If an error comes up during processing, this routine is simply called again after
    /// issuing a new request to the leader.
    #[tracing::instrument(level = "trace", skip(self, rx))]
    async fn wait_for_snapshot(&mut self, mut rx: oneshot::Receiver<Snapshot<M::SnapshotData>>) {
        loop {
            tokio::select! {
                _ = self.replication_core.heartbeat.tick() => self.replication_core.send_append_entries().await,

                event_span = self.replication_core.repl_rx.recv() => {
                    match event_span {
                        Some((event, span)) => self.replication_core.drain_raft_rx(event, span),
                        None => {
                            self.replication_core.target_state = TargetReplState::Shutdown;
                            return;
                        }
                    }
                },

                res = &mut rx => {
                    match res {
                        Ok(snapshot) => {
                            self.snapshot = Some(snapshot);
                            return;
                        }
                        Err(_) => {
                            // Dropped without an answer: nothing to send yet. Pace the
                            // retry so this does not spin against the leader.
                            sleep(self.replication_core.heartbeat_timeout).await;
                            return;
                        }
                    }
                },
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, snapshot), fields(snapshot = %snapshot.meta.log_id()))]
    async fn stream_snapshot(&mut self, mut snapshot: Snapshot<M::SnapshotData>) -> anyhow::Result<()> {
        let end = snapshot.snapshot.seek(SeekFrom::End(0)).await?;
        let meta = snapshot.meta;
        let mut offset = 0;
        let mut buf = Vec::with_capacity(self.replication_core.config.snapshot_max_chunk_size as usize);

        loop {
            if self.replication_core.target_state != TargetReplState::Snapshotting {
                return Ok(());
            }

            snapshot.snapshot.seek(SeekFrom::Start(offset)).await?;
            let n_read = snapshot.snapshot.read_buf(&mut buf).await?;

            let complete = (offset + n_read as u64) == end;
            let req = InstallRequest {
                term: self.replication_core.term,
                leader: self.replication_core.id,
                snapshot_index: meta.index,
                snapshot_term: meta.term,
                offset,
                data: Vec::from(&buf[..n_read]),
                complete,
            };
            buf.clear();

            tracing::debug!(
                peer = self.replication_core.target,
                offset = req.offset,
                len = req.data.len(),
                complete = req.complete,
                "sending snapshot chunk"
            );

            let res = match timeout(
                self.replication_core.install_snapshot_timeout,
                self.replication_core.network.send_install(self.replication_core.target, req),
            )
            .await
            {
                Ok(Ok(res)) => res,
                Ok(Err(err)) => {
                    tracing::warn!(peer = self.replication_core.target, error = %err, "error sending InstallRequest");
                    continue;
                }
                Err(_) => {
                    tracing::warn!(peer = self.replication_core.target, "timeout while sending InstallRequest");
                    continue;
                }
            };

            if res.term > self.replication_core.term {
                let _ = self.replication_core.raft_core_tx.send((
                    ReplicaEvent::RevertToFollower {
                        target: self.replication_core.target,
                        term: res.term,
                    },
                    tracing::debug_span!("CH"),
                ));
                self.replication_core.target_state = TargetReplState::Shutdown;
                return Ok(());
            }

            if complete && res.next_offset >= end {
                // The peer holds the snapshot; resume log replication right after it.
                self.replication_core.next_index = meta.index + 1;
                self.replication_core.matched = meta.log_id();
                self.replication_core.prev_log = meta.log_id();
                let _ = self.replication_core.raft_core_tx.send((
                    ReplicaEvent::UpdateMatchIndex {
                        target: self.replication_core.target,
                        matched: self.replication_core.matched,
                    },
                    tracing::debug_span!("CH"),
                ));
                self.replication_core.target_state = TargetReplState::Lagging;
                return Ok(());
            }

            // The receiver's offset is authoritative; 0 restarts the stream.
            offset = res.next_offset;

            if let Some(Some((event, span))) = self.replication_core.repl_rx.recv().now_or_never() {
                self.replication_core.drain_raft_rx(event, span);
            }
        }
    }
}
