//! Leader-side handling of client operations.

use std::sync::Arc;

use anyhow::anyhow;
use futures::future::TryFutureExt;
use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;
use tokio::time::timeout;
use tokio::time::Duration;
use tracing_futures::Instrument;

use crate::core::LeaderState;
use crate::core::Role;
use crate::entry::Consistency;
use crate::entry::Entry;
use crate::entry::EntryPayload;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::network::RaftNetwork;
use crate::quorum;
use crate::raft::AdminResponse;
use crate::raft::AppendRequest;
use crate::raft::CloseSessionRequest;
use crate::raft::CloseSessionResponse;
use crate::raft::CommandRequest;
use crate::raft::CommandResponse;
use crate::raft::KeepAliveRequest;
use crate::raft::KeepAliveResponse;
use crate::raft::OpenSessionRequest;
use crate::raft::OpenSessionResponse;
use crate::raft::QueryRequest;
use crate::raft::QueryResponse;
use crate::raft::ResponseTx;
use crate::replication::RaftEvent;
use crate::state_machine::ApplyResult;
use crate::state_machine::StateMachine;

/// An entry appended by the leader, awaiting commit, paired with its response channel.
pub(super) struct PendingEntry {
    /// The Arc'd entry, shared with the replication streams without cloning the payload.
    pub entry: Arc<Entry>,
    pub responder: Responder,
}

/// The response channel of a pending entry, by request kind.
pub(super) enum Responder {
    Command(ResponseTx<CommandResponse>),
    Query(ResponseTx<QueryResponse>),
    OpenSession(ResponseTx<OpenSessionResponse>),
    CloseSession(ResponseTx<CloseSessionResponse>),
    KeepAlive(ResponseTx<KeepAliveResponse>),
    /// A configuration change; `None` for changes raised internally.
    Admin(Option<ResponseTx<AdminResponse>>),
    /// No caller is waiting (the leader's initial entry).
    None,
}

impl Responder {
    /// Complete the pending request with an error.
    pub(super) fn reject(self, err: RaftError) {
        match self {
            Responder::Command(tx) => {
                let _ = tx.send(Err(err));
            }
            Responder::Query(tx) => {
                let _ = tx.send(Err(err));
            }
            Responder::OpenSession(tx) => {
                let _ = tx.send(Err(err));
            }
            Responder::CloseSession(tx) => {
                let _ = tx.send(Err(err));
            }
            Responder::KeepAlive(tx) => {
                let _ = tx.send(Err(err));
            }
            Responder::Admin(Some(tx)) => {
                let _ = tx.send(Err(err));
            }
            Responder::Admin(None) | Responder::None => {}
        }
    }
}

impl<'a, N: RaftNetwork, M: StateMachine> LeaderState<'a, N, M> {
    /// Commit the initial entry which new leaders are obligated to create when first
    /// coming to power, per §8.
    ///
    /// Until this entry commits, nothing from an earlier term may be counted committed
    /// and reads can not be served; committing it pulls the whole preceding log with it.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        let entry = self.append_payload_to_log(EntryPayload::Initialize).await?;
        let pending = PendingEntry {
            entry: Arc::new(entry),
            responder: Responder::None,
        };
        self.replicate_client_request(pending).await;
        Ok(())
    }

    /// Handle a client command: record it in the log and answer once it is committed and
    /// applied.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx), fields(session = rpc.session, sequence = rpc.sequence))]
    pub(super) async fn handle_command(&mut self, rpc: CommandRequest, tx: ResponseTx<CommandResponse>) {
        let payload = EntryPayload::Command {
            session: rpc.session,
            sequence: rpc.sequence,
            operation: rpc.operation,
        };
        let entry = match self.append_payload_to_log(payload).await {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        self.replicate_client_request(PendingEntry {
            entry: Arc::new(entry),
            responder: Responder::Command(tx),
        })
        .await;
    }

    /// Handle a client query at its requested consistency level.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx), fields(session = rpc.session, consistency = ?rpc.consistency))]
    pub(super) async fn handle_query(&mut self, rpc: QueryRequest, tx: ResponseTx<QueryResponse>) {
        match rpc.consistency {
            // Local state is good enough; answer off the hot path.
            Consistency::Sequential => {
                let state_machine = self.core.state_machine.clone();
                let index = self.core.last_applied.index;
                tokio::spawn(
                    async move {
                        let res = match state_machine.query(&rpc.operation).await {
                            Ok(res) => res,
                            Err(err) => {
                                let _ = tx.send(Err(RaftError::Storage(err)));
                                return;
                            }
                        };
                        let _ = tx.send(res.map(|result| QueryResponse { index, result }).map_err(RaftError::from));
                    }
                    .instrument(tracing::debug_span!("query")),
                );
            }
            // Confirm leadership with a heartbeat quorum first (§8), then read locally.
            Consistency::LinearizableLease => {
                if let Err(err) = self.verify_leadership().await {
                    let _ = tx.send(Err(err));
                    return;
                }
                let res = match self.core.state_machine.query(&rpc.operation).await {
                    Ok(res) => res,
                    Err(err) => {
                        let _ = tx.send(Err(RaftError::Storage(err)));
                        return;
                    }
                };
                let index = self.core.last_applied.index;
                let _ = tx.send(res.map(|result| QueryResponse { index, result }).map_err(RaftError::from));
            }
            // Place the query in the log; it is answered when applied in order.
            Consistency::Linearizable => {
                let payload = EntryPayload::Query {
                    session: rpc.session,
                    sequence: rpc.sequence,
                    operation: rpc.operation,
                };
                let entry = match self.append_payload_to_log(payload).await {
                    Ok(entry) => entry,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                };
                self.replicate_client_request(PendingEntry {
                    entry: Arc::new(entry),
                    responder: Responder::Query(tx),
                })
                .await;
            }
        }
    }

    /// Register a new client session.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx), fields(client = %rpc.client))]
    pub(super) async fn handle_open_session(&mut self, rpc: OpenSessionRequest, tx: ResponseTx<OpenSessionResponse>) {
        let granted = rpc.timeout.max(self.core.config.session_timeout);
        let payload = EntryPayload::OpenSession {
            client: rpc.client,
            timeout: granted,
        };
        let entry = match self.append_payload_to_log(payload).await {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        self.replicate_client_request(PendingEntry {
            entry: Arc::new(entry),
            responder: Responder::OpenSession(tx),
        })
        .await;
    }

    /// Close a client session.
    #[tracing::instrument(level = "trace", skip(self, tx), fields(session = rpc.session))]
    pub(super) async fn handle_close_session(&mut self, rpc: CloseSessionRequest, tx: ResponseTx<CloseSessionResponse>) {
        let payload = EntryPayload::CloseSession { session: rpc.session };
        let entry = match self.append_payload_to_log(payload).await {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        self.replicate_client_request(PendingEntry {
            entry: Arc::new(entry),
            responder: Responder::CloseSession(tx),
        })
        .await;
    }

    /// Heartbeat client sessions.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_keep_alive(&mut self, rpc: KeepAliveRequest, tx: ResponseTx<KeepAliveResponse>) {
        if rpc.sessions.len() != rpc.command_sequences.len() || rpc.sessions.len() != rpc.event_indexes.len() {
            let _ = tx.send(Err(RaftError::ProtocolError(
                "keep-alive session, sequence and event vectors must have equal lengths".into(),
            )));
            return;
        }
        let payload = EntryPayload::KeepAlive {
            sessions: rpc.sessions,
            command_sequences: rpc.command_sequences,
            event_indexes: rpc.event_indexes,
        };
        let entry = match self.append_payload_to_log(payload).await {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        self.replicate_client_request(PendingEntry {
            entry: Arc::new(entry),
            responder: Responder::KeepAlive(tx),
        })
        .await;
    }

    /// Confirm this server is still the leader by exchanging heartbeats with a quorum of
    /// ACTIVE members (§8).
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn verify_leadership(&mut self) -> RaftResult<()> {
        let active = self.core.cluster.configuration().active_ids();
        let needed = quorum::majority_of(active.len());
        let mut confirmed = if active.contains(&self.core.id) { 1 } else { 0 };
        if confirmed >= needed {
            return Ok(());
        }

        let mut pending = FuturesUnordered::new();
        for id in active.iter().filter(|id| **id != self.core.id) {
            let rpc = AppendRequest {
                term: self.core.current_term,
                leader: self.core.id,
                prev_log_index: self.nodes.get(id).map(|n| n.matched.index).unwrap_or(0),
                prev_log_term: self.nodes.get(id).map(|n| n.matched.term).unwrap_or(0),
                entries: vec![],
                commit_index: self.core.commit_index,
            };
            let target = *id;
            let network = self.core.network.clone();
            let ttl = Duration::from_millis(self.core.config.heartbeat_interval);
            let task = tokio::spawn(
                async move {
                    match timeout(ttl, network.send_append(target, rpc)).await {
                        Ok(Ok(data)) => Ok((target, data)),
                        Ok(Err(err)) => Err((target, err)),
                        Err(_timeout) => Err((target, anyhow!("timeout waiting for leadership confirmation"))),
                    }
                }
                .instrument(tracing::debug_span!("confirm", peer = target)),
            )
            .map_err(move |err| (target, err.into()));
            pending.push(task);
        }

        while let Some(res) = pending.next().await {
            let (target, data) = match res {
                Ok(Ok(res)) => res,
                Ok(Err((target, err))) | Err((target, err)) => {
                    tracing::warn!(peer = target, error = %err, "error confirming leadership for read");
                    continue;
                }
            };

            if data.term > self.core.current_term {
                self.core.update_current_term(data.term, None);
                self.core.save_hard_state().await?;
                self.core.set_target_role(Role::Follower);
                return Err(RaftError::NoLeader { leader: None });
            }
            if active.contains(&target) {
                confirmed += 1;
            }
            if confirmed >= needed {
                return Ok(());
            }
        }

        Err(RaftError::Network(anyhow!(
            "too many requests failed, could not confirm leadership"
        )))
    }

    /// Transform a payload into an entry at the next index of the current term, append it
    /// to the log and flush.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload) -> RaftResult<Entry> {
        let entry = Entry {
            index: self.core.last_log_id.index + 1,
            term: self.core.current_term,
            timestamp: crate::timestamp_millis(),
            payload,
        };
        self.core
            .log
            .append(&entry)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err.into()))?;
        self.core
            .log
            .flush()
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err.into()))?;
        self.core.last_log_id = entry.log_id();
        self.leader_report_metrics();
        Ok(entry)
    }

    /// Begin replicating an appended entry.
    ///
    /// This does not wait for the entry to finish replication: once a quorum stores it,
    /// commit advancement completes the pending request asynchronously. A single-server
    /// voting cluster commits immediately.
    #[tracing::instrument(level = "trace", skip(self, pending))]
    pub(super) async fn replicate_client_request(&mut self, pending: PendingEntry) {
        let entry_arc = pending.entry.clone();
        let index = entry_arc.index;
        self.awaiting_committed.push(pending);

        if self.nodes.is_empty() {
            self.commit_entries(index).await.ok();
            return;
        }

        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send((
                RaftEvent::Replicate {
                    entry: entry_arc.clone(),
                    commit_index: self.core.commit_index,
                },
                tracing::debug_span!("CH"),
            ));
        }
    }

    /// Handle the post-commit logic for a pending entry: apply it and complete the
    /// caller's channel with the response its kind calls for.
    #[tracing::instrument(level = "trace", skip(self, pending))]
    pub(super) async fn client_request_post_commit(&mut self, pending: PendingEntry) {
        let entry = pending.entry;
        let index = entry.index;
        let applied = self.apply_entry_to_state_machine(&entry).await;

        match pending.responder {
            Responder::Command(tx) => {
                let _ = tx.send(flatten(applied).map(|result| CommandResponse {
                    index,
                    event_index: index,
                    result,
                }));
            }
            Responder::Query(tx) => {
                let _ = tx.send(flatten(applied).map(|result| QueryResponse { index, result }));
            }
            Responder::OpenSession(tx) => {
                let granted = match &entry.payload {
                    EntryPayload::OpenSession { timeout, .. } => *timeout,
                    _ => self.core.config.session_timeout,
                };
                let _ = tx.send(flatten(applied).map(|_| OpenSessionResponse {
                    session: index,
                    timeout: granted,
                }));
            }
            Responder::CloseSession(tx) => {
                let session = match &entry.payload {
                    EntryPayload::CloseSession { session } => *session,
                    _ => 0,
                };
                let _ = tx.send(flatten(applied).map(|_| CloseSessionResponse { session }));
            }
            Responder::KeepAlive(tx) => {
                let leader = Some(self.core.id);
                let members = self.core.cluster.configuration().members.clone();
                let _ = tx.send(flatten(applied).map(|_| KeepAliveResponse { leader, members }));
            }
            Responder::Admin(resp_tx) => {
                if let Err(err) = &applied {
                    tracing::error!(error = %err, index, "error applying configuration entry");
                }
                if let Some(tx) = resp_tx {
                    let configuration = self.core.cluster.configuration();
                    let _ = tx.send(applied.map(|_| AdminResponse {
                        index: configuration.index,
                        term: configuration.term,
                        members: configuration.members.clone(),
                    }));
                }
            }
            Responder::None => {
                if let Err(err) = &applied {
                    tracing::error!(error = %err, index, "error applying leader entry");
                }
            }
        }

        self.core.trigger_log_compaction_if_needed(false);
    }

    /// Apply the given committed entry, catching up any earlier committed entries first
    /// so the state machine always sees strictly increasing indices.
    #[tracing::instrument(level = "trace", skip(self, entry), fields(index = entry.index))]
    pub(super) async fn apply_entry_to_state_machine(&mut self, entry: &Entry) -> RaftResult<ApplyResult> {
        // Unapplied entries from before this leadership are folded in first.
        let expected = self.core.last_applied.index + 1;
        if entry.index > expected {
            let entries = self
                .core
                .log
                .entries(expected, entry.index)
                .await
                .map_err(|err| self.core.map_fatal_storage_error(err.into()))?;
            if !entries.is_empty() {
                self.core
                    .state_machine
                    .apply(&entries)
                    .await
                    .map_err(|err| self.core.map_fatal_storage_error(err))?;
                self.core.last_applied = entries.last().expect("non-empty").log_id();
            }
        }

        // Let any outstanding background apply task finish before touching the state
        // machine from this path.
        if !self.core.replicate_to_sm_handle.is_empty() {
            if let Some(Ok(res)) = self.core.replicate_to_sm_handle.next().await {
                self.core.handle_replicate_to_sm_result(res)?;
            }
        }

        if entry.index <= self.core.last_applied.index {
            // Already applied by the background task; the per-entry result is gone.
            return Ok(Ok(Vec::new()));
        }

        let results = self
            .core
            .state_machine
            .apply(std::slice::from_ref(entry))
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_applied = entry.log_id();
        self.leader_report_metrics();
        Ok(results.into_iter().next().unwrap_or(Ok(Vec::new())))
    }
}

/// Collapse a fatal-or-application layered apply outcome into one client-facing result.
fn flatten(res: RaftResult<ApplyResult>) -> RaftResult<Vec<u8>> {
    match res {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(apply_err)) => Err(apply_err.into()),
        Err(err) => Err(err),
    }
}
