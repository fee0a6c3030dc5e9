//! The state-machine executor interface and snapshot data types.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::io::AsyncSeek;
use tokio::io::AsyncWrite;

use crate::entry::Entry;
use crate::error::RaftError;
use crate::LogId;

/// Metadata identifying a snapshot: the last entry it covers.
///
/// The canonical file name of a snapshot is `{index}-{term}.snapshot`, written atomically
/// via rename by the implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// The index of the last entry included in the snapshot.
    pub index: u64,
    /// The term of that entry.
    pub term: u64,
}

impl SnapshotMeta {
    pub fn log_id(&self) -> LogId {
        LogId {
            term: self.term,
            index: self.index,
        }
    }
}

/// A snapshot paired with a handle to its byte stream.
pub struct Snapshot<S>
where S: AsyncRead + AsyncSeek + Send + Unpin + 'static
{
    pub meta: SnapshotMeta,
    pub snapshot: Box<S>,
}

/// A per-entry application outcome.
///
/// The `Err` variant carries session and application failures which are returned to the
/// client in the response; they never demote the server's role.
pub type ApplyResult = std::result::Result<Vec<u8>, ApplyError>;

/// An error produced while applying an entry or executing a query.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("unknown session {0}")]
    UnknownSession(u64),

    #[error("closed session {0}")]
    ClosedSession(u64),

    #[error("expired session {0}")]
    ExpiredSession(u64),

    #[error("command failure: {0}")]
    Command(String),

    #[error("query failure: {0}")]
    Query(String),

    #[error("application error: {0}")]
    Application(String),
}

impl From<ApplyError> for RaftError {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::UnknownSession(s) => RaftError::UnknownSession(s),
            ApplyError::ClosedSession(s) => RaftError::ClosedSession(s),
            ApplyError::ExpiredSession(s) => RaftError::ExpiredSession(s),
            ApplyError::Command(msg) => RaftError::CommandFailure(msg),
            ApplyError::Query(msg) => RaftError::QueryFailure(msg),
            ApplyError::Application(msg) => RaftError::ApplicationError(msg),
        }
    }
}

/// The state-machine executor which applies committed entries.
///
/// Implementations own session bookkeeping: commands are ordered per session by
/// `(session, sequence)` and a repeated pair must return the cached result rather than
/// re-executing. The core guarantees entries are presented exactly once each, in strictly
/// increasing index order, and never before they are committed.
///
/// Errors returned through the outer `Result` are treated as unrecoverable storage
/// failures and shut the server down; per-entry outcomes travel in [`ApplyResult`].
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// The associated type used for exposing a snapshot for reading and writing.
    type SnapshotData: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin + 'static;

    /// Apply the given committed entries in order, returning one outcome per entry.
    ///
    /// All entry kinds are presented, including configurations and session lifecycle
    /// entries; implementations ignore the kinds they carry no state for. `Query` entries
    /// execute their read against the state as of the preceding entry and must not mutate.
    async fn apply(&self, entries: &[Entry]) -> Result<Vec<ApplyResult>>;

    /// Execute a read-only operation against current state, for sequential and
    /// lease-based reads which bypass the log.
    async fn query(&self, operation: &[u8]) -> Result<ApplyResult>;

    /// The id of the last entry this state machine has applied, `0-0` when pristine.
    async fn last_applied(&self) -> Result<LogId>;

    /// Write a snapshot of current state, returning a read handle to it.
    ///
    /// The returned metadata must identify the last applied entry at the time the state
    /// was captured.
    async fn snapshot(&self) -> Result<Snapshot<Self::SnapshotData>>;

    /// Get a read handle to the most recent complete snapshot, if one exists.
    async fn current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>>;

    /// Create a new blank snapshot stream for receiving an installation from the leader.
    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>>;

    /// Finalize the installation of a snapshot streamed from the leader, replacing all
    /// current state with its contents.
    async fn install_snapshot(&self, meta: &SnapshotMeta, snapshot: Box<Self::SnapshotData>) -> Result<()>;
}
