//! Error types exposed by this crate.

use thiserror::Error;

use crate::core::Role;
use crate::ServerId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Protocol-level error kinds.
///
/// Handlers complete with one of these instead of a transport failure; a transport layer
/// maps `Err` onto a response with an ERROR status and the corresponding kind, and `Ok`
/// onto an OK status.
#[derive(Debug, Error)]
pub enum RaftError {
    /// No leader is known; the client should retry, following the hint if present.
    #[error("no known cluster leader")]
    NoLeader { leader: Option<ServerId> },

    /// The request is not valid in the server's current role.
    #[error("request is not valid in the {0} role")]
    IllegalMemberState(Role),

    /// The session is not known to the state machine.
    #[error("unknown session {0}")]
    UnknownSession(u64),

    /// The session has been closed.
    #[error("closed session {0}")]
    ClosedSession(u64),

    /// The session expired for lack of keep-alives.
    #[error("expired session {0}")]
    ExpiredSession(u64),

    /// The state machine rejected a command.
    #[error("command failure: {0}")]
    CommandFailure(String),

    /// The state machine rejected a query.
    #[error("query failure: {0}")]
    QueryFailure(String),

    /// An application error surfaced while applying an entry.
    #[error("application error: {0}")]
    ApplicationError(String),

    /// The request was malformed.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// A configuration change was rejected.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// An error which originated from the storage layer.
    #[error("storage error")]
    Storage(#[source] anyhow::Error),

    /// An error which originated from the network layer.
    #[error("network error")]
    Network(#[source] anyhow::Error),

    /// The node is shutting down.
    #[error("raft node is shutting down")]
    ShuttingDown,
}

/// An error produced while bootstrapping a pristine node.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The node already carries log entries or a term and can not be bootstrapped.
    #[error("the cluster is already initialized")]
    NotAllowed,

    /// The proposed membership does not include this node.
    #[error("bootstrap membership does not include this node")]
    LocalMemberMissing,

    #[error(transparent)]
    RaftError(#[from] RaftError),
}
