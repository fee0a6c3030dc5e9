//! A Raft replicated state machine server core.
//!
//! This crate implements the consensus core of a replicated state machine server: the
//! role state machine which drives a server through the Raft roles (Inactive, Reserve,
//! Passive, Follower, Candidate, Leader), a segmented on-disk replicated log, and the
//! persistent cluster configuration those roles consult and mutate.
//!
//! Applications provide the two external collaborators as trait implementations:
//! [`RaftNetwork`](crate::network::RaftNetwork) for transport and
//! [`StateMachine`](crate::state_machine::StateMachine) for applying committed entries,
//! then drive a node through the cheaply cloneable [`Raft`](crate::raft::Raft) handle.

mod core;
mod quorum;
mod replication;

pub mod cluster;
pub mod config;
pub mod entry;
pub mod error;
pub mod log;
pub mod meta;
pub mod metrics;
pub mod network;
pub mod raft;
pub mod state_machine;

use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

pub use async_trait;

pub use crate::cluster::Cluster;
pub use crate::config::Config;
pub use crate::config::ConfigError;
pub use crate::config::SnapshotPolicy;
pub use crate::core::Role;
pub use crate::entry::Configuration;
pub use crate::entry::Consistency;
pub use crate::entry::Entry;
pub use crate::entry::EntryPayload;
pub use crate::entry::Member;
pub use crate::entry::MemberType;
pub use crate::error::RaftError;
pub use crate::error::RaftResult;
pub use crate::log::Log;
pub use crate::log::LogOptions;
pub use crate::meta::MetaStore;
pub use crate::metrics::RaftMetrics;
pub use crate::network::RaftNetwork;
pub use crate::raft::Raft;
pub use crate::replication::ReplicationMetrics;
pub use crate::state_machine::StateMachine;

/// A Raft server's ID.
///
/// Server ids must be non-zero: the meta store encodes an absent vote as `0`.
pub type ServerId = u64;

/// The identity of a log entry: its index paired with the term in which it was written.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl Display for LogId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

/// A trait implemented by types which present a compact, single-line summary for logging.
///
/// `Debug` output for messages carrying entry batches or member lists is too noisy for the
/// hot path; this is the low-cost alternative used by the tracing spans.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

/// Whether to update a value or to leave it as is.
#[derive(Debug)]
pub enum Update<T> {
    Update(T),
    Ignore,
}

/// The current time expressed as milliseconds since the unix epoch.
pub(crate) fn timestamp_millis() -> u64 {
    use std::time::SystemTime;
    use std::time::UNIX_EPOCH;

    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
