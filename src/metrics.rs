//! State observation for a running Raft node.
//!
//! The core publishes a snapshot of its observable state onto a `watch` channel whenever
//! something noteworthy changes. The [`Wait`] helper turns that channel into awaitable
//! conditions, which is also how the integration tests synchronize with a cluster.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::core::Role;
use crate::entry::Configuration;
use crate::replication::ReplicationMetrics;
use crate::LogId;
use crate::ServerId;

/// Leader-specific observable state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaderMetrics {
    /// Replication progress per peer.
    pub replication: HashMap<ServerId, ReplicationMetrics>,
}

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The server's ID.
    pub id: ServerId,
    /// The server's current role.
    pub role: Role,
    /// The current term.
    pub current_term: u64,
    /// The index of the last log entry.
    pub last_log_index: u64,
    /// The index of the highest committed entry.
    pub commit_index: u64,
    /// The index of the last entry applied to the state machine.
    pub last_applied: u64,
    /// The current cluster leader, if known.
    pub current_leader: Option<ServerId>,
    /// The current cluster configuration.
    pub configuration: Configuration,
    /// The id of the last entry covered by a snapshot, `0-0` if none exists.
    pub snapshot: LogId,
    /// Leader-specific state, present only while this server leads.
    pub leader_metrics: Option<LeaderMetrics>,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: ServerId) -> Self {
        Self {
            id,
            role: Role::Inactive,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
            configuration: Configuration::default(),
            snapshot: LogId::default(),
            leader_metrics: None,
        }
    }
}

/// An error which may arise while waiting on a metrics condition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),

    #[error("raft node is shutting down")]
    ShuttingDown,
}

/// A handle for waiting on the metrics to satisfy some condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait until the metrics satisfy `func`, or timeout.
    #[tracing::instrument(level = "debug", skip(self, func))]
    pub async fn metrics<T>(&self, func: T, msg: &str) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool + Send {
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!(%latest.id, ?latest.role, "wait condition satisfied: {}", msg);
                return Ok(latest);
            }

            let delay = timeout(self.timeout, rx.changed()).await;
            match delay {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(WaitError::ShuttingDown),
                Err(_) => {
                    let latest = rx.borrow().clone();
                    tracing::debug!(%latest.id, ?latest.role, "timeout waiting for: {}", msg);
                    return Err(WaitError::Timeout(self.timeout, format!("{} latest: {:?}", msg, latest)));
                }
            }
        }
    }

    /// Wait for the log to reach `want` entries appended and applied.
    pub async fn log(&self, want_log: u64, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index == want_log && m.last_applied == want_log,
            &format!("{} .last_log_index and .last_applied -> {}", msg, want_log),
        )
        .await
    }

    /// Wait for the node to assume the given role.
    pub async fn role(&self, want_role: Role, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.role == want_role, &format!("{} .role -> {:?}", msg, want_role)).await
    }

    /// Wait for the node to observe the given leader.
    pub async fn current_leader(&self, leader: ServerId, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader == Some(leader),
            &format!("{} .current_leader -> {}", msg, leader),
        )
        .await
    }

    /// Wait for the node's snapshot to cover the given log id.
    pub async fn snapshot(&self, want: LogId, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.snapshot == want, &format!("{} .snapshot -> {}", msg, want)).await
    }

    /// Wait for the configuration to contain exactly the given member ids.
    pub async fn members(&self, want: Vec<ServerId>, msg: &str) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| {
                let mut ids: Vec<ServerId> = m.configuration.members.iter().map(|x| x.id).collect();
                ids.sort_unstable();
                ids == want
            },
            &format!("{} .configuration members -> {:?}", msg, want),
        )
        .await
    }
}
