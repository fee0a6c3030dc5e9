//! Raft runtime configuration.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Default heartbeat interval in milliseconds.
const DEFAULT_HEARTBEAT_INTERVAL: u64 = 150;
/// Default election timeout, as a multiple of the heartbeat interval.
const DEFAULT_ELECTION_TIMEOUT_FACTOR: u64 = 5;
/// Default session timeout, as a multiple of the heartbeat interval.
const DEFAULT_SESSION_TIMEOUT_FACTOR: u64 = 20;
/// Default maximum number of entries per AppendRequest payload.
const DEFAULT_MAX_PAYLOAD_ENTRIES: u64 = 300;
/// Default snapshot chunk size (3 MiB).
const DEFAULT_SNAPSHOT_MAX_CHUNK_SIZE: u64 = 3 * 1024 * 1024;
/// Default timeout for sending a single snapshot chunk, in milliseconds.
const DEFAULT_INSTALL_SNAPSHOT_TIMEOUT: u64 = 200;

/// Log compaction policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// Snapshot the state machine once it has applied the given number of entries since
    /// the last snapshot.
    LogsSinceLast(u64),
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self::LogsSinceLast(5000)
    }
}

/// The runtime configuration of a Raft node.
///
/// Returned from [`ConfigBuilder::validate`]; construct via [`Config::build`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The interval at which leaders send heartbeats to followers, in milliseconds.
    pub heartbeat_interval: u64,
    /// The lower bound of the election timeout, in milliseconds.
    ///
    /// The effective timeout is drawn uniformly from `[election_timeout, 2 * election_timeout)`
    /// each time the timer is armed.
    pub election_timeout: u64,
    /// The interval after which an inactive client session expires, in milliseconds.
    pub session_timeout: u64,
    /// The maximum number of entries per AppendRequest payload.
    pub max_payload_entries: u64,
    /// The distance behind in log replication at which a follower is brought back up to
    /// speed via storage reads instead of the live replication buffer.
    pub replication_lag_threshold: u64,
    /// The snapshot policy to use for log compaction.
    pub snapshot_policy: SnapshotPolicy,
    /// The maximum snapshot chunk size, in bytes.
    pub snapshot_max_chunk_size: u64,
    /// The timeout for sending a single snapshot chunk, in milliseconds.
    pub install_snapshot_timeout: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            heartbeat_interval: None,
            election_timeout: None,
            session_timeout: None,
            max_payload_entries: None,
            replication_lag_threshold: None,
            snapshot_policy: None,
            snapshot_max_chunk_size: None,
            install_snapshot_timeout: None,
        }
    }

    /// Generate a new random election timeout within the configured band, in milliseconds.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout..self.election_timeout * 2)
    }
}

/// A configuration builder.
pub struct ConfigBuilder {
    cluster_name: String,
    heartbeat_interval: Option<u64>,
    election_timeout: Option<u64>,
    session_timeout: Option<u64>,
    max_payload_entries: Option<u64>,
    replication_lag_threshold: Option<u64>,
    snapshot_policy: Option<SnapshotPolicy>,
    snapshot_max_chunk_size: Option<u64>,
    install_snapshot_timeout: Option<u64>,
}

impl ConfigBuilder {
    /// Set the heartbeat interval, in milliseconds.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the base election timeout, in milliseconds.
    pub fn election_timeout(mut self, val: u64) -> Self {
        self.election_timeout = Some(val);
        self
    }

    /// Set the session timeout, in milliseconds.
    pub fn session_timeout(mut self, val: u64) -> Self {
        self.session_timeout = Some(val);
        self
    }

    /// Set the maximum number of entries per AppendRequest payload.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Set the replication lag threshold.
    pub fn replication_lag_threshold(mut self, val: u64) -> Self {
        self.replication_lag_threshold = Some(val);
        self
    }

    /// Set the snapshot policy.
    pub fn snapshot_policy(mut self, val: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(val);
        self
    }

    /// Set the maximum snapshot chunk size, in bytes.
    pub fn snapshot_max_chunk_size(mut self, val: u64) -> Self {
        self.snapshot_max_chunk_size = Some(val);
        self
    }

    /// Set the per-chunk snapshot send timeout, in milliseconds.
    pub fn install_snapshot_timeout(mut self, val: u64) -> Self {
        self.install_snapshot_timeout = Some(val);
        self
    }

    /// Validate the state of this builder, returning a config instance if valid.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        let election_timeout =
            self.election_timeout.unwrap_or(heartbeat_interval * DEFAULT_ELECTION_TIMEOUT_FACTOR);
        let session_timeout =
            self.session_timeout.unwrap_or(heartbeat_interval * DEFAULT_SESSION_TIMEOUT_FACTOR);
        if heartbeat_interval == 0 {
            return Err(ConfigError::InvalidHeartbeatInterval);
        }
        if election_timeout < heartbeat_interval * 2 {
            return Err(ConfigError::InvalidElectionTimeout);
        }
        if session_timeout < election_timeout {
            return Err(ConfigError::InvalidSessionTimeout);
        }
        let max_payload_entries = self.max_payload_entries.unwrap_or(DEFAULT_MAX_PAYLOAD_ENTRIES);
        if max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }
        Ok(Config {
            cluster_name: self.cluster_name,
            heartbeat_interval,
            election_timeout,
            session_timeout,
            max_payload_entries,
            replication_lag_threshold: self.replication_lag_threshold.unwrap_or(1000),
            snapshot_policy: self.snapshot_policy.unwrap_or_default(),
            snapshot_max_chunk_size: self.snapshot_max_chunk_size.unwrap_or(DEFAULT_SNAPSHOT_MAX_CHUNK_SIZE),
            install_snapshot_timeout: self.install_snapshot_timeout.unwrap_or(DEFAULT_INSTALL_SNAPSHOT_TIMEOUT),
        })
    }
}

/// A configuration error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("heartbeat interval must be greater than 0")]
    InvalidHeartbeatInterval,
    #[error("election timeout must be at least twice the heartbeat interval")]
    InvalidElectionTimeout,
    #[error("session timeout must not be less than the election timeout")]
    InvalidSessionTimeout,
    #[error("max payload entries must be greater than 0")]
    MaxPayloadEntriesTooSmall,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::build("test".into()).validate().unwrap();
        assert_eq!(cfg.heartbeat_interval, 150);
        assert_eq!(cfg.election_timeout, 750);
    }

    #[test]
    fn rand_election_timeout_stays_in_band() {
        let cfg = Config::build("test".into()).validate().unwrap();
        for _ in 0..100 {
            let t = cfg.new_rand_election_timeout();
            assert!(t >= cfg.election_timeout && t < cfg.election_timeout * 2);
        }
    }

    #[test]
    fn rejects_tight_election_timeout() {
        let res = Config::build("test".into()).heartbeat_interval(100).election_timeout(150).validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidElectionTimeout);
    }
}
