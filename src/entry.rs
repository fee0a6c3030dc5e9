//! Log entry and cluster configuration data types.

use serde::Deserialize;
use serde::Serialize;

use crate::quorum;
use crate::LogId;
use crate::MessageSummary;
use crate::ServerId;

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry's position in the log.
    pub index: u64,
    /// The term in which the entry was written.
    pub term: u64,
    /// Leader wall-clock time at append, in milliseconds since the unix epoch.
    ///
    /// Used by the session subsystem for timeout accounting; never used for ordering.
    pub timestamp: u64,
    /// This entry's payload.
    pub payload: EntryPayload,
}

impl Entry {
    pub fn log_id(&self) -> LogId {
        LogId {
            term: self.term,
            index: self.index,
        }
    }
}

impl MessageSummary for Entry {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id(), self.payload.summary())
    }
}

impl MessageSummary for &[Entry] {
    fn summary(&self) -> String {
        self.iter().map(|x| x.summary()).collect::<Vec<_>>().join(",")
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// An empty payload written by a new leader at the start of its term.
    Initialize,
    /// A cluster membership configuration.
    Configuration { members: Vec<Member> },
    /// A client state-machine mutation.
    Command { session: u64, sequence: u64, operation: Vec<u8> },
    /// A linearizable read which requires log placement.
    Query { session: u64, sequence: u64, operation: Vec<u8> },
    /// Registration of a new client session.
    OpenSession { client: String, timeout: u64 },
    /// Expiry of a client session.
    CloseSession { session: u64 },
    /// A client session heartbeat.
    KeepAlive {
        sessions: Vec<u64>,
        command_sequences: Vec<u64>,
        event_indexes: Vec<u64>,
    },
}

impl MessageSummary for EntryPayload {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Initialize => "initialize".to_string(),
            EntryPayload::Configuration { members } => {
                format!("configuration: {:?}", members.iter().map(|m| m.id).collect::<Vec<_>>())
            }
            EntryPayload::Command { session, sequence, .. } => format!("command: {}/{}", session, sequence),
            EntryPayload::Query { session, sequence, .. } => format!("query: {}/{}", session, sequence),
            EntryPayload::OpenSession { client, .. } => format!("open-session: {}", client),
            EntryPayload::CloseSession { session } => format!("close-session: {}", session),
            EntryPayload::KeepAlive { sessions, .. } => format!("keep-alive: {:?}", sessions),
        }
    }
}

/// The replication and voting role a member plays in the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberType {
    /// Participates in quorum and receives log entries.
    Active,
    /// Receives log entries but does not vote.
    Passive,
    /// Tracked in the configuration but neither votes nor receives entries.
    Reserve,
    /// Not participating in the cluster.
    Inactive,
}

/// A single member of the cluster configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: ServerId,
    /// Transport address, opaque to the core.
    pub address: String,
    pub member_type: MemberType,
    /// Milliseconds since the unix epoch at which this member record last changed.
    pub updated: u64,
}

impl Member {
    pub fn new(id: ServerId, address: impl Into<String>, member_type: MemberType) -> Self {
        Self {
            id,
            address: address.into(),
            member_type,
            updated: crate::timestamp_millis(),
        }
    }
}

/// The membership configuration of the cluster.
///
/// Exactly one configuration is current per server. A configuration is committed once the
/// server's commit index covers `index`, at which point it is persisted to the meta store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// The index of the log entry which produced this configuration, 0 for a bootstrap
    /// configuration which has not yet been written to the log.
    pub index: u64,
    /// The term of that log entry.
    pub term: u64,
    /// Milliseconds since the unix epoch at which this configuration was created.
    pub timestamp: u64,
    /// All known members, voting or not.
    pub members: Vec<Member>,
}

impl Configuration {
    /// Look up a member by id.
    pub fn get(&self, id: ServerId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    /// Check if the given server id exists in this configuration.
    pub fn contains(&self, id: ServerId) -> bool {
        self.get(id).is_some()
    }

    /// The member type of the given server, `Inactive` if it is not a member.
    pub fn member_type(&self, id: ServerId) -> MemberType {
        self.get(id).map(|m| m.member_type).unwrap_or(MemberType::Inactive)
    }

    /// Ids of all ACTIVE members, the voting population.
    pub fn active_ids(&self) -> Vec<ServerId> {
        self.members.iter().filter(|m| m.member_type == MemberType::Active).map(|m| m.id).collect()
    }

    /// Ids of all members which receive log entries (ACTIVE and PASSIVE).
    pub fn replication_ids(&self) -> Vec<ServerId> {
        self.members
            .iter()
            .filter(|m| matches!(m.member_type, MemberType::Active | MemberType::Passive))
            .map(|m| m.id)
            .collect()
    }

    /// Ids of all members other than `local`.
    pub fn remote_ids(&self, local: ServerId) -> Vec<ServerId> {
        self.members.iter().filter(|m| m.id != local).map(|m| m.id).collect()
    }

    /// The number of ACTIVE members which constitutes a quorum.
    pub fn quorum(&self) -> usize {
        quorum::majority_of(self.active_ids().len())
    }
}

impl MessageSummary for Configuration {
    fn summary(&self) -> String {
        let members = self
            .members
            .iter()
            .map(|m| format!("{}:{:?}", m.id, m.member_type))
            .collect::<Vec<_>>()
            .join(",");
        format!("cfg@{}-{}[{}]", self.term, self.index, members)
    }
}

/// The consistency level requested for a client query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Serve from local state without leadership verification.
    Sequential,
    /// Serve locally after confirming leadership with a heartbeat quorum.
    LinearizableLease,
    /// Place the query in the log and serve once it is committed and applied.
    Linearizable,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(types: &[(ServerId, MemberType)]) -> Configuration {
        Configuration {
            index: 1,
            term: 1,
            timestamp: 0,
            members: types.iter().map(|(id, t)| Member::new(*id, format!("s{}", id), *t)).collect(),
        }
    }

    #[test]
    fn quorum_counts_only_active_members() {
        let c = cfg(&[
            (1, MemberType::Active),
            (2, MemberType::Active),
            (3, MemberType::Active),
            (4, MemberType::Passive),
            (5, MemberType::Reserve),
        ]);
        assert_eq!(c.quorum(), 2);
        assert_eq!(c.active_ids(), vec![1, 2, 3]);
        assert_eq!(c.replication_ids(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn member_type_defaults_to_inactive_for_strangers() {
        let c = cfg(&[(1, MemberType::Active)]);
        assert_eq!(c.member_type(9), MemberType::Inactive);
    }
}
