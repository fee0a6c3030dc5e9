//! The live cluster roster.

use crate::entry::Configuration;
use crate::entry::Member;
use crate::entry::MemberType;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::meta::MetaStore;
use crate::MessageSummary;
use crate::ServerId;

/// The outcome of installing a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigureOutcome {
    /// Whether the configuration was installed (false when it was stale and ignored).
    pub installed: bool,
    /// Whether the local member's type changed, requiring a role transition.
    pub local_type_changed: bool,
}

/// Maintains the live cluster configuration for one server.
///
/// The cluster is owned by the server's core task; it carries no synchronization of its
/// own. Per-peer replication progress is tracked by the leader keyed on member id, not
/// on the member records themselves.
pub struct Cluster {
    local_id: ServerId,
    configuration: Configuration,
    /// Whether the current configuration has been persisted to the meta store.
    committed: bool,
}

impl Cluster {
    /// Create the cluster view, restoring the given configuration if one was persisted.
    pub fn new(local_id: ServerId, configuration: Option<Configuration>) -> Self {
        let (configuration, committed) = match configuration {
            Some(cfg) => (cfg, true),
            None => (Configuration::default(), false),
        };
        Self {
            local_id,
            configuration,
            committed,
        }
    }

    pub fn local_id(&self) -> ServerId {
        self.local_id
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// The local member's record, if this server is part of the configuration.
    pub fn local_member(&self) -> Option<&Member> {
        self.configuration.get(self.local_id)
    }

    /// The local member's type; `Inactive` when this server is not a member.
    pub fn local_type(&self) -> MemberType {
        self.configuration.member_type(self.local_id)
    }

    /// Install a configuration, ignoring any which is not newer than the current one.
    pub fn configure(&mut self, configuration: Configuration) -> ConfigureOutcome {
        let has_current = !self.configuration.members.is_empty() || self.configuration.index > 0;
        if has_current && configuration.index <= self.configuration.index {
            return ConfigureOutcome {
                installed: false,
                local_type_changed: false,
            };
        }

        let old_type = self.local_type();
        for member in &configuration.members {
            if !self.configuration.contains(member.id) {
                tracing::info!(member = member.id, member_type = ?member.member_type, "member joined configuration");
            }
        }
        for member in &self.configuration.members {
            if !configuration.contains(member.id) {
                tracing::info!(member = member.id, "member left configuration");
            }
        }

        tracing::debug!(configuration = %configuration.summary(), "installing configuration");
        self.configuration = configuration;
        self.committed = false;

        ConfigureOutcome {
            installed: true,
            local_type_changed: self.local_type() != old_type,
        }
    }

    /// Whether the current configuration still needs to be persisted.
    pub fn needs_commit(&self, commit_index: u64) -> bool {
        !self.committed && commit_index >= self.configuration.index && !self.configuration.members.is_empty()
    }

    /// Persist the current configuration to the meta store.
    pub async fn commit(&mut self, meta: &MetaStore) -> RaftResult<()> {
        if self.committed {
            return Ok(());
        }
        meta.save_configuration(&self.configuration)
            .await
            .map_err(|err| RaftError::Storage(err.into()))?;
        self.committed = true;
        tracing::debug!(index = self.configuration.index, "committed configuration");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: ServerId, t: MemberType) -> Member {
        Member::new(id, format!("s{}", id), t)
    }

    fn cfg(index: u64, members: Vec<Member>) -> Configuration {
        Configuration {
            index,
            term: 1,
            timestamp: 0,
            members,
        }
    }

    #[test]
    fn stale_configurations_are_ignored() {
        let mut cluster = Cluster::new(1, Some(cfg(5, vec![member(1, MemberType::Active)])));
        let outcome = cluster.configure(cfg(4, vec![member(1, MemberType::Passive)]));
        assert!(!outcome.installed);
        assert_eq!(cluster.local_type(), MemberType::Active);
    }

    #[test]
    fn local_type_change_is_reported() {
        let mut cluster = Cluster::new(1, Some(cfg(1, vec![member(1, MemberType::Passive)])));
        let outcome = cluster.configure(cfg(2, vec![member(1, MemberType::Active)]));
        assert!(outcome.installed);
        assert!(outcome.local_type_changed);

        // Same type at a higher index: installed, no transition required.
        let outcome = cluster.configure(cfg(3, vec![member(1, MemberType::Active), member(2, MemberType::Active)]));
        assert!(outcome.installed);
        assert!(!outcome.local_type_changed);
    }

    #[test]
    fn absent_local_member_is_inactive() {
        let cluster = Cluster::new(9, Some(cfg(1, vec![member(1, MemberType::Active)])));
        assert_eq!(cluster.local_type(), MemberType::Inactive);
        assert!(cluster.local_member().is_none());
    }

    #[test]
    fn bootstrap_configuration_installs_over_empty() {
        let mut cluster = Cluster::new(1, None);
        let outcome = cluster.configure(cfg(0, vec![member(1, MemberType::Active)]));
        assert!(outcome.installed);
        assert!(outcome.local_type_changed);
        assert_eq!(cluster.local_type(), MemberType::Active);
    }
}
