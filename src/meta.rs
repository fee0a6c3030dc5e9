//! Persistent server metadata: term, vote and the committed configuration.

use std::convert::TryInto;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::entry::Configuration;
use crate::ServerId;

/// The meta store file name.
const META_FILE: &str = "raft.meta";
/// Size of the fixed-width record prefix: term, vote and configuration index.
const META_HEADER_SIZE: usize = 24;

/// An error raised by the meta store.
#[derive(Debug, Error)]
pub enum MetaError {
    #[error("corrupt meta store {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("meta codec error")]
    Codec(#[from] bincode::Error),
}

/// The durable state of a Raft server.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetaRecord {
    /// The last recorded term observed by this server.
    pub current_term: u64,
    /// The candidate voted for in `current_term`, if any.
    pub voted_for: Option<ServerId>,
    /// The latest committed cluster configuration, if any.
    pub configuration: Option<Configuration>,
}

/// A tiny persistent record holding `(current_term, voted_for)` and the latest committed
/// cluster configuration.
///
/// Writes are synchronous: every save rewrites the record to a temp file, renames it into
/// place and fsyncs, and the returned future resolves only once the data is durable. Vote
/// grants must await the save before responding.
///
/// On-disk layout: `[current_term u64][voted_for u64|0][configuration_index u64]` followed
/// by `[len u32][bincode Configuration]`, little-endian. A `voted_for` of 0 encodes the
/// absence of a vote, which is why server ids must be non-zero.
pub struct MetaStore {
    path: PathBuf,
    cached: RwLock<MetaRecord>,
}

impl MetaStore {
    /// Open the meta store rooted at `dir`, loading any existing record.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, MetaError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(META_FILE);
        let cached = if path.exists() {
            Self::read_record(&path)?
        } else {
            MetaRecord::default()
        };
        Ok(Self {
            path,
            cached: RwLock::new(cached),
        })
    }

    /// The current durable record.
    pub async fn load(&self) -> MetaRecord {
        self.cached.read().await.clone()
    }

    /// Persist the current term and vote.
    pub async fn save_vote(&self, current_term: u64, voted_for: Option<ServerId>) -> Result<(), MetaError> {
        debug_assert!(voted_for != Some(0), "server ids must be non-zero");
        let mut cached = self.cached.write().await;
        cached.current_term = current_term;
        cached.voted_for = voted_for;
        self.write_record(&cached)
    }

    /// Persist the given committed configuration.
    pub async fn save_configuration(&self, configuration: &Configuration) -> Result<(), MetaError> {
        let mut cached = self.cached.write().await;
        cached.configuration = Some(configuration.clone());
        self.write_record(&cached)
    }

    fn read_record(path: &PathBuf) -> Result<MetaRecord, MetaError> {
        let data = std::fs::read(path)?;
        if data.len() < META_HEADER_SIZE {
            return Err(MetaError::Corrupt {
                path: path.display().to_string(),
                reason: "record shorter than its fixed header".into(),
            });
        }
        let current_term = u64::from_le_bytes(data[0..8].try_into().expect("sliced 8 bytes"));
        let voted_for = match u64::from_le_bytes(data[8..16].try_into().expect("sliced 8 bytes")) {
            0 => None,
            id => Some(id),
        };
        let configuration_index = u64::from_le_bytes(data[16..24].try_into().expect("sliced 8 bytes"));

        let mut configuration = None;
        if data.len() > META_HEADER_SIZE {
            if data.len() < META_HEADER_SIZE + 4 {
                return Err(MetaError::Corrupt {
                    path: path.display().to_string(),
                    reason: "truncated configuration length".into(),
                });
            }
            let len = u32::from_le_bytes(
                data[META_HEADER_SIZE..META_HEADER_SIZE + 4].try_into().expect("sliced 4 bytes"),
            ) as usize;
            let start = META_HEADER_SIZE + 4;
            if data.len() < start + len {
                return Err(MetaError::Corrupt {
                    path: path.display().to_string(),
                    reason: "truncated configuration payload".into(),
                });
            }
            let cfg: Configuration = bincode::deserialize(&data[start..start + len])?;
            if cfg.index != configuration_index {
                return Err(MetaError::Corrupt {
                    path: path.display().to_string(),
                    reason: format!(
                        "configuration index {} does not match header {}",
                        cfg.index, configuration_index
                    ),
                });
            }
            configuration = Some(cfg);
        }

        Ok(MetaRecord {
            current_term,
            voted_for,
            configuration,
        })
    }

    fn write_record(&self, record: &MetaRecord) -> Result<(), MetaError> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&record.current_term.to_le_bytes());
        buf.extend_from_slice(&record.voted_for.unwrap_or(0).to_le_bytes());
        buf.extend_from_slice(&record.configuration.as_ref().map(|c| c.index).unwrap_or(0).to_le_bytes());
        if let Some(cfg) = &record.configuration {
            let payload = bincode::serialize(cfg)?;
            buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            buf.extend_from_slice(&payload);
        }

        let tmp = self.path.with_extension("meta.tmp");
        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
        file.write_all(&buf)?;
        file.sync_data()?;
        std::fs::rename(&tmp, &self.path)?;
        // Durability of the rename itself requires syncing the directory.
        if let Some(dir) = self.path.parent() {
            if let Ok(dir_handle) = std::fs::File::open(dir) {
                let _ = dir_handle.sync_data();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Member;
    use crate::entry::MemberType;

    #[tokio::test]
    async fn vote_and_configuration_survive_reopen() -> Result<(), MetaError> {
        let dir = tempfile::tempdir()?;
        {
            let meta = MetaStore::open(dir.path()).await?;
            assert_eq!(meta.load().await, MetaRecord::default());

            meta.save_vote(3, Some(2)).await?;
            meta.save_configuration(&Configuration {
                index: 5,
                term: 3,
                timestamp: 42,
                members: vec![
                    Member::new(1, "s1", MemberType::Active),
                    Member::new(2, "s2", MemberType::Passive),
                ],
            })
            .await?;
        }

        let meta = MetaStore::open(dir.path()).await?;
        let record = meta.load().await;
        assert_eq!(record.current_term, 3);
        assert_eq!(record.voted_for, Some(2));
        let cfg = record.configuration.unwrap();
        assert_eq!(cfg.index, 5);
        assert_eq!(cfg.member_type(2), MemberType::Passive);
        Ok(())
    }

    #[tokio::test]
    async fn clearing_the_vote_is_durable() -> Result<(), MetaError> {
        let dir = tempfile::tempdir()?;
        {
            let meta = MetaStore::open(dir.path()).await?;
            meta.save_vote(1, Some(1)).await?;
            meta.save_vote(2, None).await?;
        }
        let meta = MetaStore::open(dir.path()).await?;
        let record = meta.load().await;
        assert_eq!(record.current_term, 2);
        assert_eq!(record.voted_for, None);
        Ok(())
    }
}
