//! The segmented replicated log.

mod segment;

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::entry::Configuration;
use crate::entry::Entry;
use crate::entry::EntryPayload;
use crate::LogId;

use segment::Segment;
use segment::SegmentDescriptor;

/// Sizing options for the segmented log.
#[derive(Clone, Debug)]
pub struct LogOptions {
    /// The maximum number of entries per segment.
    pub max_segment_entries: u64,
    /// The maximum segment file size in bytes.
    pub max_segment_bytes: u64,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            max_segment_entries: 65536,
            max_segment_bytes: 32 * 1024 * 1024,
        }
    }
}

/// An error raised by the log.
#[derive(Debug, Error)]
pub enum LogError {
    /// The requested index can not be written: either it is discontiguous with the log's
    /// tail, or the entry exceeds the segment capacity.
    #[error("index {index} is out of bounds for the log")]
    IndexOutOfBounds { index: u64 },

    /// An attempt was made to truncate entries at or below the commit index.
    #[error("cannot truncate to index {index}: commit index is {commit_index}")]
    TruncateCommitted { index: u64, commit_index: u64 },

    /// A segment file is unreadable beyond torn-tail recovery.
    #[error("corrupt log segment {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("entry codec error")]
    Codec(#[from] bincode::Error),
}

struct LogInner {
    segments: BTreeMap<u64, Segment>,
    /// The identity of the last entry discarded by compaction. The log's logical
    /// `first_index` is `compacted.index + 1`; physical segment files may retain older
    /// entries until whole segments fall behind the compaction point.
    compacted: LogId,
    last_log_id: LogId,
    /// The highest index known committed. Entries at or below this are immutable;
    /// `truncate` refuses to cross it.
    commit_index: u64,
}

impl LogInner {
    fn tail(&mut self) -> &mut Segment {
        self.segments.values_mut().next_back().expect("log always holds at least one segment")
    }

    fn segment_for(&self, index: u64) -> Option<&Segment> {
        self.segments.range(..=index).next_back().map(|(_, s)| s)
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.compacted.index {
            return Some(self.compacted.term);
        }
        if index <= self.compacted.index || index > self.last_log_id.index {
            return None;
        }
        self.segment_for(index).and_then(|s| s.term_of(index))
    }

    /// Delete whole sealed segments which lie entirely behind the compaction point.
    fn prune_compacted_segments(&mut self) -> Result<(), LogError> {
        let tail_base = *self.segments.keys().next_back().expect("log always holds at least one segment");
        let removable: Vec<u64> = self
            .segments
            .iter()
            .filter(|(base, segment)| {
                **base != tail_base
                    && segment.last_index().map(|last| last <= self.compacted.index).unwrap_or(true)
            })
            .map(|(base, _)| *base)
            .collect();
        for base in removable {
            if let Some(segment) = self.segments.remove(&base) {
                tracing::debug!(base, "removing compacted log segment");
                segment.destroy()?;
            }
        }
        Ok(())
    }
}

/// The append-only segmented log.
///
/// A log is owned by a single writer (the server's core task); reads may be issued
/// concurrently by replication and apply tasks through the shared handle. Every mutation
/// takes the write lock, so readers always observe a consistent snapshot of the index.
pub struct Log {
    dir: PathBuf,
    options: LogOptions,
    inner: RwLock<LogInner>,
}

impl Log {
    /// Open the log rooted at `dir`, creating it if empty and recovering any torn tail.
    pub async fn open(dir: impl Into<PathBuf>, options: LogOptions) -> Result<Self, LogError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut bases = Vec::new();
        for dirent in std::fs::read_dir(&dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".log") {
                if let Ok(base) = stem.parse::<u64>() {
                    bases.push(base);
                }
            }
        }
        bases.sort_unstable();

        let mut segments = BTreeMap::new();
        let mut prev_term = 0;
        for base in bases {
            let path = dir.join(Segment::file_name(base));
            let segment =
                Segment::open(path, base, prev_term, options.max_segment_entries, options.max_segment_bytes)?;
            prev_term = segment.last_index().and_then(|i| segment.term_of(i)).unwrap_or(prev_term);
            segments.insert(base, segment);
        }

        // Interior segments emptied by a crash between roll and first append are dropped;
        // the tail is reopened for writes below.
        let tail_base = segments.keys().next_back().copied();
        let empty: Vec<u64> = segments
            .iter()
            .filter(|(base, s)| Some(**base) != tail_base && s.is_empty())
            .map(|(base, _)| *base)
            .collect();
        for base in empty {
            if let Some(segment) = segments.remove(&base) {
                segment.destroy()?;
            }
        }

        if segments.is_empty() {
            let descriptor = SegmentDescriptor {
                base_index: 1,
                base_term: 0,
                max_entries: options.max_segment_entries,
                max_bytes: options.max_segment_bytes,
            };
            segments.insert(1, Segment::create(&dir, descriptor)?);
        }

        let first = segments.values().next().expect("at least one segment");
        let compacted = LogId::new(first.descriptor().base_term, first.descriptor().base_index - 1);

        let mut last_log_id = compacted;
        for segment in segments.values() {
            if let Some(index) = segment.last_index() {
                let term = segment.term_of(index).expect("indexed entry has a term");
                last_log_id = LogId::new(term, index);
            }
        }

        // All but the tail are immutable.
        let tail_base = *segments.keys().next_back().expect("at least one segment");
        for (base, segment) in segments.iter_mut() {
            if *base != tail_base {
                segment.seal()?;
            }
        }

        tracing::debug!(dir = %dir.display(), last = %last_log_id, first = compacted.index + 1, "opened log");

        Ok(Self {
            dir,
            options,
            inner: RwLock::new(LogInner {
                segments,
                compacted,
                last_log_id,
                commit_index: 0,
            }),
        })
    }

    /// The index of the first entry logically present in the log.
    pub async fn first_index(&self) -> u64 {
        self.inner.read().await.compacted.index + 1
    }

    /// The index of the last entry in the log, 0 if empty.
    pub async fn last_index(&self) -> u64 {
        self.inner.read().await.last_log_id.index
    }

    /// The term of the last entry in the log, 0 if empty.
    pub async fn last_term(&self) -> u64 {
        self.inner.read().await.last_log_id.term
    }

    /// The identity of the last entry in the log.
    pub async fn last_log_id(&self) -> LogId {
        self.inner.read().await.last_log_id
    }

    /// Write the next entry to the log, returning its index.
    ///
    /// The entry's index must be exactly `last_index + 1`; the tail segment is sealed and
    /// replaced when full.
    pub async fn append(&self, entry: &Entry) -> Result<u64, LogError> {
        let mut inner = self.inner.write().await;
        if entry.index != inner.last_log_id.index + 1 {
            return Err(LogError::IndexOutOfBounds { index: entry.index });
        }
        debug_assert!(entry.term >= inner.last_log_id.term, "entry term regressed");

        let frame = segment::encode_frame(entry)?;
        if segment::frame_capacity(frame.len()) > self.options.max_segment_bytes {
            return Err(LogError::IndexOutOfBounds { index: entry.index });
        }

        if inner.tail().would_overflow(frame.len()) && !inner.tail().is_empty() {
            let base_term = inner.last_log_id.term;
            inner.tail().seal()?;
            let descriptor = SegmentDescriptor {
                base_index: entry.index,
                base_term,
                max_entries: self.options.max_segment_entries,
                max_bytes: self.options.max_segment_bytes,
            };
            let segment = Segment::create(&self.dir, descriptor)?;
            inner.segments.insert(entry.index, segment);
        }

        inner.tail().append(entry, &frame)?;
        inner.last_log_id = entry.log_id();
        Ok(entry.index)
    }

    /// Read the entry at `index`, `None` when it lies outside `[first_index, last_index]`.
    pub async fn get(&self, index: u64) -> Result<Option<Entry>, LogError> {
        let inner = self.inner.read().await;
        if index <= inner.compacted.index || index > inner.last_log_id.index {
            return Ok(None);
        }
        match inner.segment_for(index) {
            Some(segment) => segment.read(index),
            None => Ok(None),
        }
    }

    /// Read the entries in `[start, stop)`, clamped to the log's bounds.
    pub async fn entries(&self, start: u64, stop: u64) -> Result<Vec<Entry>, LogError> {
        let inner = self.inner.read().await;
        let start = start.max(inner.compacted.index + 1);
        let stop = stop.min(inner.last_log_id.index + 1);
        let mut out = Vec::with_capacity(stop.saturating_sub(start) as usize);
        for index in start..stop {
            match inner.segment_for(index).and_then(|s| s.read(index).transpose()) {
                Some(entry) => out.push(entry?),
                None => break,
            }
        }
        Ok(out)
    }

    /// The term of the entry at `index`, answered from the in-memory index.
    ///
    /// The compaction boundary itself answers with the compacted term, so consistency
    /// checks keep working at `first_index - 1`.
    pub async fn term_at(&self, index: u64) -> Option<u64> {
        self.inner.read().await.term_at(index)
    }

    /// Record the cluster commit index, making the prefix immutable.
    pub async fn commit(&self, index: u64) {
        let mut inner = self.inner.write().await;
        if index > inner.commit_index {
            inner.commit_index = index;
        }
    }

    /// Remove all entries with index `> index`.
    ///
    /// Fails with `TruncateCommitted` when asked to remove committed entries.
    pub async fn truncate(&self, index: u64) -> Result<(), LogError> {
        let mut inner = self.inner.write().await;
        if index < inner.commit_index {
            return Err(LogError::TruncateCommitted {
                index,
                commit_index: inner.commit_index,
            });
        }
        if index >= inner.last_log_id.index {
            return Ok(());
        }

        let doomed: Vec<u64> = inner.segments.range(index + 1..).map(|(base, _)| *base).collect();
        for base in doomed {
            if let Some(segment) = inner.segments.remove(&base) {
                segment.destroy()?;
            }
        }
        if inner.segments.is_empty() {
            let descriptor = SegmentDescriptor {
                base_index: inner.compacted.index + 1,
                base_term: inner.compacted.term,
                max_entries: self.options.max_segment_entries,
                max_bytes: self.options.max_segment_bytes,
            };
            let segment = Segment::create(&self.dir, descriptor)?;
            inner.segments.insert(descriptor_base(&segment), segment);
        } else {
            let tail = inner.tail();
            tail.truncate_from(index + 1)?;
            tail.unseal();
        }

        inner.last_log_id = match inner.term_at(index) {
            Some(term) => LogId::new(term, index),
            None => inner.compacted,
        };
        Ok(())
    }

    /// Raise `first_index` to `index + 1`, discarding older entries.
    ///
    /// Called only once the state machine has applied through `index` and a snapshot
    /// covering it exists. Whole sealed segments behind the boundary are deleted.
    pub async fn compact(&self, index: u64) -> Result<(), LogError> {
        let mut inner = self.inner.write().await;
        if index <= inner.compacted.index {
            return Ok(());
        }
        let term = match inner.term_at(index) {
            Some(term) => term,
            None => return Err(LogError::IndexOutOfBounds { index }),
        };
        inner.compacted = LogId::new(term, index);
        inner.prune_compacted_segments()?;
        tracing::debug!(first_index = index + 1, "compacted log");
        Ok(())
    }

    /// Discard the entire log and restart it immediately after `log_id`.
    ///
    /// Used when a snapshot is installed whose boundary lies beyond the local log.
    pub async fn reset(&self, log_id: LogId) -> Result<(), LogError> {
        let mut inner = self.inner.write().await;
        let bases: Vec<u64> = inner.segments.keys().copied().collect();
        for base in bases {
            if let Some(segment) = inner.segments.remove(&base) {
                segment.destroy()?;
            }
        }
        let descriptor = SegmentDescriptor {
            base_index: log_id.index + 1,
            base_term: log_id.term,
            max_entries: self.options.max_segment_entries,
            max_bytes: self.options.max_segment_bytes,
        };
        let segment = Segment::create(&self.dir, descriptor)?;
        inner.segments.insert(log_id.index + 1, segment);
        inner.compacted = log_id;
        inner.last_log_id = log_id;
        if log_id.index > inner.commit_index {
            inner.commit_index = log_id.index;
        }
        tracing::debug!(boundary = %log_id, "reset log");
        Ok(())
    }

    /// Re-establish the compaction boundary from a snapshot discovered at startup.
    pub async fn restore_compaction(&self, log_id: LogId) -> Result<(), LogError> {
        let needs_reset = {
            let inner = self.inner.read().await;
            if log_id.index <= inner.compacted.index {
                return Ok(());
            }
            log_id.index > inner.last_log_id.index
        };
        if needs_reset {
            return self.reset(log_id).await;
        }
        let mut inner = self.inner.write().await;
        inner.compacted = log_id;
        inner.prune_compacted_segments()?;
        Ok(())
    }

    /// Guarantee all prior appends are durable on return.
    pub async fn flush(&self) -> Result<(), LogError> {
        let inner = self.inner.read().await;
        for segment in inner.segments.values() {
            segment.sync()?;
        }
        Ok(())
    }

    /// Find the most recent membership configuration recorded in the log, searching from
    /// the tail backwards.
    pub async fn latest_configuration(&self) -> Result<Option<Configuration>, LogError> {
        let inner = self.inner.read().await;
        let first = inner.compacted.index + 1;
        let mut index = inner.last_log_id.index;
        while index >= first && index > 0 {
            let entry = match inner.segment_for(index).and_then(|s| s.read(index).transpose()) {
                Some(entry) => entry?,
                None => break,
            };
            if let EntryPayload::Configuration { members } = entry.payload {
                return Ok(Some(Configuration {
                    index: entry.index,
                    term: entry.term,
                    timestamp: entry.timestamp,
                    members,
                }));
            }
            index -= 1;
        }
        Ok(None)
    }
}

fn descriptor_base(segment: &Segment) -> u64 {
    segment.descriptor().base_index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryPayload;

    fn entry(index: u64, term: u64) -> Entry {
        Entry {
            index,
            term,
            timestamp: 0,
            payload: EntryPayload::Command {
                session: 1,
                sequence: index,
                operation: format!("op-{}", index).into_bytes(),
            },
        }
    }

    fn small_options() -> LogOptions {
        LogOptions {
            max_segment_entries: 4,
            max_segment_bytes: 64 * 1024,
        }
    }

    #[tokio::test]
    async fn append_get_and_reopen_across_segments() -> Result<(), LogError> {
        let dir = tempfile::tempdir()?;
        {
            let log = Log::open(dir.path(), small_options()).await?;
            for i in 1..=10 {
                log.append(&entry(i, 1)).await?;
            }
            log.flush().await?;
            assert_eq!(log.first_index().await, 1);
            assert_eq!(log.last_index().await, 10);
            assert_eq!(log.get(7).await?.unwrap().index, 7);
            assert!(log.get(11).await?.is_none());
        }
        // Reopen: ten entries across three segments survive.
        let log = Log::open(dir.path(), small_options()).await?;
        assert_eq!(log.last_index().await, 10);
        assert_eq!(log.term_at(10).await, Some(1));
        assert_eq!(log.get(1).await?.unwrap().index, 1);
        Ok(())
    }

    #[tokio::test]
    async fn append_rejects_discontiguous_index() -> Result<(), LogError> {
        let dir = tempfile::tempdir()?;
        let log = Log::open(dir.path(), small_options()).await?;
        log.append(&entry(1, 1)).await?;
        let err = log.append(&entry(3, 1)).await.unwrap_err();
        assert!(matches!(err, LogError::IndexOutOfBounds { index: 3 }));
        Ok(())
    }

    #[tokio::test]
    async fn truncate_refuses_to_cross_commit_index() -> Result<(), LogError> {
        let dir = tempfile::tempdir()?;
        let log = Log::open(dir.path(), small_options()).await?;
        for i in 1..=6 {
            log.append(&entry(i, 1)).await?;
        }
        log.commit(4).await;
        let err = log.truncate(3).await.unwrap_err();
        assert!(matches!(err, LogError::TruncateCommitted { index: 3, commit_index: 4 }));

        log.truncate(4).await?;
        assert_eq!(log.last_index().await, 4);
        assert!(log.get(5).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn truncate_survives_reopen() -> Result<(), LogError> {
        let dir = tempfile::tempdir()?;
        {
            let log = Log::open(dir.path(), small_options()).await?;
            for i in 1..=9 {
                log.append(&entry(i, 1)).await?;
            }
            log.truncate(5).await?;
            // The log stays writable at the truncation point.
            log.append(&entry(6, 2)).await?;
            log.flush().await?;
        }
        let log = Log::open(dir.path(), small_options()).await?;
        assert_eq!(log.last_index().await, 6);
        assert_eq!(log.term_at(6).await, Some(2));
        assert_eq!(log.term_at(5).await, Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn compact_raises_first_index_and_keeps_boundary_term() -> Result<(), LogError> {
        let dir = tempfile::tempdir()?;
        let log = Log::open(dir.path(), small_options()).await?;
        for i in 1..=10 {
            log.append(&entry(i, 1)).await?;
        }
        log.commit(10).await;
        log.compact(8).await?;

        assert_eq!(log.first_index().await, 9);
        assert!(log.get(8).await?.is_none());
        assert_eq!(log.term_at(8).await, Some(1));
        assert_eq!(log.get(9).await?.unwrap().index, 9);
        Ok(())
    }

    #[tokio::test]
    async fn reset_restarts_the_log_beyond_a_snapshot() -> Result<(), LogError> {
        let dir = tempfile::tempdir()?;
        let log = Log::open(dir.path(), small_options()).await?;
        for i in 1..=3 {
            log.append(&entry(i, 1)).await?;
        }
        log.reset(LogId::new(4, 100)).await?;
        assert_eq!(log.first_index().await, 101);
        assert_eq!(log.last_index().await, 100);
        assert_eq!(log.term_at(100).await, Some(4));
        log.append(&entry(101, 5)).await?;
        assert_eq!(log.last_index().await, 101);
        Ok(())
    }

    #[tokio::test]
    async fn torn_tail_is_discarded_on_open() -> Result<(), LogError> {
        use std::io::Write;

        let dir = tempfile::tempdir()?;
        {
            let log = Log::open(dir.path(), small_options()).await?;
            for i in 1..=3 {
                log.append(&entry(i, 1)).await?;
            }
            log.flush().await?;
        }
        // Simulate a crash mid-append: garbage after the last full frame.
        let path = dir.path().join(Segment::file_name(1));
        let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
        file.write_all(&[0xde, 0xad, 0xbe, 0xef, 0x01])?;
        drop(file);

        let log = Log::open(dir.path(), small_options()).await?;
        assert_eq!(log.last_index().await, 3);
        assert_eq!(log.get(3).await?.unwrap().index, 3);
        // And the log accepts appends again.
        log.append(&entry(4, 1)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn latest_configuration_is_found_from_the_tail() -> Result<(), LogError> {
        use crate::entry::Member;
        use crate::entry::MemberType;

        let dir = tempfile::tempdir()?;
        let log = Log::open(dir.path(), small_options()).await?;
        log.append(&entry(1, 1)).await?;
        log.append(&Entry {
            index: 2,
            term: 1,
            timestamp: 7,
            payload: EntryPayload::Configuration {
                members: vec![Member::new(1, "s1", MemberType::Active)],
            },
        })
        .await?;
        log.append(&entry(3, 1)).await?;

        let cfg = log.latest_configuration().await?.unwrap();
        assert_eq!(cfg.index, 2);
        assert_eq!(cfg.members.len(), 1);
        Ok(())
    }
}
