//! A single on-disk log segment.

use std::convert::TryInto;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::path::PathBuf;

use crate::entry::Entry;
use crate::log::LogError;

/// Compute the CRC32 checksum of a payload.
fn crc32(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Magic bytes identifying a segment file: "CLOG".
const SEGMENT_MAGIC: u32 = 0x434C_4F47;
/// Size of the segment file header in bytes.
const SEGMENT_HEADER_SIZE: u64 = 20;
/// Size of a single entry frame header (`[len: u32][crc: u32]`) in bytes.
const FRAME_HEADER_SIZE: u64 = 8;

/// Static properties of a segment.
#[derive(Clone, Debug)]
pub(crate) struct SegmentDescriptor {
    /// The index of the first entry this segment may hold.
    pub base_index: u64,
    /// The term of the entry immediately preceding `base_index`.
    pub base_term: u64,
    /// The maximum number of entries this segment may hold before it is sealed.
    pub max_entries: u64,
    /// The maximum file size this segment may grow to before it is sealed.
    pub max_bytes: u64,
}

/// The in-memory index record of a single stored entry.
struct Slot {
    /// Byte offset of the entry frame within the file.
    offset: u64,
    /// Payload length in bytes, excluding the frame header.
    len: u32,
    /// The entry's term, kept in memory for consistency checks without disk reads.
    term: u64,
}

/// A contiguous range of entries backed by one file region.
///
/// Entries are stored as `[len: u32][crc: u32][bincode payload]` frames after a fixed
/// header of `[magic: u32][base_index: u64][base_term: u64]`, all little-endian. A sealed
/// segment is immutable; only the tail segment of a log accepts appends.
pub(crate) struct Segment {
    descriptor: SegmentDescriptor,
    path: PathBuf,
    file: File,
    slots: Vec<Slot>,
    /// Total bytes written, header included.
    size: u64,
    sealed: bool,
}

impl Segment {
    /// The file name for a segment based at the given index.
    pub fn file_name(base_index: u64) -> String {
        format!("{:020}.log", base_index)
    }

    /// Create a new, empty segment file.
    pub fn create(dir: &Path, descriptor: SegmentDescriptor) -> Result<Self, LogError> {
        let path = dir.join(Self::file_name(descriptor.base_index));
        let mut file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;
        let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&SEGMENT_MAGIC.to_le_bytes());
        header[4..12].copy_from_slice(&descriptor.base_index.to_le_bytes());
        header[12..20].copy_from_slice(&descriptor.base_term.to_le_bytes());
        file.write_all(&header)?;
        file.sync_data()?;
        Ok(Self {
            descriptor,
            path,
            file,
            slots: Vec::new(),
            size: SEGMENT_HEADER_SIZE,
            sealed: false,
        })
    }

    /// Open an existing segment file, rebuilding the in-memory entry index.
    ///
    /// A torn or corrupt tail frame — short header, failed checksum, failed decode or an
    /// index discontinuity — truncates the file at that frame; everything before it is kept.
    /// `fallback_base_term` recovers the header of a file which crashed mid-create.
    pub fn open(
        path: PathBuf,
        base_index: u64,
        fallback_base_term: u64,
        max_entries: u64,
        max_bytes: u64,
    ) -> Result<Self, LogError> {
        let data = std::fs::read(&path)?;
        if data.len() < SEGMENT_HEADER_SIZE as usize {
            // Crash before the header hit disk. Recreate the segment in place.
            let descriptor = SegmentDescriptor {
                base_index,
                base_term: fallback_base_term,
                max_entries,
                max_bytes,
            };
            let dir = path.parent().map(|p| p.to_path_buf()).unwrap_or_default();
            return Self::create(&dir, descriptor);
        }

        let magic = u32::from_le_bytes(data[0..4].try_into().expect("sliced 4 bytes"));
        if magic != SEGMENT_MAGIC {
            return Err(LogError::Corrupt {
                path: path.display().to_string(),
                reason: "bad segment magic".into(),
            });
        }
        let header_base = u64::from_le_bytes(data[4..12].try_into().expect("sliced 8 bytes"));
        if header_base != base_index {
            return Err(LogError::Corrupt {
                path: path.display().to_string(),
                reason: format!("segment header base {} does not match file name base {}", header_base, base_index),
            });
        }
        let base_term = u64::from_le_bytes(data[12..20].try_into().expect("sliced 8 bytes"));

        let mut slots = Vec::new();
        let mut pos = SEGMENT_HEADER_SIZE as usize;
        let mut next_index = base_index;
        loop {
            if pos + FRAME_HEADER_SIZE as usize > data.len() {
                break;
            }
            let len = u32::from_le_bytes(data[pos..pos + 4].try_into().expect("sliced 4 bytes")) as usize;
            let crc = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().expect("sliced 4 bytes"));
            let payload_start = pos + FRAME_HEADER_SIZE as usize;
            if payload_start + len > data.len() {
                break;
            }
            let payload = &data[payload_start..payload_start + len];
            if crc32(payload) != crc {
                break;
            }
            let entry: Entry = match bincode::deserialize(payload) {
                Ok(entry) => entry,
                Err(_) => break,
            };
            if entry.index != next_index {
                break;
            }
            slots.push(Slot {
                offset: pos as u64,
                len: len as u32,
                term: entry.term,
            });
            next_index += 1;
            pos = payload_start + len;
        }

        if pos < data.len() {
            tracing::warn!(
                path = %path.display(),
                discarded = data.len() - pos,
                "discarding torn tail of log segment"
            );
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.set_len(pos as u64)?;
        file.sync_data()?;
        Ok(Self {
            descriptor: SegmentDescriptor {
                base_index,
                base_term,
                max_entries,
                max_bytes,
            },
            path,
            file,
            slots,
            size: pos as u64,
            sealed: false,
        })
    }

    pub fn descriptor(&self) -> &SegmentDescriptor {
        &self.descriptor
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The index of the last entry in this segment, if any.
    pub fn last_index(&self) -> Option<u64> {
        if self.slots.is_empty() {
            None
        } else {
            Some(self.descriptor.base_index + self.slots.len() as u64 - 1)
        }
    }

    /// The term of the entry at `index`, without touching disk.
    pub fn term_of(&self, index: u64) -> Option<u64> {
        self.slot(index).map(|s| s.term)
    }

    /// Whether appending a frame of the given size would exceed this segment's limits.
    pub fn would_overflow(&self, frame_len: usize) -> bool {
        self.slots.len() as u64 >= self.descriptor.max_entries
            || self.size + frame_len as u64 > self.descriptor.max_bytes
    }

    /// Append a pre-encoded entry frame.
    ///
    /// The caller is responsible for index continuity and for rolling to a new segment
    /// when this one is full.
    pub fn append(&mut self, entry: &Entry, frame: &[u8]) -> Result<(), LogError> {
        debug_assert!(!self.sealed, "appended to a sealed segment");
        debug_assert_eq!(
            entry.index,
            self.descriptor.base_index + self.slots.len() as u64,
            "segment append out of order"
        );
        self.file.seek(SeekFrom::Start(self.size))?;
        self.file.write_all(frame)?;
        self.slots.push(Slot {
            offset: self.size,
            len: (frame.len() as u64 - FRAME_HEADER_SIZE) as u32,
            term: entry.term,
        });
        self.size += frame.len() as u64;
        Ok(())
    }

    /// Read the entry at the given index.
    pub fn read(&self, index: u64) -> Result<Option<Entry>, LogError> {
        let slot = match self.slot(index) {
            Some(slot) => slot,
            None => return Ok(None),
        };
        let mut buf = vec![0u8; slot.len as usize + FRAME_HEADER_SIZE as usize];
        self.file.read_exact_at(&mut buf, slot.offset)?;
        let crc = u32::from_le_bytes(buf[4..8].try_into().expect("sliced 4 bytes"));
        let payload = &buf[FRAME_HEADER_SIZE as usize..];
        if crc32(payload) != crc {
            return Err(LogError::Corrupt {
                path: self.path.display().to_string(),
                reason: format!("checksum mismatch at index {}", index),
            });
        }
        Ok(Some(bincode::deserialize(payload)?))
    }

    /// Remove all entries with index `>= index`, shrinking the file.
    pub fn truncate_from(&mut self, index: u64) -> Result<(), LogError> {
        if index <= self.descriptor.base_index {
            self.slots.clear();
            self.size = SEGMENT_HEADER_SIZE;
        } else {
            let keep = (index - self.descriptor.base_index) as usize;
            if keep >= self.slots.len() {
                return Ok(());
            }
            self.size = self.slots[keep].offset;
            self.slots.truncate(keep);
        }
        self.file.set_len(self.size)?;
        self.file.sync_data()?;
        self.sealed = false;
        Ok(())
    }

    /// Make this segment immutable.
    pub fn seal(&mut self) -> Result<(), LogError> {
        self.sync()?;
        self.sealed = true;
        Ok(())
    }

    /// Reopen this segment for appends after a truncation made it the tail again.
    pub fn unseal(&mut self) {
        self.sealed = false;
    }

    /// Fsync any buffered writes.
    pub fn sync(&self) -> Result<(), LogError> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Delete the backing file.
    pub fn destroy(self) -> Result<(), LogError> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    fn slot(&self, index: u64) -> Option<&Slot> {
        if index < self.descriptor.base_index {
            return None;
        }
        self.slots.get((index - self.descriptor.base_index) as usize)
    }
}

/// Encode an entry into its on-disk frame.
pub(crate) fn encode_frame(entry: &Entry) -> Result<Vec<u8>, LogError> {
    let payload = bincode::serialize(entry)?;
    let mut frame = Vec::with_capacity(payload.len() + FRAME_HEADER_SIZE as usize);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// The smallest segment size able to hold a frame of the given length.
pub(crate) fn frame_capacity(frame_len: usize) -> u64 {
    SEGMENT_HEADER_SIZE + frame_len as u64
}
