//! SSTable Reader
//!
//! Opens SSTable files and provides O(log n) lookups via an in-memory index.
//! The whole file is checksummed on open, so a reader never serves data from a
//! damaged table.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, StrataError};
use crate::key::{InternalKeyComparator, LookupKey, ParsedInternalKey, RecordKind};

use super::iterator::SSTableIterator;
use super::{TableEntry, ENTRY_HEADER_SIZE, FOOTER_SIZE, HEADER_SIZE, MAGIC, VERSION};

/// Reader for SSTable files with an in-memory index
pub struct SSTableReader {
    path: PathBuf,
    /// File handle for reading values; seek + read happen under the lock
    file: Mutex<File>,
    /// In-memory index: internal key → file offset, in key order
    index: Vec<(Vec<u8>, u64)>,
    /// Index block starting offset (end of the data block)
    index_offset: u64,
    file_size: u64,
    cmp: InternalKeyComparator,
}

fn corruption(path: &Path, what: impl std::fmt::Display) -> StrataError {
    StrataError::Corruption(format!("{}: {}", path.display(), what))
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

impl SSTableReader {
    /// Open an SSTable for reading
    ///
    /// Validates header, footer and both checksums, then loads the index.
    pub fn open(path: &Path, cmp: InternalKeyComparator) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < HEADER_SIZE + FOOTER_SIZE {
            return Err(corruption(path, format!("file too small: {} bytes", file_size)));
        }

        // Header
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        if &header[0..4] != MAGIC {
            return Err(corruption(path, format!("invalid magic {:?}", &header[0..4])));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != VERSION {
            return Err(corruption(path, format!("unsupported version {}", version)));
        }
        let entry_count = le_u64(&header[6..14]);

        // Footer
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact(&mut footer)?;
        let index_offset = le_u64(&footer[0..8]);
        let data_crc = le_u32(&footer[8..12]);
        let index_crc = le_u32(&footer[12..16]);
        if index_offset < HEADER_SIZE || index_offset > file_size - FOOTER_SIZE {
            return Err(corruption(path, format!("index offset {} out of range", index_offset)));
        }

        // Data checksum, streamed
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut hasher = crc32fast::Hasher::new();
        let mut data = BufReader::new((&mut file).take(index_offset - HEADER_SIZE));
        let mut chunk = [0u8; 64 * 1024];
        loop {
            let n = data.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            hasher.update(&chunk[..n]);
        }
        drop(data);
        if hasher.finalize() != data_crc {
            return Err(corruption(path, "data checksum mismatch"));
        }

        // Index block
        let index_block_size = file_size - FOOTER_SIZE - index_offset;
        let mut index_data = vec![0u8; index_block_size as usize];
        file.seek(SeekFrom::Start(index_offset))?;
        file.read_exact(&mut index_data)?;
        if crc32fast::hash(&index_data) != index_crc {
            return Err(corruption(path, "index checksum mismatch"));
        }

        let mut index = Vec::with_capacity(entry_count as usize);
        let mut pos = 0;
        while pos < index_data.len() {
            if pos + 12 > index_data.len() {
                return Err(corruption(path, "truncated index entry"));
            }
            let key_len = le_u32(&index_data[pos..]) as usize;
            let offset = le_u64(&index_data[pos + 4..]);
            pos += 12;
            if pos + key_len > index_data.len() {
                return Err(corruption(path, "index key exceeds block"));
            }
            let key = index_data[pos..pos + key_len].to_vec();
            ParsedInternalKey::parse(&key)?;
            pos += key_len;
            index.push((key, offset));
        }
        if index.len() as u64 != entry_count {
            return Err(corruption(
                path,
                format!("index has {} entries, header says {}", index.len(), entry_count),
            ));
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            index,
            index_offset,
            file_size,
            cmp,
        })
    }

    /// Position of the first entry with key >= target (== len when none)
    pub fn find(&self, target: &[u8]) -> usize {
        self.index
            .partition_point(|(key, _)| self.cmp.compare(key, target) == Ordering::Less)
    }

    /// Internal key at `pos`
    pub fn key_at(&self, pos: usize) -> &[u8] {
        &self.index[pos].0
    }

    /// Read the value stored at index position `pos`
    pub fn value_at(&self, pos: usize) -> Result<Vec<u8>> {
        let (key, offset) = &self.index[pos];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(*offset))?;

        let mut header = [0u8; ENTRY_HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        let key_len = le_u32(&header[0..4]) as usize;
        let val_len = le_u32(&header[4..8]) as usize;
        if key_len != key.len() {
            return Err(corruption(&self.path, format!("entry at {} disagrees with index", offset)));
        }

        file.seek(SeekFrom::Current(key_len as i64))?;
        let mut value = vec![0u8; val_len];
        file.read_exact(&mut value)?;
        Ok(value)
    }

    /// Newest entry for the lookup key's user key visible at its sequence.
    ///
    /// Returns `Ok(None)` when this table holds no visible version; a
    /// tombstone comes back as an entry of kind `Delete` with an empty value.
    pub fn get(&self, lookup: &LookupKey) -> Result<Option<TableEntry>> {
        let pos = self.find(lookup.internal_key());
        if pos >= self.index.len() {
            return Ok(None);
        }

        let parsed = ParsedInternalKey::parse(self.key_at(pos))?;
        if self.cmp.compare_user(parsed.user_key, lookup.user_key()) != Ordering::Equal {
            return Ok(None);
        }

        let value = match parsed.kind {
            RecordKind::Value => self.value_at(pos)?,
            RecordKind::Delete => Vec::new(),
        };
        Ok(Some(TableEntry {
            sequence: parsed.sequence,
            kind: parsed.kind,
            value,
        }))
    }

    /// Approximate byte offset in the file where `internal_key` would live
    pub fn approximate_offset_of(&self, internal_key: &[u8]) -> u64 {
        let pos = self.find(internal_key);
        self.index
            .get(pos)
            .map(|(_, offset)| *offset)
            .unwrap_or(self.index_offset)
    }

    /// Bidirectional iterator that keeps this reader alive
    pub fn iter(self: &Arc<Self>) -> SSTableIterator {
        SSTableIterator::new(Arc::clone(self))
    }

    /// Get entry count
    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    /// Smallest internal key in this SSTable
    pub fn smallest(&self) -> Option<&[u8]> {
        self.index.first().map(|(k, _)| k.as_slice())
    }

    /// Largest internal key in this SSTable
    pub fn largest(&self) -> Option<&[u8]> {
        self.index.last().map(|(k, _)| k.as_slice())
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for SSTableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTableReader")
            .field("path", &self.path)
            .field("entries", &self.index.len())
            .field("file_size", &self.file_size)
            .finish()
    }
}
