//! SSTable Builder
//!
//! Writes sorted internal-key entries to a new SSTable file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, StrataError};

use super::{SSTable, ENTRY_HEADER_SIZE, FOOTER_SIZE, HEADER_SIZE, MAGIC, VERSION};

/// Builder for creating new SSTables from sorted entries
pub struct SSTableBuilder {
    /// Output file path
    path: PathBuf,
    /// Buffered writer for performance
    writer: BufWriter<File>,
    /// Number of entries written
    entry_count: u64,
    /// Current write position (for index)
    current_offset: u64,
    /// Index: internal key → file offset of entry
    index: Vec<(Vec<u8>, u64)>,
    /// Bytes the index block will occupy
    index_size: u64,
    /// Running CRC hasher for data section
    data_hasher: crc32fast::Hasher,
}

impl SSTableBuilder {
    /// Create a new SSTable builder
    ///
    /// Writes header immediately; call `add()` in internal key order, then
    /// `finish()` to write index and footer.
    pub fn new(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut writer = BufWriter::new(file);

        // Write header (entry_count placeholder, will be updated in finish)
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&0u64.to_le_bytes())?;

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            entry_count: 0,
            current_offset: HEADER_SIZE,
            index: Vec::new(),
            index_size: 0,
            data_hasher: crc32fast::Hasher::new(),
        })
    }

    /// Add an entry (must be called in internal key order)
    pub fn add(&mut self, internal_key: &[u8], value: &[u8]) -> Result<()> {
        self.index.push((internal_key.to_vec(), self.current_offset));
        self.index_size += 12 + internal_key.len() as u64;

        let key_len_bytes = (internal_key.len() as u32).to_le_bytes();
        let val_len_bytes = (value.len() as u32).to_le_bytes();

        self.writer.write_all(&key_len_bytes)?;
        self.writer.write_all(&val_len_bytes)?;
        self.writer.write_all(internal_key)?;
        self.writer.write_all(value)?;

        self.data_hasher.update(&key_len_bytes);
        self.data_hasher.update(&val_len_bytes);
        self.data_hasher.update(internal_key);
        self.data_hasher.update(value);

        self.current_offset += ENTRY_HEADER_SIZE + internal_key.len() as u64 + value.len() as u64;
        self.entry_count += 1;

        Ok(())
    }

    /// Number of entries added so far
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Size the file would have if finished now
    pub fn file_size(&self) -> u64 {
        self.current_offset + self.index_size + FOOTER_SIZE
    }

    /// Last key added
    pub fn last_key(&self) -> Option<&[u8]> {
        self.index.last().map(|(k, _)| k.as_slice())
    }

    /// Finish building: write index block, footer, fsync, and return metadata
    pub fn finish(mut self) -> Result<SSTable> {
        let index_offset = self.current_offset;

        let mut index_hasher = crc32fast::Hasher::new();
        for (key, offset) in &self.index {
            let key_len = (key.len() as u32).to_le_bytes();
            let offset = offset.to_le_bytes();
            self.writer.write_all(&key_len)?;
            self.writer.write_all(&offset)?;
            self.writer.write_all(key)?;
            index_hasher.update(&key_len);
            index_hasher.update(&offset);
            index_hasher.update(key);
        }

        let data_crc = self.data_hasher.finalize();
        let index_crc = index_hasher.finalize();

        self.writer.write_all(&index_offset.to_le_bytes())?;
        self.writer.write_all(&data_crc.to_le_bytes())?;
        self.writer.write_all(&index_crc.to_le_bytes())?;
        self.writer.flush()?;

        // Seek back and update entry count in header
        let mut file = self.writer.into_inner().map_err(|e| {
            StrataError::Io(std::io::Error::new(
                e.error().kind(),
                format!("failed to flush SSTable: {}", e.error()),
            ))
        })?;
        file.seek(SeekFrom::Start(6))?;
        file.write_all(&self.entry_count.to_le_bytes())?;
        file.sync_all()?;

        let file_size = file.metadata()?.len();
        let smallest = self.index.first().map(|(k, _)| k.clone()).unwrap_or_default();
        let largest = self.index.last().map(|(k, _)| k.clone()).unwrap_or_default();

        Ok(SSTable {
            path: self.path,
            entry_count: self.entry_count,
            smallest,
            largest,
            file_size,
        })
    }

    /// Drop the partially written file
    pub fn abandon(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
