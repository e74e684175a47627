//! WAL Writer
//!
//! Appends framed records to a journal file.
//!
//! Two layers of buffering:
//!   BufWriter.flush()  → Rust buffer → OS page cache
//!   file.sync_data()   → OS page cache → physical disk

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::record::encode_record;
use crate::error::Result;

/// Writes records to one journal file
pub struct WalWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    offset: u64,
}

impl WalWriter {
    /// Create a new, empty journal file (truncating any existing file)
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            offset: 0,
        })
    }

    /// Append one record and hand it to the OS.
    ///
    /// Returns the end offset of the record; the record is durable at that
    /// offset once `sync()` returns.
    pub fn append(&mut self, payload: &[u8]) -> Result<u64> {
        let framed = encode_record(payload);
        self.writer.write_all(&framed)?;
        self.writer.flush()?;
        self.offset += framed.len() as u64;
        Ok(self.offset)
    }

    /// Hand buffered bytes to the OS without waiting for the disk
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Force everything written so far to stable storage
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Bytes written so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for WalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalWriter")
            .field("path", &self.path)
            .field("offset", &self.offset)
            .finish()
    }
}
