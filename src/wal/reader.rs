//! WAL Reader
//!
//! Loads a journal file into memory and yields record payloads in order.
//!
//! A damaged record at the very end of the file is the signature of a crash
//! in the middle of an append: it ends the log normally. A damaged record
//! followed by more data is interior corruption: fatal in strict mode,
//! skipped in lenient mode.
//!
//! A length field that runs past the end of the file looks exactly like an
//! append cut short, so the reader looks for an intact record further on
//! before accepting it as a torn tail. If one is found the length itself
//! was damaged and the record is treated as interior corruption.

use std::fs;
use std::path::Path;

use bytes::Buf;

use super::record::{record_checksum, RECORD_HEADER_SIZE};
use crate::config::RecoveryMode;
use crate::error::{Result, StrataError};

/// Reads records from a journal file
pub struct WalReader {
    data: Vec<u8>,
    offset: usize,
    mode: RecoveryMode,
    records_corrupted: u64,
    was_truncated: bool,
}

impl WalReader {
    /// Open a journal file for reading
    pub fn open(path: &Path, mode: RecoveryMode) -> Result<Self> {
        let data = fs::read(path)?;
        Ok(Self::from_bytes(data, mode))
    }

    /// Read records from an in-memory image of a journal
    pub fn from_bytes(data: Vec<u8>, mode: RecoveryMode) -> Self {
        Self {
            data,
            offset: 0,
            mode,
            records_corrupted: 0,
            was_truncated: false,
        }
    }

    /// Read the next record payload, or `None` at the end of the log
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let len = self.data.len();
            if self.offset >= len {
                return Ok(None);
            }

            let remaining = len - self.offset;
            if remaining < RECORD_HEADER_SIZE {
                self.truncate_tail();
                return Ok(None);
            }

            let mut header = &self.data[self.offset..self.offset + RECORD_HEADER_SIZE];
            let stored_crc = header.get_u32_le();
            let payload_len = header.get_u32_le() as usize;

            if payload_len > remaining - RECORD_HEADER_SIZE {
                let Some(next) = self.find_intact_record(self.offset + 1) else {
                    self.truncate_tail();
                    return Ok(None);
                };
                match self.mode {
                    RecoveryMode::Strict => {
                        return Err(StrataError::Corruption(format!(
                            "journal record length {} at offset {} overruns the file",
                            payload_len, self.offset
                        )));
                    }
                    RecoveryMode::Lenient => {
                        tracing::warn!(offset = self.offset, resume = next, "Skipping journal record with damaged length");
                        self.records_corrupted += 1;
                        self.offset = next;
                        continue;
                    }
                }
            }

            let start = self.offset + RECORD_HEADER_SIZE;
            let end = start + payload_len;
            let computed = record_checksum(&self.data[self.offset + 4..start], &self.data[start..end]);

            if computed != stored_crc {
                if end == len {
                    self.truncate_tail();
                    return Ok(None);
                }
                match self.mode {
                    RecoveryMode::Strict => {
                        return Err(StrataError::Corruption(format!(
                            "journal checksum mismatch at offset {}",
                            self.offset
                        )));
                    }
                    RecoveryMode::Lenient => {
                        tracing::warn!(offset = self.offset, len = payload_len, "Skipping corrupted journal record");
                        self.records_corrupted += 1;
                        self.offset = end;
                        continue;
                    }
                }
            }

            self.offset = end;
            return Ok(Some(self.data[start..end].to_vec()));
        }
    }

    /// Offset of the first record at or after `from` whose checksum holds
    fn find_intact_record(&self, from: usize) -> Option<usize> {
        let len = self.data.len();
        (from..len.saturating_sub(RECORD_HEADER_SIZE - 1)).find(|&at| {
            let mut header = &self.data[at..at + RECORD_HEADER_SIZE];
            let stored_crc = header.get_u32_le();
            let payload_len = header.get_u32_le() as usize;
            let start = at + RECORD_HEADER_SIZE;
            payload_len <= len - start
                && record_checksum(&self.data[at + 4..start], &self.data[start..start + payload_len]) == stored_crc
        })
    }

    fn truncate_tail(&mut self) {
        tracing::debug!(offset = self.offset, dropped = self.data.len() - self.offset, "Journal ends with a partial record");
        self.offset = self.data.len();
        self.was_truncated = true;
    }

    /// Record a payload that framed correctly but failed to decode
    pub(crate) fn note_corrupted(&mut self) {
        self.records_corrupted += 1;
    }

    pub fn mode(&self) -> RecoveryMode {
        self.mode
    }

    /// Number of interior records skipped (lenient mode only)
    pub fn records_corrupted(&self) -> u64 {
        self.records_corrupted
    }

    /// Whether a partial trailing record was dropped
    pub fn was_truncated(&self) -> bool {
        self.was_truncated
    }
}
