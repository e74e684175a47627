//! Version edits
//!
//! A `VersionEdit` is the delta between two versions. Edits are bincode
//! encoded and appended to the manifest, one journal-framed record each.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::key::SequenceNumber;

/// A table file added by an edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFile {
    pub number: u64,
    pub file_size: u64,
    /// Smallest internal key
    pub smallest: Vec<u8>,
    /// Largest internal key
    pub largest: Vec<u8>,
}

/// Delta applied to a version to produce the next one
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEdit {
    /// Name of the user comparator the database was created with
    pub comparator: Option<String>,
    /// Journals numbered below this are no longer needed
    pub log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<SequenceNumber>,
    /// `(level, internal key)` where the next compaction of that level starts
    pub compact_pointers: Vec<(usize, Vec<u8>)>,
    /// `(level, file number)`
    pub deleted_files: BTreeSet<(usize, u64)>,
    /// `(level, file)`
    pub new_files: Vec<(usize, NewFile)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator = Some(name.to_string());
    }

    pub fn set_log_number(&mut self, number: u64) {
        self.log_number = Some(number);
    }

    pub fn set_next_file_number(&mut self, number: u64) {
        self.next_file_number = Some(number);
    }

    pub fn set_last_sequence(&mut self, seq: SequenceNumber) {
        self.last_sequence = Some(seq);
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: Vec<u8>) {
        self.compact_pointers.push((level, key));
    }

    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        file_size: u64,
        smallest: Vec<u8>,
        largest: Vec<u8>,
    ) {
        self.new_files.push((
            level,
            NewFile {
                number,
                file_size,
                smallest,
                largest,
            },
        ));
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.insert((level, number));
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}
