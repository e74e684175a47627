//! SSTable Module
//!
//! Sorted String Table - immutable on-disk sorted run of internal keys.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (14 bytes)                                       │
//! │   Magic: "STRT" (4) | Version: u16 (2) | Count: u64 (8) │
//! ├─────────────────────────────────────────────────────────┤
//! │ Data Block (variable)                                   │
//! │   [KeyLen: u32][ValLen: u32][InternalKey][Value]        │
//! │   ... repeated for each entry, in internal key order ...│
//! ├─────────────────────────────────────────────────────────┤
//! │ Index Block (variable)                                  │
//! │   [KeyLen: u32][Offset: u64][InternalKey]               │
//! │   ... repeated for each entry ...                       │
//! ├─────────────────────────────────────────────────────────┤
//! │ Footer (16 bytes)                                       │
//! │   IndexOffset: u64 (8) | DataCRC: u32 (4) | IndexCRC (4)│
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Tombstones are ordinary entries whose internal key carries the `Delete`
//! kind and whose value is empty.

mod builder;
mod iterator;
mod reader;

pub use builder::SSTableBuilder;
pub use iterator::SSTableIterator;
pub use reader::SSTableReader;


use std::path::PathBuf;

use crate::key::{RecordKind, SequenceNumber};

// =============================================================================
// Shared Constants (used by builder, reader, iterator)
// =============================================================================

/// Magic bytes identifying a Strata SSTable file
pub(crate) const MAGIC: &[u8; 4] = b"STRT";

/// Current SSTable format version
pub(crate) const VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + EntryCount (8) = 14 bytes
pub(crate) const HEADER_SIZE: u64 = 14;

/// Footer size: IndexOffset (8) + DataCRC (4) + IndexCRC (4) = 16 bytes
pub(crate) const FOOTER_SIZE: u64 = 16;

/// Per-entry header in the data block: KeyLen (4) + ValLen (4)
pub(crate) const ENTRY_HEADER_SIZE: u64 = 8;

// =============================================================================
// SSTable Metadata
// =============================================================================

/// Summary of a finished SSTable, returned by the builder
#[derive(Debug, Clone)]
pub struct SSTable {
    /// Path to the SSTable file
    pub path: PathBuf,
    /// Number of entries in this SSTable
    pub entry_count: u64,
    /// Smallest internal key
    pub smallest: Vec<u8>,
    /// Largest internal key
    pub largest: Vec<u8>,
    /// File size in bytes
    pub file_size: u64,
}

impl SSTable {
    /// Get the number of entries
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }
}

/// Entry found by a point lookup in one table
#[derive(Debug, Clone, PartialEq)]
pub struct TableEntry {
    pub sequence: SequenceNumber,
    pub kind: RecordKind,
    pub value: Vec<u8>,
}
