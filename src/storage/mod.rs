//! Storage Module
//!
//! Persistent storage layer: immutable table files and the cache of their
//! open readers.
//!
//! ## Responsibilities
//! - Persist sorted runs of internal keys to disk
//! - Point lookups and bidirectional scans over one table
//! - Name and classify every file of a data directory
//!
//! See [`sstable`] for the table file layout.

mod filename;
mod manager;
pub mod sstable;

pub use filename::{
    current_file_name, journal_file_name, lock_file_name, manifest_file_name, parse_file_name,
    read_current_file, set_current_file, table_file_name, temp_file_name, FileType,
};
pub use manager::StorageManager;
pub use sstable::{SSTable, SSTableBuilder, SSTableIterator, SSTableReader, TableEntry};
