//! MemTable Module
//!
//! In-memory data structure for recent writes.
//!
//! ## Responsibilities
//! - Fast reads and writes in memory
//! - Multi-version storage keyed by internal key
//! - Track size for seal triggers
//! - Ordered, bidirectional iteration for reads and flushes
//!
//! ## Data Structure Choice
//! BTreeMap wrapped in RwLock, ordered by the internal key comparator.
//! Iterators do not hold the lock between steps: each step re-enters the map
//! with a short read lock, so readers never block writers for long.

mod iterator;
mod table;

pub use iterator::MemTableIterator;
pub use table::MemTable;

/// Result of a point lookup in a MemTable
#[derive(Debug, Clone, PartialEq)]
pub enum MemTableEntry {
    /// A live value
    Value(Vec<u8>),

    /// A tombstone (deleted key)
    Tombstone,
}
