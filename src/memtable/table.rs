//! MemTable implementation
//!
//! BTreeMap-based memtable with RwLock for concurrency.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{MemTableEntry, MemTableIterator};
use crate::key::{
    encode_internal_key, InternalKeyComparator, LookupKey, ParsedInternalKey, RecordKind,
    SequenceNumber,
};

/// Bookkeeping cost charged per entry on top of key and value bytes
const ENTRY_OVERHEAD: usize = 16;

/// Map key: an encoded internal key ordered by the engine comparator
#[derive(Clone)]
pub(crate) struct MemKey {
    pub(crate) encoded: Vec<u8>,
    cmp: InternalKeyComparator,
}

impl MemKey {
    pub(crate) fn new(encoded: Vec<u8>, cmp: &InternalKeyComparator) -> Self {
        Self {
            encoded,
            cmp: cmp.clone(),
        }
    }
}

impl PartialEq for MemKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MemKey {}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp.compare(&self.encoded, &other.encoded)
    }
}

/// In-memory table for recent writes
///
/// ## Concurrency:
/// - `data`: RwLock (many concurrent readers, one writer at a time)
/// - `size` / `entry_count`: atomics, readable without the lock
pub struct MemTable {
    cmp: InternalKeyComparator,
    pub(crate) data: RwLock<BTreeMap<MemKey, Vec<u8>>>,
    size: AtomicUsize,
    entry_count: AtomicUsize,
}

impl MemTable {
    /// Create a new empty MemTable
    pub fn new(cmp: InternalKeyComparator) -> Self {
        Self {
            cmp,
            data: RwLock::new(BTreeMap::new()),
            size: AtomicUsize::new(0),
            entry_count: AtomicUsize::new(0),
        }
    }

    /// Insert one version of a key.
    ///
    /// Sequence numbers are unique, so an insert never replaces an entry.
    pub fn put(&self, seq: SequenceNumber, kind: RecordKind, key: &[u8], value: &[u8]) {
        let encoded = encode_internal_key(key, seq, kind);
        let charge = encoded.len() + value.len() + ENTRY_OVERHEAD;

        self.data
            .write()
            .insert(MemKey::new(encoded, &self.cmp), value.to_vec());

        self.size.fetch_add(charge, AtomicOrdering::Relaxed);
        self.entry_count.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Find the newest entry for the lookup key's user key with a sequence at
    /// or below the lookup sequence.
    ///
    /// Returns `None` when this table holds no visible version of the key.
    pub fn get(&self, lookup: &LookupKey) -> Option<MemTableEntry> {
        let probe = MemKey::new(lookup.internal_key().to_vec(), &self.cmp);
        let data = self.data.read();
        let (found, value) = data.range(probe..).next()?;

        // Keys in the map were encoded by `put`, so they always parse.
        let parsed = ParsedInternalKey::parse(&found.encoded).ok()?;
        if self.cmp.compare_user(parsed.user_key, lookup.user_key()) != Ordering::Equal {
            return None;
        }

        Some(match parsed.kind {
            RecordKind::Value => MemTableEntry::Value(value.clone()),
            RecordKind::Delete => MemTableEntry::Tombstone,
        })
    }

    /// Bidirectional iterator that keeps this table alive
    pub fn iter(self: &Arc<Self>) -> MemTableIterator {
        MemTableIterator::new(Arc::clone(self))
    }

    /// Approximate memory usage in bytes
    pub fn approx_size(&self) -> usize {
        self.size.load(AtomicOrdering::Relaxed)
    }

    /// Number of stored versions (puts and tombstones)
    pub fn entry_count(&self) -> usize {
        self.entry_count.load(AtomicOrdering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    pub fn comparator(&self) -> &InternalKeyComparator {
        &self.cmp
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("entries", &self.entry_count())
            .field("size", &self.approx_size())
            .finish()
    }
}
