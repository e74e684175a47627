//! Storage Manager
//!
//! Owns the table files of one data directory and caches their open readers.
//!
//! ## Responsibilities
//! - Create new table files for flush and compaction output
//! - Open readers on demand and keep at most `max_open_files` of them
//! - Evict readers of deleted files
//!
//! ## Concurrency:
//! - `cache`: Protected by Mutex, held only for map bookkeeping
//! - Readers are opened outside the lock; a racing open of the same file
//!   keeps whichever reader was inserted first
//! - All methods use `&self` (no exclusive access needed)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::key::{InternalKeyComparator, LookupKey};

use super::filename::table_file_name;
use super::{SSTableBuilder, SSTableIterator, SSTableReader, TableEntry};

struct CachedTable {
    reader: Arc<SSTableReader>,
    last_used: u64,
}

struct TableCache {
    tables: HashMap<u64, CachedTable>,
    tick: u64,
}

/// Manages table files and their reader cache
pub struct StorageManager {
    /// Directory where table files are stored
    data_dir: PathBuf,

    cmp: InternalKeyComparator,

    /// Maximum number of cached readers
    capacity: usize,

    cache: Mutex<TableCache>,
}

impl StorageManager {
    pub fn new(data_dir: &Path, cmp: InternalKeyComparator, max_open_files: usize) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            cmp,
            capacity: max_open_files.max(1),
            cache: Mutex::new(TableCache {
                tables: HashMap::new(),
                tick: 0,
            }),
        }
    }

    /// Start writing table file `number`
    pub fn create_table(&self, number: u64) -> Result<SSTableBuilder> {
        SSTableBuilder::new(&self.table_path(number))
    }

    /// Reader for table file `number`, opening it if not cached
    pub fn open_table(&self, number: u64) -> Result<Arc<SSTableReader>> {
        {
            let mut cache = self.cache.lock();
            cache.tick += 1;
            let tick = cache.tick;
            if let Some(entry) = cache.tables.get_mut(&number) {
                entry.last_used = tick;
                return Ok(Arc::clone(&entry.reader));
            }
        }

        let reader = Arc::new(SSTableReader::open(&self.table_path(number), self.cmp.clone())?);
        tracing::trace!(file = number, "opened table reader");

        let mut cache = self.cache.lock();
        cache.tick += 1;
        let tick = cache.tick;
        let reader = Arc::clone(
            &cache
                .tables
                .entry(number)
                .or_insert(CachedTable {
                    reader,
                    last_used: tick,
                })
                .reader,
        );

        while cache.tables.len() > self.capacity {
            let oldest = cache
                .tables
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(number, _)| *number);
            match oldest {
                Some(victim) => {
                    cache.tables.remove(&victim);
                }
                None => break,
            }
        }

        Ok(reader)
    }

    /// Point lookup in table file `number`
    pub fn get(&self, number: u64, lookup: &LookupKey) -> Result<Option<TableEntry>> {
        self.open_table(number)?.get(lookup)
    }

    /// Iterator over table file `number`
    pub fn iter(&self, number: u64) -> Result<SSTableIterator> {
        Ok(self.open_table(number)?.iter())
    }

    /// Approximate offset of `internal_key` within table file `number`
    pub fn approximate_offset_of(&self, number: u64, internal_key: &[u8]) -> Result<u64> {
        Ok(self.open_table(number)?.approximate_offset_of(internal_key))
    }

    /// Drop the cached reader of a deleted file
    pub fn evict(&self, number: u64) {
        self.cache.lock().tables.remove(&number);
    }

    /// Number of readers currently cached
    pub fn cached_count(&self) -> usize {
        self.cache.lock().tables.len()
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn comparator(&self) -> &InternalKeyComparator {
        &self.cmp
    }

    /// Path of table file `number`
    pub fn table_path(&self, number: u64) -> PathBuf {
        table_file_name(&self.data_dir, number)
    }
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("data_dir", &self.data_dir)
            .field("capacity", &self.capacity)
            .field("cached", &self.cached_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{encode_internal_key, BytewiseComparator, RecordKind};

    fn manager(dir: &Path, capacity: usize) -> StorageManager {
        let cmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        StorageManager::new(dir, cmp, capacity)
    }

    fn write_table(storage: &StorageManager, number: u64, key: &[u8]) {
        let mut builder = storage.create_table(number).unwrap();
        builder
            .add(&encode_internal_key(key, number, RecordKind::Value), b"v")
            .unwrap();
        builder.finish().unwrap();
    }

    #[test]
    fn test_cache_respects_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let storage = manager(dir.path(), 2);
        for n in 1..=4 {
            write_table(&storage, n, format!("k{}", n).as_bytes());
            storage.open_table(n).unwrap();
        }
        assert_eq!(storage.cached_count(), 2);

        // Evicted readers reopen transparently
        let found = storage.get(1, &LookupKey::new(b"k1", 100)).unwrap();
        assert_eq!(found.map(|e| e.value), Some(b"v".to_vec()));
    }

    #[test]
    fn test_evict() {
        let dir = tempfile::tempdir().unwrap();
        let storage = manager(dir.path(), 10);
        write_table(&storage, 5, b"a");
        storage.open_table(5).unwrap();
        storage.evict(5);
        assert_eq!(storage.cached_count(), 0);
    }
}
