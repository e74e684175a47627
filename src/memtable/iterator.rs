//! MemTable iterator
//!
//! Holds an `Arc` on its table and re-enters the map on every step, so the
//! read lock is only held for one lookup at a time.

use std::ops::Bound;
use std::sync::Arc;

use super::table::MemKey;
use super::MemTable;
use crate::error::Result;
use crate::iterator::InternalIterator;

/// Cursor over the entries of one memtable
pub struct MemTableIterator {
    table: Arc<MemTable>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl MemTableIterator {
    pub(super) fn new(table: Arc<MemTable>) -> Self {
        Self {
            table,
            current: None,
        }
    }

    fn probe(&self, key: &[u8]) -> MemKey {
        MemKey::new(key.to_vec(), self.table.comparator())
    }

    fn load(&mut self, bounds: (Bound<MemKey>, Bound<MemKey>), from_back: bool) {
        let data = self.table.data.read();
        let mut range = data.range(bounds);
        let entry = if from_back {
            range.next_back()
        } else {
            range.next()
        };
        self.current = entry.map(|(k, v)| (k.encoded.clone(), v.clone()));
    }
}

impl InternalIterator for MemTableIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.load((Bound::Unbounded, Bound::Unbounded), false);
        Ok(())
    }

    fn seek_to_last(&mut self) -> Result<()> {
        self.load((Bound::Unbounded, Bound::Unbounded), true);
        Ok(())
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        let probe = self.probe(target);
        self.load((Bound::Included(probe), Bound::Unbounded), false);
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if let Some((key, _)) = self.current.take() {
            let probe = self.probe(&key);
            self.load((Bound::Excluded(probe), Bound::Unbounded), false);
        }
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        if let Some((key, _)) = self.current.take() {
            let probe = self.probe(&key);
            self.load((Bound::Unbounded, Bound::Excluded(probe)), true);
        }
        Ok(())
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map(|(k, _)| k.as_slice()).unwrap_or(&[])
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().map(|(_, v)| v.as_slice()).unwrap_or(&[])
    }
}
