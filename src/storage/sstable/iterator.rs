//! SSTable Iterator
//!
//! Bidirectional cursor over the entries of one SSTable. Keys come from the
//! in-memory index; the value is read from disk when the cursor lands on an
//! entry.

use std::sync::Arc;

use super::SSTableReader;
use crate::error::Result;
use crate::iterator::InternalIterator;

/// Iterator over SSTable entries in internal key order
pub struct SSTableIterator {
    table: Arc<SSTableReader>,
    pos: Option<usize>,
    value: Vec<u8>,
}

impl SSTableIterator {
    pub(super) fn new(table: Arc<SSTableReader>) -> Self {
        Self {
            table,
            pos: None,
            value: Vec::new(),
        }
    }

    fn position(&mut self, pos: Option<usize>) -> Result<()> {
        self.pos = pos.filter(|&p| p < self.table.entry_count());
        self.value.clear();
        if let Some(p) = self.pos {
            self.value = self.table.value_at(p)?;
        }
        Ok(())
    }
}

impl InternalIterator for SSTableIterator {
    fn valid(&self) -> bool {
        self.pos.is_some()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.position(Some(0))
    }

    fn seek_to_last(&mut self) -> Result<()> {
        let last = self.table.entry_count().checked_sub(1);
        self.position(last)
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        let pos = self.table.find(target);
        self.position(Some(pos))
    }

    fn next(&mut self) -> Result<()> {
        let next = self.pos.map(|p| p + 1);
        self.position(next)
    }

    fn prev(&mut self) -> Result<()> {
        let prev = self.pos.and_then(|p| p.checked_sub(1));
        self.position(prev)
    }

    fn key(&self) -> &[u8] {
        match self.pos {
            Some(p) => self.table.key_at(p),
            None => &[],
        }
    }

    fn value(&self) -> &[u8] {
        &self.value
    }
}
