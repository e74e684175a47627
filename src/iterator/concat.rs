//! Concatenating iterator over one level
//!
//! Files at levels >= 1 are disjoint and sorted, so the level reads as one
//! sorted run. Table readers are opened lazily, one file at a time.

use std::sync::Arc;

use super::InternalIterator;
use crate::error::Result;
use crate::key::InternalKeyComparator;
use crate::storage::{SSTableIterator, StorageManager};
use crate::version::{find_file, FileMetaData};

/// Iterator over the files of one sorted level
pub struct LevelIterator {
    storage: Arc<StorageManager>,
    icmp: InternalKeyComparator,
    files: Vec<Arc<FileMetaData>>,
    /// Index of the file `table` reads
    index: usize,
    table: Option<SSTableIterator>,
}

impl LevelIterator {
    pub fn new(storage: Arc<StorageManager>, icmp: InternalKeyComparator, files: Vec<Arc<FileMetaData>>) -> Self {
        Self {
            storage,
            icmp,
            files,
            index: 0,
            table: None,
        }
    }

    /// Open file `index`, or clear the table iterator when out of range
    fn open_file(&mut self, index: usize) -> Result<()> {
        self.index = index;
        if index >= self.files.len() {
            self.table = None;
            return Ok(());
        }
        self.table = Some(self.storage.iter(self.files[index].number)?);
        Ok(())
    }

    fn table_valid(&self) -> bool {
        self.table.as_ref().map_or(false, |t| t.valid())
    }

    /// Step into following files until one yields an entry
    fn skip_empty_forward(&mut self) -> Result<()> {
        while self.table.is_some() && !self.table_valid() {
            self.open_file(self.index + 1)?;
            if let Some(table) = &mut self.table {
                table.seek_to_first()?;
            }
        }
        Ok(())
    }

    /// Step into preceding files until one yields an entry
    fn skip_empty_backward(&mut self) -> Result<()> {
        while self.table.is_some() && !self.table_valid() {
            if self.index == 0 {
                self.table = None;
                break;
            }
            self.open_file(self.index - 1)?;
            if let Some(table) = &mut self.table {
                table.seek_to_last()?;
            }
        }
        Ok(())
    }
}

impl InternalIterator for LevelIterator {
    fn valid(&self) -> bool {
        self.table_valid()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.open_file(0)?;
        if let Some(table) = &mut self.table {
            table.seek_to_first()?;
        }
        self.skip_empty_forward()
    }

    fn seek_to_last(&mut self) -> Result<()> {
        if self.files.is_empty() {
            self.table = None;
            return Ok(());
        }
        self.open_file(self.files.len() - 1)?;
        if let Some(table) = &mut self.table {
            table.seek_to_last()?;
        }
        self.skip_empty_backward()
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        let index = find_file(&self.icmp, &self.files, target);
        self.open_file(index)?;
        if let Some(table) = &mut self.table {
            table.seek(target)?;
        }
        self.skip_empty_forward()
    }

    fn next(&mut self) -> Result<()> {
        if let Some(table) = &mut self.table {
            table.next()?;
        }
        self.skip_empty_forward()
    }

    fn prev(&mut self) -> Result<()> {
        if let Some(table) = &mut self.table {
            table.prev()?;
        }
        self.skip_empty_backward()
    }

    fn key(&self) -> &[u8] {
        match &self.table {
            Some(table) => table.key(),
            None => &[],
        }
    }

    fn value(&self) -> &[u8] {
        match &self.table {
            Some(table) => table.value(),
            None => &[],
        }
    }
}
