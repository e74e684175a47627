//! Flush and compaction jobs
//!
//! Both write new tables from a sorted stream of internal entries. A flush
//! copies one memtable verbatim into a level-0 table. A compaction merges its
//! inputs and drops entries that no reader can observe:
//!
//! - an older version of a user key, once a newer version at or below the
//!   oldest snapshot has been seen
//! - a tombstone at or below the oldest snapshot, when no deeper level can
//!   hold the key

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use super::{Compaction, CompactionStats, SlotState, WorkerChannel};
use crate::error::Result;
use crate::iterator::{BoxedIterator, InternalIterator, LevelIterator, MergingIterator};
use crate::key::{ParsedInternalKey, RecordKind, SequenceNumber, MAX_SEQUENCE};
use crate::storage::{SSTable, SSTableBuilder, StorageManager};
use crate::version::VersionSet;

/// Write every entry of `iter` into table file `number`.
///
/// Returns `Ok(None)` without creating a file when `iter` is empty. The new
/// table is reopened through the cache before returning so a damaged write
/// is caught here rather than by a reader.
pub fn build_table(
    storage: &StorageManager,
    number: u64,
    iter: &mut dyn InternalIterator,
) -> Result<Option<SSTable>> {
    iter.seek_to_first()?;
    if !iter.valid() {
        return Ok(None);
    }

    let mut builder = storage.create_table(number)?;
    let written = (|| -> Result<SSTable> {
        while iter.valid() {
            builder.add(iter.key(), iter.value())?;
            iter.next()?;
        }
        builder.finish()
    })();

    let table = match written {
        Ok(table) => table,
        Err(e) => {
            let _ = fs::remove_file(storage.table_path(number));
            return Err(e);
        }
    };

    if let Err(e) = storage.open_table(number) {
        storage.evict(number);
        let _ = fs::remove_file(storage.table_path(number));
        return Err(e);
    }
    Ok(Some(table))
}

/// How a compaction job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Outputs were installed in a new version
    Installed(CompactionStats),
    /// A pause or shutdown was requested; partial outputs were deleted
    Abandoned,
}

struct Output {
    number: u64,
    table: SSTable,
}

/// Merges the inputs of one [`Compaction`] into new tables
pub struct CompactionJob<'a> {
    compaction: Compaction,
    versions: &'a VersionSet,
    storage: &'a Arc<StorageManager>,
    pending_outputs: &'a Mutex<HashSet<u64>>,
    smallest_snapshot: SequenceNumber,
    channel: Option<&'a WorkerChannel>,

    builder: Option<(u64, SSTableBuilder)>,
    outputs: Vec<Output>,
}

impl<'a> CompactionJob<'a> {
    pub fn new(
        compaction: Compaction,
        versions: &'a VersionSet,
        storage: &'a Arc<StorageManager>,
        pending_outputs: &'a Mutex<HashSet<u64>>,
        smallest_snapshot: SequenceNumber,
    ) -> Self {
        Self {
            compaction,
            versions,
            storage,
            pending_outputs,
            smallest_snapshot,
            channel: None,
            builder: None,
            outputs: Vec::new(),
        }
    }

    /// Report the install step through `channel`'s slot state
    pub fn with_channel(mut self, channel: &'a WorkerChannel) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Run the merge and install the result.
    ///
    /// `should_yield` is polled whenever no output file is open; once it
    /// returns true the job stops and deletes what it wrote.
    pub fn run(mut self, should_yield: &dyn Fn() -> bool) -> Result<JobOutcome> {
        let started = Instant::now();
        let level = self.compaction.level();
        tracing::info!(
            level,
            inputs = self.compaction.inputs(0).len(),
            next_level_inputs = self.compaction.inputs(1).len(),
            smallest_snapshot = self.smallest_snapshot,
            "compaction started"
        );

        let merged = match self.merge(should_yield) {
            Ok(merged) => merged,
            Err(e) => {
                self.cleanup();
                return Err(e);
            }
        };
        if !merged {
            tracing::info!(level, "compaction abandoned at checkpoint");
            self.cleanup();
            return Ok(JobOutcome::Abandoned);
        }

        let stats = CompactionStats {
            count: 1,
            micros: started.elapsed().as_micros() as u64,
            bytes_read: self.compaction.input_bytes(),
            bytes_written: self.outputs.iter().map(|o| o.table.file_size).sum(),
        };

        if let Err(e) = self.install() {
            self.cleanup();
            return Err(e);
        }
        self.release_pending();

        tracing::info!(
            level,
            outputs = self.outputs.len(),
            bytes_read = stats.bytes_read,
            bytes_written = stats.bytes_written,
            micros = stats.micros,
            "compaction finished"
        );
        Ok(JobOutcome::Installed(stats))
    }

    /// Returns `Ok(false)` if the job yielded before finishing
    fn merge(&mut self, should_yield: &dyn Fn() -> bool) -> Result<bool> {
        let mut input = self.make_input_iterator()?;
        input.seek_to_first()?;

        let icmp = self.versions.comparator().clone();
        let mut current_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = MAX_SEQUENCE;
        let mut split_requested = false;

        while input.valid() {
            if self.builder.is_none() && should_yield() {
                return Ok(false);
            }

            let key = input.key();
            let parsed = ParsedInternalKey::parse(key)?;

            if self.builder.is_some() && self.compaction.should_stop_before(key) {
                split_requested = true;
            }

            let new_user_key = current_user_key
                .as_deref()
                .map_or(true, |k| icmp.compare_user(parsed.user_key, k) != Ordering::Equal);
            if new_user_key {
                // Outputs only end between user keys, so one key never spans two files
                let full = self
                    .builder
                    .as_ref()
                    .map_or(false, |(_, b)| b.file_size() >= self.compaction.max_output_file_size());
                if self.builder.is_some() && (split_requested || full) {
                    self.finish_output()?;
                    split_requested = false;
                    if should_yield() {
                        return Ok(false);
                    }
                }
                current_user_key = Some(parsed.user_key.to_vec());
                last_sequence_for_key = MAX_SEQUENCE;
            }

            let drop = if last_sequence_for_key <= self.smallest_snapshot {
                // Hidden by a newer entry for the same key
                true
            } else {
                parsed.kind == RecordKind::Delete
                    && parsed.sequence <= self.smallest_snapshot
                    && self.compaction.is_base_level_for_key(parsed.user_key)
            };
            last_sequence_for_key = parsed.sequence;

            if !drop {
                if self.builder.is_none() {
                    self.open_output()?;
                }
                if let Some((_, builder)) = &mut self.builder {
                    builder.add(input.key(), input.value())?;
                }
            }

            input.next()?;
        }

        if self.builder.is_some() {
            self.finish_output()?;
        }
        Ok(true)
    }

    fn make_input_iterator(&self) -> Result<MergingIterator> {
        let icmp = self.versions.comparator().clone();
        let mut children: Vec<BoxedIterator> = Vec::new();
        for which in 0..2 {
            let files = self.compaction.inputs(which);
            if files.is_empty() {
                continue;
            }
            if self.compaction.level() + which == 0 {
                for file in files {
                    children.push(Box::new(self.storage.iter(file.number)?));
                }
            } else {
                children.push(Box::new(LevelIterator::new(
                    Arc::clone(self.storage),
                    icmp.clone(),
                    files.to_vec(),
                )));
            }
        }
        Ok(MergingIterator::new(icmp, children))
    }

    fn open_output(&mut self) -> Result<()> {
        let number = self.versions.new_file_number();
        self.pending_outputs.lock().insert(number);
        let builder = self.storage.create_table(number)?;
        self.builder = Some((number, builder));
        Ok(())
    }

    fn finish_output(&mut self) -> Result<()> {
        let Some((number, builder)) = self.builder.take() else {
            return Ok(());
        };
        let entries = builder.entry_count();
        let table = builder.finish()?;
        // Make sure the new file is readable before it is installed
        self.storage.open_table(number)?;
        tracing::debug!(
            file = number,
            level = self.compaction.output_level(),
            entries,
            bytes = table.file_size,
            "compaction output written"
        );
        self.outputs.push(Output { number, table });
        Ok(())
    }

    fn install(&mut self) -> Result<()> {
        if let Some(channel) = self.channel {
            channel.set_state(SlotState::Committing);
        }
        self.compaction.add_input_deletions();
        let output_level = self.compaction.output_level();
        for output in &self.outputs {
            self.compaction.edit_mut().add_file(
                output_level,
                output.number,
                output.table.file_size,
                output.table.smallest.clone(),
                output.table.largest.clone(),
            );
        }
        let edit = std::mem::take(self.compaction.edit_mut());
        self.versions.log_and_apply(edit)
    }

    /// Delete everything this job wrote
    fn cleanup(&mut self) {
        let mut numbers: Vec<u64> = self.outputs.drain(..).map(|o| o.number).collect();
        if let Some((number, builder)) = self.builder.take() {
            let _ = builder.abandon();
            numbers.push(number);
        }
        for &number in &numbers {
            self.storage.evict(number);
            let path = self.storage.table_path(number);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove compaction output");
                }
            }
        }
        let mut pending = self.pending_outputs.lock();
        for number in numbers {
            pending.remove(&number);
        }
    }

    fn release_pending(&self) {
        let mut pending = self.pending_outputs.lock();
        for output in &self.outputs {
            pending.remove(&output.number);
        }
    }
}

/// Move a single file one level down without rewriting it
pub fn trivial_move(mut compaction: Compaction, versions: &VersionSet) -> Result<()> {
    let level = compaction.level();
    let file = Arc::clone(&compaction.inputs(0)[0]);
    let edit = compaction.edit_mut();
    edit.delete_file(level, file.number);
    edit.add_file(
        level + 1,
        file.number,
        file.file_size,
        file.smallest.encoded().to_vec(),
        file.largest.encoded().to_vec(),
    );
    versions.log_and_apply(compaction.into_edit())?;
    tracing::info!(file = file.number, from = level, to = level + 1, bytes = file.file_size, "trivial move");
    Ok(())
}
