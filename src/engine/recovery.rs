//! Startup recovery
//!
//! Brings a data directory back to a consistent state before the engine
//! accepts work:
//! 1. Load the level set from `CURRENT` and its manifest
//! 2. Replay every journal at or after the manifest's log number into
//!    level-0 tables
//! 3. Start a fresh journal and record it in a new manifest

use std::fs;
use std::sync::Arc;

use crate::compaction::build_table;
use crate::config::Config;
use crate::error::{Result, StrataError};
use crate::key::SequenceNumber;
use crate::memtable::MemTable;
use crate::storage::{journal_file_name, parse_file_name, FileType, StorageManager};
use crate::version::{VersionEdit, VersionSet};
use crate::wal::{WalRecovery, WalWriter};

/// Recover `versions` from disk and open a new journal.
///
/// Returns the new journal and its file number.
pub(super) fn recover(
    config: &Config,
    versions: &VersionSet,
    storage: &StorageManager,
) -> Result<(WalWriter, u64)> {
    let dir = &config.data_dir;
    let existed = versions.recover()?;

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some((file_type, number)) = entry.file_name().to_str().and_then(parse_file_name) {
            files.push((file_type, number));
        }
    }

    if existed {
        // Every table the manifest names must be on disk
        let current = versions.current();
        for number in current.file_numbers() {
            if !files.contains(&(FileType::Table, number)) {
                return Err(StrataError::Corruption(format!(
                    "missing table file {:06}.sst",
                    number
                )));
            }
        }
    } else if files.iter().any(|(t, _)| *t == FileType::Table) {
        return Err(StrataError::Corruption(format!(
            "{}: table files present but no CURRENT file; run repair",
            dir.display()
        )));
    } else {
        tracing::info!(data_dir = %dir.display(), "creating new database");
    }

    let min_log = versions.log_number();
    let mut journals: Vec<u64> = files
        .iter()
        .filter(|(t, n)| *t == FileType::Journal && *n >= min_log)
        .map(|(_, n)| *n)
        .collect();
    journals.sort_unstable();

    let mut edit = VersionEdit::new();
    let mut max_sequence = versions.last_sequence();
    for number in journals {
        versions.mark_file_number_used(number);
        replay_journal(config, versions, storage, number, &mut edit, &mut max_sequence)?;
    }
    versions.set_last_sequence(max_sequence);

    let log_number = versions.new_file_number();
    let journal = WalWriter::create(&journal_file_name(dir, log_number))?;
    edit.set_log_number(log_number);
    versions.log_and_apply(edit)?;

    Ok((journal, log_number))
}

/// Replay one journal, writing level-0 tables whenever the replay memtable
/// outgrows the write buffer
fn replay_journal(
    config: &Config,
    versions: &VersionSet,
    storage: &StorageManager,
    number: u64,
    edit: &mut VersionEdit,
    max_sequence: &mut SequenceNumber,
) -> Result<()> {
    let path = journal_file_name(&config.data_dir, number);
    let icmp = versions.comparator().clone();
    let mut memtable = Arc::new(MemTable::new(icmp.clone()));
    let mut tables = 0usize;

    let result = WalRecovery::replay_with(&path, config.recovery_mode, |batch| {
        batch.insert_into(&memtable);
        if !batch.is_empty() {
            *max_sequence = (*max_sequence).max(batch.last_sequence());
        }
        if memtable.approx_size() > config.write_buffer_size {
            write_level0_table(versions, storage, &memtable, edit)?;
            memtable = Arc::new(MemTable::new(icmp.clone()));
            tables += 1;
        }
        Ok(())
    })?;

    if !memtable.is_empty() {
        write_level0_table(versions, storage, &memtable, edit)?;
        tables += 1;
    }

    tracing::info!(
        journal = number,
        batches = result.batches_recovered,
        corrupted = result.records_corrupted,
        truncated = result.was_truncated,
        tables,
        "replayed journal"
    );
    Ok(())
}

fn write_level0_table(
    versions: &VersionSet,
    storage: &StorageManager,
    memtable: &Arc<MemTable>,
    edit: &mut VersionEdit,
) -> Result<()> {
    let number = versions.new_file_number();
    if let Some(table) = build_table(storage, number, &mut memtable.iter())? {
        tracing::debug!(file = number, entries = table.entry_count, "recovered memtable written");
        edit.add_file(0, number, table.file_size, table.smallest, table.largest);
    }
    Ok(())
}
