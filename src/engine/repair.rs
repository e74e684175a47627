//! Manifest repair
//!
//! Rebuilds the manifest of a damaged database from its table files. Every
//! readable table is placed in level 0 (newer data wins on sequence number,
//! so overlap is harmless); tables that fail their checksums are renamed to
//! `*.sst.bad` and left for inspection. Journals are kept: the subsequent
//! open replays all of them with lenient recovery.

use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::error::{Result, StrataError};
use crate::key::{InternalKeyComparator, ParsedInternalKey, SequenceNumber};
use crate::storage::{
    manifest_file_name, parse_file_name, set_current_file, table_file_name, FileType, SSTableReader,
};
use crate::version::VersionEdit;
use crate::wal::WalWriter;

use super::lock_directory;

struct RecoveredTable {
    number: u64,
    file_size: u64,
    smallest: Vec<u8>,
    largest: Vec<u8>,
    max_sequence: SequenceNumber,
}

pub(super) fn repair(config: &Config) -> Result<()> {
    let dir = &config.data_dir;
    if !dir.is_dir() {
        return Err(StrataError::InvalidArgument(format!(
            "{}: not a directory",
            dir.display()
        )));
    }
    let _lock = lock_directory(dir)?;
    let icmp = InternalKeyComparator::new(config.comparator.clone());

    let mut max_number = 0;
    let mut table_numbers = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some((file_type, number)) = entry.file_name().to_str().and_then(parse_file_name) else {
            continue;
        };
        max_number = max_number.max(number);
        if file_type == FileType::Table {
            table_numbers.push(number);
        }
    }
    table_numbers.sort_unstable();

    let mut tables = Vec::new();
    let mut set_aside = 0usize;
    for number in table_numbers {
        let path = table_file_name(dir, number);
        match scan_table(&path, number, &icmp) {
            Ok(Some(table)) => tables.push(table),
            Ok(None) => {
                set_aside += 1;
                set_aside_table(&path, "empty table")?;
            }
            Err(e) => {
                set_aside += 1;
                set_aside_table(&path, &e.to_string())?;
            }
        }
    }

    let last_sequence = tables.iter().map(|t| t.max_sequence).max().unwrap_or(0);
    let manifest_number = max_number + 1;

    let mut edit = VersionEdit::new();
    edit.set_comparator_name(icmp.user_comparator().name());
    edit.set_log_number(0);
    edit.set_next_file_number(manifest_number + 1);
    edit.set_last_sequence(last_sequence);
    for table in &tables {
        edit.add_file(
            0,
            table.number,
            table.file_size,
            table.smallest.clone(),
            table.largest.clone(),
        );
    }

    let path = manifest_file_name(dir, manifest_number);
    let written = (|| -> Result<()> {
        let mut writer = WalWriter::create(&path)?;
        writer.append(&edit.encode()?)?;
        writer.sync()?;
        set_current_file(dir, manifest_number)
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&path);
        return Err(e);
    }

    tracing::info!(
        data_dir = %dir.display(),
        tables = tables.len(),
        set_aside,
        last_sequence,
        manifest = manifest_number,
        "repaired manifest"
    );
    Ok(())
}

/// Key range, size and newest sequence of a readable, non-empty table
fn scan_table(path: &Path, number: u64, icmp: &InternalKeyComparator) -> Result<Option<RecoveredTable>> {
    let reader = SSTableReader::open(path, icmp.clone())?;
    let (Some(smallest), Some(largest)) = (reader.smallest(), reader.largest()) else {
        return Ok(None);
    };

    let mut max_sequence = 0;
    for pos in 0..reader.entry_count() {
        let parsed = ParsedInternalKey::parse(reader.key_at(pos))?;
        max_sequence = max_sequence.max(parsed.sequence);
    }

    Ok(Some(RecoveredTable {
        number,
        file_size: reader.file_size(),
        smallest: smallest.to_vec(),
        largest: largest.to_vec(),
        max_sequence,
    }))
}

fn set_aside_table(path: &Path, reason: &str) -> Result<()> {
    let mut bad = path.as_os_str().to_owned();
    bad.push(".bad");
    tracing::warn!(table = %path.display(), reason, "setting aside unreadable table");
    fs::rename(path, &bad)?;
    Ok(())
}
