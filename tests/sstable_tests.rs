//! Tests for the table file format and the table cache
//!
//! These tests verify:
//! - Builder output is readable and ordered
//! - Point lookups resolve sequences and tombstones
//! - Bidirectional iteration over a table
//! - Checksums reject damaged files

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata::iterator::InternalIterator;
use strata::key::{encode_internal_key, BytewiseComparator, InternalKeyComparator, LookupKey, RecordKind};
use strata::storage::{table_file_name, SSTable, SSTableBuilder, SSTableReader, StorageManager};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn icmp() -> InternalKeyComparator {
    InternalKeyComparator::new(Arc::new(BytewiseComparator))
}

fn setup_temp_sstable() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("000007.sst");
    (temp_dir, path)
}

/// Table with keys key00000.. each written once at sequence i + 1
fn create_sstable_with_entries(path: &Path, count: usize) -> SSTable {
    let mut builder = SSTableBuilder::new(path).unwrap();
    for i in 0..count {
        let key = format!("key{:05}", i);
        let ikey = encode_internal_key(key.as_bytes(), i as u64 + 1, RecordKind::Value);
        builder.add(&ikey, format!("value{}", i).as_bytes()).unwrap();
    }
    builder.finish().unwrap()
}

fn lookup(reader: &SSTableReader, key: &str, seq: u64) -> Option<(u64, RecordKind, Vec<u8>)> {
    reader
        .get(&LookupKey::new(key.as_bytes(), seq))
        .unwrap()
        .map(|e| (e.sequence, e.kind, e.value))
}

// =============================================================================
// Builder Tests
// =============================================================================

#[test]
fn test_builder_creates_file() {
    let (_temp, path) = setup_temp_sstable();
    let table = create_sstable_with_entries(&path, 5);

    assert!(path.exists());
    assert_eq!(table.entry_count(), 5);
    assert_eq!(table.file_size, fs::metadata(&path).unwrap().len());
    assert_eq!(table.smallest, encode_internal_key(b"key00000", 1, RecordKind::Value));
    assert_eq!(table.largest, encode_internal_key(b"key00004", 5, RecordKind::Value));
}

#[test]
fn test_builder_size_estimate_matches_file() {
    let (_temp, path) = setup_temp_sstable();
    let mut builder = SSTableBuilder::new(&path).unwrap();
    for i in 0..20u64 {
        let ikey = encode_internal_key(format!("k{:03}", i).as_bytes(), i + 1, RecordKind::Value);
        builder.add(&ikey, &[7u8; 64]).unwrap();
    }
    let estimate = builder.file_size();
    let table = builder.finish().unwrap();
    assert_eq!(estimate, table.file_size);
}

#[test]
fn test_abandon_removes_file() {
    let (_temp, path) = setup_temp_sstable();
    let mut builder = SSTableBuilder::new(&path).unwrap();
    builder
        .add(&encode_internal_key(b"a", 1, RecordKind::Value), b"v")
        .unwrap();
    builder.abandon().unwrap();
    assert!(!path.exists());
}

// =============================================================================
// Reader Tests
// =============================================================================

#[test]
fn test_reader_finds_every_key() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 200);
    let reader = SSTableReader::open(&path, icmp()).unwrap();

    assert_eq!(reader.entry_count(), 200);
    for i in (0..200).step_by(17) {
        let key = format!("key{:05}", i);
        let (seq, kind, value) = lookup(&reader, &key, u64::MAX >> 8).unwrap();
        assert_eq!(seq, i as u64 + 1);
        assert_eq!(kind, RecordKind::Value);
        assert_eq!(value, format!("value{}", i).into_bytes());
    }
    assert_eq!(lookup(&reader, "key99999", 1000), None);
    assert_eq!(lookup(&reader, "aaa", 1000), None);
}

#[test]
fn test_reader_resolves_versions_and_tombstones() {
    let (_temp, path) = setup_temp_sstable();
    let mut builder = SSTableBuilder::new(&path).unwrap();
    builder.add(&encode_internal_key(b"k", 9, RecordKind::Delete), b"").unwrap();
    builder.add(&encode_internal_key(b"k", 4, RecordKind::Value), b"v4").unwrap();
    builder.add(&encode_internal_key(b"k", 2, RecordKind::Value), b"v2").unwrap();
    builder.finish().unwrap();
    let reader = SSTableReader::open(&path, icmp()).unwrap();

    assert_eq!(lookup(&reader, "k", 1), None);
    assert_eq!(lookup(&reader, "k", 3), Some((2, RecordKind::Value, b"v2".to_vec())));
    assert_eq!(lookup(&reader, "k", 8), Some((4, RecordKind::Value, b"v4".to_vec())));
    assert_eq!(lookup(&reader, "k", 9), Some((9, RecordKind::Delete, Vec::new())));
}

#[test]
fn test_iterator_both_directions() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 10);
    let reader = Arc::new(SSTableReader::open(&path, icmp()).unwrap());

    let mut iter = reader.iter();
    iter.seek_to_first().unwrap();
    let mut forward = Vec::new();
    while iter.valid() {
        forward.push(iter.value().to_vec());
        iter.next().unwrap();
    }

    iter.seek_to_last().unwrap();
    let mut backward = Vec::new();
    while iter.valid() {
        backward.push(iter.value().to_vec());
        iter.prev().unwrap();
    }
    backward.reverse();

    assert_eq!(forward.len(), 10);
    assert_eq!(forward, backward);

    iter.seek(&encode_internal_key(b"key00004x", u64::MAX >> 8, RecordKind::Value)).unwrap();
    assert_eq!(iter.value(), b"value5");
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_flipped_data_byte_is_rejected() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 10);

    let mut data = fs::read(&path).unwrap();
    data[20] ^= 0x01;
    fs::write(&path, &data).unwrap();

    let err = SSTableReader::open(&path, icmp()).unwrap_err();
    assert!(err.is_corruption(), "unexpected error: {}", err);
}

#[test]
fn test_bad_magic_is_rejected() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 3);

    let mut data = fs::read(&path).unwrap();
    data[0] = b'X';
    fs::write(&path, &data).unwrap();

    assert!(SSTableReader::open(&path, icmp()).unwrap_err().is_corruption());
}

#[test]
fn test_truncated_file_is_rejected() {
    let (_temp, path) = setup_temp_sstable();
    create_sstable_with_entries(&path, 3);
    fs::write(&path, b"STRT").unwrap();
    assert!(SSTableReader::open(&path, icmp()).unwrap_err().is_corruption());
}

// =============================================================================
// Table Cache Tests
// =============================================================================

#[test]
fn test_storage_manager_serves_lookups() {
    let temp = TempDir::new().unwrap();
    for number in [3u64, 4] {
        create_sstable_with_entries(&table_file_name(temp.path(), number), 4);
    }
    let storage = StorageManager::new(temp.path(), icmp(), 1);

    let entry = storage.get(3, &LookupKey::new(b"key00002", 100)).unwrap().unwrap();
    assert_eq!(entry.value, b"value2");
    let entry = storage.get(4, &LookupKey::new(b"key00003", 100)).unwrap().unwrap();
    assert_eq!(entry.value, b"value3");
    assert_eq!(storage.cached_count(), 1);

    assert!(storage.get(5, &LookupKey::new(b"key00000", 100)).is_err());
}
