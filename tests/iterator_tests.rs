//! Tests for iterators and snapshots
//!
//! These tests verify:
//! - Iteration yields each live user key once, in order, in both directions
//! - Key ranges bound iteration to [start, limit)
//! - Snapshots pin the state they were taken at, through flushes and compactions

use strata::{Config, Engine, KeyRange, ReadOptions, WriteBatch, WriteOptions};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_engine() -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .write_buffer_size(16 * 1024)
        .build();
    let engine = Engine::open(config).unwrap();
    (temp_dir, engine)
}

fn scan(engine: &Engine, options: &ReadOptions<'_>, range: Option<KeyRange>) -> Vec<(String, String)> {
    engine
        .iter(options, range)
        .unwrap()
        .entries()
        .map(|r| {
            let (k, v) = r.unwrap();
            (String::from_utf8(k).unwrap(), String::from_utf8(v).unwrap())
        })
        .collect()
}

fn scan_reverse(engine: &Engine, range: Option<KeyRange>) -> Vec<(String, String)> {
    let mut iter = engine.iter(&ReadOptions::default(), range).unwrap();
    iter.seek_to_last().unwrap();
    let mut out = Vec::new();
    while iter.valid() {
        out.push((
            String::from_utf8(iter.key().to_vec()).unwrap(),
            String::from_utf8(iter.value().to_vec()).unwrap(),
        ));
        iter.prev().unwrap();
    }
    out
}

fn kv(k: &str, v: &str) -> (String, String) {
    (k.to_string(), v.to_string())
}

/// Five keys spread over a table and the memtable, with an overwrite and a delete
fn populate(engine: &Engine) {
    engine.put("a", "1").unwrap();
    engine.put("b", "old").unwrap();
    engine.put("c", "3").unwrap();
    engine.put("d", "doomed").unwrap();
    engine.flush().unwrap();
    engine.put("b", "new").unwrap();
    engine.delete("d").unwrap();
    engine.put("e", "5").unwrap();
}

// =============================================================================
// Iteration Tests
// =============================================================================

#[test]
fn test_empty_database_iterates_nothing() {
    let (_temp, engine) = setup_temp_engine();
    let mut iter = engine.iter(&ReadOptions::default(), None).unwrap();
    iter.seek_to_first().unwrap();
    assert!(!iter.valid());
    iter.seek_to_last().unwrap();
    assert!(!iter.valid());
    assert!(iter.key().is_empty());
}

#[test]
fn test_forward_iteration_merges_memtable_and_tables() {
    let (_temp, engine) = setup_temp_engine();
    populate(&engine);

    assert_eq!(
        scan(&engine, &ReadOptions::default(), None),
        vec![kv("a", "1"), kv("b", "new"), kv("c", "3"), kv("e", "5")]
    );
}

#[test]
fn test_reverse_iteration_mirrors_forward() {
    let (_temp, engine) = setup_temp_engine();
    populate(&engine);

    let forward = scan(&engine, &ReadOptions::default(), None);
    let mut backward = scan_reverse(&engine, None);
    backward.reverse();
    assert_eq!(forward, backward);
}

#[test]
fn test_direction_changes() {
    let (_temp, engine) = setup_temp_engine();
    populate(&engine);

    let mut iter = engine.iter(&ReadOptions::default(), None).unwrap();
    iter.seek(b"c").unwrap();
    assert_eq!(iter.key(), b"c");
    iter.prev().unwrap();
    assert_eq!(iter.key(), b"b");
    assert_eq!(iter.value(), b"new");
    iter.next().unwrap();
    assert_eq!(iter.key(), b"c");
    iter.next().unwrap();
    assert_eq!(iter.key(), b"e");
    iter.next().unwrap();
    assert!(!iter.valid());
}

#[test]
fn test_seek_skips_deleted_key() {
    let (_temp, engine) = setup_temp_engine();
    populate(&engine);

    let mut iter = engine.iter(&ReadOptions::default(), None).unwrap();
    iter.seek(b"d").unwrap();
    assert_eq!(iter.key(), b"e");
    iter.seek(b"zzz").unwrap();
    assert!(!iter.valid());
}

#[test]
fn test_range_bounds_iteration() {
    let (_temp, engine) = setup_temp_engine();
    populate(&engine);

    let range = || Some(KeyRange::new("b", "e"));
    assert_eq!(
        scan(&engine, &ReadOptions::default(), range()),
        vec![kv("b", "new"), kv("c", "3")]
    );
    assert_eq!(scan_reverse(&engine, range()), vec![kv("c", "3"), kv("b", "new")]);

    assert_eq!(
        scan(&engine, &ReadOptions::default(), Some(KeyRange::from("c"))),
        vec![kv("c", "3"), kv("e", "5")]
    );
    assert_eq!(
        scan(&engine, &ReadOptions::default(), Some(KeyRange::until("b"))),
        vec![kv("a", "1")]
    );

    // Seeking below the range start clamps to the start
    let mut iter = engine.iter(&ReadOptions::default(), range()).unwrap();
    iter.seek(b"a").unwrap();
    assert_eq!(iter.key(), b"b");
}

#[test]
fn test_iterator_is_stable_against_later_writes() {
    let (_temp, engine) = setup_temp_engine();
    populate(&engine);

    let mut iter = engine.iter(&ReadOptions::default(), None).unwrap();
    engine.put("aa", "late").unwrap();
    engine.delete("c").unwrap();
    engine.flush().unwrap();

    iter.seek_to_first().unwrap();
    let mut keys = Vec::new();
    while iter.valid() {
        keys.push(iter.key().to_vec());
        iter.next().unwrap();
    }
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"e".to_vec()]);
}

#[test]
fn test_open_iterators_are_counted() {
    let (_temp, engine) = setup_temp_engine();
    let first = engine.iter(&ReadOptions::default(), None).unwrap();
    let second = engine.iter(&ReadOptions::default(), None).unwrap();
    assert_eq!(engine.open_iterators(), 2);
    drop(first);
    assert_eq!(engine.open_iterators(), 1);
    drop(second);
    assert_eq!(engine.open_iterators(), 0);
}

#[test]
fn test_many_versions_of_one_key_yield_once() {
    let (_temp, engine) = setup_temp_engine();
    for round in 0..50 {
        engine.put("hot", format!("v{}", round)).unwrap();
        if round % 10 == 9 {
            engine.flush().unwrap();
        }
    }
    assert_eq!(scan(&engine, &ReadOptions::default(), None), vec![kv("hot", "v49")]);
    assert_eq!(scan_reverse(&engine, None), vec![kv("hot", "v49")]);
}

// =============================================================================
// Snapshot Tests
// =============================================================================

#[test]
fn test_snapshot_sees_state_at_creation() {
    let (_temp, engine) = setup_temp_engine();
    engine.put("k", "v1").unwrap();
    let snap = engine.snapshot();
    assert_eq!(snap.sequence(), 1);

    engine.put("k", "v2").unwrap();
    engine.put("new", "x").unwrap();

    let at = ReadOptions::at(&snap);
    assert_eq!(engine.get_with(b"k", &at).unwrap(), Some(b"v1".to_vec()));
    assert_eq!(engine.get_with(b"new", &at).unwrap(), None);
    assert_eq!(engine.get(b"k").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(scan(&engine, &at, None), vec![kv("k", "v1")]);
}

#[test]
fn test_snapshot_survives_delete_flush_and_compaction() {
    let (_temp, engine) = setup_temp_engine();
    let mut batch = WriteBatch::new();
    for i in 0..100 {
        batch.put(format!("key{:03}", i), format!("v{}", i));
    }
    engine.write(batch, &WriteOptions::default()).unwrap();
    let snap = engine.snapshot();

    for i in 0..100 {
        if i % 2 == 0 {
            engine.delete(format!("key{:03}", i)).unwrap();
        } else {
            engine.put(format!("key{:03}", i), "overwritten").unwrap();
        }
    }
    engine.flush().unwrap();
    engine.compact_range(None, None).unwrap();

    let at = ReadOptions::at(&snap);
    for i in (0..100).step_by(7) {
        let key = format!("key{:03}", i);
        assert_eq!(
            engine.get_with(key.as_bytes(), &at).unwrap(),
            Some(format!("v{}", i).into_bytes())
        );
    }
    assert_eq!(scan(&engine, &at, None).len(), 100);

    let latest = scan(&engine, &ReadOptions::default(), None);
    assert_eq!(latest.len(), 50);
    assert!(latest.iter().all(|(_, v)| v == "overwritten"));
}

#[test]
fn test_snapshot_count_and_release() {
    let (_temp, engine) = setup_temp_engine();
    let first = engine.snapshot();
    let second = engine.snapshot();
    assert_eq!(engine.open_snapshots(), 2);

    engine.release_snapshot(first);
    assert_eq!(engine.open_snapshots(), 1);
    drop(second);
    assert_eq!(engine.open_snapshots(), 0);
    assert_eq!(engine.stats().open_snapshots, 0);
}

#[test]
fn test_released_snapshot_lets_compaction_drop_versions() {
    let (_temp, engine) = setup_temp_engine();
    engine.put("k", "old").unwrap();
    let snap = engine.snapshot();
    engine.put("k", "new").unwrap();
    engine.release_snapshot(snap);

    engine.flush().unwrap();
    engine.compact_range(None, None).unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"new".to_vec()));

    let snap = engine.snapshot();
    assert_eq!(engine.get_with(b"k", &ReadOptions::at(&snap)).unwrap(), Some(b"new".to_vec()));
}
