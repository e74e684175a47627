//! Tests for compaction
//!
//! These tests verify:
//! - Manual compaction moves data down without changing what reads return
//! - A full compaction leaves each user key once, in order
//! - Automatic compaction keeps level 0 below the stop trigger
//! - Pausing background work holds flushes and compactions back, stalls
//!   writers that need a flush, and rejects manual flushes and compactions

use std::fs;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use strata::storage::{parse_file_name, FileType};
use strata::{Config, Engine, LevelStats, ReadOptions, StrataError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn small_config(dir: &TempDir) -> Config {
    Config::builder()
        .data_dir(dir.path())
        .write_buffer_size(8 * 1024)
        .target_file_size(16 * 1024)
        .level1_max_bytes(64 * 1024)
        .level0_compaction_trigger(2)
        .level0_stop_writes_trigger(6)
        .build()
}

fn setup_temp_engine() -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(small_config(&temp_dir)).unwrap();
    (temp_dir, engine)
}

fn key(i: usize) -> String {
    format!("key{:06}", i)
}

fn load(engine: &Engine, count: usize, tag: &str) {
    for i in 0..count {
        engine.put(key(i), format!("{}-{}-{}", tag, i, "x".repeat(80))).unwrap();
    }
}

fn all_entries(engine: &Engine) -> Vec<(Vec<u8>, Vec<u8>)> {
    engine
        .iter(&ReadOptions::default(), None)
        .unwrap()
        .entries()
        .map(|r| r.unwrap())
        .collect()
}

fn total_files(engine: &Engine) -> usize {
    (0..7).map(|level| engine.num_files_at_level(level)).sum()
}

/// Per-level stats plus the table files on disk
fn table_layout(dir: &TempDir, engine: &Engine) -> (Vec<LevelStats>, Vec<u64>) {
    let mut tables: Vec<u64> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().and_then(parse_file_name))
        .filter(|(t, _)| *t == FileType::Table)
        .map(|(_, number)| number)
        .collect();
    tables.sort_unstable();
    (engine.stats().levels, tables)
}

/// Wait for the compaction worker to drain level 0 below `limit`
fn wait_for_level0_below(engine: &Engine, limit: usize) {
    for _ in 0..500 {
        if engine.num_files_at_level(0) < limit {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("level 0 still has {} files", engine.num_files_at_level(0));
}

// =============================================================================
// Manual Compaction Tests
// =============================================================================

#[test]
fn test_compact_empty_database_does_nothing() {
    let (temp, engine) = setup_temp_engine();
    let before = table_layout(&temp, &engine);
    assert!(!engine.compact_range(None, None).unwrap());
    assert_eq!(table_layout(&temp, &engine), before);
    assert!(before.1.is_empty());
}

#[test]
fn test_compact_range_outside_data_does_nothing() {
    let (temp, engine) = setup_temp_engine();
    engine.put("m", "v").unwrap();
    engine.flush().unwrap();
    let before = table_layout(&temp, &engine);
    assert_eq!(before.1.len(), 1);

    assert!(!engine.compact_range(Some(b"x"), Some(b"z")).unwrap());
    assert_eq!(table_layout(&temp, &engine), before);
    assert_eq!(engine.num_files_at_level(0), 1);
    assert_eq!(engine.get(b"m").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_compact_range_moves_level0_down() {
    let (_temp, engine) = setup_temp_engine();
    load(&engine, 50, "a");
    engine.flush().unwrap();
    assert!(engine.compact_range(None, None).unwrap());

    assert_eq!(engine.num_files_at_level(0), 0);
    assert!(total_files(&engine) > 0);
    assert_eq!(all_entries(&engine).len(), 50);
}

#[test]
fn test_compaction_preserves_data() {
    let (_temp, engine) = setup_temp_engine();
    load(&engine, 1000, "first");
    load(&engine, 500, "second");
    for i in (0..1000).step_by(3) {
        engine.delete(key(i)).unwrap();
    }
    let before = all_entries(&engine);

    engine.compact_range(None, None).unwrap();
    assert_eq!(all_entries(&engine), before);

    // A second pass over already-compacted data changes nothing visible
    engine.compact_range(None, None).unwrap();
    assert_eq!(all_entries(&engine), before);

    assert_eq!(engine.get(key(0).as_bytes()).unwrap(), None);
    assert!(engine.get(key(1).as_bytes()).unwrap().unwrap().starts_with(b"second-1-"));
    assert!(engine.get(key(700).as_bytes()).unwrap().unwrap().starts_with(b"first-700-"));
}

#[test]
fn test_full_compaction_leaves_sorted_unique_keys() {
    let (_temp, engine) = setup_temp_engine();
    load(&engine, 2000, "v");
    load(&engine, 2000, "w");
    engine.compact_range(None, None).unwrap();

    assert_eq!(engine.num_files_at_level(0), 0);
    let keys: Vec<Vec<u8>> = all_entries(&engine).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys.len(), 2000);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert!(engine.stats().levels.iter().skip(1).any(|l| l.compaction.count > 0));
}

#[test]
fn test_compacted_data_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let before = {
        let engine = Engine::open(small_config(&temp)).unwrap();
        load(&engine, 800, "v");
        engine.compact_range(None, None).unwrap();
        let entries = all_entries(&engine);
        engine.close().unwrap();
        entries
    };

    let engine = Engine::open(small_config(&temp)).unwrap();
    assert_eq!(all_entries(&engine), before);
}

// =============================================================================
// Automatic Compaction Tests
// =============================================================================

#[test]
fn test_automatic_compaction_drains_level0() {
    let (_temp, engine) = setup_temp_engine();
    for round in 0..6 {
        load(&engine, 200, &format!("r{}", round));
        engine.flush().unwrap();
    }
    wait_for_level0_below(&engine, 2);

    assert!(total_files(&engine) > 0);
    assert_eq!(all_entries(&engine).len(), 200);
    assert!(engine.get(key(7).as_bytes()).unwrap().unwrap().starts_with(b"r5-7-"));
}

// =============================================================================
// Pause Tests
// =============================================================================

#[test]
fn test_pause_holds_flushes_back() {
    let (_temp, engine) = setup_temp_engine();
    let guard = engine.pause_compaction().unwrap();

    // Enough to seal one memtable, not enough to fill the next
    for i in 0..80 {
        engine.put(key(i), "x".repeat(100)).unwrap();
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(engine.num_files_at_level(0), 0);
    assert!(engine.stats().sealed_memtable);
    assert_eq!(engine.get(key(3).as_bytes()).unwrap(), Some("x".repeat(100).into_bytes()));

    drop(guard);
    engine.flush().unwrap();
    assert!(total_files(&engine) > 0);
    assert_eq!(all_entries(&engine).len(), 80);
}

#[test]
fn test_manual_compaction_rejected_while_paused() {
    let (_temp, engine) = setup_temp_engine();
    load(&engine, 20, "v");
    engine.flush().unwrap();

    let guard = engine.pause_compaction().unwrap();
    let err = engine.compact_range(None, None).unwrap_err();
    assert!(matches!(err, StrataError::InvalidArgument(_)), "unexpected error: {}", err);
    drop(guard);

    assert!(engine.compact_range(None, None).unwrap());
}

#[test]
fn test_compact_range_with_unflushed_data_rejected_while_paused() {
    let (_temp, engine) = setup_temp_engine();
    engine.put("a", "1").unwrap();
    let engine = Arc::new(engine);
    let guard = engine.pause_compaction().unwrap();

    let (tx, rx) = mpsc::channel();
    {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            let _ = tx.send(engine.compact_range(None, None));
        });
    }
    let result = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("compact_range blocked on a paused worker");
    assert!(matches!(result, Err(StrataError::InvalidArgument(_))), "unexpected result: {:?}", result);

    let err = engine.flush().unwrap_err();
    assert!(matches!(err, StrataError::InvalidArgument(_)), "unexpected error: {}", err);

    drop(guard);
    assert!(engine.compact_range(None, None).unwrap());
    assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
}

#[test]
fn test_writers_stall_while_paused_and_resume_after() {
    const WRITES: usize = 300;
    let (_temp, engine) = setup_temp_engine();
    let engine = Arc::new(engine);
    let guard = engine.pause_compaction().unwrap();

    // Far more than two memtables' worth, so the writer must wait on the flush
    let (tx, rx) = mpsc::channel();
    {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            for i in 0..WRITES {
                engine.put(key(i), "y".repeat(100)).unwrap();
            }
            let _ = tx.send(());
        });
    }

    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    assert!(engine.stats().sealed_memtable);
    assert_eq!(engine.num_files_at_level(0), 0);
    assert!(engine.last_sequence() < WRITES as u64);

    drop(guard);
    rx.recv_timeout(Duration::from_secs(10))
        .expect("writer still stalled after resume");
    assert_eq!(engine.last_sequence(), WRITES as u64);
    assert_eq!(all_entries(&engine).len(), WRITES);
    assert!(total_files(&engine) > 0);
}

#[test]
fn test_nested_pauses_resume_after_last_guard() {
    let (_temp, engine) = setup_temp_engine();
    let outer = engine.pause_compaction().unwrap();
    let inner = engine.pause_compaction().unwrap();
    drop(inner);

    for i in 0..80 {
        engine.put(key(i), "x".repeat(100)).unwrap();
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(engine.num_files_at_level(0), 0);

    drop(outer);
    engine.flush().unwrap();
    assert!(total_files(&engine) > 0);
}
