//! Tests for background and journal failures
//!
//! These tests verify:
//! - A failed flush leaves a sticky error that later writes and close report
//! - A failed journal append rejects every later write while reads keep working

use std::fs;
use std::path::Path;

use strata::{Config, Engine, StrataError};
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

/// Occupy every unused file number below 200 with `make`
fn occupy_unused_numbers(dir: &Path, name: impl Fn(u64) -> String, make: impl Fn(&Path)) {
    for number in 1..200 {
        let path = dir.join(name(number));
        if !path.exists() {
            make(&path);
        }
    }
}

// =============================================================================
// Background Error Tests
// =============================================================================

#[test]
fn test_failed_flush_is_sticky() {
    let (temp, engine) = setup_temp_engine();
    engine.put("a", "1").unwrap();

    // A directory where the next table should go makes the flush fail
    occupy_unused_numbers(
        temp.path(),
        |n| format!("{:06}.sst", n),
        |path| fs::create_dir(path).unwrap(),
    );

    let err = engine.flush().unwrap_err();
    assert!(matches!(err, StrataError::Compaction(_)), "unexpected error: {}", err);
    assert!(engine.stats().background_error.is_some());

    let err = engine.put("b", "2").unwrap_err();
    assert!(matches!(err, StrataError::Compaction(_)), "unexpected error: {}", err);
    let err = engine.compact_range(None, None).unwrap_err();
    assert!(matches!(err, StrataError::Compaction(_)), "unexpected error: {}", err);

    // Data written before the failure is still readable from the sealed memtable
    assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));

    let err = engine.close().unwrap_err();
    assert!(matches!(err, StrataError::Compaction(_)), "unexpected error: {}", err);
}

// =============================================================================
// Journal Fault Tests
// =============================================================================

#[cfg(target_os = "linux")]
#[test]
fn test_failed_journal_append_is_sticky() {
    if !Path::new("/dev/full").exists() {
        return;
    }
    let (temp, engine) = setup_temp_engine();
    engine.put("a", "1").unwrap();

    // The journal opened by the next seal writes into a full device
    occupy_unused_numbers(
        temp.path(),
        |n| format!("{:06}.log", n),
        |path| std::os::unix::fs::symlink("/dev/full", path).unwrap(),
    );
    engine.flush().unwrap();

    let err = engine.put("b", "2").unwrap_err();
    assert!(matches!(err, StrataError::JournalFault(_)), "unexpected error: {}", err);
    let err = engine.put("c", "3").unwrap_err();
    assert!(matches!(err, StrataError::JournalFault(_)), "unexpected error: {}", err);

    assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.get(b"b").unwrap(), None);
    assert_eq!(engine.last_sequence(), 1);
}
