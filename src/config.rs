//! Configuration for Strata
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Result, StrataError};
use crate::key::{BytewiseComparator, Comparator};
use crate::snapshot::Snapshot;

/// Number of levels in the level set
pub const NUM_LEVELS: usize = 7;

/// Main configuration for a Strata instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── CURRENT            (name of the live manifest)
    ///     ├── LOCK               (advisory process lock)
    ///     ├── MANIFEST-000001    (version edits)
    ///     ├── 000002.log         (journal, one per memtable epoch)
    ///     └── 000003.sst         (table files)
    pub data_dir: PathBuf,

    /// Orders user keys; persisted by name in the manifest
    pub comparator: Arc<dyn Comparator>,

    /// Target size of a table file written by compaction (in bytes)
    pub target_file_size: u64,

    /// Maximum number of table readers kept open at once
    pub max_open_files: usize,

    // -------------------------------------------------------------------------
    // Journal Configuration
    // -------------------------------------------------------------------------
    /// Default for `WriteOptions::sync`: fsync the journal on every write
    pub sync_writes: bool,

    /// How journal corruption is handled during open
    pub recovery_mode: RecoveryMode,

    // -------------------------------------------------------------------------
    // MemTable Configuration
    // -------------------------------------------------------------------------
    /// Size of the active memtable before it is sealed (in bytes)
    pub write_buffer_size: usize,

    /// Flush the active memtable to a table file on `close`
    pub flush_on_close: bool,

    // -------------------------------------------------------------------------
    // Compaction Configuration
    // -------------------------------------------------------------------------
    /// Level-0 file count that triggers a compaction
    pub level0_compaction_trigger: usize,

    /// Level-0 file count at which writers block until compaction catches up
    pub level0_stop_writes_trigger: usize,

    /// Maximum total bytes of level 1; each deeper level is 10x larger
    pub level1_max_bytes: u64,
}

/// Journal recovery strictness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryMode {
    /// Interior journal corruption aborts open
    #[default]
    Strict,

    /// Interior journal corruption is skipped (used by repair)
    Lenient,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./strata_data"),
            comparator: Arc::new(BytewiseComparator),
            target_file_size: 2 * 1024 * 1024, // 2 MB
            max_open_files: 500,
            sync_writes: false,
            recovery_mode: RecoveryMode::Strict,
            write_buffer_size: 4 * 1024 * 1024, // 4 MB
            flush_on_close: true,
            level0_compaction_trigger: 4,
            level0_stop_writes_trigger: 12,
            level1_max_bytes: 10 * 1024 * 1024, // 10 MB
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject option combinations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(StrataError::InvalidArgument(msg.to_string()));
        if self.write_buffer_size == 0 {
            return invalid("write_buffer_size must be positive");
        }
        if self.target_file_size == 0 {
            return invalid("target_file_size must be positive");
        }
        if self.level1_max_bytes == 0 {
            return invalid("level1_max_bytes must be positive");
        }
        if self.level0_compaction_trigger == 0 {
            return invalid("level0_compaction_trigger must be at least 1");
        }
        if self.level0_stop_writes_trigger < self.level0_compaction_trigger {
            return invalid("level0_stop_writes_trigger must not be below level0_compaction_trigger");
        }
        Ok(())
    }

    /// Maximum total bytes for `level` (levels >= 1)
    pub fn max_bytes_for_level(&self, level: usize) -> f64 {
        let mut bytes = self.level1_max_bytes as f64;
        for _ in 1..level {
            bytes *= 10.0;
        }
        bytes
    }

    /// Upper bound on the bytes of level L+2 a single compaction output may overlap
    pub fn max_grandparent_overlap_bytes(&self) -> u64 {
        10 * self.target_file_size
    }

    /// Upper bound on the total input bytes of an expanded compaction
    pub fn expanded_compaction_byte_limit(&self) -> u64 {
        25 * self.target_file_size
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Override the user key comparator
    pub fn comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.config.comparator = comparator;
        self
    }

    /// Set the memtable seal threshold (in bytes)
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    /// Set the target table file size (in bytes)
    pub fn target_file_size(mut self, size: u64) -> Self {
        self.config.target_file_size = size;
        self
    }

    /// Set the number of table readers kept open
    pub fn max_open_files(mut self, count: usize) -> Self {
        self.config.max_open_files = count;
        self
    }

    /// Sync the journal on every write by default
    pub fn sync_writes(mut self, sync: bool) -> Self {
        self.config.sync_writes = sync;
        self
    }

    /// Set the journal recovery mode
    pub fn recovery_mode(mut self, mode: RecoveryMode) -> Self {
        self.config.recovery_mode = mode;
        self
    }

    /// Flush the memtable when the engine is closed
    pub fn flush_on_close(mut self, flush: bool) -> Self {
        self.config.flush_on_close = flush;
        self
    }

    /// Set the level-0 compaction trigger (file count)
    pub fn level0_compaction_trigger(mut self, count: usize) -> Self {
        self.config.level0_compaction_trigger = count;
        self
    }

    /// Set the level-0 file count at which writes stall
    pub fn level0_stop_writes_trigger(mut self, count: usize) -> Self {
        self.config.level0_stop_writes_trigger = count;
        self
    }

    /// Set the byte budget of level 1
    pub fn level1_max_bytes(mut self, bytes: u64) -> Self {
        self.config.level1_max_bytes = bytes;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

/// Per-write options
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// fsync the journal before acknowledging the write
    pub sync: bool,
}

impl WriteOptions {
    pub fn sync() -> Self {
        Self { sync: true }
    }
}

/// Per-read options
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions<'a> {
    /// Read as of this snapshot instead of the latest state
    pub snapshot: Option<&'a Snapshot>,
}

impl<'a> ReadOptions<'a> {
    pub fn at(snapshot: &'a Snapshot) -> Self {
        Self {
            snapshot: Some(snapshot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_stop_trigger_below_compaction_trigger_rejected() {
        let config = Config::builder()
            .level0_compaction_trigger(8)
            .level0_stop_writes_trigger(4)
            .build();
        assert!(matches!(config.validate(), Err(StrataError::InvalidArgument(_))));
    }

    #[test]
    fn test_level_budgets_grow_tenfold() {
        let config = Config::builder().level1_max_bytes(1000).build();
        assert_eq!(config.max_bytes_for_level(1), 1000.0);
        assert_eq!(config.max_bytes_for_level(3), 100_000.0);
    }
}
