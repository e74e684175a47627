//! # Strata
//!
//! An embedded, ordered key-value storage engine built on a log-structured
//! merge tree:
//! - Write-ahead journal with group commit for durability
//! - Memtable sealing and background flush to level-0 tables
//! - Leveled background compaction on a dedicated worker
//! - Multi-version snapshot reads and bidirectional iterators
//! - Crash recovery from the journal and manifest, plus manifest repair
//!
//! ## Architecture Overview
//!
//! ```text
//!      put / delete / write                 get / iter / snapshot
//!               │                                     │
//! ┌─────────────▼───────────┐          ┌──────────────▼──────────────┐
//! │  Write queue (leader    │          │  Read path: memtables, then │
//! │  commits the group)     │          │  level 0, then levels 1..6  │
//! └──────┬──────────────────┘          └──────────────▲──────────────┘
//!        │                                            │
//!        ▼                                            │
//!   ┌──────────┐    ┌────────────┐    seal    ┌───────┴──────┐
//!   │ Journal  │───▶│  MemTable  │───────────▶│   Sealed     │
//!   │ (append) │    │  (active)  │            │   MemTable   │
//!   └──────────┘    └────────────┘            └───────┬──────┘
//!                                                     │ flush worker
//!                                                     ▼
//!                     ┌──────────────────────────────────────────┐
//!                     │  Level 0 .. Level 6 table files          │
//!                     │  (VersionSet + MANIFEST, compaction      │
//!                     │   worker merges level L into L+1)        │
//!                     └──────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use strata::{Engine, ReadOptions};
//!
//! let engine = Engine::open_path("./data")?;
//! engine.put("key", "value")?;
//! let snapshot = engine.snapshot();
//! engine.delete("key")?;
//! assert_eq!(engine.get(b"key")?, None);
//! assert_eq!(engine.get_with(b"key", &ReadOptions::at(&snapshot))?, Some(b"value".to_vec()));
//! drop(snapshot);
//! engine.close()?;
//! # Ok::<(), strata::StrataError>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod key;
pub mod batch;
pub mod wal;
pub mod memtable;
pub mod storage;
pub mod version;
pub mod snapshot;
pub mod iterator;
pub mod compaction;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use batch::WriteBatch;
pub use compaction::{CompactionStats, SlotState};
pub use config::{Config, ConfigBuilder, ReadOptions, RecoveryMode, WriteOptions};
pub use engine::{CompactionPause, Engine, EngineStats, LevelStats};
pub use error::{Result, StrataError};
pub use iterator::{DbIterator, KeyRange};
pub use key::{BytewiseComparator, Comparator};
pub use snapshot::Snapshot;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of Strata
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
