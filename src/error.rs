//! Error types for Strata
//!
//! Provides a unified error type for all operations. A missing key is not an
//! error: lookups return `Ok(None)`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using StrataError
pub type Result<T> = std::result::Result<T, StrataError>;

/// Unified error type for Strata operations
#[derive(Debug, Error)]
pub enum StrataError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // -------------------------------------------------------------------------
    // Data Integrity Errors
    // -------------------------------------------------------------------------
    /// Malformed journal, manifest or table record
    #[error("Corruption: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Sticky Background Errors
    // -------------------------------------------------------------------------
    /// A flush or compaction failed; automatic compaction is halted until reopen
    #[error("Compaction error: {0}")]
    Compaction(String),

    /// A journal write failed; all further writes are rejected
    #[error("Journal fault: {0}")]
    JournalFault(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Usage Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Engine is closed")]
    Closed,

    #[error("Database directory is locked by another process: {0}")]
    Locked(PathBuf),
}

impl StrataError {
    /// Build an equivalent error for fan-out to several callers.
    ///
    /// `io::Error` is not `Clone`, so I/O errors are rebuilt from their kind
    /// and message.
    pub fn duplicate(&self) -> StrataError {
        match self {
            StrataError::Io(e) => StrataError::Io(io::Error::new(e.kind(), e.to_string())),
            StrataError::Corruption(msg) => StrataError::Corruption(msg.clone()),
            StrataError::Compaction(msg) => StrataError::Compaction(msg.clone()),
            StrataError::JournalFault(msg) => StrataError::JournalFault(msg.clone()),
            StrataError::Serialization(msg) => StrataError::Serialization(msg.clone()),
            StrataError::InvalidArgument(msg) => StrataError::InvalidArgument(msg.clone()),
            StrataError::Closed => StrataError::Closed,
            StrataError::Locked(path) => StrataError::Locked(path.clone()),
        }
    }

    /// True for errors that indicate malformed on-disk data
    pub fn is_corruption(&self) -> bool {
        matches!(self, StrataError::Corruption(_))
    }
}

impl From<bincode::Error> for StrataError {
    fn from(e: bincode::Error) -> Self {
        StrataError::Serialization(e.to_string())
    }
}
