//! Write-Ahead Log (WAL) Module
//!
//! Provides durability guarantees through append-only logging.
//!
//! ## Responsibilities
//! - Append encoded write batches before they become visible
//! - CRC32 checksums for corruption detection
//! - Distinguish a torn tail (normal end of log) from interior corruption
//! - Crash recovery and replay
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Record 1                                │
//! │ ┌─────────┬─────────┬─────────────────┐ │
//! │ │ CRC (4) │ Len (4) │ Payload (batch) │ │
//! │ └─────────┴─────────┴─────────────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Record 2                                │
//! │ ┌─────────┬─────────┬─────────────────┐ │
//! │ │ CRC (4) │ Len (4) │ Payload (batch) │ │
//! │ └─────────┴─────────┴─────────────────┘ │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The CRC covers the length field and the payload. The same framing is
//! reused for manifest records.

mod reader;
mod record;
mod recovery;
mod writer;

pub use reader::WalReader;
pub use record::{encode_record, RECORD_HEADER_SIZE};
pub use recovery::{RecoveryResult, WalRecovery};
pub use writer::WalWriter;
