//! WAL Recovery
//!
//! Replays a journal file as a sequence of write batches.

use std::path::Path;

use super::WalReader;
use crate::batch::WriteBatch;
use crate::config::RecoveryMode;
use crate::error::Result;
use crate::key::SequenceNumber;

/// Handles journal replay after a restart or crash
pub struct WalRecovery;

/// Result of a recovery operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of batches successfully recovered
    pub batches_recovered: u64,

    /// Number of corrupted interior records skipped (lenient mode only)
    pub records_corrupted: u64,

    /// Sequence number of the last operation recovered (0 if none)
    pub last_sequence: SequenceNumber,

    /// Whether a partial trailing record was dropped
    pub was_truncated: bool,
}

impl WalRecovery {
    /// Stream every valid batch of `path` into `apply`, in append order
    pub fn replay_with<F>(path: &Path, mode: RecoveryMode, mut apply: F) -> Result<RecoveryResult>
    where
        F: FnMut(WriteBatch) -> Result<()>,
    {
        let mut reader = WalReader::open(path, mode)?;
        let mut result = RecoveryResult::default();

        while let Some(payload) = reader.next_record()? {
            let batch = match WriteBatch::decode(&payload) {
                Ok(batch) => batch,
                Err(e) if mode == RecoveryMode::Lenient => {
                    tracing::warn!(error = %e, path = %path.display(), "Skipping undecodable journal batch");
                    reader.note_corrupted();
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !batch.is_empty() {
                result.last_sequence = result.last_sequence.max(batch.last_sequence());
            }
            result.batches_recovered += 1;
            apply(batch)?;
        }

        result.records_corrupted = reader.records_corrupted();
        result.was_truncated = reader.was_truncated();
        Ok(result)
    }

    /// Recover all batches of a journal file
    pub fn replay(path: &Path, mode: RecoveryMode) -> Result<(Vec<WriteBatch>, RecoveryResult)> {
        let mut batches = Vec::new();
        let result = Self::replay_with(path, mode, |batch| {
            batches.push(batch);
            Ok(())
        })?;
        Ok((batches, result))
    }

    /// Verify integrity of a journal file without keeping its contents
    pub fn verify(path: &Path) -> Result<RecoveryResult> {
        Self::replay_with(path, RecoveryMode::Strict, |_| Ok(()))
    }
}
