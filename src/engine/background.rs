//! Background tasks
//!
//! [`FlushTask`] turns the sealed memtable into a level-0 table.
//! [`CompactionTask`] runs automatic and manual compactions. Both share the
//! engine state through `Arc<EngineInner>` and report failures as the
//! sticky background error.

use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::compaction::{
    build_table, pick_compaction, pick_range_compaction, trivial_move, BackgroundTask, Compaction,
    CompactionJob, CompactionStats, JobOutcome, ManualCompaction, SlotState, WorkerChannel,
};
use crate::config::NUM_LEVELS;
use crate::error::{Result, StrataError};
use crate::storage::{parse_file_name, FileType};
use crate::version::VersionEdit;

use super::EngineInner;

// =============================================================================
// Flush
// =============================================================================

pub(super) struct FlushTask {
    inner: Arc<EngineInner>,
}

impl FlushTask {
    pub(super) fn new(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }
}

impl BackgroundTask for FlushTask {
    fn channel(&self) -> &WorkerChannel {
        &self.inner.flush_worker
    }

    fn needs_work(&self) -> bool {
        self.inner.mem.lock().sealed.is_some()
    }

    fn run_once(&self) -> Result<()> {
        let inner = &self.inner;
        let (sealed, log_number) = {
            let mem = inner.mem.lock();
            match &mem.sealed {
                Some(sealed) => (Arc::clone(sealed), mem.log_number),
                None => return Ok(()),
            }
        };

        let started = Instant::now();
        let number = inner.versions.new_file_number();
        inner.pending_outputs.lock().insert(number);

        let installed = build_table(&inner.storage, number, &mut sealed.iter()).and_then(|table| {
            self.channel().set_state(SlotState::Committing);
            let mut edit = VersionEdit::new();
            if let Some(table) = &table {
                edit.add_file(
                    0,
                    number,
                    table.file_size,
                    table.smallest.clone(),
                    table.largest.clone(),
                );
            }
            // Everything up to the active journal is now in a table
            edit.set_log_number(log_number);
            inner.versions.log_and_apply(edit)?;
            Ok(table)
        });
        inner.pending_outputs.lock().remove(&number);
        let table = installed?;

        let stats = CompactionStats {
            count: 1,
            micros: started.elapsed().as_micros() as u64,
            bytes_read: 0,
            bytes_written: table.as_ref().map_or(0, |t| t.file_size),
        };
        inner.compaction_stats.lock()[0].add(&stats);
        tracing::info!(
            file = number,
            entries = table.as_ref().map_or(0, |t| t.entry_count),
            bytes = stats.bytes_written,
            micros = stats.micros,
            log_number,
            "memtable flushed to level 0"
        );

        inner.remove_obsolete_files(false);

        {
            let mut mem = inner.mem.lock();
            mem.sealed = None;
            inner.mem_cv.notify_all();
        }
        inner.compaction_worker.trigger();
        Ok(())
    }

    fn should_yield(&self) -> bool {
        self.inner.should_yield()
    }

    fn on_error(&self, error: StrataError) {
        self.inner.record_background_error(&error);
    }

    fn halted(&self) -> bool {
        self.inner.bg_error.lock().is_some()
    }
}

// =============================================================================
// Compaction
// =============================================================================

pub(super) struct CompactionTask {
    inner: Arc<EngineInner>,
}

impl CompactionTask {
    pub(super) fn new(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }
}

impl BackgroundTask for CompactionTask {
    fn channel(&self) -> &WorkerChannel {
        &self.inner.compaction_worker
    }

    fn needs_work(&self) -> bool {
        self.inner.versions.current().needs_compaction()
    }

    fn run_once(&self) -> Result<()> {
        let Some(compaction) = pick_compaction(&self.inner.versions) else {
            return Ok(());
        };
        self.inner.run_compaction(compaction)?;
        Ok(())
    }

    fn run_manual(&self, request: ManualCompaction) {
        let result = self
            .inner
            .manual_compaction(request.begin.as_deref(), request.end.as_deref());
        if let Err(e) = &result {
            tracing::warn!(error = %e, "manual compaction failed");
        }
        // The caller may have given up waiting
        let _ = request.reply.send(result);
    }

    fn should_yield(&self) -> bool {
        self.inner.should_yield()
    }

    fn on_error(&self, error: StrataError) {
        self.inner.record_background_error(&error);
    }

    fn halted(&self) -> bool {
        self.inner.bg_error.lock().is_some()
    }
}

impl EngineInner {
    /// Run one compaction to completion.
    ///
    /// Returns `Ok(false)` if the job was abandoned at a pause or shutdown
    /// checkpoint.
    fn run_compaction(&self, compaction: Compaction) -> Result<bool> {
        let output_level = compaction.output_level();
        if compaction.is_trivial_move() {
            self.compaction_worker.set_state(SlotState::Committing);
            trivial_move(compaction, &self.versions)?;
        } else {
            let smallest_snapshot = self
                .snapshots
                .smallest_visible(|| self.versions.last_sequence());
            let job = CompactionJob::new(
                compaction,
                &self.versions,
                &self.storage,
                &self.pending_outputs,
                smallest_snapshot,
            )
            .with_channel(&self.compaction_worker);

            match job.run(&|| self.should_yield())? {
                JobOutcome::Installed(stats) => {
                    self.compaction_stats.lock()[output_level].add(&stats);
                }
                JobOutcome::Abandoned => return Ok(false),
            }
        }

        tracing::debug!(levels = %self.versions.level_summary(), "compaction installed");
        self.remove_obsolete_files(false);
        // Level 0 may have shrunk below the stop trigger
        self.wake_writers();
        Ok(true)
    }

    /// Compact each level overlapping `[begin, end]` into the next one
    fn manual_compaction(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<bool> {
        let current = self.versions.current();
        let deepest = (0..NUM_LEVELS - 1)
            .rev()
            .find(|&level| !current.overlapping_inputs(level, begin, end).is_empty());
        drop(current);
        let Some(deepest) = deepest else {
            tracing::debug!("manual compaction: nothing in range");
            return Ok(false);
        };

        let mut did_work = false;
        for level in 0..=deepest {
            loop {
                if let Some(e) = self.background_error() {
                    return Err(e);
                }
                if self.shutting_down.load(Ordering::SeqCst) {
                    return Err(StrataError::Closed);
                }
                if self.pauses.load(Ordering::SeqCst) > 0 {
                    return Err(StrataError::InvalidArgument("background work is paused".into()));
                }

                let Some(compaction) = pick_range_compaction(&self.versions, level, begin, end) else {
                    break;
                };
                tracing::info!(level, "manual compaction step");
                match self.run_compaction(compaction) {
                    Ok(true) => did_work = true,
                    // Abandoned; the checks above report why on the next pass
                    Ok(false) => continue,
                    Err(e) => {
                        self.record_background_error(&e);
                        return Err(e);
                    }
                }
            }
        }
        Ok(did_work)
    }

    /// Delete files no live version, pending output or journal epoch needs.
    ///
    /// The directory is listed before the pending and live sets are read, so
    /// a file created concurrently is always covered by one of the two sets.
    /// Temp files are only removed at open.
    pub(super) fn remove_obsolete_files(&self, remove_temp: bool) {
        let dir = &self.config.data_dir;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to list data directory");
                return;
            }
        };
        let files: Vec<(String, FileType, u64)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?.to_string();
                let (file_type, number) = parse_file_name(&name)?;
                Some((name, file_type, number))
            })
            .collect();

        let pending = self.pending_outputs.lock().clone();
        let live = self.versions.live_files();
        let log_number = self.versions.log_number();
        let manifest_number = self.versions.manifest_number();

        for (name, file_type, number) in files {
            let keep = match file_type {
                FileType::Journal => number >= log_number,
                FileType::Manifest => number >= manifest_number,
                FileType::Table => live.contains(&number) || pending.contains(&number),
                FileType::Temp => !remove_temp,
                FileType::Current | FileType::Lock => true,
            };
            if keep {
                continue;
            }
            if file_type == FileType::Table {
                self.storage.evict(number);
            }
            match fs::remove_file(dir.join(&name)) {
                Ok(()) => tracing::debug!(file = %name, "deleted obsolete file"),
                Err(e) => tracing::warn!(file = %name, error = %e, "failed to delete obsolete file"),
            }
        }
    }
}
