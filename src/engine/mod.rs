//! Engine Module
//!
//! The storage engine facade that coordinates all components.
//!
//! ## Responsibilities
//! - Coordinate journal, memtables, table files and the level set
//! - Group concurrent writes into one journal record ([`write`])
//! - Seal full memtables and hand them to the flush worker
//! - Serve point reads and iterators at a snapshot sequence
//! - Recover from the journal and manifest on startup ([`recovery`])
//! - Rebuild a damaged manifest ([`repair`])
//!
//! ## Concurrency Model
//!
//! - **Writes**: one leader at a time commits a group of batches; the
//!   memtable pointers are swapped under `mem`, the journal under `journal`
//! - **Reads**: clone the memtable and version `Arc`s under brief locks, then
//!   run without any engine lock
//! - **Background**: flush and compaction run on two worker threads
//!   ([`background`]); writers blocked on backpressure wait on `mem_cv`

mod background;
mod recovery;
mod repair;
mod write;

use std::collections::HashSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::iter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel;
use fs2::FileExt;
use parking_lot::{Condvar, Mutex};

use crate::batch::WriteBatch;
use crate::compaction::{spawn_worker, Command, CompactionStats, ManualCompaction, SlotState, WorkerChannel};
use crate::config::{Config, ReadOptions, RecoveryMode, WriteOptions, NUM_LEVELS};
use crate::error::{Result, StrataError};
use crate::iterator::{BoxedIterator, DbIterator, InternalIterator, KeyRange, MergingIterator};
use crate::key::{InternalKeyComparator, LookupKey, ParsedInternalKey, RecordKind, SequenceNumber, MAX_SEQUENCE};
use crate::memtable::{MemTable, MemTableEntry};
use crate::snapshot::{Snapshot, SnapshotList};
use crate::storage::{lock_file_name, StorageManager};
use crate::version::{Version, VersionSet};
use crate::wal::WalWriter;

use background::{CompactionTask, FlushTask};
use write::WriteQueue;

/// Memtable pointers; swapped only by the write leader and the flush worker
pub(crate) struct MemState {
    /// Accepts writes
    active: Arc<MemTable>,
    /// Frozen, waiting for the flush worker
    sealed: Option<Arc<MemTable>>,
    /// Journal backing `active`
    log_number: u64,
}

/// What one point read or iterator reads from
struct ReadView {
    sequence: SequenceNumber,
    active: Arc<MemTable>,
    sealed: Option<Arc<MemTable>>,
    version: Arc<Version>,
}

/// State shared between the engine handle and its worker threads
pub(crate) struct EngineInner {
    config: Arc<Config>,
    icmp: InternalKeyComparator,
    versions: VersionSet,
    storage: Arc<StorageManager>,
    snapshots: Arc<SnapshotList>,

    mem: Mutex<MemState>,
    /// Signalled when the sealed slot clears, level 0 shrinks, or an error
    /// or shutdown wakes blocked writers
    mem_cv: Condvar,

    writers: Mutex<WriteQueue>,
    writers_cv: Condvar,
    journal: Mutex<WalWriter>,

    /// Table numbers being written that no version references yet
    pending_outputs: Mutex<HashSet<u64>>,
    bg_error: Mutex<Option<String>>,
    journal_fault: Mutex<Option<String>>,

    shutting_down: AtomicBool,
    pauses: AtomicUsize,
    open_iterators: Arc<AtomicUsize>,
    compaction_stats: Mutex<[CompactionStats; NUM_LEVELS]>,

    flush_worker: WorkerChannel,
    compaction_worker: WorkerChannel,
}

/// The main storage engine
///
/// All methods take `&self`; an `Engine` can be shared between threads
/// behind an `Arc`.
pub struct Engine {
    inner: Arc<EngineInner>,
    workers: Vec<JoinHandle<()>>,
    closed: bool,
    /// Held for the lifetime of the engine; dropping it releases `LOCK`
    _lock: File,
}

/// Take the advisory lock on `dir`
fn lock_directory(dir: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(lock_file_name(dir))?;
    file.try_lock_exclusive()
        .map_err(|_| StrataError::Locked(dir.to_path_buf()))?;
    Ok(file)
}

impl Engine {
    /// Open or create a database with the given config
    ///
    /// On startup:
    /// 1. Validate options and lock the data directory
    /// 2. Recover the level set and replay journals into level-0 tables
    /// 3. Start a fresh journal and manifest
    /// 4. Delete obsolete files and start the background workers
    pub fn open(config: Config) -> Result<Self> {
        // Step 1: Options and directory lock
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;
        let lock = lock_directory(&config.data_dir)?;

        let config = Arc::new(config);
        let icmp = InternalKeyComparator::new(Arc::clone(&config.comparator));
        let storage = Arc::new(StorageManager::new(
            &config.data_dir,
            icmp.clone(),
            config.max_open_files,
        ));
        let versions = VersionSet::new(&config.data_dir, Arc::clone(&config), icmp.clone());

        // Steps 2-3: Recover, replay, new journal + manifest
        let (journal, log_number) = recovery::recover(&config, &versions, &storage)?;

        let (flush_worker, flush_rx) = WorkerChannel::new("flush");
        let (compaction_worker, compaction_rx) = WorkerChannel::new("compaction");

        let inner = Arc::new(EngineInner {
            config: Arc::clone(&config),
            icmp: icmp.clone(),
            versions,
            storage,
            snapshots: Arc::new(SnapshotList::new()),
            mem: Mutex::new(MemState {
                active: Arc::new(MemTable::new(icmp)),
                sealed: None,
                log_number,
            }),
            mem_cv: Condvar::new(),
            writers: Mutex::new(WriteQueue::default()),
            writers_cv: Condvar::new(),
            journal: Mutex::new(journal),
            pending_outputs: Mutex::new(HashSet::new()),
            bg_error: Mutex::new(None),
            journal_fault: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            pauses: AtomicUsize::new(0),
            open_iterators: Arc::new(AtomicUsize::new(0)),
            compaction_stats: Mutex::new([CompactionStats::default(); NUM_LEVELS]),
            flush_worker,
            compaction_worker,
        });

        // Step 4: Sweep and start workers
        inner.remove_obsolete_files(true);

        let mut workers = Vec::with_capacity(2);
        workers.push(spawn_worker(
            Arc::new(FlushTask::new(Arc::clone(&inner))),
            flush_rx,
        )?);
        workers.push(spawn_worker(
            Arc::new(CompactionTask::new(Arc::clone(&inner))),
            compaction_rx,
        )?);

        if inner.versions.current().needs_compaction() {
            inner.compaction_worker.trigger();
        }

        tracing::info!(
            data_dir = %config.data_dir.display(),
            last_sequence = inner.versions.last_sequence(),
            levels = %inner.versions.level_summary(),
            "engine opened"
        );

        Ok(Self {
            inner,
            workers,
            closed: false,
            _lock: lock,
        })
    }

    /// Open with default options at the given path
    pub fn open_path(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(Config::builder().data_dir(path).build())
    }

    /// Best-effort recovery of a damaged database.
    ///
    /// Rebuilds the manifest from the table files in `config.data_dir`
    /// (unreadable tables are renamed to `*.sst.bad`), then opens the
    /// database with lenient journal recovery.
    pub fn repair(mut config: Config) -> Result<Self> {
        config.validate()?;
        repair::repair(&config)?;
        config.recovery_mode = RecoveryMode::Lenient;
        Self::open(config)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Put a key-value pair
    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch, &WriteOptions::default())
    }

    /// Delete a key
    pub fn delete(&self, key: impl Into<Vec<u8>>) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch, &WriteOptions::default())
    }

    /// Apply `batch` atomically.
    ///
    /// The batch is durable in the journal (synced when `options.sync` or
    /// `Config::sync_writes` is set) before it becomes visible to readers.
    pub fn write(&self, batch: WriteBatch, options: &WriteOptions) -> Result<()> {
        let sync = options.sync || self.inner.config.sync_writes;
        self.inner.write_internal(Some(batch), sync)
    }

    /// Seal the active memtable and wait until it is a level-0 table.
    ///
    /// Rejected with `InvalidArgument` while background work is paused.
    pub fn flush(&self) -> Result<()> {
        self.inner.check_background_running()?;
        self.inner.write_internal(None, false)?;
        self.inner.wait_for_flush()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get the latest value for a key
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_with(key, &ReadOptions::default())
    }

    /// Get a value, optionally as of a snapshot
    pub fn get_with(&self, key: &[u8], options: &ReadOptions<'_>) -> Result<Option<Vec<u8>>> {
        self.inner.get(key, options)
    }

    /// Iterator over the user-visible state, optionally bounded to `range`.
    ///
    /// The iterator starts unpositioned; call `seek_to_first`, `seek_to_last`
    /// or `seek` (or consume it with `entries()`).
    pub fn iter(&self, options: &ReadOptions<'_>, range: Option<KeyRange>) -> Result<DbIterator> {
        self.inner.iter(options, range.unwrap_or_default())
    }

    /// Pin the current state for consistent reads
    pub fn snapshot(&self) -> Snapshot {
        let inner = &self.inner;
        Snapshot::new(inner.versions.current(), Arc::clone(&inner.snapshots), || {
            inner.versions.last_sequence()
        })
    }

    /// Release a snapshot; equivalent to dropping it
    pub fn release_snapshot(&self, snapshot: Snapshot) {
        drop(snapshot);
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Compact every level holding user keys in `[begin, end]` (inclusive,
    /// `None` unbounded) into the next level.
    ///
    /// Returns `Ok(false)` when nothing overlaps the range, and
    /// `InvalidArgument` while background work is paused.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<bool> {
        let inner = &self.inner;
        inner.check_background_running()?;
        let mut did_work = false;

        let needs_flush = {
            let mem = inner.mem.lock();
            mem.sealed.is_some() || memtable_overlaps(&mem.active, begin, end)?
        };
        if needs_flush {
            self.flush()?;
            did_work = true;
        }

        let (reply, result) = channel::bounded(1);
        inner.compaction_worker.send(Command::Manual(ManualCompaction {
            begin: begin.map(<[u8]>::to_vec),
            end: end.map(<[u8]>::to_vec),
            reply,
        }))?;
        let compacted = result.recv().map_err(|_| StrataError::Closed)??;
        Ok(did_work || compacted)
    }

    /// Stop flushes and compactions until the returned guard is dropped.
    ///
    /// Returns once both workers have reached a checkpoint: a running
    /// compaction finishes its current output file and is abandoned.
    /// Writes keep going until the memtables fill up.
    pub fn pause_compaction(&self) -> Result<CompactionPause> {
        let inner = &self.inner;
        inner.pauses.fetch_add(1, Ordering::SeqCst);
        let guard = CompactionPause {
            inner: Arc::clone(inner),
        };
        // Callers blocked in `flush` must give up rather than wait on a paused worker
        inner.wake_writers();

        let mut acks = Vec::with_capacity(2);
        for worker in [&inner.flush_worker, &inner.compaction_worker] {
            let (ack, done) = channel::bounded(1);
            worker.send(Command::Pause(ack))?;
            acks.push(done);
        }
        for done in acks {
            done.recv().map_err(|_| StrataError::Closed)?;
        }
        tracing::info!("background work paused");
        Ok(guard)
    }

    /// Close the engine.
    ///
    /// Flushes the memtable when `Config::flush_on_close` is set, stops the
    /// workers, syncs the journal and deletes obsolete files. Returns the
    /// background error if a flush or compaction failed earlier.
    pub fn close(mut self) -> Result<()> {
        self.shutdown(true)
    }

    fn shutdown(&mut self, graceful: bool) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut result = Ok(());
        let inner = Arc::clone(&self.inner);
        let can_flush = inner.config.flush_on_close
            && inner.pauses.load(Ordering::SeqCst) == 0
            && inner.background_error().is_none()
            && inner.journal_fault.lock().is_none();
        if graceful && can_flush {
            if let Err(e) = self.flush() {
                tracing::warn!(error = %e, "flush on close failed");
                result = Err(e);
            }
        }

        inner.shutting_down.store(true, Ordering::SeqCst);
        inner.wake_writers();
        for worker in [&inner.flush_worker, &inner.compaction_worker] {
            // An exited worker has nothing left to stop
            let _ = worker.send(Command::Shutdown);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("background worker panicked");
            }
        }

        if let Err(e) = inner.journal.lock().sync() {
            tracing::warn!(error = %e, "failed to sync journal on close");
        }
        inner.remove_obsolete_files(false);
        tracing::info!(last_sequence = inner.versions.last_sequence(), "engine closed");

        if graceful {
            if let Some(e) = inner.background_error() {
                return Err(e);
            }
        }
        result
    }

    // =========================================================================
    // Accessors / Diagnostics
    // =========================================================================

    /// Number of table files at `level`
    pub fn num_files_at_level(&self, level: usize) -> usize {
        if level >= NUM_LEVELS {
            return 0;
        }
        self.inner.versions.current().num_files(level)
    }

    /// Approximate bytes of table data for user keys in `[start, limit)`
    pub fn approximate_size(&self, start: &[u8], limit: &[u8]) -> Result<u64> {
        let inner = &self.inner;
        let version = inner.versions.current();
        let start = LookupKey::new(start, MAX_SEQUENCE);
        let limit = LookupKey::new(limit, MAX_SEQUENCE);
        let from = version.approximate_offset_of(start.internal_key(), &inner.storage)?;
        let to = version.approximate_offset_of(limit.internal_key(), &inner.storage)?;
        Ok(to.saturating_sub(from))
    }

    /// Number of snapshots not yet released
    pub fn open_snapshots(&self) -> usize {
        self.inner.snapshots.len()
    }

    /// Number of iterators not yet dropped
    pub fn open_iterators(&self) -> usize {
        self.inner.open_iterators.load(Ordering::SeqCst)
    }

    /// Newest committed sequence number
    pub fn last_sequence(&self) -> SequenceNumber {
        self.inner.versions.last_sequence()
    }

    /// Get the config
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the data directory
    pub fn data_dir(&self) -> &Path {
        &self.inner.config.data_dir
    }

    /// Snapshot of the engine's counters
    pub fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        let version = inner.versions.current();
        let compaction = *inner.compaction_stats.lock();
        let levels = (0..NUM_LEVELS)
            .map(|level| LevelStats {
                files: version.num_files(level),
                bytes: version.level_bytes(level),
                compaction: compaction[level],
            })
            .collect();
        let (memtable_bytes, sealed_memtable) = {
            let mem = inner.mem.lock();
            (mem.active.approx_size(), mem.sealed.is_some())
        };

        EngineStats {
            levels,
            flush_state: inner.flush_worker.state(),
            compaction_state: inner.compaction_worker.state(),
            background_error: inner.bg_error.lock().clone(),
            journal_fault: inner.journal_fault.lock().clone(),
            last_sequence: inner.versions.last_sequence(),
            open_snapshots: inner.snapshots.len(),
            open_iterators: inner.open_iterators.load(Ordering::SeqCst),
            memtable_bytes,
            sealed_memtable,
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.shutdown(false);
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.inner.config.data_dir)
            .field("versions", &self.inner.versions)
            .finish()
    }
}

/// True if `memtable` holds a key in `[begin, end]`
fn memtable_overlaps(memtable: &Arc<MemTable>, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<bool> {
    let mut iter = memtable.iter();
    match begin {
        Some(begin) => iter.seek(LookupKey::new(begin, MAX_SEQUENCE).internal_key())?,
        None => iter.seek_to_first()?,
    }
    if !iter.valid() {
        return Ok(false);
    }
    let Some(end) = end else {
        return Ok(true);
    };
    let parsed = ParsedInternalKey::parse(iter.key())?;
    Ok(memtable.comparator().compare_user(parsed.user_key, end) != std::cmp::Ordering::Greater)
}

impl EngineInner {
    fn get(&self, key: &[u8], options: &ReadOptions<'_>) -> Result<Option<Vec<u8>>> {
        let ReadView {
            sequence,
            active,
            sealed,
            version,
        } = self.read_view(options);
        let lookup = LookupKey::new(key, sequence);

        for memtable in iter::once(&active).chain(sealed.as_ref()) {
            if let Some(entry) = memtable.get(&lookup) {
                return Ok(match entry {
                    MemTableEntry::Value(value) => Some(value),
                    MemTableEntry::Tombstone => None,
                });
            }
        }

        let (entry, stats) = version.get(&lookup, &self.storage)?;
        if version.update_stats(&stats) {
            self.compaction_worker.trigger();
        }
        Ok(entry.and_then(|e| match e.kind {
            RecordKind::Value => Some(e.value),
            RecordKind::Delete => None,
        }))
    }

    fn iter(&self, options: &ReadOptions<'_>, range: KeyRange) -> Result<DbIterator> {
        let ReadView {
            sequence,
            active,
            sealed,
            version,
        } = self.read_view(options);

        let mut children: Vec<BoxedIterator> = vec![Box::new(active.iter())];
        if let Some(sealed) = &sealed {
            children.push(Box::new(sealed.iter()));
        }
        children.extend(version.iterators(&self.storage)?);

        let merged = MergingIterator::new(self.icmp.clone(), children);
        Ok(DbIterator::new(
            merged,
            Arc::clone(self.icmp.user_comparator()),
            sequence,
            range,
            version,
            Arc::clone(&self.open_iterators),
        ))
    }

    /// Capture the read sequence, memtables and version in one step.
    ///
    /// A sealed memtable leaves `sealed` only after its table is in the
    /// current version, and the leader swaps memtables under `mem`, so under
    /// the lock every published sequence lives in exactly one of the three.
    /// Any version installed before this point was compacted with a bound at
    /// or below the sequence read here.
    fn read_view(&self, options: &ReadOptions<'_>) -> ReadView {
        let mem = self.mem.lock();
        let version = self.versions.current();
        let sequence = match options.snapshot {
            Some(snapshot) => snapshot.sequence(),
            None => self.versions.last_sequence(),
        };
        ReadView {
            sequence,
            active: Arc::clone(&mem.active),
            sealed: mem.sealed.clone(),
            version,
        }
    }

    /// Block until the sealed slot is empty
    fn wait_for_flush(&self) -> Result<()> {
        let mut mem = self.mem.lock();
        while mem.sealed.is_some() {
            if let Some(e) = self.background_error() {
                return Err(e);
            }
            self.check_background_running()?;
            self.mem_cv.wait(&mut mem);
        }
        Ok(())
    }

    /// `Closed` during shutdown, `InvalidArgument` while paused
    fn check_background_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(StrataError::Closed);
        }
        if self.pauses.load(Ordering::SeqCst) > 0 {
            return Err(StrataError::InvalidArgument("background work is paused".into()));
        }
        Ok(())
    }

    /// The sticky flush/compaction failure, if any
    fn background_error(&self) -> Option<StrataError> {
        self.bg_error.lock().clone().map(StrataError::Compaction)
    }

    fn record_background_error(&self, error: &StrataError) {
        {
            let mut slot = self.bg_error.lock();
            if slot.is_none() {
                *slot = Some(error.to_string());
            }
        }
        self.wake_writers();
    }

    /// Wake writers waiting on backpressure so they re-check their condition
    fn wake_writers(&self) {
        let _mem = self.mem.lock();
        self.mem_cv.notify_all();
    }

    /// True once a pause or shutdown wants background work to stop
    fn should_yield(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst) || self.pauses.load(Ordering::SeqCst) > 0
    }
}

/// Per-level counters in [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelStats {
    pub files: usize,
    pub bytes: u64,
    /// Compactions that wrote into this level (level 0: flushes)
    pub compaction: CompactionStats,
}

/// Point-in-time view of the engine's state
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub levels: Vec<LevelStats>,
    pub flush_state: SlotState,
    pub compaction_state: SlotState,
    pub background_error: Option<String>,
    pub journal_fault: Option<String>,
    pub last_sequence: SequenceNumber,
    pub open_snapshots: usize,
    pub open_iterators: usize,
    pub memtable_bytes: usize,
    pub sealed_memtable: bool,
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Level  Files  Size(MB)  Compactions  Time(ms)  Read(MB)  Write(MB)")?;
        writeln!(f, "-----------------------------------------------------------------")?;
        const MB: f64 = 1024.0 * 1024.0;
        for (level, stats) in self.levels.iter().enumerate() {
            if stats.files == 0 && stats.compaction.count == 0 {
                continue;
            }
            writeln!(
                f,
                "{:>5}  {:>5}  {:>8.2}  {:>11}  {:>8}  {:>8.2}  {:>9.2}",
                level,
                stats.files,
                stats.bytes as f64 / MB,
                stats.compaction.count,
                stats.compaction.micros / 1000,
                stats.compaction.bytes_read as f64 / MB,
                stats.compaction.bytes_written as f64 / MB,
            )?;
        }
        writeln!(f, "last sequence:     {}", self.last_sequence)?;
        writeln!(
            f,
            "memtable:          {} bytes{}",
            self.memtable_bytes,
            if self.sealed_memtable { " (+ sealed)" } else { "" }
        )?;
        writeln!(f, "flush worker:      {:?}", self.flush_state)?;
        writeln!(f, "compaction worker: {:?}", self.compaction_state)?;
        writeln!(f, "open snapshots:    {}", self.open_snapshots)?;
        write!(f, "open iterators:    {}", self.open_iterators)?;
        if let Some(e) = &self.background_error {
            write!(f, "\nbackground error:  {}", e)?;
        }
        if let Some(e) = &self.journal_fault {
            write!(f, "\njournal fault:     {}", e)?;
        }
        Ok(())
    }
}

/// Keeps background work paused while alive
#[must_use = "background work resumes as soon as the guard is dropped"]
pub struct CompactionPause {
    inner: Arc<EngineInner>,
}

impl Drop for CompactionPause {
    fn drop(&mut self) {
        let inner = &self.inner;
        if inner.pauses.fetch_sub(1, Ordering::SeqCst) == 1 {
            for worker in [&inner.flush_worker, &inner.compaction_worker] {
                let _ = worker.send(Command::Resume);
            }
            tracing::info!("background work resumed");
        }
    }
}

impl fmt::Debug for CompactionPause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompactionPause").finish()
    }
}
