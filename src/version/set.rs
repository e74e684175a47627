//! Version Set
//!
//! Owns the current [`Version`] and the manifest that records how it came
//! to be.
//!
//! ## Manifest
//! `MANIFEST-NNNNNN` holds journal-framed, bincode-encoded [`VersionEdit`]s.
//! The first record of a manifest is a full snapshot of the level set; every
//! later record is a delta. `CURRENT` names the live manifest. A new manifest
//! is started on the first install after open, so manifests never grow
//! across restarts.
//!
//! ## Concurrency:
//! - `current`: RwLock held only to clone or swap the `Arc`
//! - `state`: Mutex serializing installs; held across manifest I/O, which
//!   only the background workers and open contend for
//! - `live`: weak handles of every installed version, for the obsolete sweep

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::config::{Config, RecoveryMode, NUM_LEVELS};
use crate::error::{Result, StrataError};
use crate::key::{InternalKeyComparator, SequenceNumber};
use crate::storage::{manifest_file_name, read_current_file, set_current_file};
use crate::wal::{WalReader, WalWriter};

use super::{FileMetaData, Version, VersionEdit};

struct ManifestState {
    writer: Option<WalWriter>,
    /// Per level: internal key where the next round-robin compaction starts
    compact_pointers: Vec<Option<Vec<u8>>>,
}

/// The sequence of versions of one database
pub struct VersionSet {
    dir: PathBuf,
    config: Arc<Config>,
    icmp: InternalKeyComparator,

    next_file_number: AtomicU64,
    last_sequence: AtomicU64,
    log_number: AtomicU64,
    manifest_number: AtomicU64,

    current: RwLock<Arc<Version>>,
    live: Mutex<Vec<Weak<Version>>>,
    state: Mutex<ManifestState>,
}

impl VersionSet {
    /// Empty version set; call [`recover`](Self::recover) for an existing database
    pub fn new(dir: &Path, config: Arc<Config>, icmp: InternalKeyComparator) -> Self {
        let current = Arc::new(Version::empty(icmp.clone()));
        Self {
            dir: dir.to_path_buf(),
            config,
            icmp,
            next_file_number: AtomicU64::new(2),
            last_sequence: AtomicU64::new(0),
            log_number: AtomicU64::new(0),
            manifest_number: AtomicU64::new(0),
            live: Mutex::new(vec![Arc::downgrade(&current)]),
            current: RwLock::new(current),
            state: Mutex::new(ManifestState {
                writer: None,
                compact_pointers: vec![None; NUM_LEVELS],
            }),
        }
    }

    /// Load the level set named by `CURRENT`.
    ///
    /// Returns `Ok(false)` when the directory holds no database yet.
    pub fn recover(&self) -> Result<bool> {
        let Some(manifest_path) = read_current_file(&self.dir)? else {
            return Ok(false);
        };

        let mut reader = WalReader::open(&manifest_path, RecoveryMode::Strict)?;
        let mut builder = VersionBuilder::new(self.icmp.clone(), &self.current());
        let mut compact_pointers: Vec<Option<Vec<u8>>> = vec![None; NUM_LEVELS];
        let mut log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;
        let mut edits = 0usize;

        while let Some(record) = reader.next_record()? {
            let edit = VersionEdit::decode(&record)
                .map_err(|e| StrataError::Corruption(format!("{}: {}", manifest_path.display(), e)))?;

            if let Some(name) = &edit.comparator {
                let ours = self.icmp.user_comparator().name();
                if name != ours {
                    return Err(StrataError::InvalidArgument(format!(
                        "comparator mismatch: database uses {}, options use {}",
                        name, ours
                    )));
                }
            }

            builder.apply(&edit);
            for (level, key) in &edit.compact_pointers {
                compact_pointers[*level] = Some(key.clone());
            }
            log_number = edit.log_number.or(log_number);
            next_file_number = edit.next_file_number.or(next_file_number);
            last_sequence = edit.last_sequence.or(last_sequence);
            edits += 1;
        }

        let missing = |what: &str| {
            StrataError::Corruption(format!("{}: no {} entry", manifest_path.display(), what))
        };
        let log_number = log_number.ok_or_else(|| missing("log number"))?;
        let next_file_number = next_file_number.ok_or_else(|| missing("next file number"))?;
        let last_sequence = last_sequence.ok_or_else(|| missing("last sequence"))?;

        let mut version = Version::from_levels(self.icmp.clone(), builder.finish());
        version.finalize(&self.config);

        tracing::info!(
            manifest = %manifest_path.display(),
            edits,
            log_number,
            next_file_number,
            last_sequence,
            "recovered version set"
        );

        self.next_file_number.store(next_file_number, AtomicOrdering::SeqCst);
        self.mark_file_number_used(log_number);
        self.last_sequence.store(last_sequence, AtomicOrdering::SeqCst);
        self.log_number.store(log_number, AtomicOrdering::SeqCst);
        self.state.lock().compact_pointers = compact_pointers;
        self.install(Arc::new(version));
        Ok(true)
    }

    /// Apply `edit` to the current version, persist it and make the result current.
    ///
    /// The first call after open starts a new manifest holding a snapshot of
    /// the whole level set, then points `CURRENT` at it.
    pub fn log_and_apply(&self, mut edit: VersionEdit) -> Result<()> {
        let mut state = self.state.lock();

        match edit.log_number {
            Some(number) if number < self.log_number() => {
                return Err(StrataError::InvalidArgument(format!(
                    "log number went backwards: {} < {}",
                    number,
                    self.log_number()
                )));
            }
            Some(_) => {}
            None => edit.set_log_number(self.log_number()),
        }
        edit.set_last_sequence(self.last_sequence());

        let base = self.current();
        let mut builder = VersionBuilder::new(self.icmp.clone(), &base);
        builder.apply(&edit);
        let mut version = Version::from_levels(self.icmp.clone(), builder.finish());
        version.finalize(&self.config);

        let mut new_manifest = None;
        if state.writer.is_none() {
            let number = self.new_file_number();
            let path = manifest_file_name(&self.dir, number);
            let mut writer = WalWriter::create(&path)?;
            let snapshot = self.snapshot_edit(&base, &state.compact_pointers);
            if let Err(e) = writer.append(&snapshot.encode()?) {
                let _ = fs::remove_file(&path);
                return Err(e);
            }
            new_manifest = Some((number, path));
            state.writer = Some(writer);
        }
        edit.set_next_file_number(self.next_file_number());

        let written = self.write_edit(&mut state, &edit, new_manifest.as_ref().map(|(n, _)| *n));
        if let Err(e) = written {
            if let Some((_, path)) = &new_manifest {
                state.writer = None;
                let _ = fs::remove_file(path);
            }
            tracing::error!(error = %e, "failed to write manifest");
            return Err(e);
        }

        if let Some((number, path)) = new_manifest {
            tracing::debug!(manifest = %path.display(), "started new manifest");
            self.manifest_number.store(number, AtomicOrdering::SeqCst);
        }
        for (level, key) in &edit.compact_pointers {
            state.compact_pointers[*level] = Some(key.clone());
        }
        if let Some(number) = edit.log_number {
            self.log_number.store(number, AtomicOrdering::SeqCst);
        }
        self.install(Arc::new(version));
        Ok(())
    }

    fn write_edit(&self, state: &mut ManifestState, edit: &VersionEdit, new_manifest: Option<u64>) -> Result<()> {
        let encoded = edit.encode()?;
        let writer = state
            .writer
            .as_mut()
            .ok_or_else(|| StrataError::Corruption("manifest writer missing".into()))?;
        writer.append(&encoded)?;
        writer.sync()?;
        if let Some(number) = new_manifest {
            set_current_file(&self.dir, number)?;
        }
        Ok(())
    }

    /// Edit describing the full state of `version`
    fn snapshot_edit(&self, version: &Version, compact_pointers: &[Option<Vec<u8>>]) -> VersionEdit {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.icmp.user_comparator().name());
        edit.set_log_number(self.log_number());
        edit.set_next_file_number(self.next_file_number());
        edit.set_last_sequence(self.last_sequence());
        for (level, pointer) in compact_pointers.iter().enumerate() {
            if let Some(key) = pointer {
                edit.set_compact_pointer(level, key.clone());
            }
        }
        for level in 0..NUM_LEVELS {
            for file in version.files(level) {
                edit.add_file(
                    level,
                    file.number,
                    file.file_size,
                    file.smallest.encoded().to_vec(),
                    file.largest.encoded().to_vec(),
                );
            }
        }
        edit
    }

    fn install(&self, version: Arc<Version>) {
        {
            let mut live = self.live.lock();
            live.retain(|v| v.strong_count() > 0);
            live.push(Arc::downgrade(&version));
        }
        *self.current.write() = version;
    }

    /// The current version
    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current.read())
    }

    /// Every table file referenced by a version that is still alive
    pub fn live_files(&self) -> HashSet<u64> {
        let mut files: HashSet<u64> = self.current().file_numbers().collect();
        let mut live = self.live.lock();
        live.retain(|v| v.strong_count() > 0);
        for version in live.iter().filter_map(Weak::upgrade) {
            files.extend(version.file_numbers());
        }
        files
    }

    /// Number of versions still referenced somewhere
    pub fn live_versions(&self) -> usize {
        let mut live = self.live.lock();
        live.retain(|v| v.strong_count() > 0);
        live.len()
    }

    /// Round-robin start key for the next compaction of `level`
    pub fn compact_pointer(&self, level: usize) -> Option<Vec<u8>> {
        self.state.lock().compact_pointers[level].clone()
    }

    pub fn new_file_number(&self) -> u64 {
        self.next_file_number.fetch_add(1, AtomicOrdering::SeqCst)
    }

    /// Make sure `number` is never handed out again
    pub fn mark_file_number_used(&self, number: u64) {
        self.next_file_number.fetch_max(number + 1, AtomicOrdering::SeqCst);
    }

    pub fn next_file_number(&self) -> u64 {
        self.next_file_number.load(AtomicOrdering::SeqCst)
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence.load(AtomicOrdering::Acquire)
    }

    /// Publish `seq` as the newest visible sequence
    pub fn set_last_sequence(&self, seq: SequenceNumber) {
        debug_assert!(seq >= self.last_sequence());
        self.last_sequence.store(seq, AtomicOrdering::Release);
    }

    /// Journals numbered below this hold nothing that is not in a table
    pub fn log_number(&self) -> u64 {
        self.log_number.load(AtomicOrdering::SeqCst)
    }

    pub fn manifest_number(&self) -> u64 {
        self.manifest_number.load(AtomicOrdering::SeqCst)
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn comparator(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    /// One line per non-empty level, for logs and the admin tool
    pub fn level_summary(&self) -> String {
        let version = self.current();
        let counts: Vec<String> = (0..NUM_LEVELS)
            .map(|level| version.num_files(level).to_string())
            .collect();
        format!("files[ {} ]", counts.join(" "))
    }
}

impl std::fmt::Debug for VersionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionSet")
            .field("dir", &self.dir)
            .field("next_file_number", &self.next_file_number())
            .field("last_sequence", &self.last_sequence())
            .field("log_number", &self.log_number())
            .field("current", &self.current())
            .finish()
    }
}

/// Accumulates edits on top of a base version
struct VersionBuilder {
    icmp: InternalKeyComparator,
    base: Vec<Vec<Arc<FileMetaData>>>,
    deleted: Vec<HashSet<u64>>,
    added: Vec<Vec<Arc<FileMetaData>>>,
}

impl VersionBuilder {
    fn new(icmp: InternalKeyComparator, base: &Version) -> Self {
        Self {
            icmp,
            base: (0..NUM_LEVELS).map(|l| base.files(l).to_vec()).collect(),
            deleted: vec![HashSet::new(); NUM_LEVELS],
            added: vec![Vec::new(); NUM_LEVELS],
        }
    }

    fn apply(&mut self, edit: &VersionEdit) {
        for &(level, number) in &edit.deleted_files {
            self.deleted[level].insert(number);
            self.added[level].retain(|f| f.number != number);
        }
        for (level, file) in &edit.new_files {
            self.deleted[*level].remove(&file.number);
            self.added[*level].push(Arc::new(FileMetaData::new(
                file.number,
                file.file_size,
                file.smallest.clone(),
                file.largest.clone(),
            )));
        }
    }

    fn finish(self) -> Vec<Vec<Arc<FileMetaData>>> {
        let icmp = self.icmp;
        self.base
            .into_iter()
            .zip(self.added)
            .zip(self.deleted)
            .enumerate()
            .map(|(level, ((base, added), deleted))| {
                let mut files: Vec<Arc<FileMetaData>> = base
                    .into_iter()
                    .chain(added)
                    .filter(|f| !deleted.contains(&f.number))
                    .collect();
                if level == 0 {
                    files.sort_by_key(|f| f.number);
                } else {
                    files.sort_by(|a, b| {
                        icmp.compare(a.smallest.encoded(), b.smallest.encoded())
                            .then(a.number.cmp(&b.number))
                    });
                    debug_assert!(files.windows(2).all(|w| {
                        icmp.compare_user(w[0].largest_user_key(), w[1].smallest_user_key())
                            == std::cmp::Ordering::Less
                    }));
                }
                files
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{encode_internal_key, BytewiseComparator, RecordKind};

    fn open_set(dir: &Path) -> VersionSet {
        let config = Arc::new(Config::builder().data_dir(dir).build());
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        VersionSet::new(dir, config, icmp)
    }

    fn ikey(k: &[u8]) -> Vec<u8> {
        encode_internal_key(k, 1, RecordKind::Value)
    }

    #[test]
    fn test_fresh_directory_has_nothing_to_recover() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!open_set(dir.path()).recover().unwrap());
    }

    #[test]
    fn test_layout_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let set = open_set(dir.path());
            let number = set.new_file_number();
            let mut edit = VersionEdit::new();
            edit.set_log_number(1);
            edit.add_file(2, number, 512, ikey(b"a"), ikey(b"f"));
            set.set_last_sequence(17);
            set.log_and_apply(edit).unwrap();

            let mut edit = VersionEdit::new();
            edit.delete_file(2, number);
            edit.add_file(3, number, 512, ikey(b"a"), ikey(b"f"));
            set.log_and_apply(edit).unwrap();
        }

        let set = open_set(dir.path());
        assert!(set.recover().unwrap());
        let version = set.current();
        assert_eq!(version.num_files(2), 0);
        assert_eq!(version.num_files(3), 1);
        assert_eq!(set.last_sequence(), 17);
        assert_eq!(set.log_number(), 1);
    }

    #[test]
    fn test_pinned_version_keeps_files_live() {
        let dir = tempfile::tempdir().unwrap();
        let set = open_set(dir.path());
        let mut edit = VersionEdit::new();
        edit.add_file(0, 10, 100, ikey(b"a"), ikey(b"b"));
        set.log_and_apply(edit).unwrap();

        let pinned = set.current();
        let mut edit = VersionEdit::new();
        edit.delete_file(0, 10);
        set.log_and_apply(edit).unwrap();

        assert!(set.live_files().contains(&10));
        drop(pinned);
        assert!(!set.live_files().contains(&10));
    }
}
