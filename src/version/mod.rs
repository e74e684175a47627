//! Version Module
//!
//! A [`Version`] is an immutable description of which table files live at
//! which level. The [`VersionSet`] owns the current version, persists every
//! change to the manifest and tracks older versions that are still pinned by
//! snapshots and iterators.
//!
//! ## Level layout
//! - Level 0: files flushed straight from memtables, may overlap, ordered by
//!   file number
//! - Level 1..: files are disjoint and ordered by smallest key

mod edit;
mod set;

pub use edit::{NewFile, VersionEdit};
pub use set::VersionSet;

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{Config, NUM_LEVELS};
use crate::error::Result;
use crate::iterator::{BoxedIterator, LevelIterator};
use crate::key::{InternalKey, InternalKeyComparator, LookupKey, MAX_SEQUENCE};
use crate::storage::{StorageManager, TableEntry};

/// Bytes of table data one seek is worth; a file may absorb
/// `size / SEEK_COST_BYTES` wasted seeks before it is compacted
const SEEK_COST_BYTES: u64 = 16 * 1024;

/// Lower bound on the seek allowance of a file
const MIN_ALLOWED_SEEKS: i64 = 100;

/// Metadata of one live table file
pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    /// Remaining wasted seeks before a seek compaction is requested
    allowed_seeks: AtomicI64,
}

impl FileMetaData {
    pub fn new(number: u64, file_size: u64, smallest: Vec<u8>, largest: Vec<u8>) -> Self {
        let allowed = ((file_size / SEEK_COST_BYTES) as i64).max(MIN_ALLOWED_SEEKS);
        Self {
            number,
            file_size,
            smallest: InternalKey::from_encoded(smallest),
            largest: InternalKey::from_encoded(largest),
            allowed_seeks: AtomicI64::new(allowed),
        }
    }

    pub fn smallest_user_key(&self) -> &[u8] {
        self.smallest.user_key()
    }

    pub fn largest_user_key(&self) -> &[u8] {
        self.largest.user_key()
    }

    pub fn allowed_seeks(&self) -> i64 {
        self.allowed_seeks.load(AtomicOrdering::Relaxed)
    }
}

impl fmt::Debug for FileMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} ({} bytes) [{:?} .. {:?}]",
            self.number, self.file_size, self.smallest, self.largest
        )
    }
}

/// Read-path bookkeeping returned by [`Version::get`]
#[derive(Debug, Default)]
pub struct GetStats {
    /// First file probed when a lookup had to probe more than one file
    pub seek_file: Option<(Arc<FileMetaData>, usize)>,
}

/// Index of the first file whose largest key is >= `internal_key`
///
/// `files` must be disjoint and sorted (levels >= 1).
pub fn find_file(icmp: &InternalKeyComparator, files: &[Arc<FileMetaData>], internal_key: &[u8]) -> usize {
    files.partition_point(|f| icmp.compare(f.largest.encoded(), internal_key) == Ordering::Less)
}

/// Total size in bytes of `files`
pub fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

/// Immutable set of table files per level
pub struct Version {
    levels: Vec<Vec<Arc<FileMetaData>>>,
    icmp: InternalKeyComparator,

    /// Level that most needs compaction and its score (>= 1 means due)
    compaction_level: usize,
    compaction_score: f64,

    /// File whose seek allowance ran out, with its level
    file_to_compact: Mutex<Option<(Arc<FileMetaData>, usize)>>,
}

impl Version {
    pub(crate) fn empty(icmp: InternalKeyComparator) -> Self {
        Self::from_levels(icmp, vec![Vec::new(); NUM_LEVELS])
    }

    pub(crate) fn from_levels(icmp: InternalKeyComparator, levels: Vec<Vec<Arc<FileMetaData>>>) -> Self {
        debug_assert_eq!(levels.len(), NUM_LEVELS);
        Self {
            levels,
            icmp,
            compaction_level: 0,
            compaction_score: 0.0,
            file_to_compact: Mutex::new(None),
        }
    }

    /// Compute the size-triggered compaction score
    pub(crate) fn finalize(&mut self, config: &Config) {
        let mut best_level = 0;
        let mut best_score = -1.0;
        for level in 0..NUM_LEVELS - 1 {
            let score = if level == 0 {
                self.levels[0].len() as f64 / config.level0_compaction_trigger.max(1) as f64
            } else {
                total_file_size(&self.levels[level]) as f64 / config.max_bytes_for_level(level)
            };
            if score > best_score {
                best_level = level;
                best_score = score;
            }
        }
        self.compaction_level = best_level;
        self.compaction_score = best_score;
    }

    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.levels[level]
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.levels[level].len()
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        total_file_size(&self.levels[level])
    }

    /// Every file number referenced by this version
    pub fn file_numbers(&self) -> impl Iterator<Item = u64> + '_ {
        self.levels.iter().flatten().map(|f| f.number)
    }

    pub fn comparator(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    pub fn compaction_score(&self) -> f64 {
        self.compaction_score
    }

    pub fn compaction_level(&self) -> usize {
        self.compaction_level
    }

    /// True if a size or seek triggered compaction is due
    pub fn needs_compaction(&self) -> bool {
        self.compaction_score >= 1.0 || self.file_to_compact.lock().is_some()
    }

    pub(crate) fn file_to_compact(&self) -> Option<(Arc<FileMetaData>, usize)> {
        self.file_to_compact.lock().clone()
    }

    /// Look `lookup` up in the table files.
    ///
    /// Level 0 files may overlap, so every candidate is probed and the entry
    /// with the highest sequence wins. Deeper levels hold at most one
    /// candidate each and the search stops at the first hit.
    pub fn get(&self, lookup: &LookupKey, storage: &StorageManager) -> Result<(Option<TableEntry>, GetStats)> {
        let user_key = lookup.user_key();
        let mut first_probed: Option<(Arc<FileMetaData>, usize)> = None;
        let mut probes = 0usize;

        let stats = |first: Option<(Arc<FileMetaData>, usize)>, probes: usize| GetStats {
            seek_file: if probes > 1 { first } else { None },
        };

        let mut best: Option<TableEntry> = None;
        for file in self.levels[0].iter().rev() {
            if self.icmp.compare_user(user_key, file.smallest_user_key()) == Ordering::Less
                || self.icmp.compare_user(user_key, file.largest_user_key()) == Ordering::Greater
            {
                continue;
            }
            probes += 1;
            if first_probed.is_none() {
                first_probed = Some((Arc::clone(file), 0));
            }
            if let Some(entry) = storage.get(file.number, lookup)? {
                if best.as_ref().map_or(true, |b| entry.sequence > b.sequence) {
                    best = Some(entry);
                }
            }
        }
        if best.is_some() {
            return Ok((best, stats(first_probed, probes)));
        }

        for level in 1..NUM_LEVELS {
            let files = &self.levels[level];
            let index = find_file(&self.icmp, files, lookup.internal_key());
            let Some(file) = files.get(index) else {
                continue;
            };
            if self.icmp.compare_user(user_key, file.smallest_user_key()) == Ordering::Less {
                continue;
            }
            probes += 1;
            if first_probed.is_none() {
                first_probed = Some((Arc::clone(file), level));
            }
            if let Some(entry) = storage.get(file.number, lookup)? {
                return Ok((Some(entry), stats(first_probed, probes)));
            }
        }

        Ok((None, stats(first_probed, probes)))
    }

    /// Charge a wasted seek; returns true if a compaction should be scheduled
    pub fn update_stats(&self, stats: &GetStats) -> bool {
        if let Some((file, level)) = &stats.seek_file {
            let remaining = file.allowed_seeks.fetch_sub(1, AtomicOrdering::Relaxed) - 1;
            if remaining <= 0 {
                let mut slot = self.file_to_compact.lock();
                if slot.is_none() {
                    tracing::debug!(file = file.number, level, "seek allowance exhausted");
                    *slot = Some((Arc::clone(file), *level));
                    return true;
                }
            }
        }
        false
    }

    /// Files at `level` whose user key range intersects `[begin, end]`.
    ///
    /// `None` bounds are open. At level 0 the range grows to cover every file
    /// it touches, because overlapping level-0 files must move together.
    pub fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<FileMetaData>> {
        let mut begin = begin.map(|b| b.to_vec());
        let mut end = end.map(|e| e.to_vec());
        let mut inputs = Vec::new();

        let mut i = 0;
        while i < self.levels[level].len() {
            let file = &self.levels[level][i];
            i += 1;
            let file_start = file.smallest_user_key();
            let file_limit = file.largest_user_key();

            if let Some(b) = &begin {
                if self.icmp.compare_user(file_limit, b) == Ordering::Less {
                    continue;
                }
            }
            if let Some(e) = &end {
                if self.icmp.compare_user(file_start, e) == Ordering::Greater {
                    continue;
                }
            }

            inputs.push(Arc::clone(file));
            if level == 0 {
                let widens_begin = begin
                    .as_ref()
                    .map_or(false, |b| self.icmp.compare_user(file_start, b) == Ordering::Less);
                let widens_end = end
                    .as_ref()
                    .map_or(false, |e| self.icmp.compare_user(file_limit, e) == Ordering::Greater);
                if widens_begin || widens_end {
                    if widens_begin {
                        begin = Some(file_start.to_vec());
                    }
                    if widens_end {
                        end = Some(file_limit.to_vec());
                    }
                    inputs.clear();
                    i = 0;
                }
            }
        }
        inputs
    }

    /// True if some file at `level` overlaps the user key range
    pub fn overlap_in_level(&self, level: usize, smallest: Option<&[u8]>, largest: Option<&[u8]>) -> bool {
        let files = &self.levels[level];
        let after = |f: &FileMetaData| {
            smallest.map_or(false, |s| self.icmp.compare_user(s, f.largest_user_key()) == Ordering::Greater)
        };
        let before = |f: &FileMetaData| {
            largest.map_or(false, |l| self.icmp.compare_user(l, f.smallest_user_key()) == Ordering::Less)
        };

        if level == 0 {
            return files.iter().any(|f| !after(f) && !before(f));
        }

        let index = match smallest {
            Some(s) => {
                let probe = LookupKey::new(s, MAX_SEQUENCE);
                find_file(&self.icmp, files, probe.internal_key())
            }
            None => 0,
        };
        files.get(index).map_or(false, |f| !before(f))
    }

    /// One iterator per level-0 file plus one concatenating iterator per
    /// deeper non-empty level
    pub fn iterators(&self, storage: &Arc<StorageManager>) -> Result<Vec<BoxedIterator>> {
        let mut iters: Vec<BoxedIterator> = Vec::new();
        for file in &self.levels[0] {
            iters.push(Box::new(storage.iter(file.number)?));
        }
        for level in 1..NUM_LEVELS {
            if !self.levels[level].is_empty() {
                iters.push(Box::new(LevelIterator::new(
                    Arc::clone(storage),
                    self.icmp.clone(),
                    self.levels[level].clone(),
                )));
            }
        }
        Ok(iters)
    }

    /// Approximate number of table bytes that sort before `internal_key`
    pub fn approximate_offset_of(&self, internal_key: &[u8], storage: &StorageManager) -> Result<u64> {
        let mut result = 0;
        for (level, files) in self.levels.iter().enumerate() {
            for file in files {
                if self.icmp.compare(file.largest.encoded(), internal_key) != Ordering::Greater {
                    result += file.file_size;
                } else if self.icmp.compare(file.smallest.encoded(), internal_key) == Ordering::Greater {
                    if level > 0 {
                        break;
                    }
                } else {
                    result += storage.approximate_offset_of(file.number, internal_key)?;
                }
            }
        }
        Ok(result)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_map();
        for (level, files) in self.levels.iter().enumerate() {
            if !files.is_empty() {
                list.entry(&level, files);
            }
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{encode_internal_key, BytewiseComparator, RecordKind};

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn file(number: u64, smallest: &[u8], largest: &[u8]) -> Arc<FileMetaData> {
        Arc::new(FileMetaData::new(
            number,
            1000,
            encode_internal_key(smallest, 100, RecordKind::Value),
            encode_internal_key(largest, 100, RecordKind::Value),
        ))
    }

    fn version_with(level: usize, files: Vec<Arc<FileMetaData>>) -> Version {
        let mut levels = vec![Vec::new(); NUM_LEVELS];
        levels[level] = files;
        Version::from_levels(icmp(), levels)
    }

    #[test]
    fn test_find_file() {
        let files = vec![file(1, b"a", b"c"), file(2, b"e", b"g"), file(3, b"k", b"m")];
        let cmp = icmp();
        let probe = |k: &[u8]| find_file(&cmp, &files, LookupKey::new(k, 200).internal_key());
        assert_eq!(probe(b"a"), 0);
        assert_eq!(probe(b"d"), 1);
        assert_eq!(probe(b"g"), 1);
        assert_eq!(probe(b"h"), 2);
        assert_eq!(probe(b"z"), 3);
    }

    #[test]
    fn test_overlap_in_level() {
        let v = version_with(2, vec![file(1, b"b", b"d"), file(2, b"h", b"j")]);
        assert!(v.overlap_in_level(2, Some(b"a"), Some(b"b")));
        assert!(!v.overlap_in_level(2, Some(b"e"), Some(b"g")));
        assert!(v.overlap_in_level(2, None, None));
        assert!(!v.overlap_in_level(2, Some(b"k"), None));
    }

    #[test]
    fn test_level0_overlap_expands() {
        let v = version_with(
            0,
            vec![file(1, b"a", b"c"), file(2, b"b", b"f"), file(3, b"e", b"h"), file(4, b"x", b"z")],
        );
        let inputs = v.overlapping_inputs(0, Some(b"a"), Some(b"a"));
        let numbers: Vec<u64> = inputs.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn test_seek_allowance_marks_file() {
        let v = version_with(1, vec![file(9, b"a", b"z")]);
        let f = Arc::clone(&v.files(1)[0]);
        let stats = GetStats {
            seek_file: Some((f, 1)),
        };
        let mut scheduled = false;
        for _ in 0..MIN_ALLOWED_SEEKS {
            scheduled |= v.update_stats(&stats);
        }
        assert!(scheduled);
        assert!(v.needs_compaction());
    }
}
