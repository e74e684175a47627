//! Compaction Module
//!
//! Background maintenance of the level tree.
//!
//! ## Responsibilities
//! - Choose what to compact: size score, exhausted seek allowance, or a
//!   manual key range ([`picker`])
//! - Merge the chosen tables into new, size-bounded tables one level down,
//!   dropping versions no reader can see any more ([`job`])
//! - Run flush and compaction on two worker threads driven by command
//!   queues ([`scheduler`])

pub mod job;
pub mod picker;
pub mod scheduler;

pub use job::{build_table, trivial_move, CompactionJob, JobOutcome};
pub use picker::{pick_compaction, pick_range_compaction};
pub use scheduler::{spawn_worker, BackgroundTask, Command, ManualCompaction, SlotState, WorkerChannel};

use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::{Config, NUM_LEVELS};
use crate::key::InternalKeyComparator;
use crate::version::{total_file_size, FileMetaData, Version, VersionEdit};

/// Per-level totals of finished compactions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub count: u64,
    pub micros: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl CompactionStats {
    pub fn add(&mut self, other: &CompactionStats) {
        self.count += other.count;
        self.micros += other.micros;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
    }
}

/// One compaction: inputs from `level` and `level + 1`, output to `level + 1`
pub struct Compaction {
    level: usize,
    max_output_file_size: u64,
    max_grandparent_overlap: u64,
    manual: bool,
    input_version: Arc<Version>,
    icmp: InternalKeyComparator,
    edit: VersionEdit,

    /// `[files at level, files at level + 1]`
    inputs: [Vec<Arc<FileMetaData>>; 2],

    /// Files at `level + 2` overlapping the compaction range
    grandparents: Vec<Arc<FileMetaData>>,
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,

    /// Per level, the file `is_base_level_for_key` looks at next
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    pub(crate) fn new(config: &Config, level: usize, version: Arc<Version>) -> Self {
        Self {
            level,
            max_output_file_size: config.target_file_size,
            max_grandparent_overlap: config.max_grandparent_overlap_bytes(),
            manual: false,
            icmp: version.comparator().clone(),
            input_version: version,
            edit: VersionEdit::new(),
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn output_level(&self) -> usize {
        self.level + 1
    }

    pub fn is_manual(&self) -> bool {
        self.manual
    }

    pub(crate) fn set_manual(&mut self) {
        self.manual = true;
    }

    pub fn input_version(&self) -> &Arc<Version> {
        &self.input_version
    }

    /// `which` is 0 for `level`, 1 for `level + 1`
    pub fn inputs(&self, which: usize) -> &[Arc<FileMetaData>] {
        &self.inputs[which]
    }

    pub(crate) fn inputs_mut(&mut self, which: usize) -> &mut Vec<Arc<FileMetaData>> {
        &mut self.inputs[which]
    }

    pub(crate) fn set_grandparents(&mut self, files: Vec<Arc<FileMetaData>>) {
        self.grandparents = files;
    }

    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    pub fn edit_mut(&mut self) -> &mut VersionEdit {
        &mut self.edit
    }

    pub fn into_edit(self) -> VersionEdit {
        self.edit
    }

    /// Total bytes of all input files
    pub fn input_bytes(&self) -> u64 {
        total_file_size(&self.inputs[0]) + total_file_size(&self.inputs[1])
    }

    /// A single file with nothing to merge against can move down by
    /// metadata edit alone, unless it would create an expensive overlap
    /// with the grandparent level
    pub fn is_trivial_move(&self) -> bool {
        !self.manual
            && self.inputs[0].len() == 1
            && self.inputs[1].is_empty()
            && total_file_size(&self.grandparents) <= self.max_grandparent_overlap
    }

    /// Record the deletion of every input file in the edit
    pub fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for file in &self.inputs[which] {
                self.edit.delete_file(self.level + which, file.number);
            }
        }
    }

    /// True if no level below the output level can hold `user_key`.
    ///
    /// Keys must be passed in ascending order.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        for level in self.level + 2..NUM_LEVELS {
            let files = self.input_version.files(level);
            while self.level_ptrs[level] < files.len() {
                let file = &files[self.level_ptrs[level]];
                if self.icmp.compare_user(user_key, file.largest_user_key()) != Ordering::Greater {
                    if self.icmp.compare_user(user_key, file.smallest_user_key()) != Ordering::Less {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// True if the output file should end before `internal_key` because it
    /// already overlaps too much of the grandparent level.
    ///
    /// Keys must be passed in ascending order.
    pub fn should_stop_before(&mut self, internal_key: &[u8]) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && self.icmp.compare(
                internal_key,
                self.grandparents[self.grandparent_index].largest.encoded(),
            ) == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.max_grandparent_overlap {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for Compaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let numbers = |files: &[Arc<FileMetaData>]| files.iter().map(|f| f.number).collect::<Vec<_>>();
        f.debug_struct("Compaction")
            .field("level", &self.level)
            .field("inputs", &numbers(&self.inputs[0]))
            .field("next_level_inputs", &numbers(&self.inputs[1]))
            .field("grandparents", &self.grandparents.len())
            .field("manual", &self.manual)
            .finish()
    }
}
