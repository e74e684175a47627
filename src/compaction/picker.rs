//! Compaction picking
//!
//! Size-triggered compactions take priority over seek-triggered ones. Within
//! a level, files are chosen round-robin starting after the level's compact
//! pointer so every part of the key space is eventually rewritten.

use std::cmp::Ordering;
use std::sync::Arc;

use super::Compaction;
use crate::config::NUM_LEVELS;
use crate::key::InternalKeyComparator;
use crate::version::{total_file_size, FileMetaData, VersionSet};

/// Smallest and largest internal key over `files`
fn key_range(icmp: &InternalKeyComparator, files: &[Arc<FileMetaData>]) -> (Vec<u8>, Vec<u8>) {
    let mut smallest = files[0].smallest.encoded();
    let mut largest = files[0].largest.encoded();
    for file in &files[1..] {
        if icmp.compare(file.smallest.encoded(), smallest) == Ordering::Less {
            smallest = file.smallest.encoded();
        }
        if icmp.compare(file.largest.encoded(), largest) == Ordering::Greater {
            largest = file.largest.encoded();
        }
    }
    (smallest.to_vec(), largest.to_vec())
}

fn user_key(internal_key: &[u8]) -> &[u8] {
    crate::key::extract_user_key(internal_key)
}

/// Choose the next automatic compaction, if any is due
pub fn pick_compaction(versions: &VersionSet) -> Option<Compaction> {
    let current = versions.current();
    let icmp = versions.comparator();

    let mut compaction = if current.compaction_score() >= 1.0 {
        let level = current.compaction_level();
        let mut c = Compaction::new(versions.config(), level, Arc::clone(&current));
        let pointer = versions.compact_pointer(level);
        let first_after_pointer = current.files(level).iter().find(|f| {
            pointer
                .as_deref()
                .map_or(true, |p| icmp.compare(f.largest.encoded(), p) == Ordering::Greater)
        });
        // Wrap around to the start of the key space
        let file = first_after_pointer.or_else(|| current.files(level).first())?;
        c.inputs_mut(0).push(Arc::clone(file));
        c
    } else if let Some((file, level)) = current.file_to_compact() {
        let mut c = Compaction::new(versions.config(), level, Arc::clone(&current));
        c.inputs_mut(0).push(file);
        c
    } else {
        return None;
    };

    // Overlapping level-0 files must move together
    if compaction.level() == 0 {
        let (smallest, largest) = key_range(icmp, compaction.inputs(0));
        let inputs = current.overlapping_inputs(0, Some(user_key(&smallest)), Some(user_key(&largest)));
        *compaction.inputs_mut(0) = inputs;
    }

    setup_other_inputs(versions, &mut compaction);
    Some(compaction)
}

/// Compaction of the files at `level` overlapping the user key range
/// `[begin, end]` (inclusive, `None` unbounded)
pub fn pick_range_compaction(
    versions: &VersionSet,
    level: usize,
    begin: Option<&[u8]>,
    end: Option<&[u8]>,
) -> Option<Compaction> {
    if level + 1 >= NUM_LEVELS {
        return None;
    }
    let current = versions.current();
    let mut inputs = current.overlapping_inputs(level, begin, end);
    if inputs.is_empty() {
        return None;
    }

    // Bound the work of one step; the caller loops until the range is done.
    // Level-0 inputs are never split because they may overlap.
    if level > 0 {
        let limit = versions.config().target_file_size;
        let mut total = 0;
        for i in 0..inputs.len() {
            total += inputs[i].file_size;
            if total >= limit {
                inputs.truncate(i + 1);
                break;
            }
        }
    }

    let mut compaction = Compaction::new(versions.config(), level, current);
    compaction.set_manual();
    *compaction.inputs_mut(0) = inputs;
    setup_other_inputs(versions, &mut compaction);
    Some(compaction)
}

/// Add the overlapping files of `level + 1`, grow the level inputs when that
/// is free, and record the grandparents and the next compact pointer
fn setup_other_inputs(versions: &VersionSet, c: &mut Compaction) {
    let level = c.level();
    let icmp = versions.comparator();
    let current = Arc::clone(c.input_version());

    let (smallest, mut largest) = key_range(icmp, c.inputs(0));
    *c.inputs_mut(1) =
        current.overlapping_inputs(level + 1, Some(user_key(&smallest)), Some(user_key(&largest)));

    let all_range = |c: &Compaction| {
        let all: Vec<Arc<FileMetaData>> = c.inputs(0).iter().chain(c.inputs(1)).cloned().collect();
        key_range(icmp, &all)
    };
    let (mut all_start, mut all_limit) = all_range(&*c);

    if !c.inputs(1).is_empty() {
        let expanded0 =
            current.overlapping_inputs(level, Some(user_key(&all_start)), Some(user_key(&all_limit)));
        let inputs1_size = total_file_size(c.inputs(1));
        let expanded0_size = total_file_size(&expanded0);
        if expanded0.len() > c.inputs(0).len()
            && inputs1_size + expanded0_size < versions.config().expanded_compaction_byte_limit()
        {
            let (new_start, new_limit) = key_range(icmp, &expanded0);
            let expanded1 =
                current.overlapping_inputs(level + 1, Some(user_key(&new_start)), Some(user_key(&new_limit)));
            if expanded1.len() == c.inputs(1).len() {
                tracing::debug!(
                    level,
                    from = c.inputs(0).len(),
                    to = expanded0.len(),
                    "expanding compaction inputs"
                );
                largest = new_limit;
                *c.inputs_mut(0) = expanded0;
                *c.inputs_mut(1) = expanded1;
                let (start, limit) = all_range(&*c);
                all_start = start;
                all_limit = limit;
            }
        }
    }

    if level + 2 < NUM_LEVELS {
        let grandparents =
            current.overlapping_inputs(level + 2, Some(user_key(&all_start)), Some(user_key(&all_limit)));
        c.set_grandparents(grandparents);
    }

    // The next compaction of this level starts after this one
    c.edit_mut().set_compact_pointer(level, largest);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::key::{encode_internal_key, BytewiseComparator, RecordKind};
    use crate::version::VersionEdit;

    fn ikey(k: &[u8]) -> Vec<u8> {
        encode_internal_key(k, 1, RecordKind::Value)
    }

    fn version_set(dir: &std::path::Path) -> VersionSet {
        let config = Arc::new(Config::builder().data_dir(dir).level0_compaction_trigger(2).build());
        VersionSet::new(dir, config, InternalKeyComparator::new(Arc::new(BytewiseComparator)))
    }

    #[test]
    fn test_nothing_to_pick_when_small() {
        let dir = tempfile::tempdir().unwrap();
        let set = version_set(dir.path());
        let mut edit = VersionEdit::new();
        edit.add_file(0, 5, 100, ikey(b"a"), ikey(b"c"));
        set.log_and_apply(edit).unwrap();
        assert!(pick_compaction(&set).is_none());
    }

    #[test]
    fn test_level0_pulls_overlapping_files() {
        let dir = tempfile::tempdir().unwrap();
        let set = version_set(dir.path());
        let mut edit = VersionEdit::new();
        edit.add_file(0, 5, 100, ikey(b"a"), ikey(b"c"));
        edit.add_file(0, 6, 100, ikey(b"b"), ikey(b"d"));
        edit.add_file(1, 7, 100, ikey(b"c"), ikey(b"e"));
        edit.add_file(1, 8, 100, ikey(b"x"), ikey(b"z"));
        set.log_and_apply(edit).unwrap();

        let c = pick_compaction(&set).expect("level 0 is over its trigger");
        assert_eq!(c.level(), 0);
        let level0: Vec<u64> = c.inputs(0).iter().map(|f| f.number).collect();
        let level1: Vec<u64> = c.inputs(1).iter().map(|f| f.number).collect();
        assert_eq!(level0, vec![5, 6]);
        assert_eq!(level1, vec![7]);
        assert!(!c.is_trivial_move());
    }

    #[test]
    fn test_range_compaction_without_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let set = version_set(dir.path());
        let mut edit = VersionEdit::new();
        edit.add_file(1, 5, 100, ikey(b"a"), ikey(b"c"));
        set.log_and_apply(edit).unwrap();

        assert!(pick_range_compaction(&set, 1, Some(b"x"), Some(b"z")).is_none());
        let c = pick_range_compaction(&set, 1, Some(b"b"), None).unwrap();
        assert!(c.is_manual());
        assert!(!c.is_trivial_move());
    }
}
