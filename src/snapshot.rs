//! Snapshot registry
//!
//! Tracks the sequence numbers of open snapshots so compaction never drops a
//! version some snapshot can still read. A [`Snapshot`] also pins the
//! version that was current when it was taken, keeping that version's table
//! files on disk until the snapshot is released.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::key::SequenceNumber;
use crate::version::Version;

/// Reference counts of open snapshots, keyed by sequence
#[derive(Debug, Default)]
pub(crate) struct SnapshotList {
    open: Mutex<BTreeMap<SequenceNumber, usize>>,
}

impl SnapshotList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a snapshot at the sequence `current` returns.
    ///
    /// The sequence is read under the list lock, so it is never older than
    /// a bound [`smallest_visible`](Self::smallest_visible) already handed out.
    fn acquire_current(&self, current: impl FnOnce() -> SequenceNumber) -> SequenceNumber {
        let mut open = self.open.lock();
        let seq = current();
        *open.entry(seq).or_insert(0) += 1;
        seq
    }

    fn release(&self, seq: SequenceNumber) {
        let mut open = self.open.lock();
        if let Some(count) = open.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                open.remove(&seq);
            }
        }
    }

    /// Oldest sequence any reader may still ask for: the oldest open
    /// snapshot, or `current()` when none is open.
    ///
    /// Compaction may drop a version only if a newer version of the same key
    /// is at or below this bound.
    pub(crate) fn smallest_visible(&self, current: impl FnOnce() -> SequenceNumber) -> SequenceNumber {
        let open = self.open.lock();
        match open.keys().next() {
            Some(&oldest) => oldest,
            None => current(),
        }
    }

    /// Number of open snapshots
    pub(crate) fn len(&self) -> usize {
        self.open.lock().values().sum()
    }
}

/// A consistent read point.
///
/// Reads through a snapshot never observe writes committed after it was
/// taken. Dropping the snapshot releases it.
pub struct Snapshot {
    sequence: SequenceNumber,
    _version: Arc<Version>,
    list: Arc<SnapshotList>,
}

impl Snapshot {
    /// Pin `version` and register a snapshot at the sequence `current` returns
    pub(crate) fn new(
        version: Arc<Version>,
        list: Arc<SnapshotList>,
        current: impl FnOnce() -> SequenceNumber,
    ) -> Self {
        let sequence = list.acquire_current(current);
        Self {
            sequence,
            _version: version,
            list,
        }
    }

    /// Newest sequence visible through this snapshot
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.list.release(self.sequence);
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("sequence", &self.sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{BytewiseComparator, InternalKeyComparator};

    fn version() -> Arc<Version> {
        Arc::new(Version::empty(InternalKeyComparator::new(Arc::new(BytewiseComparator))))
    }

    fn snapshot_at(list: &Arc<SnapshotList>, seq: SequenceNumber) -> Snapshot {
        Snapshot::new(version(), Arc::clone(list), || seq)
    }

    #[test]
    fn test_smallest_visible_tracks_open_snapshots() {
        let list = Arc::new(SnapshotList::new());
        assert_eq!(list.smallest_visible(|| 100), 100);

        let s5 = snapshot_at(&list, 5);
        let s9 = snapshot_at(&list, 9);
        let s5b = snapshot_at(&list, 5);
        assert_eq!(s9.sequence(), 9);
        assert_eq!(list.smallest_visible(|| 100), 5);
        assert_eq!(list.len(), 3);

        drop(s5);
        assert_eq!(list.smallest_visible(|| 100), 5);
        drop(s5b);
        assert_eq!(list.smallest_visible(|| 100), 9);
        drop(s9);
        assert_eq!(list.smallest_visible(|| 100), 100);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_snapshot_sequence_read_under_lock() {
        let list = Arc::new(SnapshotList::new());
        // While the bound is being computed, a new snapshot cannot register
        // below it
        let bound = list.smallest_visible(|| {
            assert!(list.open.try_lock().is_none());
            42
        });
        let snap = Snapshot::new(version(), Arc::clone(&list), || {
            assert!(list.open.try_lock().is_none());
            42
        });
        assert!(snap.sequence() >= bound);
    }
}
