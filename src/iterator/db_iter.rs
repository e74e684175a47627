//! User-facing iterator
//!
//! Wraps the merged stream of internal entries and exposes, for each user
//! key, only the newest entry visible at the read sequence. Keys whose newest
//! visible entry is a tombstone are skipped.
//!
//! Moving forward, the merged iterator sits on the entry being exposed.
//! Moving backward, it sits just before every entry of the exposed user key,
//! and the exposed key and value are held in `saved_key` and `saved_value`.

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use super::{InternalIterator, MergingIterator};
use crate::error::Result;
use crate::key::{extract_user_key, Comparator, LookupKey, ParsedInternalKey, RecordKind, SequenceNumber, MAX_SEQUENCE};
use crate::version::Version;

/// Half-open user key range `[start, limit)`; `None` is unbounded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Option<Vec<u8>>,
    pub limit: Option<Vec<u8>>,
}

impl KeyRange {
    pub fn new(start: impl Into<Vec<u8>>, limit: impl Into<Vec<u8>>) -> Self {
        Self {
            start: Some(start.into()),
            limit: Some(limit.into()),
        }
    }

    /// Every key
    pub fn all() -> Self {
        Self::default()
    }

    /// Keys >= `start`
    pub fn from(start: impl Into<Vec<u8>>) -> Self {
        Self {
            start: Some(start.into()),
            limit: None,
        }
    }

    /// Keys < `limit`
    pub fn until(limit: impl Into<Vec<u8>>) -> Self {
        Self {
            start: None,
            limit: Some(limit.into()),
        }
    }

    pub fn contains(&self, cmp: &dyn Comparator, key: &[u8]) -> bool {
        let after_start = self
            .start
            .as_deref()
            .map_or(true, |s| cmp.compare(key, s) != Ordering::Less);
        let before_limit = self
            .limit
            .as_deref()
            .map_or(true, |l| cmp.compare(key, l) == Ordering::Less);
        after_start && before_limit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Iterator over the user-visible state at one sequence number.
///
/// Holds the version and memtables it was created from until dropped.
pub struct DbIterator {
    inner: MergingIterator,
    ucmp: Arc<dyn Comparator>,
    sequence: SequenceNumber,
    range: KeyRange,

    direction: Direction,
    valid: bool,
    positioned: bool,
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,

    _version: Arc<Version>,
    open_iterators: Arc<AtomicUsize>,
}

impl DbIterator {
    pub(crate) fn new(
        inner: MergingIterator,
        ucmp: Arc<dyn Comparator>,
        sequence: SequenceNumber,
        range: KeyRange,
        version: Arc<Version>,
        open_iterators: Arc<AtomicUsize>,
    ) -> Self {
        open_iterators.fetch_add(1, AtomicOrdering::SeqCst);
        Self {
            inner,
            ucmp,
            sequence,
            range,
            direction: Direction::Forward,
            valid: false,
            positioned: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            _version: version,
            open_iterators,
        }
    }

    /// True if positioned at an entry
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Current user key, empty when not valid
    pub fn key(&self) -> &[u8] {
        if !self.valid {
            return &[];
        }
        match self.direction {
            Direction::Forward => extract_user_key(self.inner.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    /// Current value, empty when not valid
    pub fn value(&self) -> &[u8] {
        if !self.valid {
            return &[];
        }
        match self.direction {
            Direction::Forward => self.inner.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    /// Sequence number this iterator reads at
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn seek_to_first(&mut self) -> Result<()> {
        if let Some(start) = self.range.start.clone() {
            return self.seek(&start);
        }
        self.positioned = true;
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.inner.seek_to_first()?;
        if self.inner.valid() {
            self.find_next_user_entry(false)?;
        } else {
            self.valid = false;
        }
        self.enforce_bounds();
        Ok(())
    }

    pub fn seek_to_last(&mut self) -> Result<()> {
        self.positioned = true;
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        match self.range.limit.clone() {
            Some(limit) => {
                // Land on the last entry whose user key is below `limit`
                self.inner.seek(LookupKey::new(&limit, MAX_SEQUENCE).internal_key())?;
                if self.inner.valid() {
                    self.inner.prev()?;
                } else {
                    self.inner.seek_to_last()?;
                }
            }
            None => self.inner.seek_to_last()?,
        }
        self.find_prev_user_entry()?;
        self.enforce_bounds();
        Ok(())
    }

    /// Position at the first key >= `target`
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        let target = match &self.range.start {
            Some(start) if self.ucmp.compare(target, start) == Ordering::Less => start.clone(),
            _ => target.to_vec(),
        };

        self.positioned = true;
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.saved_key.clear();
        self.inner.seek(LookupKey::new(&target, self.sequence).internal_key())?;
        if self.inner.valid() {
            self.find_next_user_entry(false)?;
        } else {
            self.valid = false;
        }
        self.enforce_bounds();
        Ok(())
    }

    pub fn next(&mut self) -> Result<()> {
        if !self.valid {
            return Ok(());
        }

        if self.direction == Direction::Reverse {
            self.direction = Direction::Forward;
            // The merged iterator sits before the entries of saved_key
            if self.inner.valid() {
                self.inner.next()?;
            } else {
                self.inner.seek_to_first()?;
            }
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return Ok(());
            }
        } else {
            self.saved_key.clear();
            self.saved_key.extend_from_slice(extract_user_key(self.inner.key()));
            self.inner.next()?;
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return Ok(());
            }
        }

        self.find_next_user_entry(true)?;
        self.enforce_bounds();
        Ok(())
    }

    pub fn prev(&mut self) -> Result<()> {
        if !self.valid {
            return Ok(());
        }

        if self.direction == Direction::Forward {
            // Back up past every entry of the current user key
            self.saved_key.clear();
            self.saved_key.extend_from_slice(extract_user_key(self.inner.key()));
            loop {
                self.inner.prev()?;
                if !self.inner.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return Ok(());
                }
                if self.ucmp.compare(extract_user_key(self.inner.key()), &self.saved_key) == Ordering::Less {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry()?;
        self.enforce_bounds();
        Ok(())
    }

    /// Consume the iterator as a `std::iter::Iterator` of `(key, value)`.
    ///
    /// Starts at the current entry, or at the first entry if the iterator
    /// was never positioned.
    pub fn entries(self) -> Entries {
        Entries {
            started: self.positioned,
            iter: self,
            advance: false,
            done: false,
        }
    }

    /// Skip forward to the newest visible value of the next user key.
    ///
    /// With `skipping`, entries of user keys <= `saved_key` are hidden.
    fn find_next_user_entry(&mut self, mut skipping: bool) -> Result<()> {
        debug_assert_eq!(self.direction, Direction::Forward);
        while self.inner.valid() {
            let parsed = ParsedInternalKey::parse(self.inner.key())?;
            if parsed.sequence <= self.sequence {
                match parsed.kind {
                    RecordKind::Delete => {
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(parsed.user_key);
                        skipping = true;
                    }
                    RecordKind::Value => {
                        let hidden = skipping
                            && self.ucmp.compare(parsed.user_key, &self.saved_key) != Ordering::Greater;
                        if !hidden {
                            self.valid = true;
                            self.saved_key.clear();
                            return Ok(());
                        }
                    }
                }
            }
            self.inner.next()?;
        }
        self.saved_key.clear();
        self.valid = false;
        Ok(())
    }

    /// Walk backward collecting the newest visible entry of the previous user key
    fn find_prev_user_entry(&mut self) -> Result<()> {
        debug_assert_eq!(self.direction, Direction::Reverse);
        let mut kind = RecordKind::Delete;
        while self.inner.valid() {
            let parsed = ParsedInternalKey::parse(self.inner.key())?;
            if parsed.sequence <= self.sequence {
                if kind != RecordKind::Delete
                    && self.ucmp.compare(parsed.user_key, &self.saved_key) == Ordering::Less
                {
                    // Reached the entries of an earlier user key
                    break;
                }
                kind = parsed.kind;
                match kind {
                    RecordKind::Delete => {
                        self.saved_key.clear();
                        self.saved_value.clear();
                    }
                    RecordKind::Value => {
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(parsed.user_key);
                        self.saved_value.clear();
                        self.saved_value.extend_from_slice(self.inner.value());
                    }
                }
            }
            self.inner.prev()?;
        }

        if kind == RecordKind::Delete {
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
        Ok(())
    }

    /// Invalidate the iterator if it left `[start, limit)`
    fn enforce_bounds(&mut self) {
        if self.valid && !self.range.contains(self.ucmp.as_ref(), self.key()) {
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
        }
    }
}

impl Drop for DbIterator {
    fn drop(&mut self) {
        self.open_iterators.fetch_sub(1, AtomicOrdering::SeqCst);
    }
}

impl fmt::Debug for DbIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbIterator")
            .field("sequence", &self.sequence)
            .field("range", &self.range)
            .field("valid", &self.valid)
            .finish()
    }
}

/// `std::iter::Iterator` adapter returned by [`DbIterator::entries`]
pub struct Entries {
    iter: DbIterator,
    started: bool,
    advance: bool,
    done: bool,
}

impl Iterator for Entries {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let step = if !self.started {
            self.started = true;
            self.iter.seek_to_first()
        } else if self.advance {
            self.iter.next()
        } else {
            Ok(())
        };
        if let Err(e) = step {
            self.done = true;
            return Some(Err(e));
        }

        if !self.iter.valid() {
            self.done = true;
            return None;
        }
        self.advance = true;
        Some(Ok((self.iter.key().to_vec(), self.iter.value().to_vec())))
    }
}
