//! Iterator Module
//!
//! Every sorted source (memtable, table file, level, merged view) implements
//! [`InternalIterator`] over encoded internal keys. [`MergingIterator`]
//! combines them and [`DbIterator`] turns the merged stream into the
//! user-visible view at one snapshot sequence.

mod concat;
mod db_iter;
mod merging;

pub use concat::LevelIterator;
pub use db_iter::{DbIterator, Entries, KeyRange};
pub use merging::MergingIterator;

use crate::error::Result;

/// Bidirectional cursor over encoded internal keys.
///
/// An iterator positioned before the first or after the last entry is simply
/// not `valid()`; `key()` and `value()` may only be called while valid.
pub trait InternalIterator: Send {
    /// Returns true if the iterator is positioned at an entry
    fn valid(&self) -> bool;

    /// Position at the first entry
    fn seek_to_first(&mut self) -> Result<()>;

    /// Position at the last entry
    fn seek_to_last(&mut self) -> Result<()>;

    /// Position at the first entry with key >= target
    fn seek(&mut self, target: &[u8]) -> Result<()>;

    /// Advance to the next entry
    fn next(&mut self) -> Result<()>;

    /// Step back to the previous entry
    fn prev(&mut self) -> Result<()>;

    /// Current internal key
    fn key(&self) -> &[u8];

    /// Current value
    fn value(&self) -> &[u8];
}

impl<I: InternalIterator + ?Sized> InternalIterator for Box<I> {
    fn valid(&self) -> bool {
        (**self).valid()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        (**self).seek_to_first()
    }

    fn seek_to_last(&mut self) -> Result<()> {
        (**self).seek_to_last()
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        (**self).seek(target)
    }

    fn next(&mut self) -> Result<()> {
        (**self).next()
    }

    fn prev(&mut self) -> Result<()> {
        (**self).prev()
    }

    fn key(&self) -> &[u8] {
        (**self).key()
    }

    fn value(&self) -> &[u8] {
        (**self).value()
    }
}

/// Boxed iterator as handed to the merging layers
pub type BoxedIterator = Box<dyn InternalIterator>;
