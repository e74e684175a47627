//! User key comparators

use std::cmp::Ordering;
use std::fmt;

/// Orders user keys.
///
/// The name is persisted in the manifest; reopening a database with a
/// comparator of a different name is rejected.
pub trait Comparator: Send + Sync {
    /// Stable identifier stored in the manifest
    fn name(&self) -> &str;

    /// Three-way comparison of two user keys
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

impl fmt::Debug for dyn Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Comparator({})", self.name())
    }
}

/// Lexicographic byte ordering (the default)
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &str {
        "strata.BytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}
