//! K-way merge over sorted children
//!
//! Children are scanned linearly to find the smallest (or largest) key; the
//! number of children is small (memtables, level-0 files and one iterator per
//! deeper level), so a heap buys nothing.

use std::cmp::Ordering;

use super::{BoxedIterator, InternalIterator};
use crate::error::Result;
use crate::key::InternalKeyComparator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Merges several internal iterators into one sorted stream.
///
/// Duplicate keys are all yielded; version filtering is left to the caller.
pub struct MergingIterator {
    cmp: InternalKeyComparator,
    children: Vec<BoxedIterator>,
    current: Option<usize>,
    direction: Direction,
}

impl MergingIterator {
    pub fn new(cmp: InternalKeyComparator, children: Vec<BoxedIterator>) -> Self {
        Self {
            cmp,
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            smallest = match smallest {
                Some(s) if self.cmp.compare(child.key(), self.children[s].key()) != Ordering::Less => Some(s),
                _ => Some(i),
            };
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate().rev() {
            if !child.valid() {
                continue;
            }
            largest = match largest {
                Some(l) if self.cmp.compare(child.key(), self.children[l].key()) != Ordering::Greater => Some(l),
                _ => Some(i),
            };
        }
        self.current = largest;
    }
}

impl InternalIterator for MergingIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.seek_to_first()?;
        }
        self.direction = Direction::Forward;
        self.find_smallest();
        Ok(())
    }

    fn seek_to_last(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.seek_to_last()?;
        }
        self.direction = Direction::Reverse;
        self.find_largest();
        Ok(())
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        for child in &mut self.children {
            child.seek(target)?;
        }
        self.direction = Direction::Forward;
        self.find_smallest();
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        let Some(current) = self.current else {
            return Ok(());
        };

        // After moving backwards the other children sit before key(); move
        // each of them to the first entry after it.
        if self.direction != Direction::Forward {
            let key = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key)?;
                if child.valid() && self.cmp.compare(&key, child.key()) == Ordering::Equal {
                    child.next()?;
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next()?;
        self.find_smallest();
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        let Some(current) = self.current else {
            return Ok(());
        };

        // After moving forwards the other children sit after key(); move
        // each of them to the last entry before it.
        if self.direction != Direction::Reverse {
            let key = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key)?;
                if child.valid() {
                    child.prev()?;
                } else {
                    child.seek_to_last()?;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev()?;
        self.find_largest();
        Ok(())
    }

    fn key(&self) -> &[u8] {
        match self.current {
            Some(i) => self.children[i].key(),
            None => &[],
        }
    }

    fn value(&self) -> &[u8] {
        match self.current {
            Some(i) => self.children[i].value(),
            None => &[],
        }
    }
}
