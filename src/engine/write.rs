//! Write path
//!
//! Writers queue up behind one another. The writer at the front of the
//! queue is the leader: it makes room in the memtable, merges the batches
//! queued behind it into one group, writes the group as a single journal
//! record, applies it to the memtable and hands every member its result.
//!
//! A queued `None` batch is a flush request: it forces the active memtable
//! to be sealed and is never merged with other writes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::batch::WriteBatch;
use crate::error::{Result, StrataError};
use crate::key::MAX_SEQUENCE;
use crate::memtable::MemTable;
use crate::storage::journal_file_name;
use crate::wal::WalWriter;

use super::EngineInner;

/// Upper bound on the encoded size of one write group
const MAX_GROUP_BYTES: usize = 1 << 20;

/// A small leading batch only pulls in this much more, so that small
/// writes are not slowed down by large ones queued behind them
const SMALL_BATCH_BYTES: usize = 128 << 10;

struct PendingWrite {
    batch: Option<WriteBatch>,
    sync: bool,
}

/// Writers waiting for their turn, in arrival order
#[derive(Default)]
pub(crate) struct WriteQueue {
    next_ticket: u64,
    queue: VecDeque<u64>,
    pending: HashMap<u64, PendingWrite>,
    /// Results for group members, collected by each member when it wakes
    finished: HashMap<u64, Result<()>>,
}

impl EngineInner {
    pub(super) fn write_internal(&self, batch: Option<WriteBatch>, sync: bool) -> Result<()> {
        let mut writers = self.writers.lock();
        let ticket = writers.next_ticket;
        writers.next_ticket += 1;
        writers.queue.push_back(ticket);
        writers.pending.insert(ticket, PendingWrite { batch, sync });

        loop {
            if let Some(result) = writers.finished.remove(&ticket) {
                return result;
            }
            if writers.queue.front() == Some(&ticket) {
                break;
            }
            self.writers_cv.wait(&mut writers);
        }

        // Leader from here on. Later writers may queue while we make room.
        let force = writers
            .pending
            .get(&ticket)
            .map_or(false, |p| p.batch.is_none());
        drop(writers);
        let room = self.make_room_for_write(force);

        let mut writers = self.writers.lock();
        let mut leader = writers.pending.remove(&ticket).unwrap_or(PendingWrite {
            batch: None,
            sync: false,
        });

        let (group, result) = match (room, leader.batch.take()) {
            (Err(e), _) => (Vec::new(), Err(e)),
            (Ok(()), None) => (Vec::new(), Ok(())),
            (Ok(()), Some(batch)) => {
                let followers = Self::gather_group(&writers, &batch, leader.sync);
                let mut merged = batch;
                let mut sync = leader.sync;
                for follower in &followers {
                    if let Some(mut write) = writers.pending.remove(follower) {
                        sync |= write.sync;
                        if let Some(batch) = write.batch.take() {
                            merged.append(batch);
                        }
                    }
                }
                drop(writers);
                let result = self.commit_group(merged, sync);
                writers = self.writers.lock();
                (followers, result)
            }
        };

        writers.queue.pop_front();
        for follower in group {
            writers.queue.pop_front();
            let shared = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(e.duplicate()),
            };
            writers.finished.insert(follower, shared);
        }
        self.writers_cv.notify_all();
        result
    }

    /// Tickets queued behind the leader that can share its journal record
    fn gather_group(writers: &WriteQueue, first: &WriteBatch, leader_sync: bool) -> Vec<u64> {
        let mut size = first.approximate_size();
        let max_size = if size <= SMALL_BATCH_BYTES {
            size + SMALL_BATCH_BYTES
        } else {
            MAX_GROUP_BYTES
        };

        let mut group = Vec::new();
        for ticket in writers.queue.iter().skip(1) {
            let Some(write) = writers.pending.get(ticket) else {
                break;
            };
            // A sync write must not be acknowledged by a non-sync leader's record
            if write.sync && !leader_sync {
                break;
            }
            let Some(batch) = &write.batch else {
                break;
            };
            size += batch.approximate_size();
            if size > max_size {
                break;
            }
            group.push(*ticket);
        }
        group
    }

    /// Journal, then memtable, then publish. Runs on the leader only.
    fn commit_group(&self, mut batch: WriteBatch, sync: bool) -> Result<()> {
        if let Some(fault) = self.journal_fault.lock().clone() {
            return Err(StrataError::JournalFault(fault));
        }
        if let Some(e) = self.background_error() {
            return Err(e);
        }
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(StrataError::Closed);
        }

        let last = self.versions.last_sequence();
        let count = batch.len() as u64;
        if count == 0 {
            return Ok(());
        }
        let first = last + 1;
        if last + count > MAX_SEQUENCE {
            return Err(StrataError::InvalidArgument(format!(
                "sequence space exhausted at {}",
                last
            )));
        }
        batch.set_sequence(first);

        {
            let mut journal = self.journal.lock();
            let written = journal.append(&batch.encode()).and_then(|_| {
                if sync {
                    journal.sync()
                } else {
                    Ok(())
                }
            });
            if let Err(e) = written {
                let msg = format!("{}: {}", journal.path().display(), e);
                tracing::error!(error = %e, journal = %journal.path().display(), "journal write failed");
                *self.journal_fault.lock() = Some(msg.clone());
                return Err(StrataError::JournalFault(msg));
            }
        }

        let active = Arc::clone(&self.mem.lock().active);
        batch.insert_into(&active);
        self.versions.set_last_sequence(last + count);
        Ok(())
    }

    /// Make sure the active memtable has room, sealing it if needed.
    ///
    /// With `force`, a non-empty active memtable is sealed regardless of
    /// its size. Blocks while a sealed memtable is still being flushed or
    /// while level 0 has reached `level0_stop_writes_trigger` files.
    fn make_room_for_write(&self, mut force: bool) -> Result<()> {
        // The next journal is created with `mem` released so readers and the
        // flush worker are not held up by file creation
        let mut next_journal: Option<(u64, WalWriter)> = None;
        let mut mem = self.mem.lock();
        loop {
            if let Some(e) = self.background_error() {
                return Err(e);
            }
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(StrataError::Closed);
            }

            if !force && mem.active.approx_size() < self.config.write_buffer_size {
                return Ok(());
            }

            let paused = self.pauses.load(Ordering::SeqCst) > 0;
            if mem.sealed.is_some() {
                if force && paused {
                    return Err(StrataError::InvalidArgument("background work is paused".into()));
                }
                tracing::debug!("memtable full, waiting for flush");
                self.flush_worker.trigger();
                self.mem_cv.wait(&mut mem);
                continue;
            }

            let level0 = self.versions.current().num_files(0);
            if level0 >= self.config.level0_stop_writes_trigger {
                if force && paused {
                    return Err(StrataError::InvalidArgument("background work is paused".into()));
                }
                tracing::debug!(level0, "too many level-0 files, waiting for compaction");
                self.compaction_worker.trigger();
                self.mem_cv.wait(&mut mem);
                continue;
            }

            if force && mem.active.is_empty() {
                return Ok(());
            }

            let Some((number, writer)) = next_journal.take() else {
                drop(mem);
                let number = self.versions.new_file_number();
                let path = journal_file_name(&self.config.data_dir, number);
                next_journal = Some((number, WalWriter::create(&path)?));
                mem = self.mem.lock();
                continue;
            };

            // Seal the active memtable behind the fresh journal. Every record
            // appended to the old journal has already been handed to the OS.
            *self.journal.lock() = writer;

            let fresh = Arc::new(MemTable::new(self.icmp.clone()));
            let sealed = std::mem::replace(&mut mem.active, fresh);
            tracing::debug!(
                entries = sealed.entry_count(),
                bytes = sealed.approx_size(),
                journal = number,
                "memtable sealed"
            );
            mem.sealed = Some(sealed);
            mem.log_number = number;
            self.flush_worker.trigger();
            force = false;
        }
    }
}
