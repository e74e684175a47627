//! Background workers
//!
//! Flush and compaction each run on their own thread. The engine talks to a
//! worker only through its command queue; the worker reports progress
//! through its slot state.
//!
//! ```text
//!   trigger()            worker picks up        task installs       done
//!  Idle ───────▶ Scheduled ───────────▶ Running ──────────▶ Committing ──▶ Idle
//! ```
//!
//! Triggers coalesce: while one is queued, further triggers are no-ops.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};

use crate::error::{Result, StrataError};

/// Observable state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Idle = 0,
    Scheduled = 1,
    Running = 2,
    Committing = 3,
}

impl SlotState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SlotState::Scheduled,
            2 => SlotState::Running,
            3 => SlotState::Committing,
            _ => SlotState::Idle,
        }
    }
}

/// Manual compaction of a user key range `[begin, end]`
#[derive(Debug)]
pub struct ManualCompaction {
    pub begin: Option<Vec<u8>>,
    pub end: Option<Vec<u8>>,
    /// Receives whether any work was done
    pub reply: Sender<Result<bool>>,
}

/// Message to a worker
#[derive(Debug)]
pub enum Command {
    /// Check for work and do it
    Trigger,
    /// Run a manual compaction
    Manual(ManualCompaction),
    /// Stop at the next checkpoint and acknowledge; refuse work until resumed
    Pause(Sender<()>),
    /// Leave the paused state and catch up
    Resume,
    /// Exit the worker thread
    Shutdown,
}

/// Sending half of a worker, shared by everything that triggers it
#[derive(Debug)]
pub struct WorkerChannel {
    name: &'static str,
    tx: Sender<Command>,
    state: AtomicU8,
    queued: AtomicBool,
}

impl WorkerChannel {
    pub fn new(name: &'static str) -> (Self, Receiver<Command>) {
        let (tx, rx) = channel::unbounded();
        let worker = Self {
            name,
            tx,
            state: AtomicU8::new(SlotState::Idle as u8),
            queued: AtomicBool::new(false),
        };
        (worker, rx)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ask the worker to look for work
    pub fn trigger(&self) {
        if self.queued.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.state.compare_exchange(
            SlotState::Idle as u8,
            SlotState::Scheduled as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        // A closed queue means the worker already exited
        let _ = self.tx.send(Command::Trigger);
    }

    pub fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| StrataError::Closed)
    }

    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SlotState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Work done by one worker thread
pub trait BackgroundTask: Send + Sync + 'static {
    /// The channel that drives this task
    fn channel(&self) -> &WorkerChannel;

    /// True if `run_once` has something to do
    fn needs_work(&self) -> bool;

    /// Do one unit of work (one flush, one compaction)
    fn run_once(&self) -> Result<()>;

    /// Handle a manual request; tasks without manual work reject it
    fn run_manual(&self, request: ManualCompaction) {
        let _ = request.reply.send(Err(StrataError::InvalidArgument(format!(
            "{} worker has no manual work",
            self.channel().name()
        ))));
    }

    /// True once a pause or shutdown wants the worker to stop at a checkpoint
    fn should_yield(&self) -> bool;

    /// Record a failed unit of work
    fn on_error(&self, error: StrataError);

    /// True if an earlier failure has halted automatic work
    fn halted(&self) -> bool;
}

/// Start the worker thread for `task`
pub fn spawn_worker<T: BackgroundTask>(task: Arc<T>, rx: Receiver<Command>) -> std::io::Result<JoinHandle<()>> {
    let name = format!("strata-{}", task.channel().name());
    thread::Builder::new().name(name).spawn(move || worker_loop(task.as_ref(), rx))
}

fn worker_loop<T: BackgroundTask>(task: &T, rx: Receiver<Command>) {
    let channel = task.channel();
    let mut paused = false;
    tracing::debug!(worker = channel.name(), "worker started");

    for command in rx.iter() {
        match command {
            Command::Trigger => {
                channel.queued.store(false, Ordering::Release);
                if !paused {
                    drain(task);
                } else {
                    channel.set_state(SlotState::Idle);
                }
            }
            Command::Manual(request) => {
                if paused {
                    let _ = request
                        .reply
                        .send(Err(StrataError::InvalidArgument("background work is paused".into())));
                    continue;
                }
                channel.set_state(SlotState::Running);
                task.run_manual(request);
                channel.set_state(SlotState::Idle);
                drain(task);
            }
            Command::Pause(ack) => {
                paused = true;
                channel.set_state(SlotState::Idle);
                tracing::debug!(worker = channel.name(), "worker paused");
                let _ = ack.send(());
            }
            Command::Resume => {
                paused = false;
                tracing::debug!(worker = channel.name(), "worker resumed");
                drain(task);
            }
            Command::Shutdown => break,
        }
    }

    channel.set_state(SlotState::Idle);
    tracing::debug!(worker = channel.name(), "worker stopped");
}

/// Run units of work until none is left or the task must stop
fn drain<T: BackgroundTask>(task: &T) {
    let channel = task.channel();
    while !task.halted() && !task.should_yield() && task.needs_work() {
        channel.set_state(SlotState::Running);
        if let Err(e) = task.run_once() {
            tracing::error!(worker = channel.name(), error = %e, "background work failed");
            task.on_error(e);
            break;
        }
    }
    let idle = if channel.queued.load(Ordering::Acquire) {
        SlotState::Scheduled
    } else {
        SlotState::Idle
    };
    channel.set_state(idle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Counter {
        channel: WorkerChannel,
        todo: AtomicUsize,
        done: AtomicUsize,
        yield_now: AtomicBool,
        errors: Mutex<Vec<String>>,
    }

    impl BackgroundTask for Counter {
        fn channel(&self) -> &WorkerChannel {
            &self.channel
        }

        fn needs_work(&self) -> bool {
            self.todo.load(Ordering::SeqCst) > 0
        }

        fn run_once(&self) -> Result<()> {
            self.todo.fetch_sub(1, Ordering::SeqCst);
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn should_yield(&self) -> bool {
            self.yield_now.load(Ordering::SeqCst)
        }

        fn on_error(&self, error: StrataError) {
            self.errors.lock().push(error.to_string());
        }

        fn halted(&self) -> bool {
            !self.errors.lock().is_empty()
        }
    }

    fn start() -> (Arc<Counter>, JoinHandle<()>) {
        let (channel, rx) = WorkerChannel::new("test");
        let task = Arc::new(Counter {
            channel,
            todo: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
            yield_now: AtomicBool::new(false),
            errors: Mutex::new(Vec::new()),
        });
        let handle = spawn_worker(Arc::clone(&task), rx).unwrap();
        (task, handle)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_trigger_drains_work() {
        let (task, handle) = start();
        task.todo.store(3, Ordering::SeqCst);
        task.channel.trigger();
        wait_for(|| task.done.load(Ordering::SeqCst) == 3);
        wait_for(|| task.channel.state() == SlotState::Idle);

        task.channel.send(Command::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_paused_worker_defers_until_resume() {
        let (task, handle) = start();
        let (ack_tx, ack_rx) = channel::bounded(1);
        task.channel.send(Command::Pause(ack_tx)).unwrap();
        ack_rx.recv().unwrap();

        task.todo.store(2, Ordering::SeqCst);
        task.channel.trigger();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(task.done.load(Ordering::SeqCst), 0);

        task.channel.send(Command::Resume).unwrap();
        wait_for(|| task.done.load(Ordering::SeqCst) == 2);

        task.channel.send(Command::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_manual_rejected_by_default() {
        let (task, handle) = start();
        let (reply, result) = channel::bounded(1);
        task.channel
            .send(Command::Manual(ManualCompaction {
                begin: None,
                end: None,
                reply,
            }))
            .unwrap();
        assert!(result.recv().unwrap().is_err());

        task.channel.send(Command::Shutdown).unwrap();
        handle.join().unwrap();
    }
}
