//! Deferred-work queue for the tick thread
//!
//! Decouples "run this on the tick thread" from "when it actually runs".
//! Producers on any thread submit through a cloneable [`TaskHandle`]; the
//! tick thread is the only consumer. Items are stamped with the tick they
//! were submitted on so the scheduler can force aged tasks through even when
//! there is never spare time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::constants::tick;

/// A unit of deferred work.
pub struct TaskItem {
    submitted_tick: u64,
    action: Box<dyn FnOnce() + Send + 'static>,
}

impl TaskItem {
    pub fn submitted_tick(&self) -> u64 {
        self.submitted_tick
    }

    /// Ticks elapsed since submission.
    pub fn age(&self, current_tick: u64) -> u64 {
        current_tick.saturating_sub(self.submitted_tick)
    }

    pub fn run(self) {
        (self.action)();
    }
}

impl std::fmt::Debug for TaskItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskItem")
            .field("submitted_tick", &self.submitted_tick)
            .finish_non_exhaustive()
    }
}

/// Submission failed because the scheduler is no longer RUNNING. Callers must
/// react (retry elsewhere, drop the work) instead of leaking references to a
/// dying server.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("task rejected: scheduler is shutting down")]
pub struct TaskRejected;

#[derive(Debug)]
struct Shared {
    current_tick: AtomicU64,
    accepting: AtomicBool,
}

/// Cloneable producer side. Submitting never blocks.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    tx: Sender<TaskItem>,
    shared: Arc<Shared>,
}

impl TaskHandle {
    /// Stop accepting new submissions. Items already queued are unaffected.
    pub(crate) fn close(&self) {
        self.shared.accepting.store(false, Ordering::Release);
    }

    pub fn submit(&self, action: impl FnOnce() + Send + 'static) -> Result<(), TaskRejected> {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(TaskRejected);
        }
        let item = TaskItem {
            submitted_tick: self.shared.current_tick.load(Ordering::Acquire),
            action: Box::new(action),
        };
        self.tx.send(item).map_err(|_| TaskRejected)
    }
}

/// Consumer side, owned by the tick thread.
#[derive(Debug)]
pub struct TaskQueue {
    tx: Sender<TaskItem>,
    rx: Receiver<TaskItem>,
    /// An item popped but found ineligible stays here; FIFO order is kept
    head: Option<TaskItem>,
    shared: Arc<Shared>,
}

impl TaskQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            head: None,
            shared: Arc::new(Shared {
                current_tick: AtomicU64::new(0),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Advance the tick stamp applied to new submissions.
    pub fn set_current_tick(&self, tick: u64) {
        self.shared.current_tick.store(tick, Ordering::Release);
    }

    /// Stop accepting submissions (entering STOPPING). Already-queued items
    /// remain drainable.
    pub fn close(&self) {
        self.shared.accepting.store(false, Ordering::Release);
    }

    /// Remove and return the head item, if any. Tick-thread-only.
    pub fn poll_one(&mut self) -> Option<TaskItem> {
        if let Some(item) = self.head.take() {
            return Some(item);
        }
        self.rx.try_recv().ok()
    }

    /// Drain items in FIFO order while `should_run` holds; the first
    /// ineligible item stays at the head. Returns how many ran.
    pub fn run_all_ready(&mut self, should_run: impl Fn(&TaskItem) -> bool) -> usize {
        let mut ran = 0;
        while let Some(item) = self.poll_one() {
            if should_run(&item) {
                item.run();
                ran += 1;
            } else {
                self.head = Some(item);
                break;
            }
        }
        ran
    }

    /// Run everything currently queued (shutdown drain). Returns how many ran.
    pub fn drain_all(&mut self) -> usize {
        self.run_all_ready(|_| true)
    }

    /// Park until an item arrives or `deadline` passes, whichever is first.
    /// Each park is bounded; this is the managed end-of-tick block.
    pub fn recv_deadline(&mut self, deadline: Instant) -> Option<TaskItem> {
        if let Some(item) = self.head.take() {
            return Some(item);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let wait = deadline.duration_since(now).min(tick::MAX_PARK);
        match self.rx.recv_timeout(wait) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len() + usize::from(self.head.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
