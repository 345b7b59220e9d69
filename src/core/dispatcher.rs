//! Dispatchers: route work items to execution and drive a run to completion.
//!
//! Two implementations share the [`WorkItemDispatcher`] contract:
//!
//! - [`ParallelDispatcher`] (multi-queue, shift based, with isolation)
//! - [`SimpleDispatcher`] (everything on one thread)
//!
//! A dispatcher handles exactly one run: `start` once, then `dispatch` any number of times
//! while items execute, optionally `cancel_run`, and `wait_for_completion`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use super::events::DispatcherEvent;
use super::work_item::WorkItem;
use super::DispatchError;

mod parallel;
mod simple;

pub use parallel::ParallelDispatcher;
pub use simple::SimpleDispatcher;

/// Contract shared by all dispatchers.
pub trait WorkItemDispatcher: Send + Sync {
    /// Begin a run with `root` as its top-level item.
    ///
    /// # Errors
    ///
    /// `IllegalState` if a run was already started, `WorkerSpawn` if threads could not
    /// be created.
    fn start(&self, root: Arc<WorkItem>) -> Result<(), DispatchError>;

    /// Route an item (usually a child enqueued by an executing composite) to execution.
    ///
    /// # Errors
    ///
    /// `IllegalState` before `start`, or when the item could no longer be accepted. A
    /// refused item has already been cancelled when this returns.
    fn dispatch(&self, item: Arc<WorkItem>) -> Result<(), DispatchError>;

    /// Cancel the run. Forced cancellation returns within a bounded time.
    ///
    /// # Errors
    ///
    /// `IllegalState` before `start`.
    fn cancel_run(&self, force: bool) -> Result<(), DispatchError>;

    /// Block until the run has finished or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// `IllegalState` before `start`, `Timeout` if the run is still going.
    fn wait_for_completion(&self, timeout: Duration) -> Result<RunOutcome, DispatchError>;

    /// True once `cancel_run` was called.
    fn is_cancellation_requested(&self) -> bool;

    /// Receive lifecycle events emitted from now on.
    fn subscribe(&self) -> Receiver<DispatcherEvent>;
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The root item reached a terminal state without cancellation.
    Completed,
    /// The run was cancelled, gracefully or by force.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    Idle,
    Running,
    Finished(RunOutcome),
}

struct TrackerInner {
    phase: RunPhase,
    root: Option<Arc<WorkItem>>,
}

/// Lifecycle of a single run, with a condvar for waiters.
pub(crate) struct RunTracker {
    inner: Mutex<TrackerInner>,
    finished: Condvar,
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                phase: RunPhase::Idle,
                root: None,
            }),
            finished: Condvar::new(),
        }
    }

    /// Idle -> Running.
    pub fn begin(&self, root: Arc<WorkItem>) -> Result<(), DispatchError> {
        let mut inner = self.inner.lock();
        if inner.phase != RunPhase::Idle {
            return Err(DispatchError::IllegalState("run already started".into()));
        }
        inner.phase = RunPhase::Running;
        inner.root = Some(root);
        Ok(())
    }

    pub fn ensure_started(&self) -> Result<(), DispatchError> {
        if self.inner.lock().phase == RunPhase::Idle {
            return Err(DispatchError::no_active_run());
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().phase == RunPhase::Running
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.inner.lock().phase, RunPhase::Finished(_))
    }

    /// Running -> Finished. Only the first call succeeds.
    pub fn finish(&self, outcome: RunOutcome) -> bool {
        let mut inner = self.inner.lock();
        if inner.phase != RunPhase::Running {
            return false;
        }
        inner.phase = RunPhase::Finished(outcome);
        self.finished.notify_all();
        true
    }

    pub fn root(&self) -> Option<Arc<WorkItem>> {
        self.inner.lock().root.clone()
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        match self.inner.lock().phase {
            RunPhase::Finished(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn wait(&self, timeout: Duration) -> Result<RunOutcome, DispatchError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            match inner.phase {
                RunPhase::Idle => return Err(DispatchError::no_active_run()),
                RunPhase::Finished(outcome) => return Ok(outcome),
                RunPhase::Running => {
                    if self.finished.wait_until(&mut inner, deadline).timed_out() {
                        return match inner.phase {
                            RunPhase::Finished(outcome) => Ok(outcome),
                            _ => Err(DispatchError::Timeout),
                        };
                    }
                }
            }
        }
    }
}

/// Point-in-time dispatcher statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    /// Items passed to `dispatch`, the root included.
    pub dispatched_items: u64,
    /// Items placed on a queue.
    pub queued_items: u64,
    /// Items executed inline on the dispatching thread.
    pub inline_executions: u64,
    /// Items cancelled at dispatch time.
    pub cancelled_dispatches: u64,
    /// Shift starts, counting restarts.
    pub shifts_started: u64,
    /// Isolation levels entered.
    pub isolation_entries: u64,
    /// Current isolation nesting depth.
    pub isolation_depth: usize,
    /// Composites dispatched and not yet terminal.
    pub active_composites: usize,
}

/// Lock-free counters behind [`DispatcherStats`].
#[derive(Debug, Default)]
pub(crate) struct DispatchCounters {
    pub dispatched_items: AtomicU64,
    pub queued_items: AtomicU64,
    pub inline_executions: AtomicU64,
    pub cancelled_dispatches: AtomicU64,
    pub shifts_started: AtomicU64,
    pub isolation_entries: AtomicU64,
}

impl DispatchCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, isolation_depth: usize, active_composites: usize) -> DispatcherStats {
        DispatcherStats {
            dispatched_items: self.dispatched_items.load(Ordering::Relaxed),
            queued_items: self.queued_items.load(Ordering::Relaxed),
            inline_executions: self.inline_executions.load(Ordering::Relaxed),
            cancelled_dispatches: self.cancelled_dispatches.load(Ordering::Relaxed),
            shifts_started: self.shifts_started.load(Ordering::Relaxed),
            isolation_entries: self.isolation_entries.load(Ordering::Relaxed),
            isolation_depth,
            active_composites,
        }
    }
}
