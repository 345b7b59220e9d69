//! Shifts: the execution phases of a run.
//!
//! A shift groups one or more queues with the workers that drain them. Only one shift is
//! active at a time. The active shift ends when none of its queues has waiting or
//! in-flight work; ending pauses its queues and tells the listener, which picks the next
//! shift to run.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::dispatcher::WorkItemDispatcher;
use super::queue::WorkItemQueue;
use super::work_item::WorkItem;
use super::worker::{TestWorker, WorkerHooks};
use super::DispatchError;

/// The fixed set of shifts. Ordering follows priority: `Parallel` is the smallest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftKind {
    /// Parallel queue (N workers) plus the parallel exclusive queue (one worker).
    Parallel,
    /// Serial queue, one worker.
    NonParallel,
    /// Serial exclusive queue, one worker.
    NonParallelExclusive,
}

impl ShiftKind {
    /// All shifts in the order the dispatcher considers them.
    pub const PRIORITY: [Self; 3] = [Self::Parallel, Self::NonParallel, Self::NonParallelExclusive];

    /// Short label used in thread names and logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Parallel => "parallel",
            Self::NonParallel => "serial",
            Self::NonParallelExclusive => "serial-exclusive",
        }
    }
}

impl fmt::Display for ShiftKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Receives shift-level notifications.
pub(crate) trait ShiftListener: Send + Sync {
    /// A worker of this shift is about to run `item`.
    fn work_item_starting(&self, item: &Arc<WorkItem>);

    /// The shift ran out of work and has paused its queues.
    fn shift_ended(&self, kind: ShiftKind);
}

/// One queue of a shift and the number of workers draining it.
pub(crate) struct Lane {
    pub queue: Arc<WorkItemQueue>,
    pub workers: usize,
}

#[derive(Debug, Default)]
struct ShiftFlags {
    active: bool,
    yielding: bool,
}

struct ShiftState {
    kind: ShiftKind,
    queues: Vec<Arc<WorkItemQueue>>,
    flags: Mutex<ShiftFlags>,
    listener: Weak<dyn ShiftListener>,
    dispatcher: Weak<dyn WorkItemDispatcher>,
}

impl ShiftState {
    fn has_work(&self) -> bool {
        self.queues.iter().any(|q| q.has_work())
    }

    fn in_flight(&self) -> usize {
        self.queues.iter().map(|q| q.in_flight()).sum()
    }

    fn pause_queues(&self) {
        for queue in &self.queues {
            queue.pause();
        }
    }

    fn start_queues(&self) {
        for queue in &self.queues {
            queue.start();
        }
    }

    /// Mark the shift ended and notify the listener. Caller holds the flags lock.
    fn end(&self, flags: &mut ShiftFlags) {
        flags.active = false;
        flags.yielding = false;
        tracing::info!(shift = %self.kind, "shift finished");
        if let Some(listener) = self.listener.upgrade() {
            listener.shift_ended(self.kind);
        }
    }
}

impl WorkerHooks for ShiftState {
    fn item_starting(&self, item: &Arc<WorkItem>) {
        if let Some(listener) = self.listener.upgrade() {
            listener.work_item_starting(item);
        }
    }

    fn dispatcher(&self) -> Option<Arc<dyn WorkItemDispatcher>> {
        self.dispatcher.upgrade()
    }

    fn item_finished(&self, queue: &WorkItemQueue) {
        let mut flags = self.flags.lock();
        queue.release();
        if !flags.active {
            return;
        }
        // Pause first so no worker can take a new item between the check and the end.
        self.pause_queues();
        let done = if flags.yielding {
            self.in_flight() == 0
        } else {
            !self.has_work()
        };
        if !done {
            if !flags.yielding {
                self.start_queues();
            }
            return;
        }
        self.end(&mut flags);
    }
}

/// A phase of execution: its queues and their workers.
pub(crate) struct WorkShift {
    state: Arc<ShiftState>,
    lanes: Vec<Lane>,
    workers: Mutex<Vec<TestWorker>>,
}

impl WorkShift {
    pub fn new(
        kind: ShiftKind,
        lanes: Vec<Lane>,
        listener: Weak<dyn ShiftListener>,
        dispatcher: Weak<dyn WorkItemDispatcher>,
    ) -> Self {
        let queues = lanes.iter().map(|lane| Arc::clone(&lane.queue)).collect();
        Self {
            state: Arc::new(ShiftState {
                kind,
                queues,
                flags: Mutex::new(ShiftFlags::default()),
                listener,
                dispatcher,
            }),
            lanes,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> ShiftKind {
        self.state.kind
    }

    pub fn queues(&self) -> &[Arc<WorkItemQueue>] {
        &self.state.queues
    }

    /// Spawn the workers of every lane. Does nothing if they already exist.
    pub fn spawn_workers(&self, prefix: &str, stack_size: usize) -> Result<(), DispatchError> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }
        for lane in &self.lanes {
            for index in 0..lane.workers {
                let name = if lane.workers == 1 {
                    format!("{prefix}-{}", lane.queue.name())
                } else {
                    format!("{prefix}-{}-{index}", lane.queue.name())
                };
                let hooks: Arc<dyn WorkerHooks> = Arc::clone(&self.state) as Arc<dyn WorkerHooks>;
                let worker = TestWorker::spawn(name, stack_size, Arc::clone(&lane.queue), hooks)?;
                tracing::debug!(shift = %self.kind(), worker = %worker.name(), thread = ?worker.thread_id(), "worker spawned");
                workers.push(worker);
            }
        }
        Ok(())
    }

    /// True while any owned queue has waiting or in-flight work.
    pub fn has_work(&self) -> bool {
        self.state.has_work()
    }

    pub fn is_active(&self) -> bool {
        self.state.flags.lock().active
    }

    pub fn busy_workers(&self) -> usize {
        self.workers.lock().iter().filter(|w| w.is_busy()).count()
    }

    /// True when the calling thread is one of this shift's workers.
    pub fn owns_current_thread(&self) -> bool {
        let current = std::thread::current().id();
        self.workers.lock().iter().any(|w| w.thread_id() == current)
    }

    /// Make the shift active and let its workers take items.
    ///
    /// `preempted` is checked under the shift lock, after any concurrent `yield_shift`
    /// has been observed. When it reports higher-priority work the shift stays inactive
    /// and false is returned.
    pub fn start(&self, preempted: impl FnOnce() -> bool) -> bool {
        let mut flags = self.state.flags.lock();
        if preempted() {
            tracing::debug!(shift = %self.kind(), "higher priority work queued; not starting");
            return false;
        }
        flags.active = true;
        flags.yielding = false;
        self.state.start_queues();
        tracing::info!(shift = %self.kind(), "shift started");
        true
    }

    /// Let in-flight items finish, take nothing new, then end.
    ///
    /// Used when work for a higher-priority shift arrives while this one is active.
    pub fn yield_shift(&self) {
        let mut flags = self.state.flags.lock();
        if !flags.active || flags.yielding {
            return;
        }
        flags.yielding = true;
        self.state.pause_queues();
        tracing::debug!(shift = %self.kind(), "shift yielding to higher priority work");
        if self.state.in_flight() == 0 {
            self.state.end(&mut flags);
        }
    }

    /// Stop handing out items. In-flight items finish on their own.
    ///
    /// Graceful and forced cancellation look the same here; the bounded wait and the
    /// detaching of stuck workers belong to the dispatcher.
    pub fn cancel(&self) {
        tracing::debug!(shift = %self.kind(), "cancelling shift");
        for worker in self.workers.lock().iter() {
            worker.cancel();
        }
        for queue in self.queues() {
            queue.stop();
        }
    }

    /// Stop the queues and release the workers.
    ///
    /// With a timeout each worker is joined for at most that long, then detached.
    /// Without one every worker is detached straight away.
    pub fn shutdown(&self, join_timeout: Option<Duration>) {
        for queue in self.queues() {
            queue.stop();
        }
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in &workers {
            worker.cancel();
        }
        for worker in &workers {
            match join_timeout {
                Some(timeout) => {
                    worker.join(timeout);
                }
                None => worker.detach(),
            }
        }
        tracing::debug!(shift = %self.kind(), workers = workers.len(), "shift shut down");
    }
}

impl fmt::Debug for WorkShift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkShift")
            .field("kind", &self.kind())
            .field("queues", &self.state.queues)
            .field("active", &self.is_active())
            .field("busy_workers", &self.busy_workers())
            .finish_non_exhaustive()
    }
}
