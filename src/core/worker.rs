//! Worker threads.
//!
//! Each worker is a dedicated OS thread bound to one queue. It blocks in
//! [`WorkItemQueue::dequeue`] (no polling), runs the item it gets, reports back and
//! repeats until the queue is stopped or the worker is cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;

use super::dispatcher::WorkItemDispatcher;
use super::queue::WorkItemQueue;
use super::work_item::{WorkItem, WorkItemState, WorkOutcome};
use super::DispatchError;

/// Callbacks a worker makes around every item it runs.
pub(crate) trait WorkerHooks: Send + Sync {
    /// The worker is about to run `item`.
    fn item_starting(&self, item: &Arc<WorkItem>);

    /// Dispatcher the item executes against; `None` once it has been dropped.
    fn dispatcher(&self) -> Option<Arc<dyn WorkItemDispatcher>>;

    /// The worker finished an item taken from `queue` and is idle again.
    fn item_finished(&self, queue: &WorkItemQueue);
}

/// Handle to one worker thread.
pub(crate) struct TestWorker {
    name: String,
    thread_id: ThreadId,
    cancelled: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TestWorker {
    /// Spawn a worker draining `queue`.
    pub fn spawn(
        name: String,
        stack_size: usize,
        queue: Arc<WorkItemQueue>,
        hooks: Arc<dyn WorkerHooks>,
    ) -> Result<Self, DispatchError> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let busy = Arc::new(AtomicBool::new(false));

        let handle = {
            let cancelled = Arc::clone(&cancelled);
            let busy = Arc::clone(&busy);
            let worker = name.clone();
            thread::Builder::new()
                .name(name.clone())
                .stack_size(stack_size)
                .spawn(move || run_worker(&worker, &queue, hooks.as_ref(), &cancelled, &busy))
                .map_err(|source| {
                    tracing::error!(worker = %name, error = %source, "failed to spawn worker thread");
                    DispatchError::WorkerSpawn {
                        name: name.clone(),
                        source,
                    }
                })?
        };

        Ok(Self {
            name,
            thread_id: handle.thread().id(),
            cancelled,
            busy,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Stop taking new items. The current item, if any, still runs to its end.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Join the thread, giving up after `timeout`.
    ///
    /// A worker that does not exit in time is detached. Joining from the worker's own
    /// thread detaches immediately. Returns true if the thread was joined.
    pub fn join(&self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.lock().take() else {
            return true;
        };
        if self.thread_id == thread::current().id() {
            tracing::debug!(worker = %self.name, "not joining the current thread; detaching");
            return false;
        }

        let (tx, rx) = mpsc::channel();
        let joiner = thread::Builder::new()
            .name(format!("{}-join", self.name))
            .spawn(move || {
                let _ = tx.send(handle.join().is_ok());
            });
        let joiner = match joiner {
            Ok(joiner) => joiner,
            Err(e) => {
                tracing::warn!(worker = %self.name, error = %e, "could not spawn join helper; detaching worker");
                return false;
            }
        };

        match rx.recv_timeout(timeout) {
            Ok(true) => {
                tracing::debug!(worker = %self.name, "worker joined");
                let _ = joiner.join();
                true
            }
            Ok(false) => {
                tracing::warn!(worker = %self.name, "worker thread panicked");
                let _ = joiner.join();
                true
            }
            Err(_) => {
                tracing::warn!(worker = %self.name, "worker did not exit within timeout; detaching");
                false
            }
        }
    }

    /// Let the thread run on without ever joining it.
    pub fn detach(&self) {
        if self.handle.lock().take().is_some() {
            tracing::debug!(worker = %self.name, "worker detached");
        }
    }
}

impl std::fmt::Debug for TestWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestWorker")
            .field("name", &self.name)
            .field("busy", &self.is_busy())
            .field("cancelled", &self.cancelled.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

fn run_worker(
    worker: &str,
    queue: &WorkItemQueue,
    hooks: &dyn WorkerHooks,
    cancelled: &AtomicBool,
    busy: &AtomicBool,
) {
    tracing::debug!(worker, queue = %queue.name(), "worker started");
    loop {
        if cancelled.load(Ordering::Acquire) {
            tracing::debug!(worker, "worker cancelled");
            break;
        }
        let Some(item) = queue.dequeue() else {
            break;
        };

        busy.store(true, Ordering::Release);
        hooks.item_starting(&item);
        tracing::debug!(worker, item = %item.name(), "worker executing item");
        match hooks.dispatcher() {
            Some(dispatcher) => item.execute(&dispatcher),
            None => item.abandon(WorkItemState::Cancelled, &WorkOutcome::Cancelled),
        }
        busy.store(false, Ordering::Release);
        hooks.item_finished(queue);
    }
    tracing::debug!(worker, "worker exiting");
}
