//! Single-threaded dispatcher.
//!
//! Used when the level of parallelism is zero. The root runs on one dedicated thread and
//! every dispatched item runs inline on whatever thread dispatches it, which in practice
//! is that same thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{DispatchCounters, DispatcherStats, RunOutcome, RunTracker, WorkItemDispatcher};
use crate::config::DispatcherConfig;
use crate::core::events::{DispatcherEvent, EventBus};
use crate::core::work_item::{ExecutionStrategy, WorkItem};
use crate::core::DispatchError;

pub(crate) struct SimpleShared {
    self_ref: Weak<SimpleShared>,
    config: DispatcherConfig,
    run: RunTracker,
    cancel_requested: AtomicBool,
    finishing: AtomicBool,
    runner: Mutex<Option<JoinHandle<()>>>,
    events: EventBus,
    counters: DispatchCounters,
}

/// Dispatcher that runs the whole tree on one thread.
pub struct SimpleDispatcher {
    shared: Arc<SimpleShared>,
}

impl SimpleDispatcher {
    /// Create a dispatcher.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the configuration does not validate.
    pub fn new(config: DispatcherConfig) -> Result<Self, DispatchError> {
        config.validate().map_err(DispatchError::InvalidConfig)?;
        Ok(Self {
            shared: Arc::new_cyclic(|me| SimpleShared {
                self_ref: me.clone(),
                config,
                run: RunTracker::new(),
                cancel_requested: AtomicBool::new(false),
                finishing: AtomicBool::new(false),
                runner: Mutex::new(None),
                events: EventBus::new(),
                counters: DispatchCounters::default(),
            }),
        })
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    /// Current statistics. Queue and isolation figures are always zero.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        self.shared.counters.snapshot(0, 0)
    }

    /// Outcome of the run, once it has finished.
    #[must_use]
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.shared.run.outcome()
    }

    /// Join the runner thread, waiting at most the configured shutdown timeout.
    ///
    /// Returns true when the thread has exited (or was never started).
    pub fn join_runner(&self) -> bool {
        let Some(handle) = self.shared.runner.lock().take() else {
            return true;
        };
        if handle.thread().id() == thread::current().id() {
            return false;
        }
        let (tx, rx) = std::sync::mpsc::channel();
        let joiner = thread::spawn(move || {
            let _ = tx.send(handle.join().is_ok());
        });
        match rx.recv_timeout(self.shared.config.shutdown_join_timeout()) {
            Ok(clean) => {
                if !clean {
                    warn!("runner thread panicked");
                }
                let _ = joiner.join();
                true
            }
            Err(_) => {
                warn!("runner did not exit within timeout; detaching");
                false
            }
        }
    }
}

impl WorkItemDispatcher for SimpleDispatcher {
    fn start(&self, root: Arc<WorkItem>) -> Result<(), DispatchError> {
        self.shared.begin_run(root)
    }

    fn dispatch(&self, item: Arc<WorkItem>) -> Result<(), DispatchError> {
        self.shared.run_inline(item)
    }

    fn cancel_run(&self, force: bool) -> Result<(), DispatchError> {
        self.shared.request_cancel(force)
    }

    fn wait_for_completion(&self, timeout: Duration) -> Result<RunOutcome, DispatchError> {
        self.shared.run.wait(timeout)
    }

    fn is_cancellation_requested(&self) -> bool {
        self.shared.cancelled()
    }

    fn subscribe(&self) -> Receiver<DispatcherEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for SimpleDispatcher {
    fn drop(&mut self) {
        if self.shared.run.is_running() {
            debug!("simple dispatcher dropped with an active run; runner will be detached");
            self.shared.cancel_requested.store(true, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for SimpleDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleDispatcher")
            .field("config", &self.shared.config)
            .field("outcome", &self.shared.run.outcome())
            .finish_non_exhaustive()
    }
}

impl SimpleShared {
    fn cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    fn begin_run(&self, root: Arc<WorkItem>) -> Result<(), DispatchError> {
        self.run.begin(Arc::clone(&root))?;
        root.set_execution_strategy(ExecutionStrategy::Direct);
        DispatchCounters::bump(&self.counters.dispatched_items);
        info!(root = %root.name(), "starting single-threaded run");

        let Some(shared) = self.self_ref.upgrade() else {
            return Err(DispatchError::IllegalState("dispatcher is shutting down".into()));
        };
        let name = format!("{}-runner", self.config.thread_name_prefix);
        let runner_root = Arc::clone(&root);
        // Held across the spawn so the runner always finds its own handle.
        let mut runner = self.runner.lock();
        let spawned = thread::Builder::new()
            .name(name.clone())
            .stack_size(self.config.thread_stack_size)
            .spawn(move || shared.run_root(&runner_root));

        match spawned {
            Ok(handle) => {
                *runner = Some(handle);
                Ok(())
            }
            Err(source) => {
                drop(runner);
                tracing::error!(thread = %name, error = %source, "failed to spawn runner");
                self.cancel_requested.store(true, Ordering::SeqCst);
                root.cancel(self);
                self.finish_run();
                Err(DispatchError::WorkerSpawn { name, source })
            }
        }
    }

    /// Runner thread body.
    fn run_root(&self, root: &Arc<WorkItem>) {
        if self.cancelled() {
            root.cancel(self);
        } else {
            self.execute(root);
        }
        if !root.state().is_terminal() {
            warn!(root = %root.name(), state = ?root.state(), "root not terminal after execution");
        }
        self.finish_run();
    }

    fn execute(&self, item: &Arc<WorkItem>) {
        DispatchCounters::bump(&self.counters.inline_executions);
        match self.self_ref.upgrade() {
            Some(shared) => {
                let dispatcher: Arc<dyn WorkItemDispatcher> = shared;
                item.execute(&dispatcher);
            }
            None => item.cancel(self),
        }
    }

    fn run_inline(&self, item: Arc<WorkItem>) -> Result<(), DispatchError> {
        self.run.ensure_started()?;
        DispatchCounters::bump(&self.counters.dispatched_items);
        if self.run.is_finished() {
            DispatchCounters::bump(&self.counters.cancelled_dispatches);
            item.cancel(self);
            return Err(DispatchError::IllegalState("run already finished".into()));
        }
        if self.cancelled() {
            DispatchCounters::bump(&self.counters.cancelled_dispatches);
            item.cancel(self);
            return Ok(());
        }
        item.set_execution_strategy(ExecutionStrategy::Direct);
        self.execute(&item);
        Ok(())
    }

    fn request_cancel(&self, force: bool) -> Result<(), DispatchError> {
        self.run.ensure_started()?;
        if self.run.is_finished() {
            return Ok(());
        }
        if !self.cancel_requested.swap(true, Ordering::SeqCst) {
            info!(force, "cancelling single-threaded run");
        }
        if force {
            let root = self.run.root();
            if self.on_runner_thread() {
                debug!("forced cancellation requested from the runner; not waiting");
            } else {
                let settled = root.as_ref().is_none_or(|root| {
                    root.wait_for_completion(self.config.forced_cancel_timeout())
                });
                if !settled {
                    warn!(
                        timeout_ms = self.config.forced_cancel_timeout_ms,
                        "forced cancellation timed out; abandoning the runner"
                    );
                }
            }
            if let Some(root) = root {
                root.seal_finalization();
                root.force_cancel();
            }
            self.finish_run();
        }
        Ok(())
    }

    fn on_runner_thread(&self) -> bool {
        self.runner
            .lock()
            .as_ref()
            .is_some_and(|handle| handle.thread().id() == thread::current().id())
    }

    fn finish_run(&self) {
        if self.finishing.swap(true, Ordering::SeqCst) {
            return;
        }
        let outcome = if self.cancelled() {
            RunOutcome::Cancelled
        } else {
            RunOutcome::Completed
        };
        info!(?outcome, "run finished");
        self.events.emit(&DispatcherEvent::RunFinished { outcome });
        self.run.finish(outcome);
    }
}

impl WorkItemDispatcher for SimpleShared {
    fn start(&self, root: Arc<WorkItem>) -> Result<(), DispatchError> {
        self.begin_run(root)
    }

    fn dispatch(&self, item: Arc<WorkItem>) -> Result<(), DispatchError> {
        self.run_inline(item)
    }

    fn cancel_run(&self, force: bool) -> Result<(), DispatchError> {
        self.request_cancel(force)
    }

    fn wait_for_completion(&self, timeout: Duration) -> Result<RunOutcome, DispatchError> {
        self.run.wait(timeout)
    }

    fn is_cancellation_requested(&self) -> bool {
        self.cancelled()
    }

    fn subscribe(&self) -> Receiver<DispatcherEvent> {
        self.events.subscribe()
    }
}
