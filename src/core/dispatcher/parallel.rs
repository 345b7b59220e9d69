//! Multi-queue dispatcher.
//!
//! # Queues and shifts
//!
//! | Strategy    | Affinity  | Queue              | Shift                  |
//! |-------------|-----------|--------------------|------------------------|
//! | Parallel    | Any       | parallel (N)       | Parallel               |
//! | Parallel    | Exclusive | parallel-exclusive | Parallel               |
//! | NonParallel | Any       | serial             | NonParallel            |
//! | NonParallel | Exclusive | serial-exclusive   | NonParallelExclusive   |
//!
//! Direct and single-threaded items never touch a queue; they run on the dispatching thread.
//!
//! # Coordination
//!
//! A coordinator thread owns phase progression. It wakes on end-of-shift, newly arrived
//! work, cancellation and composite completion, and then starts the first shift (in
//! priority order) that has work. Only one shift is active at a time, so no serial item
//! starts while parallel work is queued or running.
//!
//! # Isolation
//!
//! When a worker is about to run a composite that requires isolation, every queue is
//! saved and the composite becomes the top-level item. Once it is terminal the queues
//! are restored, innermost level first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{DispatchCounters, DispatcherStats, RunOutcome, RunTracker, WorkItemDispatcher};
use crate::config::DispatcherConfig;
use crate::core::events::{DispatcherEvent, EventBus};
use crate::core::queue::WorkItemQueue;
use crate::core::shift::{Lane, ShiftKind, ShiftListener, WorkShift};
use crate::core::work_item::{
    CompletionNotice, ExecutionStrategy, ThreadAffinity, WorkItem, WorkItemId,
};
use crate::core::DispatchError;

/// Messages that wake the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    EndOfShift(ShiftKind),
    WorkArrived,
    CancelRequested,
    Stop,
}

/// How finishing a run treats worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Join,
    Detach,
}

struct Queues {
    parallel: Arc<WorkItemQueue>,
    parallel_exclusive: Arc<WorkItemQueue>,
    serial: Arc<WorkItemQueue>,
    serial_exclusive: Arc<WorkItemQueue>,
}

impl Queues {
    fn new() -> Self {
        Self {
            parallel: Arc::new(WorkItemQueue::new("parallel")),
            parallel_exclusive: Arc::new(WorkItemQueue::new("parallel-exclusive")),
            serial: Arc::new(WorkItemQueue::new("serial")),
            serial_exclusive: Arc::new(WorkItemQueue::new("serial-exclusive")),
        }
    }

    fn all(&self) -> [&Arc<WorkItemQueue>; 4] {
        [
            &self.parallel,
            &self.parallel_exclusive,
            &self.serial,
            &self.serial_exclusive,
        ]
    }

    /// Lanes owned by the shift of `kind`.
    fn lanes(&self, kind: ShiftKind, parallel_workers: usize) -> Vec<Lane> {
        let lane = |queue: &Arc<WorkItemQueue>, workers| Lane {
            queue: Arc::clone(queue),
            workers,
        };
        match kind {
            ShiftKind::Parallel => vec![
                lane(&self.parallel, parallel_workers),
                lane(&self.parallel_exclusive, 1),
            ],
            ShiftKind::NonParallel => vec![lane(&self.serial, 1)],
            ShiftKind::NonParallelExclusive => vec![lane(&self.serial_exclusive, 1)],
        }
    }

    fn route(
        &self,
        strategy: ExecutionStrategy,
        affinity: ThreadAffinity,
    ) -> (&Arc<WorkItemQueue>, ShiftKind) {
        match (strategy, affinity) {
            (ExecutionStrategy::Parallel, ThreadAffinity::Any) => {
                (&self.parallel, ShiftKind::Parallel)
            }
            (ExecutionStrategy::Parallel, ThreadAffinity::Exclusive) => {
                (&self.parallel_exclusive, ShiftKind::Parallel)
            }
            (_, ThreadAffinity::Any) => (&self.serial, ShiftKind::NonParallel),
            (_, ThreadAffinity::Exclusive) => {
                (&self.serial_exclusive, ShiftKind::NonParallelExclusive)
            }
        }
    }
}

#[derive(Default)]
struct Isolation {
    top_level: Option<Arc<WorkItem>>,
    saved: Vec<Option<Arc<WorkItem>>>,
}

pub(crate) struct ParallelShared {
    self_ref: Weak<ParallelShared>,
    config: DispatcherConfig,
    queues: Queues,
    shifts: Vec<WorkShift>,
    active_items: Mutex<HashMap<WorkItemId, Arc<WorkItem>>>,
    isolation: Mutex<Isolation>,
    run: RunTracker,
    shift_active: AtomicBool,
    cancel_requested: AtomicBool,
    finishing: AtomicBool,
    control_tx: Sender<Control>,
    control_rx: Receiver<Control>,
    completion_tx: Sender<CompletionNotice>,
    completion_rx: Receiver<CompletionNotice>,
    events: EventBus,
    counters: DispatchCounters,
}

/// Dispatcher running items on a fixed set of queues and worker threads.
///
/// ```rust
/// use std::time::Duration;
/// use prometheus_work_dispatch::config::DispatcherConfig;
/// use prometheus_work_dispatch::core::{
///     ParallelDispatcher, ParallelScope, RunOutcome, WorkItem, WorkItemDispatcher,
/// };
///
/// let dispatcher = ParallelDispatcher::new(DispatcherConfig::new().with_parallel_workers(2))?;
/// let suite = WorkItem::composite("suite")
///     .parallel_scope(ParallelScope::Children)
///     .children((0..4).map(|i| WorkItem::leaf(format!("case_{i}"), |_| Ok(())).build()))
///     .build();
///
/// dispatcher.start(suite)?;
/// assert_eq!(dispatcher.wait_for_completion(Duration::from_secs(10))?, RunOutcome::Completed);
/// # Ok::<(), prometheus_work_dispatch::core::DispatchError>(())
/// ```
pub struct ParallelDispatcher {
    shared: Arc<ParallelShared>,
}

impl ParallelDispatcher {
    /// Create a dispatcher. No thread is spawned until `start`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the configuration is invalid or asks for zero parallel workers.
    pub fn new(config: DispatcherConfig) -> Result<Self, DispatchError> {
        config.validate().map_err(DispatchError::InvalidConfig)?;
        if config.parallel_workers == 0 {
            return Err(DispatchError::InvalidConfig(
                "parallel dispatcher needs at least one parallel worker".into(),
            ));
        }
        Ok(Self {
            shared: ParallelShared::new(config),
        })
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        self.shared.stats()
    }

    /// Current isolation nesting depth.
    #[must_use]
    pub fn isolation_depth(&self) -> usize {
        self.shared.isolation.lock().saved.len()
    }

    /// Outcome of the run, once it has finished.
    #[must_use]
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.shared.run.outcome()
    }

    /// Wait for the run from async code without blocking the runtime.
    ///
    /// # Errors
    ///
    /// Same as [`WorkItemDispatcher::wait_for_completion`], plus `IllegalState` if the
    /// blocking task could not complete.
    #[cfg(feature = "tokio-runtime")]
    pub async fn wait_async(&self, timeout: Duration) -> Result<RunOutcome, DispatchError> {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || shared.run.wait(timeout))
            .await
            .map_err(|e| DispatchError::IllegalState(format!("wait task failed: {e}")))?
    }
}

impl WorkItemDispatcher for ParallelDispatcher {
    fn start(&self, root: Arc<WorkItem>) -> Result<(), DispatchError> {
        self.shared.begin_run(root)
    }

    fn dispatch(&self, item: Arc<WorkItem>) -> Result<(), DispatchError> {
        self.shared.route_item(item)
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

impl Drop for ParallelDispatcher {
    fn drop(&mut self) {
        // Signal only; joining here could hang on a stuck item.
        if self.shared.run.is_running() {
            debug!("dispatcher dropped with an active run; workers will be detached");
            self.shared.cancel_requested.store(true, Ordering::SeqCst);
            for shift in &self.shared.shifts {
                shift.cancel();
            }
        }
        let _ = self.shared.control_tx.send(Control::Stop);
    }
}

impl std::fmt::Debug for ParallelDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelDispatcher")
            .field("config", &self.shared.config)
            .field("stats", &self.shared.stats())
            .finish_non_exhaustive()
    }
}

impl ParallelShared {
    fn new(config: DispatcherConfig) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let listener: Weak<dyn ShiftListener> = me.clone();
            let dispatcher: Weak<dyn WorkItemDispatcher> = me.clone();
            let queues = Queues::new();
            let shifts = ShiftKind::PRIORITY
                .iter()
                .map(|&kind| {
                    WorkShift::new(
                        kind,
                        queues.lanes(kind, config.parallel_workers),
                        Weak::clone(&listener),
                        Weak::clone(&dispatcher),
                    )
                })
                .collect();
            let (control_tx, control_rx) = unbounded();
            let (completion_tx, completion_rx) = unbounded();
            Self {
                self_ref: me.clone(),
                config,
                queues,
                shifts,
                active_items: Mutex::new(HashMap::new()),
                isolation: Mutex::new(Isolation::default()),
                run: RunTracker::new(),
                shift_active: AtomicBool::new(false),
                cancel_requested: AtomicBool::new(false),
                finishing: AtomicBool::new(false),
                control_tx,
                control_rx,
                completion_tx,
                completion_rx,
                events: EventBus::new(),
                counters: DispatchCounters::default(),
            }
        })
    }

    fn stats(&self) -> DispatcherStats {
        let depth = self.isolation.lock().saved.len();
        let active = self.active_items.lock().len();
        self.counters.snapshot(depth, active)
    }

    fn begin_run(&self, root: Arc<WorkItem>) -> Result<(), DispatchError> {
        self.run.begin(Arc::clone(&root))?;
        info!(
            root = %root.name(),
            parallel_workers = self.config.parallel_workers,
            "starting run"
        );
        {
            let mut isolation = self.isolation.lock();
            isolation.top_level = Some(Arc::clone(&root));
            isolation.saved.clear();
        }

        if let Err(e) = self.spawn_threads() {
            warn!(error = %e, "could not start dispatcher threads; cancelling run");
            self.cancel_requested.store(true, Ordering::SeqCst);
            root.cancel(self);
            self.finish_run(Teardown::Detach);
            return Err(e);
        }

        root.set_execution_strategy(ExecutionStrategy::for_root(root.parallel_scope()));
        let dispatched = self.route_item(root);
        let _ = self.control_tx.send(Control::WorkArrived);
        dispatched
    }

    fn spawn_threads(&self) -> Result<(), DispatchError> {
        let prefix = &self.config.thread_name_prefix;
        for shift in &self.shifts {
            shift.spawn_workers(prefix, self.config.thread_stack_size)?;
        }

        let Some(shared) = self.self_ref.upgrade() else {
            return Err(DispatchError::IllegalState("dispatcher is shutting down".into()));
        };
        let name = format!("{prefix}-coordinator");
        thread::Builder::new()
            .name(name.clone())
            .stack_size(self.config.thread_stack_size)
            .spawn(move || shared.coordinate())
            .map_err(|source| {
                tracing::error!(thread = %name, error = %source, "failed to spawn coordinator");
                DispatchError::WorkerSpawn { name, source }
            })?;
        Ok(())
    }

    fn route_item(&self, item: Arc<WorkItem>) -> Result<(), DispatchError> {
        self.run.ensure_started()?;
        DispatchCounters::bump(&self.counters.dispatched_items);

        if self.run.is_finished() {
            DispatchCounters::bump(&self.counters.cancelled_dispatches);
            item.cancel(self);
            return Err(DispatchError::IllegalState("run already finished".into()));
        }
        if self.cancelled() {
            debug!(item = %item.name(), "run cancelled; cancelling dispatched item");
            DispatchCounters::bump(&self.counters.cancelled_dispatches);
            item.cancel(self);
            return Ok(());
        }

        if item.is_composite() {
            self.active_items.lock().insert(item.id(), Arc::clone(&item));
            item.on_completion(self.completion_tx.clone());
        }

        // The single-threaded flag may have been set after the strategy was chosen.
        let strategy = item.execution_strategy();
        if item.is_single_threaded() || strategy == ExecutionStrategy::Direct {
            self.execute_inline(&item);
            return Ok(());
        }

        let (queue, kind) = self.queues.route(strategy, item.thread_affinity());
        debug!(item = %item.name(), ?strategy, queue = %queue.name(), "work item enqueued");
        if let Err(e) = queue.enqueue(Arc::clone(&item)) {
            DispatchCounters::bump(&self.counters.cancelled_dispatches);
            item.cancel(self);
            return Err(e);
        }
        DispatchCounters::bump(&self.counters.queued_items);

        // A lower-priority shift must not take new items while this one waits. Yielding
        // an inactive shift is a no-op; `advance` rechecks before starting one.
        for shift in self.shifts.iter().filter(|s| s.kind() > kind) {
            shift.yield_shift();
        }
        let _ = self.control_tx.send(Control::WorkArrived);
        Ok(())
    }

    fn execute_inline(&self, item: &Arc<WorkItem>) {
        DispatchCounters::bump(&self.counters.inline_executions);
        debug!(item = %item.name(), "executing work item inline");
        match self.self_ref.upgrade() {
            Some(shared) => {
                let dispatcher: Arc<dyn WorkItemDispatcher> = shared;
                item.execute(&dispatcher);
            }
            None => item.cancel(self),
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    fn on_worker_thread(&self) -> bool {
        self.shifts.iter().any(WorkShift::owns_current_thread)
    }

    fn request_cancel(&self, force: bool) -> Result<(), DispatchError> {
        self.run.ensure_started()?;
        if self.run.is_finished() {
            debug!("cancel requested after the run finished; ignoring");
            return Ok(());
        }
        if !self.cancel_requested.swap(true, Ordering::SeqCst) {
            info!(force, "cancelling run");
        }
        for shift in &self.shifts {
            shift.cancel();
        }
        let _ = self.control_tx.send(Control::CancelRequested);

        if force {
            let root = self.run.root();
            if self.on_worker_thread() {
                // The root cannot settle while the calling body is still running.
                debug!("forced cancellation requested from a worker; not waiting");
            } else {
                let timeout = self.config.forced_cancel_timeout();
                let settled = root
                    .as_ref()
                    .is_none_or(|root| root.wait_for_completion(timeout));
                if !settled {
                    warn!(
                        timeout_ms = self.config.forced_cancel_timeout_ms,
                        "forced cancellation timed out; abandoning remaining work"
                    );
                }
            }
            let stragglers: Vec<_> = self
                .active_items
                .lock()
                .values()
                .filter(|item| !item.state().is_terminal())
                .cloned()
                .chain(root)
                .collect();
            // Claim every finalization first: an abandoned child must not count its
            // parent down into a teardown.
            for item in &stragglers {
                item.seal_finalization();
            }
            for item in &stragglers {
                item.force_cancel();
            }
            self.finish_run(Teardown::Detach);
            let _ = self.control_tx.send(Control::Stop);
        }
        Ok(())
    }

    /// Coordinator thread body.
    fn coordinate(&self) {
        debug!("coordinator started");
        let control = self.control_rx.clone();
        let completions = self.completion_rx.clone();
        loop {
            select! {
                recv(control) -> msg => match msg {
                    Ok(Control::EndOfShift(kind)) => {
                        self.shift_active.store(false, Ordering::SeqCst);
                        self.events.emit(&DispatcherEvent::ShiftFinished { shift: kind });
                    }
                    Ok(Control::WorkArrived | Control::CancelRequested) => {}
                    Ok(Control::Stop) | Err(_) => break,
                },
                recv(completions) -> notice => {
                    if let Ok(notice) = notice {
                        self.active_items.lock().remove(&notice.id);
                    }
                }
            }
            if self.finishing.load(Ordering::SeqCst) {
                break;
            }
            if self.shift_active.load(Ordering::SeqCst) {
                continue;
            }
            if self.advance() {
                break;
            }
        }
        debug!("coordinator exiting");
    }

    /// Start the next shift, unwind isolation, or finish the run. True once finished.
    fn advance(&self) -> bool {
        loop {
            if self.cancelled() {
                self.cancel_queued_items();
            }

            let top_level = self.isolation.lock().top_level.clone();
            let top_done = top_level
                .as_ref()
                .is_none_or(|item| item.state().is_terminal());

            if !top_done {
                self.start_next_shift();
                return false;
            }

            if !self.try_restore_queues() {
                self.finish_run(Teardown::Join);
                return true;
            }
        }
    }

    /// Start the first shift, in priority order, that has work.
    ///
    /// Work may be enqueued while this runs. A shift only starts if no higher-priority
    /// shift has work at that moment; otherwise the scan starts over.
    fn start_next_shift(&self) {
        loop {
            let Some(shift) = self.shifts.iter().find(|s| s.has_work()) else {
                self.shift_active.store(false, Ordering::SeqCst);
                return;
            };
            self.shift_active.store(true, Ordering::SeqCst);
            let higher_has_work = || {
                self.shifts
                    .iter()
                    .filter(|s| s.kind() < shift.kind())
                    .any(WorkShift::has_work)
            };
            if shift.start(higher_has_work) {
                DispatchCounters::bump(&self.counters.shifts_started);
                self.events
                    .emit(&DispatcherEvent::ShiftStarting { shift: shift.kind() });
                return;
            }
        }
    }

    /// Cancel everything still waiting on a queue, saved levels included.
    fn cancel_queued_items(&self) {
        for queue in self.queues.all() {
            for item in queue.drain() {
                debug!(item = %item.name(), queue = %queue.name(), "cancelling queued item");
                item.cancel(self);
            }
        }
    }

    fn isolate_queues(&self, item: &Arc<WorkItem>) {
        let depth = {
            let mut isolation = self.isolation.lock();
            if isolation
                .top_level
                .as_ref()
                .is_some_and(|top| Arc::ptr_eq(top, item))
            {
                return;
            }
            for queue in self.queues.all() {
                queue.save();
            }
            let previous = isolation.top_level.replace(Arc::clone(item));
            isolation.saved.push(previous);
            isolation.saved.len()
        };
        DispatchCounters::bump(&self.counters.isolation_entries);
        info!(item = %item.name(), depth, "isolating queues");
        self.events.emit(&DispatcherEvent::IsolationEntered {
            item: item.name().to_string(),
            depth,
        });
    }

    /// Pop one isolation level. False when there is none left.
    fn try_restore_queues(&self) -> bool {
        let (finished, depth) = {
            let mut isolation = self.isolation.lock();
            let Some(previous) = isolation.saved.pop() else {
                return false;
            };
            let finished = std::mem::replace(&mut isolation.top_level, previous);
            for queue in self.queues.all() {
                queue.restore();
            }
            (finished, isolation.saved.len())
        };
        let name = finished.as_ref().map_or_else(String::new, |i| i.name().to_string());
        info!(item = %name, depth, "restoring queues");
        self.events
            .emit(&DispatcherEvent::IsolationExited { item: name, depth });
        true
    }

    fn finish_run(&self, teardown: Teardown) {
        if self.finishing.swap(true, Ordering::SeqCst) {
            return;
        }
        let outcome = if self.cancelled() {
            RunOutcome::Cancelled
        } else {
            RunOutcome::Completed
        };

        for queue in self.queues.all() {
            queue.stop();
        }
        self.cancel_queued_items();

        let join_timeout = match teardown {
            Teardown::Join => Some(self.config.shutdown_join_timeout()),
            Teardown::Detach => None,
        };
        for shift in &self.shifts {
            shift.shutdown(join_timeout);
        }
        self.active_items.lock().clear();

        info!(?outcome, "run finished");
        self.events.emit(&DispatcherEvent::RunFinished { outcome });
        self.run.finish(outcome);
    }
}

impl WorkItemDispatcher for ParallelShared {
    fn start(&self, root: Arc<WorkItem>) -> Result<(), DispatchError> {
        self.begin_run(root)
    }

    fn dispatch(&self, item: Arc<WorkItem>) -> Result<(), DispatchError> {
        self.route_item(item)
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

impl ShiftListener for ParallelShared {
    fn work_item_starting(&self, item: &Arc<WorkItem>) {
        if item.is_composite() && item.requires_isolation() && !self.cancelled() {
            self.isolate_queues(item);
        }
    }

    fn shift_ended(&self, kind: ShiftKind) {
        let _ = self.control_tx.send(Control::EndOfShift(kind));
    }
}
