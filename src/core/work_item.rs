//! Work items: the units the dispatcher routes to queues and workers.
//!
//! A [`WorkItem`] is either a leaf (an opaque [`WorkBody`]), a composite (a fixture-like
//! node owning child items, see [`super::composite`]) or the synthetic finalization item a
//! composite enqueues once all of its children have finished.
//!
//! Items are shared as `Arc<WorkItem>`. The `parent` link is a `Weak` back-reference and
//! never keeps a parent alive.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::composite::{CompositeBuilder, CompositeWork, FinalizeMode};
use super::dispatcher::WorkItemDispatcher;
use super::executor::{run_body, WorkBody, WorkContext};
use super::AppResult;

/// Stable identifier of a work item.
pub type WorkItemId = Uuid;

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    /// Created, not yet executed.
    Ready,
    /// Executing, or (for composites) children are still running.
    Running,
    /// All children finished; the finalization item is pending.
    WaitingForChildren,
    /// Finished normally.
    Complete,
    /// Finished without running to completion.
    Cancelled,
}

impl WorkItemState {
    /// Complete and Cancelled are terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled)
    }
}

/// How an item is executed once dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Run synchronously on the dispatching thread, no queue involved.
    Direct,
    /// Run on the parallel queue family.
    Parallel,
    /// Run on the serial queue family.
    NonParallel,
}

impl ExecutionStrategy {
    /// Strategy of a root item, derived from its own declared scope and nothing else.
    #[must_use]
    pub const fn for_root(scope: ParallelScope) -> Self {
        match scope {
            ParallelScope::Default | ParallelScope::None => Self::NonParallel,
            ParallelScope::Item | ParallelScope::Children | ParallelScope::All => Self::Parallel,
        }
    }
}

/// Which workers may run an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadAffinity {
    /// Any worker of the selected family.
    #[default]
    Any,
    /// Only the dedicated single-thread worker of the selected family.
    Exclusive,
}

/// Parallelism declared by an item for itself and its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelScope {
    /// Nothing declared; inherits from the parent context.
    #[default]
    Default,
    /// Must never run in parallel with other items.
    None,
    /// The item itself may run in parallel.
    Item,
    /// The item's children may run in parallel.
    Children,
    /// Both the item and its children may run in parallel.
    All,
}

impl ParallelScope {
    /// True when the item itself is declared parallel.
    #[must_use]
    pub const fn covers_item(self) -> bool {
        matches!(self, Self::Item | Self::All)
    }

    /// True when children of the item are declared parallel.
    #[must_use]
    pub const fn covers_children(self) -> bool {
        matches!(self, Self::Children | Self::All)
    }
}

/// Result recorded by an item when it reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOutcome {
    /// The body ran and reported no error.
    Success,
    /// The body (or a composite's setup/teardown) failed.
    Failure(String),
    /// The item was never run, with the reason.
    NotRun(String),
    /// The item was cancelled.
    Cancelled,
}

/// Notice sent to completion subscribers when an item reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionNotice {
    /// Identifier of the finished item.
    pub id: WorkItemId,
    /// Name of the finished item.
    pub name: String,
    /// Terminal state reached.
    pub state: WorkItemState,
}

pub(crate) enum WorkItemKind {
    Leaf(Box<dyn WorkBody>),
    Composite(CompositeWork),
    Finalization(Arc<WorkItem>),
}

struct Status {
    state: WorkItemState,
    outcome: Option<WorkOutcome>,
}

/// Options shared by leaf and composite builders.
pub(crate) struct ItemOptions {
    pub name: String,
    pub scope: ParallelScope,
    pub affinity: ThreadAffinity,
    pub isolation: Option<bool>,
    pub single_threaded: bool,
}

impl ItemOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: ParallelScope::Default,
            affinity: ThreadAffinity::Any,
            isolation: None,
            single_threaded: false,
        }
    }
}

/// A schedulable unit of work.
pub struct WorkItem {
    id: WorkItemId,
    name: String,
    scope: ParallelScope,
    affinity: ThreadAffinity,
    inherited_exclusive: AtomicBool,
    isolation: Option<bool>,
    single_threaded: AtomicBool,
    strategy: Mutex<ExecutionStrategy>,
    parent: OnceLock<Weak<WorkItem>>,
    status: Mutex<Status>,
    finished: Condvar,
    subscribers: Mutex<Vec<Sender<CompletionNotice>>>,
    pub(crate) kind: WorkItemKind,
}

impl WorkItem {
    /// Start building a leaf item around a closure body.
    pub fn leaf<F>(name: impl Into<String>, body: F) -> WorkItemBuilder
    where
        F: Fn(&WorkContext<'_>) -> AppResult<()> + Send + Sync + 'static,
    {
        Self::leaf_with_body(name, body)
    }

    /// Start building a leaf item around any [`WorkBody`] implementation.
    pub fn leaf_with_body(name: impl Into<String>, body: impl WorkBody) -> WorkItemBuilder {
        WorkItemBuilder {
            options: ItemOptions::named(name),
            body: Box::new(body),
        }
    }

    /// Start building a composite item.
    pub fn composite(name: impl Into<String>) -> CompositeBuilder {
        CompositeBuilder::new(ItemOptions::named(name))
    }

    pub(crate) fn from_parts(options: ItemOptions, kind: WorkItemKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: options.name,
            scope: options.scope,
            affinity: options.affinity,
            inherited_exclusive: AtomicBool::new(false),
            isolation: options.isolation,
            single_threaded: AtomicBool::new(options.single_threaded),
            strategy: Mutex::new(ExecutionStrategy::for_root(options.scope)),
            parent: OnceLock::new(),
            status: Mutex::new(Status {
                state: WorkItemState::Ready,
                outcome: None,
            }),
            finished: Condvar::new(),
            subscribers: Mutex::new(Vec::new()),
            kind,
        }
    }

    /// The synthetic item that finalizes `composite` when it runs.
    pub(crate) fn finalization_for(composite: &Arc<Self>) -> Arc<Self> {
        let item = Self::from_parts(
            ItemOptions {
                name: format!("{} (finalize)", composite.name),
                scope: ParallelScope::Default,
                affinity: composite.thread_affinity(),
                isolation: Some(false),
                single_threaded: composite.is_single_threaded(),
            },
            WorkItemKind::Finalization(Arc::clone(composite)),
        );
        item.set_execution_strategy(composite.execution_strategy());
        Arc::new(item)
    }

    /// Stable identifier.
    #[must_use]
    pub const fn id(&self) -> WorkItemId {
        self.id
    }

    /// Human-readable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parallel scope declared by the item.
    #[must_use]
    pub const fn parallel_scope(&self) -> ParallelScope {
        self.scope
    }

    /// Effective affinity: the declared one, or Exclusive when inherited from a parent.
    #[must_use]
    pub fn thread_affinity(&self) -> ThreadAffinity {
        if self.affinity == ThreadAffinity::Exclusive
            || self.inherited_exclusive.load(Ordering::Acquire)
        {
            ThreadAffinity::Exclusive
        } else {
            ThreadAffinity::Any
        }
    }

    /// Strategy the dispatcher will use for this item.
    #[must_use]
    pub fn execution_strategy(&self) -> ExecutionStrategy {
        *self.strategy.lock()
    }

    pub(crate) fn set_execution_strategy(&self, strategy: ExecutionStrategy) {
        *self.strategy.lock() = strategy;
    }

    /// True for composites whose startup must not interleave with unrelated queued work.
    ///
    /// Unless overridden on the builder, a composite requires isolation when it runs
    /// with the NonParallel strategy.
    #[must_use]
    pub fn requires_isolation(&self) -> bool {
        self.is_composite()
            && self
                .isolation
                .unwrap_or_else(|| self.execution_strategy() == ExecutionStrategy::NonParallel)
    }

    /// True when the item must run inline on whatever thread dispatches it.
    #[must_use]
    pub fn is_single_threaded(&self) -> bool {
        self.single_threaded.load(Ordering::Acquire)
    }

    /// Require the item to run inline on the dispatching thread.
    ///
    /// The flag is read at dispatch time, so it may be set after the item was built.
    pub fn mark_single_threaded(&self) {
        self.single_threaded.store(true, Ordering::Release);
    }

    /// True for composite items.
    #[must_use]
    pub const fn is_composite(&self) -> bool {
        matches!(self.kind, WorkItemKind::Composite(_))
    }

    /// True for the synthetic item that finalizes a composite.
    #[must_use]
    pub const fn is_finalization(&self) -> bool {
        matches!(self.kind, WorkItemKind::Finalization(_))
    }

    /// Direct children of a composite; empty for every other kind.
    #[must_use]
    pub fn children(&self) -> &[Arc<Self>] {
        match &self.kind {
            WorkItemKind::Composite(work) => work.children(),
            _ => &[],
        }
    }

    /// The composite that owns this item, if it is still alive.
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Self>> {
        self.parent.get().and_then(Weak::upgrade)
    }

    pub(crate) fn attach_parent(&self, parent: &Arc<Self>) {
        if self.parent.set(Arc::downgrade(parent)).is_err() {
            tracing::warn!(
                item = %self.name,
                parent = %parent.name,
                "work item already has a parent; keeping the first one"
            );
        }
    }

    /// Copy the parts of the parent's context that children inherit.
    pub(crate) fn inherit_context(&self, parent: &Self) {
        if parent.is_single_threaded() {
            self.mark_single_threaded();
        }
        if parent.thread_affinity() == ThreadAffinity::Exclusive {
            self.inherited_exclusive.store(true, Ordering::Release);
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkItemState {
        self.status.lock().state
    }

    /// Outcome, once the item is terminal.
    #[must_use]
    pub fn outcome(&self) -> Option<WorkOutcome> {
        self.status.lock().outcome.clone()
    }

    /// Block until the item is terminal or `timeout` elapses. Returns true if terminal.
    #[must_use]
    pub fn wait_for_completion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self.status.lock();
        while !status.state.is_terminal() {
            if self.finished.wait_until(&mut status, deadline).timed_out() {
                return status.state.is_terminal();
            }
        }
        true
    }

    /// Subscribe to the item's completion. Fires immediately if already terminal.
    pub fn on_completion(&self, tx: Sender<CompletionNotice>) {
        let mut subscribers = self.subscribers.lock();
        let state = self.state();
        if state.is_terminal() {
            let _ = tx.send(self.notice(state));
        } else {
            subscribers.push(tx);
        }
    }

    fn notice(&self, state: WorkItemState) -> CompletionNotice {
        CompletionNotice {
            id: self.id,
            name: self.name.clone(),
            state,
        }
    }

    /// Run the item on the current thread.
    ///
    /// Never fails outward: body failures end up in [`WorkItem::outcome`]. Items that are
    /// not Ready (already run, or cancelled while queued) are skipped.
    pub fn execute(self: &Arc<Self>, dispatcher: &Arc<dyn WorkItemDispatcher>) {
        if !self.begin() {
            tracing::debug!(item = %self.name, state = ?self.state(), "skipping work item that is not ready");
            return;
        }
        match &self.kind {
            WorkItemKind::Leaf(body) => {
                let outcome = run_body(body.as_ref(), &WorkContext::new(self, dispatcher.as_ref()));
                self.finish(WorkItemState::Complete, outcome);
            }
            WorkItemKind::Composite(work) => self.perform_composite(work, dispatcher),
            WorkItemKind::Finalization(composite) => {
                composite.finalize(dispatcher.as_ref(), FinalizeMode::Normal);
                self.finish(WorkItemState::Complete, WorkOutcome::Success);
            }
        }
    }

    /// Cancel an item that never started. A finalization item still finalizes its
    /// composite, marked cancelled.
    pub(crate) fn cancel(self: &Arc<Self>, dispatcher: &dyn WorkItemDispatcher) {
        match &self.kind {
            WorkItemKind::Finalization(composite) => {
                composite.finalize(dispatcher, FinalizeMode::Cancelled);
                self.finish(WorkItemState::Cancelled, WorkOutcome::Cancelled);
            }
            _ => self.abandon(WorkItemState::Cancelled, &WorkOutcome::Cancelled),
        }
    }

    /// Mark the item and its whole subtree cancelled, whatever they are doing.
    ///
    /// Composites are finalized without running teardown. A body still executing on a
    /// worker keeps running, but its eventual result is discarded.
    pub(crate) fn force_cancel(self: &Arc<Self>) {
        if self.state().is_terminal() {
            return;
        }
        tracing::warn!(item = %self.name, "forcing work item to cancelled");
        self.abandon(WorkItemState::Cancelled, &WorkOutcome::Cancelled);
    }

    /// Move the subtree to a terminal state without running anything.
    pub(crate) fn abandon(&self, state: WorkItemState, outcome: &WorkOutcome) {
        if let WorkItemKind::Composite(work) = &self.kind {
            work.mark_finalized();
            for child in work.children() {
                child.abandon(state, outcome);
            }
        }
        self.finish(state, outcome.clone());
    }

    /// Claim finalization for every composite in the subtree so none of them tears down.
    pub(crate) fn seal_finalization(&self) {
        if let WorkItemKind::Composite(work) = &self.kind {
            work.mark_finalized();
            for child in work.children() {
                child.seal_finalization();
            }
        }
    }

    /// Ready -> Running. False if the item was already started or is terminal.
    fn begin(&self) -> bool {
        let mut status = self.status.lock();
        if status.state != WorkItemState::Ready {
            return false;
        }
        status.state = WorkItemState::Running;
        true
    }

    /// Non-terminal state change; ignored once the item is terminal.
    pub(crate) fn set_state(&self, state: WorkItemState) {
        let mut status = self.status.lock();
        if !status.state.is_terminal() {
            status.state = state;
        }
    }

    /// Enter a terminal state exactly once, then notify subscribers and the parent.
    pub(crate) fn finish(&self, state: WorkItemState, outcome: WorkOutcome) -> bool {
        {
            let mut status = self.status.lock();
            if status.state.is_terminal() {
                return false;
            }
            status.state = state;
            status.outcome = Some(outcome);
            self.finished.notify_all();
        }
        tracing::debug!(item = %self.name, ?state, "work item finished");

        let notice = self.notice(state);
        for tx in self.subscribers.lock().drain(..) {
            let _ = tx.send(notice.clone());
        }
        if let Some(parent) = self.parent() {
            parent.child_completed(self);
        }
        true
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("strategy", &self.execution_strategy())
            .field("affinity", &self.thread_affinity())
            .finish_non_exhaustive()
    }
}

/// Builder for leaf work items.
pub struct WorkItemBuilder {
    options: ItemOptions,
    body: Box<dyn WorkBody>,
}

impl WorkItemBuilder {
    /// Declare the item's parallel scope.
    #[must_use]
    pub fn parallel_scope(mut self, scope: ParallelScope) -> Self {
        self.options.scope = scope;
        self
    }

    /// Declare the item's thread affinity.
    #[must_use]
    pub fn affinity(mut self, affinity: ThreadAffinity) -> Self {
        self.options.affinity = affinity;
        self
    }

    /// Require inline execution on the dispatching thread.
    #[must_use]
    pub fn single_threaded(mut self, single_threaded: bool) -> Self {
        self.options.single_threaded = single_threaded;
        self
    }

    /// Finish the item.
    #[must_use]
    pub fn build(self) -> Arc<WorkItem> {
        Arc::new(WorkItem::from_parts(
            self.options,
            WorkItemKind::Leaf(self.body),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> WorkItemBuilder {
        WorkItem::leaf(name, |_| Ok(()))
    }

    #[test]
    fn test_root_strategy_follows_declared_scope_only() {
        assert_eq!(
            ExecutionStrategy::for_root(ParallelScope::Default),
            ExecutionStrategy::NonParallel
        );
        assert_eq!(
            ExecutionStrategy::for_root(ParallelScope::None),
            ExecutionStrategy::NonParallel
        );
        assert_eq!(
            ExecutionStrategy::for_root(ParallelScope::Item),
            ExecutionStrategy::Parallel
        );
        assert_eq!(
            ExecutionStrategy::for_root(ParallelScope::Children),
            ExecutionStrategy::Parallel
        );
        assert_eq!(
            ExecutionStrategy::for_root(ParallelScope::All),
            ExecutionStrategy::Parallel
        );
    }

    #[test]
    fn test_new_item_is_ready() {
        let item = noop("fresh").build();
        assert_eq!(item.state(), WorkItemState::Ready);
        assert!(item.outcome().is_none());
        assert!(!item.is_composite());
        assert!(item.children().is_empty());
        assert!(item.parent().is_none());
    }

    #[test]
    fn test_finish_is_exactly_once() {
        let item = noop("once").build();
        assert!(item.finish(WorkItemState::Complete, WorkOutcome::Success));
        assert!(!item.finish(WorkItemState::Cancelled, WorkOutcome::Cancelled));
        assert_eq!(item.state(), WorkItemState::Complete);
        assert_eq!(item.outcome(), Some(WorkOutcome::Success));
    }

    #[test]
    fn test_set_state_ignored_after_terminal() {
        let item = noop("terminal").build();
        item.finish(WorkItemState::Cancelled, WorkOutcome::Cancelled);
        item.set_state(WorkItemState::Running);
        assert_eq!(item.state(), WorkItemState::Cancelled);
    }

    #[test]
    fn test_completion_notice_for_late_subscriber() {
        let item = noop("late").build();
        item.finish(WorkItemState::Complete, WorkOutcome::Success);

        let (tx, rx) = crossbeam_channel::unbounded();
        item.on_completion(tx);
        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.id, item.id());
        assert_eq!(notice.state, WorkItemState::Complete);
    }

    #[test]
    fn test_wait_for_completion_times_out_then_succeeds() {
        let item = noop("waited").build();
        assert!(!item.wait_for_completion(Duration::from_millis(20)));

        let waiter = Arc::clone(&item);
        let handle = std::thread::spawn(move || waiter.wait_for_completion(Duration::from_secs(5)));
        item.finish(WorkItemState::Complete, WorkOutcome::Success);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_inherited_context() {
        let parent = noop("parent")
            .affinity(ThreadAffinity::Exclusive)
            .single_threaded(true)
            .build();
        let child = noop("child").build();
        assert_eq!(child.thread_affinity(), ThreadAffinity::Any);

        child.inherit_context(&parent);
        assert_eq!(child.thread_affinity(), ThreadAffinity::Exclusive);
        assert!(child.is_single_threaded());
    }

    #[test]
    fn test_sealed_subtree_ignores_child_completion() {
        let leaf = noop("leaf").build();
        let inner = WorkItem::composite("inner").child(Arc::clone(&leaf)).build();
        let outer = WorkItem::composite("outer").child(Arc::clone(&inner)).build();

        outer.seal_finalization();
        // Children forced before their parents must not count anything down.
        leaf.force_cancel();
        assert_eq!(leaf.state(), WorkItemState::Cancelled);
        assert_eq!(inner.state(), WorkItemState::Ready);
        inner.force_cancel();
        assert_eq!(outer.state(), WorkItemState::Ready);

        outer.force_cancel();
        assert_eq!(outer.state(), WorkItemState::Cancelled);
        assert_eq!(outer.outcome(), Some(WorkOutcome::Cancelled));
    }

    #[test]
    fn test_leaf_never_requires_isolation() {
        let leaf = noop("leaf").parallel_scope(ParallelScope::None).build();
        assert_eq!(leaf.execution_strategy(), ExecutionStrategy::NonParallel);
        assert!(!leaf.requires_isolation());
    }
}
