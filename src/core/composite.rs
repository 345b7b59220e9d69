//! Composite work items.
//!
//! A composite runs its one-time setup, dispatches every child, and counts children down
//! as they reach a terminal state. When the count hits zero it enqueues a finalization
//! item; running that item executes the teardown and completes the composite.
//!
//! Finalization happens exactly once per composite whichever path gets there first:
//! the finalization item, a cancelled finalization item, or forced abandonment.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::dispatcher::WorkItemDispatcher;
use super::executor::{run_body, WorkBody, WorkContext};
use super::work_item::{
    ExecutionStrategy, ItemOptions, ParallelScope, ThreadAffinity, WorkItem, WorkItemKind,
    WorkItemState, WorkOutcome,
};
use super::AppResult;

/// How a composite's finalization was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinalizeMode {
    /// The finalization item ran.
    Normal,
    /// The finalization item was cancelled before it could be queued or run.
    Cancelled,
}

/// Composite-only state carried by [`WorkItemKind::Composite`].
pub(crate) struct CompositeWork {
    setup: Option<Box<dyn WorkBody>>,
    teardown: Option<Box<dyn WorkBody>>,
    children: Vec<Arc<WorkItem>>,
    pending: AtomicUsize,
    finalized: AtomicBool,
    setup_failure: Mutex<Option<WorkOutcome>>,
    dispatcher: Mutex<Option<Weak<dyn WorkItemDispatcher>>>,
}

impl CompositeWork {
    pub fn children(&self) -> &[Arc<WorkItem>] {
        &self.children
    }

    /// Claim the right to finalize. Only the first caller gets true.
    fn try_begin_finalization(&self) -> bool {
        !self.finalized.swap(true, Ordering::AcqRel)
    }

    pub fn mark_finalized(&self) {
        self.finalized.store(true, Ordering::Release);
    }

    fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Decrement the pending count; true for the decrement that reaches zero.
    fn child_done(&self) -> bool {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok_and(|previous| previous == 1)
    }

    fn dispatcher(&self) -> Option<Arc<dyn WorkItemDispatcher>> {
        self.dispatcher.lock().as_ref().and_then(Weak::upgrade)
    }
}

impl WorkItem {
    /// Running phase of a composite: setup, then dispatch of every child.
    pub(crate) fn perform_composite(
        self: &Arc<Self>,
        work: &CompositeWork,
        dispatcher: &Arc<dyn WorkItemDispatcher>,
    ) {
        *work.dispatcher.lock() = Some(Arc::downgrade(dispatcher));

        let setup = work.setup.as_ref().map_or(WorkOutcome::Success, |body| {
            run_body(body.as_ref(), &WorkContext::new(self, dispatcher.as_ref()))
        });

        let children = work.children();
        work.pending.store(children.len(), Ordering::Release);
        tracing::debug!(item = %self.name(), children = children.len(), "composite running");

        if children.is_empty() {
            *work.setup_failure.lock() = failed(setup);
            self.children_finished();
            return;
        }

        if setup == WorkOutcome::Success {
            for child in children {
                child.inherit_context(self);
                child.set_execution_strategy(self.strategy_for_child(child));
                if let Err(e) = dispatcher.dispatch(Arc::clone(child)) {
                    tracing::debug!(item = %child.name(), error = %e, "child dispatch refused");
                }
            }
        } else {
            let reason = format!("one-time setup of `{}` failed", self.name());
            *work.setup_failure.lock() = failed(setup);
            for child in children {
                child.abandon(WorkItemState::Complete, &WorkOutcome::NotRun(reason.clone()));
            }
        }
    }

    /// Strategy for a child, resolved at the moment it is dispatched.
    pub(crate) fn strategy_for_child(&self, child: &Self) -> ExecutionStrategy {
        if child.is_single_threaded() {
            return ExecutionStrategy::Direct;
        }
        let scope = child.parallel_scope();
        if scope == ParallelScope::None {
            ExecutionStrategy::NonParallel
        } else if scope.covers_item() || self.parallel_scope().covers_children() {
            ExecutionStrategy::Parallel
        } else if child.thread_affinity() == ThreadAffinity::Exclusive
            && self.thread_affinity() != ThreadAffinity::Exclusive
        {
            ExecutionStrategy::NonParallel
        } else if child.is_composite() {
            ExecutionStrategy::NonParallel
        } else {
            ExecutionStrategy::Direct
        }
    }

    /// Called by a child that just reached a terminal state.
    pub(crate) fn child_completed(self: &Arc<Self>, child: &Self) {
        let WorkItemKind::Composite(work) = &self.kind else {
            return;
        };
        if work.is_finalized() {
            return;
        }
        tracing::trace!(item = %self.name(), child = %child.name(), "child completed");
        if work.child_done() {
            self.children_finished();
        }
    }

    /// All children are terminal: hand the finalization item to the dispatcher.
    fn children_finished(self: &Arc<Self>) {
        let WorkItemKind::Composite(work) = &self.kind else {
            return;
        };
        self.set_state(WorkItemState::WaitingForChildren);
        let finalization = Self::finalization_for(self);
        match work.dispatcher() {
            Some(dispatcher) => {
                if let Err(e) = dispatcher.dispatch(finalization) {
                    tracing::debug!(item = %self.name(), error = %e, "finalization dispatch refused");
                }
            }
            None => {
                tracing::warn!(item = %self.name(), "dispatcher gone before finalization");
                self.abandon(WorkItemState::Cancelled, &WorkOutcome::Cancelled);
            }
        }
    }

    /// Finalize the composite: teardown, then the terminal transition. Runs once.
    pub(crate) fn finalize(self: &Arc<Self>, dispatcher: &dyn WorkItemDispatcher, mode: FinalizeMode) {
        let WorkItemKind::Composite(work) = &self.kind else {
            return;
        };
        if !work.try_begin_finalization() {
            tracing::debug!(item = %self.name(), "composite already finalized");
            return;
        }

        let mut outcome = work.setup_failure.lock().take().unwrap_or(WorkOutcome::Success);
        if let Some(teardown) = &work.teardown {
            let teardown_outcome = run_body(teardown.as_ref(), &WorkContext::new(self, dispatcher));
            if outcome == WorkOutcome::Success {
                outcome = teardown_outcome;
            }
        }

        let state = match mode {
            FinalizeMode::Normal => WorkItemState::Complete,
            FinalizeMode::Cancelled => {
                outcome = WorkOutcome::Cancelled;
                WorkItemState::Cancelled
            }
        };
        tracing::debug!(item = %self.name(), ?mode, "composite finalized");
        self.finish(state, outcome);
    }
}

fn failed(outcome: WorkOutcome) -> Option<WorkOutcome> {
    (outcome != WorkOutcome::Success).then_some(outcome)
}

/// Builder for composite work items.
pub struct CompositeBuilder {
    options: ItemOptions,
    setup: Option<Box<dyn WorkBody>>,
    teardown: Option<Box<dyn WorkBody>>,
    children: Vec<Arc<WorkItem>>,
}

impl CompositeBuilder {
    pub(crate) fn new(options: ItemOptions) -> Self {
        Self {
            options,
            setup: None,
            teardown: None,
            children: Vec::new(),
        }
    }

    /// Declare the composite's parallel scope.
    #[must_use]
    pub fn parallel_scope(mut self, scope: ParallelScope) -> Self {
        self.options.scope = scope;
        self
    }

    /// Declare the composite's thread affinity; children inherit Exclusive.
    #[must_use]
    pub fn affinity(mut self, affinity: ThreadAffinity) -> Self {
        self.options.affinity = affinity;
        self
    }

    /// Override whether starting the composite isolates the queues.
    #[must_use]
    pub fn requires_isolation(mut self, isolate: bool) -> Self {
        self.options.isolation = Some(isolate);
        self
    }

    /// Run the composite and every descendant inline on the dispatching thread.
    #[must_use]
    pub fn single_threaded(mut self, single_threaded: bool) -> Self {
        self.options.single_threaded = single_threaded;
        self
    }

    /// One-time setup, run before any child is dispatched.
    #[must_use]
    pub fn setup<F>(mut self, body: F) -> Self
    where
        F: Fn(&WorkContext<'_>) -> AppResult<()> + Send + Sync + 'static,
    {
        self.setup = Some(Box::new(body));
        self
    }

    /// One-time teardown, run by the finalization step.
    #[must_use]
    pub fn teardown<F>(mut self, body: F) -> Self
    where
        F: Fn(&WorkContext<'_>) -> AppResult<()> + Send + Sync + 'static,
    {
        self.teardown = Some(Box::new(body));
        self
    }

    /// Append one child.
    #[must_use]
    pub fn child(mut self, child: Arc<WorkItem>) -> Self {
        self.children.push(child);
        self
    }

    /// Append several children, keeping their order.
    #[must_use]
    pub fn children(mut self, children: impl IntoIterator<Item = Arc<WorkItem>>) -> Self {
        self.children.extend(children);
        self
    }

    /// Finish the composite and attach it as parent of every child.
    #[must_use]
    pub fn build(self) -> Arc<WorkItem> {
        let work = CompositeWork {
            setup: self.setup,
            teardown: self.teardown,
            children: self.children,
            pending: AtomicUsize::new(0),
            finalized: AtomicBool::new(false),
            setup_failure: Mutex::new(None),
            dispatcher: Mutex::new(None),
        };
        let item = Arc::new(WorkItem::from_parts(self.options, WorkItemKind::Composite(work)));
        for child in item.children() {
            child.attach_parent(&item);
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str) -> Arc<WorkItem> {
        WorkItem::leaf(name, |_| Ok(())).build()
    }

    fn leaf_scoped(name: &str, scope: ParallelScope) -> Arc<WorkItem> {
        WorkItem::leaf(name, |_| Ok(())).parallel_scope(scope).build()
    }

    #[test]
    fn test_build_attaches_parent() {
        let child = leaf("child");
        let fixture = WorkItem::composite("fixture").child(Arc::clone(&child)).build();
        assert!(fixture.is_composite());
        assert_eq!(fixture.children().len(), 1);
        assert_eq!(child.parent().unwrap().id(), fixture.id());
    }

    #[test]
    fn test_child_strategy_resolution() {
        let plain = WorkItem::composite("plain").build();
        let parallel_children = WorkItem::composite("pc")
            .parallel_scope(ParallelScope::Children)
            .build();

        assert_eq!(
            plain.strategy_for_child(&leaf_scoped("none", ParallelScope::None)),
            ExecutionStrategy::NonParallel
        );
        assert_eq!(
            plain.strategy_for_child(&leaf_scoped("self", ParallelScope::Item)),
            ExecutionStrategy::Parallel
        );
        assert_eq!(
            parallel_children.strategy_for_child(&leaf("inherits")),
            ExecutionStrategy::Parallel
        );
        assert_eq!(plain.strategy_for_child(&leaf("simple")), ExecutionStrategy::Direct);
        assert_eq!(
            plain.strategy_for_child(&WorkItem::composite("nested").build()),
            ExecutionStrategy::NonParallel
        );
    }

    #[test]
    fn test_exclusive_child_never_direct_under_any_parent() {
        let plain = WorkItem::composite("plain").build();
        let exclusive_child = WorkItem::leaf("ui", |_| Ok(()))
            .affinity(ThreadAffinity::Exclusive)
            .build();
        assert_eq!(
            plain.strategy_for_child(&exclusive_child),
            ExecutionStrategy::NonParallel
        );

        let exclusive_parent = WorkItem::composite("ui-fixture")
            .affinity(ThreadAffinity::Exclusive)
            .build();
        assert_eq!(
            exclusive_parent.strategy_for_child(&exclusive_child),
            ExecutionStrategy::Direct
        );
    }

    #[test]
    fn test_single_threaded_child_is_direct() {
        let parallel_children = WorkItem::composite("pc")
            .parallel_scope(ParallelScope::All)
            .build();
        let child = leaf_scoped("st", ParallelScope::Item);
        child.mark_single_threaded();
        assert_eq!(
            parallel_children.strategy_for_child(&child),
            ExecutionStrategy::Direct
        );
    }

    #[test]
    fn test_default_isolation_follows_strategy() {
        let fixture = WorkItem::composite("fixture").build();
        assert_eq!(fixture.execution_strategy(), ExecutionStrategy::NonParallel);
        assert!(fixture.requires_isolation());

        fixture.set_execution_strategy(ExecutionStrategy::Parallel);
        assert!(!fixture.requires_isolation());

        let forced = WorkItem::composite("forced")
            .parallel_scope(ParallelScope::All)
            .requires_isolation(true)
            .build();
        assert!(forced.requires_isolation());
    }

    #[test]
    fn test_abandon_marks_whole_subtree() {
        let grandchild = leaf("grandchild");
        let child = WorkItem::composite("child").child(Arc::clone(&grandchild)).build();
        let root = WorkItem::composite("root").child(Arc::clone(&child)).build();

        root.force_cancel();
        assert_eq!(root.state(), WorkItemState::Cancelled);
        assert_eq!(child.state(), WorkItemState::Cancelled);
        assert_eq!(grandchild.state(), WorkItemState::Cancelled);
        assert_eq!(grandchild.outcome(), Some(WorkOutcome::Cancelled));
    }

    #[test]
    fn test_pending_count_never_underflows() {
        let work = CompositeWork {
            setup: None,
            teardown: None,
            children: Vec::new(),
            pending: AtomicUsize::new(2),
            finalized: AtomicBool::new(false),
            setup_failure: Mutex::new(None),
            dispatcher: Mutex::new(None),
        };
        assert!(!work.child_done());
        assert!(work.child_done());
        assert!(!work.child_done());
        assert_eq!(work.pending.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_finalization_claimed_once() {
        let work = CompositeWork {
            setup: None,
            teardown: None,
            children: Vec::new(),
            pending: AtomicUsize::new(0),
            finalized: AtomicBool::new(false),
            setup_failure: Mutex::new(None),
            dispatcher: Mutex::new(None),
        };
        assert!(work.try_begin_finalization());
        assert!(!work.try_begin_finalization());
    }
}
