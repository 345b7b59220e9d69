//! Work body abstraction and failure absorption.
//!
//! The dispatcher never looks inside a work item. What an item actually does (a test
//! method, a fixture's one-time setup or teardown) lives behind [`WorkBody`], and any
//! failure it reports, including a panic, is folded into the item's [`WorkOutcome`].

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use super::dispatcher::WorkItemDispatcher;
use super::work_item::{WorkItem, WorkOutcome};
use super::{AppResult, DispatchError};

/// Executable body of a work item.
///
/// Implemented automatically for closures, which is how most callers supply bodies:
///
/// ```rust
/// use prometheus_work_dispatch::core::WorkItem;
///
/// let item = WorkItem::leaf("adds_numbers", |_ctx| {
///     assert_eq!(2 + 2, 4);
///     Ok(())
/// })
/// .build();
/// assert_eq!(item.name(), "adds_numbers");
/// ```
pub trait WorkBody: Send + Sync + 'static {
    /// Run the body. Errors and panics are recorded as a failed outcome.
    ///
    /// # Errors
    ///
    /// Any error describes why the unit of work failed.
    fn run(&self, ctx: &WorkContext<'_>) -> AppResult<()>;
}

impl<F> WorkBody for F
where
    F: Fn(&WorkContext<'_>) -> AppResult<()> + Send + Sync + 'static,
{
    fn run(&self, ctx: &WorkContext<'_>) -> AppResult<()> {
        self(ctx)
    }
}

/// View handed to a body while it runs.
pub struct WorkContext<'a> {
    item: &'a WorkItem,
    dispatcher: &'a dyn WorkItemDispatcher,
}

impl<'a> WorkContext<'a> {
    pub(crate) fn new(item: &'a WorkItem, dispatcher: &'a dyn WorkItemDispatcher) -> Self {
        Self { item, dispatcher }
    }

    /// The item whose body is running.
    #[must_use]
    pub const fn item(&self) -> &WorkItem {
        self.item
    }

    /// True once the run has been asked to stop. Long bodies should return early.
    #[must_use]
    pub fn is_cancellation_requested(&self) -> bool {
        self.dispatcher.is_cancellation_requested()
    }

    /// Ask the run to stop from inside a body.
    ///
    /// A forced request made here does not wait for the calling body to return; the
    /// body's item is cancelled along with everything else still running.
    ///
    /// # Errors
    ///
    /// Whatever [`WorkItemDispatcher::cancel_run`] reports.
    pub fn cancel_run(&self, force: bool) -> Result<(), DispatchError> {
        self.dispatcher.cancel_run(force)
    }

    /// Name of the thread executing the body, if it has one.
    #[must_use]
    pub fn thread_name(&self) -> Option<String> {
        thread::current().name().map(str::to_owned)
    }
}

/// Run a body, absorbing errors and panics into an outcome.
pub(crate) fn run_body(body: &dyn WorkBody, ctx: &WorkContext<'_>) -> WorkOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| body.run(ctx))) {
        Ok(Ok(())) => WorkOutcome::Success,
        Ok(Err(e)) => {
            tracing::debug!(item = %ctx.item().name(), error = %e, "work body failed");
            WorkOutcome::Failure(format!("{e:#}"))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::debug!(item = %ctx.item().name(), panic = %message, "work body panicked");
            WorkOutcome::Failure(format!("panicked: {message}"))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
