//! Scheduling core: work items, queues, workers, shifts and dispatchers.

pub mod composite;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod executor;
pub mod queue;
pub mod shift;
pub mod work_item;
mod worker;

pub use composite::CompositeBuilder;
pub use dispatcher::{
    DispatcherStats, ParallelDispatcher, RunOutcome, SimpleDispatcher, WorkItemDispatcher,
};
pub use error::{AppResult, DispatchError};
pub use events::{DispatcherEvent, EventBus};
pub use executor::{WorkBody, WorkContext};
pub use queue::{WorkItemQueue, WorkItemQueueState};
pub use shift::ShiftKind;
pub use work_item::{
    CompletionNotice, ExecutionStrategy, ParallelScope, ThreadAffinity, WorkItem,
    WorkItemBuilder, WorkItemId, WorkItemState, WorkOutcome,
};
