//! # Prometheus Work Dispatch
//!
//! A phase-ordered, isolation-aware dispatcher for hierarchical trees of work items,
//! such as a test run made of suites, fixtures and test cases.
//!
//! ## Core Problem Solved
//!
//! Running a test tree in parallel is easy until items start declaring constraints:
//!
//! - **Run alone**: some items must never overlap with anything else
//! - **Thread affinity**: some items must always run on one dedicated thread
//! - **Clean startup**: some fixtures need their subtree to run without unrelated work
//!   interleaving
//! - **Bounded cancellation**: a stuck test must not keep the run alive forever
//!
//! ## How It Works
//!
//! - Every item is routed to one of four queues by its execution strategy and affinity
//! - Queues are grouped into three **shifts** that run one at a time in priority order:
//!   parallel, then serial, then serial exclusive
//! - Workers are dedicated OS threads that block on their queue; there is no polling
//! - A composite that requires isolation saves every queue when it starts and restores
//!   them once it is finished, so nested isolation unwinds like a stack
//! - Forced cancellation waits a bounded time, then marks everything left as cancelled
//!
//! ```rust
//! use std::time::Duration;
//! use prometheus_work_dispatch::builders::build_dispatcher;
//! use prometheus_work_dispatch::config::DispatcherConfig;
//! use prometheus_work_dispatch::core::{ParallelScope, RunOutcome, WorkItem, WorkItemDispatcher};
//!
//! let fixture = WorkItem::composite("math_fixture")
//!     .parallel_scope(ParallelScope::Children)
//!     .setup(|_ctx| Ok(()))
//!     .child(WorkItem::leaf("adds", |_ctx| Ok(())).build())
//!     .child(WorkItem::leaf("multiplies", |_ctx| Ok(())).build())
//!     .teardown(|_ctx| Ok(()))
//!     .build();
//!
//! let dispatcher = build_dispatcher(&DispatcherConfig::new().with_parallel_workers(2))?;
//! dispatcher.start(fixture.clone())?;
//! assert_eq!(dispatcher.wait_for_completion(Duration::from_secs(10))?, RunOutcome::Completed);
//! assert!(fixture.state().is_terminal());
//! # Ok::<(), prometheus_work_dispatch::core::DispatchError>(())
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Work items, queues, workers, shifts and dispatchers.
pub mod core;
/// Configuration models for dispatchers.
pub mod config;
/// Builders to construct dispatchers from configuration.
pub mod builders;
/// Shared utilities.
pub mod util;
