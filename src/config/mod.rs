//! Configuration models for dispatchers and their threads.

pub mod dispatcher;

pub use dispatcher::{DispatcherConfig, MIN_THREAD_STACK_SIZE};
