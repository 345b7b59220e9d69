//! Error types for dispatcher operations.

use thiserror::Error;

/// Message used whenever an operation needs a run that has been started.
pub(crate) const NO_ACTIVE_RUN: &str = "operation requires an active run";

/// Errors produced by dispatcher components.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The operation is not valid in the component's current lifecycle state.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A worker or coordinator thread could not be spawned.
    #[error("failed to spawn thread `{name}`: {source}")]
    WorkerSpawn {
        /// Name of the thread that failed to start.
        name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// Waiting for a run timed out.
    #[error("timed out waiting for run completion")]
    Timeout,
}

impl DispatchError {
    /// Error returned by `dispatch`/`cancel_run` before `start`.
    pub(crate) fn no_active_run() -> Self {
        Self::IllegalState(NO_ACTIVE_RUN.into())
    }
}

/// Result type returned by work bodies; failures are absorbed into the item's outcome.
pub type AppResult<T> = Result<T, anyhow::Error>;
