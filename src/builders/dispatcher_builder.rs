//! Builds the dispatcher matching a configuration.

use crate::config::DispatcherConfig;
use crate::core::{DispatchError, ParallelDispatcher, SimpleDispatcher, WorkItemDispatcher};

/// Build a dispatcher from configuration.
///
/// Zero parallel workers selects [`SimpleDispatcher`]; anything else selects
/// [`ParallelDispatcher`].
///
/// # Errors
///
/// `InvalidConfig` if the configuration does not validate.
pub fn build_dispatcher(cfg: &DispatcherConfig) -> Result<Box<dyn WorkItemDispatcher>, DispatchError> {
    cfg.validate().map_err(|e| DispatchError::InvalidConfig(format!("config invalid: {e}")))?;

    if cfg.parallel_workers == 0 {
        tracing::debug!("level of parallelism is zero; using the single-threaded dispatcher");
        Ok(Box::new(SimpleDispatcher::new(cfg.clone())?))
    } else {
        tracing::debug!(workers = cfg.parallel_workers, "using the parallel dispatcher");
        Ok(Box::new(ParallelDispatcher::new(cfg.clone())?))
    }
}
