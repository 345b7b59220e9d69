//! Dispatcher configuration.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const ENV_PARALLEL_WORKERS: &str = "DISPATCH_PARALLEL_WORKERS";
const ENV_FORCED_CANCEL_TIMEOUT_MS: &str = "DISPATCH_FORCED_CANCEL_TIMEOUT_MS";
const ENV_SHUTDOWN_JOIN_TIMEOUT_MS: &str = "DISPATCH_SHUTDOWN_JOIN_TIMEOUT_MS";
const ENV_THREAD_STACK_SIZE: &str = "DISPATCH_THREAD_STACK_SIZE";
const ENV_THREAD_NAME_PREFIX: &str = "DISPATCH_THREAD_NAME_PREFIX";

/// Smallest stack a worker thread may be given.
pub const MIN_THREAD_STACK_SIZE: usize = 64 * 1024;

/// Configuration for a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Workers on the parallel queue. Zero selects the single-threaded dispatcher.
    pub parallel_workers: usize,
    /// How long a forced cancellation waits for the root before abandoning it (ms).
    pub forced_cancel_timeout_ms: u64,
    /// How long shutdown waits for each worker to exit before detaching it (ms).
    pub shutdown_join_timeout_ms: u64,
    /// Stack size for every thread the dispatcher spawns (bytes).
    pub thread_stack_size: usize,
    /// Prefix for thread names.
    pub thread_name_prefix: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            parallel_workers: num_cpus::get().max(2),
            forced_cancel_timeout_ms: 5_000,
            shutdown_join_timeout_ms: 2_000,
            thread_stack_size: 4 * 1024 * 1024,
            thread_name_prefix: "dispatch".into(),
        }
    }
}

impl DispatcherConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of parallel workers.
    #[must_use]
    pub const fn with_parallel_workers(mut self, count: usize) -> Self {
        self.parallel_workers = count;
        self
    }

    /// Set the forced cancellation timeout in milliseconds.
    #[must_use]
    pub const fn with_forced_cancel_timeout_ms(mut self, ms: u64) -> Self {
        self.forced_cancel_timeout_ms = ms;
        self
    }

    /// Set the per-worker join timeout used at shutdown, in milliseconds.
    #[must_use]
    pub const fn with_shutdown_join_timeout_ms(mut self, ms: u64) -> Self {
        self.shutdown_join_timeout_ms = ms;
        self
    }

    /// Set the thread stack size in bytes.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = size;
        self
    }

    /// Set the thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Forced cancellation timeout as a `Duration`.
    #[must_use]
    pub const fn forced_cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.forced_cancel_timeout_ms)
    }

    /// Shutdown join timeout as a `Duration`.
    #[must_use]
    pub const fn shutdown_join_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_join_timeout_ms)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.forced_cancel_timeout_ms == 0 {
            return Err("forced_cancel_timeout_ms must be greater than 0".into());
        }
        if self.shutdown_join_timeout_ms == 0 {
            return Err("shutdown_join_timeout_ms must be greater than 0".into());
        }
        if self.thread_stack_size < MIN_THREAD_STACK_SIZE {
            return Err(format!(
                "thread_stack_size must be at least {MIN_THREAD_STACK_SIZE} bytes"
            ));
        }
        if self.thread_name_prefix.trim().is_empty() {
            return Err("thread_name_prefix must not be empty".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate it. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from the environment, loading `.env` first if present.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns a message naming any variable that does not parse, or a validation message.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut cfg = Self::default();
        if let Some(v) = parse_var(&lookup, ENV_PARALLEL_WORKERS)? {
            cfg.parallel_workers = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_FORCED_CANCEL_TIMEOUT_MS)? {
            cfg.forced_cancel_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_SHUTDOWN_JOIN_TIMEOUT_MS)? {
            cfg.shutdown_join_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_THREAD_STACK_SIZE)? {
            cfg.thread_stack_size = v;
        }
        if let Some(prefix) = lookup(ENV_THREAD_NAME_PREFIX) {
            cfg.thread_name_prefix = prefix;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| format!("{key}: cannot parse `{raw}`: {e}"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let cfg = DispatcherConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.parallel_workers >= 2);
        assert_eq!(cfg.forced_cancel_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.shutdown_join_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_lookup_overrides() {
        let cfg = DispatcherConfig::from_lookup(lookup_from(&[
            (ENV_PARALLEL_WORKERS, "3"),
            (ENV_FORCED_CANCEL_TIMEOUT_MS, " 250 "),
            (ENV_THREAD_NAME_PREFIX, "suite"),
        ]))
        .unwrap();
        assert_eq!(cfg.parallel_workers, 3);
        assert_eq!(cfg.forced_cancel_timeout_ms, 250);
        assert_eq!(cfg.thread_name_prefix, "suite");
        assert_eq!(cfg.shutdown_join_timeout_ms, 2_000);
    }

    #[test]
    fn test_lookup_rejects_garbage() {
        let err = DispatcherConfig::from_lookup(lookup_from(&[(ENV_PARALLEL_WORKERS, "many")]))
            .unwrap_err();
        assert!(err.contains(ENV_PARALLEL_WORKERS));
    }

    #[test]
    fn test_small_stack_rejected() {
        let cfg = DispatcherConfig::new().with_thread_stack_size(1024);
        assert!(cfg.validate().unwrap_err().contains("thread_stack_size"));
    }
}
