//! Tests for configuration validation and dispatcher construction

mod common;

use prometheus_work_dispatch::builders::build_dispatcher;
use prometheus_work_dispatch::config::{DispatcherConfig, MIN_THREAD_STACK_SIZE};
use prometheus_work_dispatch::core::{DispatchError, ParallelDispatcher, SimpleDispatcher};

#[test]
fn test_default_config_is_valid() {
    let cfg = DispatcherConfig::default();
    assert!(cfg.validate().is_ok());
    assert!(cfg.parallel_workers >= 2);
    assert_eq!(cfg.thread_name_prefix, "dispatch");
    assert_eq!(cfg, DispatcherConfig::new());
}

#[test]
fn test_setters_override_defaults() {
    let cfg = common::config(3);
    assert_eq!(cfg.parallel_workers, 3);
    assert_eq!(cfg.thread_name_prefix, "it");
    assert_eq!(cfg.forced_cancel_timeout().as_millis(), 500);
    assert_eq!(cfg.shutdown_join_timeout().as_millis(), 1_000);
    assert_eq!(cfg.thread_stack_size, 1024 * 1024);
}

#[test]
fn test_partial_json_takes_defaults() {
    let cfg = DispatcherConfig::from_json_str(r#"{"parallel_workers": 6}"#).unwrap();
    assert_eq!(cfg.parallel_workers, 6);
    assert_eq!(
        cfg.forced_cancel_timeout_ms,
        DispatcherConfig::default().forced_cancel_timeout_ms
    );
    assert_eq!(cfg.thread_name_prefix, "dispatch");
}

#[test]
fn test_json_roundtrip() {
    let cfg = DispatcherConfig::new()
        .with_parallel_workers(4)
        .with_thread_name_prefix("suite");
    let json = serde_json::to_string(&cfg).unwrap();
    assert_eq!(DispatcherConfig::from_json_str(&json).unwrap(), cfg);
}

#[test]
fn test_invalid_json_rejected() {
    assert!(DispatcherConfig::from_json_str("{not json").is_err());
    assert!(DispatcherConfig::from_json_str(r#"{"parallel_workers": -1}"#).is_err());

    let err = DispatcherConfig::from_json_str(r#"{"thread_name_prefix": "  "}"#).unwrap_err();
    assert!(err.contains("thread_name_prefix"));
}

#[test]
fn test_config_invalid_timeouts() {
    assert!(DispatcherConfig::new()
        .with_forced_cancel_timeout_ms(0)
        .validate()
        .is_err());
    assert!(DispatcherConfig::new()
        .with_shutdown_join_timeout_ms(0)
        .validate()
        .is_err());
}

#[test]
fn test_config_invalid_stack_size() {
    let cfg = DispatcherConfig::new().with_thread_stack_size(MIN_THREAD_STACK_SIZE - 1);
    assert!(cfg.validate().is_err());
    let cfg = DispatcherConfig::new().with_thread_stack_size(MIN_THREAD_STACK_SIZE);
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_builder_rejects_invalid_config() {
    let cfg = DispatcherConfig::new().with_thread_stack_size(1);
    let err = build_dispatcher(&cfg).err().unwrap();
    assert!(matches!(err, DispatchError::InvalidConfig(_)));
    assert!(err.to_string().contains("config invalid"));
}

#[test]
fn test_dispatcher_construction_by_worker_count() {
    let err = ParallelDispatcher::new(common::config(0)).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidConfig(_)));

    assert!(SimpleDispatcher::new(common::config(0)).is_ok());

    let dispatcher = ParallelDispatcher::new(common::config(2)).unwrap();
    assert_eq!(dispatcher.config().parallel_workers, 2);
    assert_eq!(dispatcher.stats().dispatched_items, 0);
    assert_eq!(dispatcher.outcome(), None);
}
