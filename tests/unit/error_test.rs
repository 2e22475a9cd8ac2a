//! Tests for error types

use throttled_scheduler::core::SchedulerError;

#[test]
fn test_invalid_config_error() {
    let err = SchedulerError::InvalidConfig("max_concurrent_tasks must be greater than 0".to_string());
    assert_eq!(
        format!("{}", err),
        "invalid configuration: max_concurrent_tasks must be greater than 0"
    );
}

#[test]
fn test_cancelled_error() {
    let err = SchedulerError::Cancelled;
    assert_eq!(format!("{}", err), "task cancelled");
    assert!(err.is_cancellation());
}

#[test]
fn test_shutdown_error() {
    let err = SchedulerError::Shutdown;
    assert_eq!(format!("{}", err), "scheduler has been shut down");
    assert!(err.is_cancellation());
}

#[test]
fn test_task_failed_error() {
    let err = SchedulerError::TaskFailed("boom".to_string());
    assert_eq!(format!("{}", err), "task failed: boom");
    assert!(!err.is_cancellation());
}

#[test]
fn test_timeout_and_internal_errors() {
    assert_eq!(format!("{}", SchedulerError::Timeout), "operation timed out");
    assert_eq!(
        format!("{}", SchedulerError::Internal("channel closed".to_string())),
        "internal error: channel closed"
    );
}

#[test]
fn test_converts_into_anyhow() {
    let err: anyhow::Error = SchedulerError::Shutdown.into();
    assert_eq!(
        err.downcast_ref::<SchedulerError>(),
        Some(&SchedulerError::Shutdown)
    );
}
