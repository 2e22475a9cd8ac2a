//! Tests for utility functions

use throttled_scheduler::util::{init_tracing, init_tracing_with_default, SchedulerId, TaskId};

#[test]
fn test_scheduler_id_display() {
    let id = SchedulerId::new("flows");
    let text = id.to_string();
    assert!(text.starts_with("flows@"));
    assert!(text.ends_with(&id.uuid().simple().to_string()));
}

#[test]
fn test_scheduler_id_identity() {
    let a = SchedulerId::new("flows");
    let b = SchedulerId::new("flows");
    assert_ne!(a, b);
    assert_eq!(a, a.clone());
    assert_eq!(a.name(), b.name());
}

#[test]
fn test_task_id() {
    let id: TaskId = 12345;
    assert_eq!(id, 12345);
}

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing_with_default("throttled_scheduler=debug");
    init_tracing();
    init_tracing_with_default("warn");
}
