//! Tests for configuration validation

use std::collections::HashMap;
use std::time::Duration;

use throttled_scheduler::config::{
    SchedulersConfig, ServiceConfig, ThrottleConfig, SHUTDOWN_TIMEOUT_ENV, TIMER_THREADS_ENV,
    WORKER_THREADS_ENV,
};

#[test]
fn test_service_config_validation() {
    let valid = ServiceConfig {
        worker_threads: 4,
        timer_threads: 2,
        thread_stack_size: 256 * 1024,
        shutdown_timeout_ms: 1_000,
    };
    assert!(valid.validate().is_ok());
    assert_eq!(valid.shutdown_timeout(), Duration::from_secs(1));
}

#[test]
fn test_service_config_invalid_stack_size() {
    let invalid = ServiceConfig::default().with_thread_stack_size(1024);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_throttle_config_validation() {
    assert!(ThrottleConfig::new("flows", 1).validate().is_ok());
    assert!(ThrottleConfig::new("flows", 0).validate().is_err());
    assert!(ThrottleConfig::new("", 3).validate().is_err());
}

#[test]
fn test_schedulers_config_validation() {
    let mut schedulers = HashMap::new();
    schedulers.insert("flows".to_string(), 2);
    schedulers.insert("reports".to_string(), 1);

    let config = SchedulersConfig {
        service: ServiceConfig::default(),
        schedulers,
    };
    assert!(config.validate().is_ok());

    let names: Vec<String> = config
        .throttle_configs()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(names, vec!["flows".to_string(), "reports".to_string()]);
}

#[test]
fn test_schedulers_config_empty() {
    let config = SchedulersConfig::default();
    assert!(config.validate().is_err());
}

#[test]
fn test_schedulers_config_zero_limit() {
    let mut schedulers = HashMap::new();
    schedulers.insert("flows".to_string(), 0);
    let config = SchedulersConfig {
        service: ServiceConfig::default(),
        schedulers,
    };
    let err = config.validate().unwrap_err();
    assert!(err.contains("flows"));
}

#[test]
fn test_schedulers_config_from_json() {
    let json = r#"{
        "service": {
            "worker_threads": 2,
            "timer_threads": 3
        },
        "schedulers": {
            "flows": 2,
            "reports": 1
        }
    }"#;

    let config = SchedulersConfig::from_json_str(json).unwrap();
    assert_eq!(config.service.worker_threads, 2);
    assert_eq!(config.service.timer_threads, 3);
    assert_eq!(
        config.service.thread_stack_size,
        ServiceConfig::default().thread_stack_size
    );
    assert_eq!(config.schedulers.get("flows"), Some(&2));
}

#[test]
fn test_schedulers_config_from_json_rejects_bad_input() {
    assert!(SchedulersConfig::from_json_str("not json").is_err());
    assert!(SchedulersConfig::from_json_str(r#"{"schedulers": {"flows": 0}}"#).is_err());
}

// Single test so no other test observes the variables.
#[test]
fn test_service_config_from_env() {
    std::env::set_var(WORKER_THREADS_ENV, "3");
    std::env::set_var(TIMER_THREADS_ENV, "5");
    std::env::set_var(SHUTDOWN_TIMEOUT_ENV, "250");
    let config = ServiceConfig::from_env().unwrap();
    assert_eq!(config.worker_threads, 3);
    assert_eq!(config.timer_threads, 5);
    assert_eq!(config.shutdown_timeout(), Duration::from_millis(250));

    std::env::set_var(TIMER_THREADS_ENV, "many");
    let err = ServiceConfig::from_env().unwrap_err();
    assert!(format!("{err:#}").contains(TIMER_THREADS_ENV));

    std::env::set_var(TIMER_THREADS_ENV, "0");
    assert!(ServiceConfig::from_env().is_err());

    std::env::remove_var(WORKER_THREADS_ENV);
    std::env::remove_var(TIMER_THREADS_ENV);
    std::env::remove_var(SHUTDOWN_TIMEOUT_ENV);
}
