//! Tests for builder modules

use std::collections::HashMap;

use throttled_scheduler::builders::{build_schedulers, build_service};
use throttled_scheduler::config::{SchedulersConfig, ServiceConfig};
use throttled_scheduler::core::SchedulerError;

fn config(schedulers: &[(&str, u32)]) -> SchedulersConfig {
    SchedulersConfig {
        service: ServiceConfig::default()
            .with_worker_threads(2)
            .with_timer_threads(2),
        schedulers: schedulers
            .iter()
            .map(|(name, limit)| ((*name).to_string(), *limit))
            .collect::<HashMap<_, _>>(),
    }
}

#[test]
fn test_build_schedulers_from_config() {
    let cfg = config(&[("flows", 2), ("reports", 1)]);
    let service = build_service(&cfg).unwrap();
    let schedulers = build_schedulers(&cfg, &service).unwrap();

    assert_eq!(schedulers.len(), 2);
    assert_eq!(schedulers["flows"].max_concurrent_tasks(), 2);
    assert_eq!(schedulers["reports"].max_concurrent_tasks(), 1);
    assert_eq!(schedulers["flows"].name(), "flows");
    assert_ne!(schedulers["flows"].id(), schedulers["reports"].id());
    assert_eq!(service.active_schedulers().len(), 2);

    service.shutdown().unwrap();
    assert!(schedulers.values().all(|s| s.is_shutdown()));
}

#[test]
fn test_build_rejects_invalid_config() {
    let cfg = config(&[("flows", 0)]);
    assert!(matches!(
        build_service(&cfg),
        Err(SchedulerError::InvalidConfig(_))
    ));

    let service = build_service(&config(&[("ok", 1)])).unwrap();
    assert!(matches!(
        build_schedulers(&cfg, &service),
        Err(SchedulerError::InvalidConfig(_))
    ));
    service.shutdown().unwrap();
}

#[test]
fn test_build_after_service_shutdown() {
    let cfg = config(&[("flows", 1)]);
    let service = build_service(&cfg).unwrap();
    service.shutdown().unwrap();
    assert!(matches!(
        build_schedulers(&cfg, &service),
        Err(SchedulerError::Shutdown)
    ));
}
