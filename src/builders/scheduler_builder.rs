//! Builders to construct a service and its throttled schedulers from
//! configuration.

use std::collections::HashMap;

use tracing::info;

use crate::config::SchedulersConfig;
use crate::core::SchedulerError;
use crate::scheduler::{SchedulerService, ThrottledScheduler};

/// Start a [`SchedulerService`] for `cfg.service`.
///
/// # Errors
///
/// `SchedulerError::InvalidConfig` if `cfg` does not validate, or whatever
/// [`SchedulerService::new`] fails with.
pub fn build_service(cfg: &SchedulersConfig) -> Result<SchedulerService, SchedulerError> {
    cfg.validate()
        .map_err(|e| SchedulerError::InvalidConfig(format!("config invalid: {e}")))?;
    SchedulerService::new(cfg.service.clone())
}

/// Create one throttled scheduler per entry of `cfg.schedulers` on `service`.
///
/// # Errors
///
/// `SchedulerError::InvalidConfig` if `cfg` does not validate, or the first
/// error raised while creating a scheduler. Schedulers created before the
/// failure are shut down.
pub fn build_schedulers(
    cfg: &SchedulersConfig,
    service: &SchedulerService,
) -> Result<HashMap<String, ThrottledScheduler>, SchedulerError> {
    cfg.validate()
        .map_err(|e| SchedulerError::InvalidConfig(format!("config invalid: {e}")))?;

    let mut schedulers = HashMap::new();
    for throttle in cfg.throttle_configs() {
        match service.create_throttled_scheduler(&throttle) {
            Ok(scheduler) => {
                schedulers.insert(throttle.name, scheduler);
            }
            Err(e) => {
                for scheduler in schedulers.values() {
                    scheduler.shutdown();
                }
                return Err(e);
            }
        }
    }

    info!(count = schedulers.len(), "throttled schedulers built");
    Ok(schedulers)
}
