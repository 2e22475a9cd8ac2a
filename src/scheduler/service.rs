//! Owner of the shared worker pool, timer service, and admission gate.
//!
//! Every scheduler created here shares the same threads; each throttled
//! scheduler gets its own lane in the shared [`PerSchedulerGate`].

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::config::{ServiceConfig, ThrottleConfig};
use crate::core::{
    AdmissionGate, PassthroughHooks, PerSchedulerGate, PoolStats, SchedulerError, TimerService,
    WorkerPool,
};
use crate::scheduler::{Scheduler, ThrottledScheduler};
use crate::util::SchedulerId;

/// Shared execution resources and the schedulers built on them.
pub struct SchedulerService {
    config: ServiceConfig,
    workers: Arc<WorkerPool>,
    timer: Arc<TimerService>,
    gate: Arc<PerSchedulerGate>,
    schedulers: Mutex<Vec<Scheduler>>,
}

impl SchedulerService {
    /// Start the worker pool and timer service described by `config`.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::InvalidConfig` if `config` does not validate
    /// - `SchedulerError::Internal` if a thread cannot be spawned
    pub fn new(config: ServiceConfig) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;

        let workers = Arc::new(WorkerPool::new(
            "scheduler-worker",
            config.worker_threads,
            config.thread_stack_size,
        )?);
        let timer = Arc::new(TimerService::new(
            config.timer_threads,
            config.thread_stack_size,
        )?);

        info!(
            worker_threads = config.worker_threads,
            timer_threads = config.timer_threads,
            "scheduler service started"
        );
        Ok(Self {
            config,
            workers,
            timer,
            gate: Arc::new(PerSchedulerGate::new()),
            schedulers: Mutex::new(Vec::new()),
        })
    }

    /// Service configuration.
    #[must_use]
    pub const fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Create an unthrottled scheduler.
    ///
    /// # Errors
    ///
    /// `SchedulerError::Shutdown` if the service has been shut down.
    pub fn create_scheduler(&self, name: &str) -> Result<Scheduler, SchedulerError> {
        self.ensure_running()?;
        let scheduler = Scheduler::new(
            SchedulerId::new(name),
            Arc::clone(&self.workers),
            Arc::clone(&self.timer),
            Arc::new(PassthroughHooks),
            self.config.shutdown_timeout(),
        );
        self.track(&scheduler);
        Ok(scheduler)
    }

    /// Create a scheduler throttled through the service's shared gate.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::InvalidConfig` if `config` does not validate
    /// - `SchedulerError::Shutdown` if the service has been shut down
    pub fn create_throttled_scheduler(
        &self,
        config: &ThrottleConfig,
    ) -> Result<ThrottledScheduler, SchedulerError> {
        self.create_throttled_scheduler_with_gate(config, Arc::clone(&self.gate))
    }

    /// Create a throttled scheduler admitting through a custom gate.
    ///
    /// # Errors
    ///
    /// Same as [`create_throttled_scheduler`](Self::create_throttled_scheduler).
    pub fn create_throttled_scheduler_with_gate<G: AdmissionGate + 'static>(
        &self,
        config: &ThrottleConfig,
        gate: Arc<G>,
    ) -> Result<ThrottledScheduler<G>, SchedulerError> {
        self.ensure_running()?;
        let scheduler = ThrottledScheduler::new(
            config,
            Arc::clone(&self.workers),
            Arc::clone(&self.timer),
            gate,
            self.config.shutdown_timeout(),
        )?;
        self.track(scheduler.scheduler());
        Ok(scheduler)
    }

    /// The gate shared by throttled schedulers of this service.
    #[must_use]
    pub fn gate(&self) -> &Arc<PerSchedulerGate> {
        &self.gate
    }

    /// Schedulers created here that are not shut down.
    #[must_use]
    pub fn active_schedulers(&self) -> Vec<Scheduler> {
        let mut schedulers = self.schedulers.lock();
        schedulers.retain(|s| !s.is_shutdown());
        schedulers.clone()
    }

    /// Worker pool statistics.
    #[must_use]
    pub fn worker_stats(&self) -> PoolStats {
        self.workers.stats()
    }

    /// Timer dispatch pool statistics.
    #[must_use]
    pub fn timer_stats(&self) -> PoolStats {
        self.timer.dispatch_stats()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.workers.is_shutdown()
    }

    /// Stop every scheduler gracefully, then the timer and worker threads.
    ///
    /// # Errors
    ///
    /// `SchedulerError::Timeout` if some scheduler did not terminate; the
    /// threads are stopped regardless.
    pub fn shutdown(&self) -> Result<(), SchedulerError> {
        if self.is_shutdown() {
            return Ok(());
        }
        let schedulers: Vec<Scheduler> = self.schedulers.lock().drain(..).collect();
        info!(schedulers = schedulers.len(), "shutting down scheduler service");

        let mut result = Ok(());
        for scheduler in &schedulers {
            if let Err(e) = scheduler.stop() {
                result = Err(e);
            }
        }

        let timeout = self.config.shutdown_timeout();
        self.timer.shutdown(timeout);
        self.workers.shutdown(timeout);
        info!("scheduler service stopped");
        result
    }

    fn ensure_running(&self) -> Result<(), SchedulerError> {
        if self.is_shutdown() {
            Err(SchedulerError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn track(&self, scheduler: &Scheduler) {
        let mut schedulers = self.schedulers.lock();
        schedulers.retain(|s| !s.is_shutdown());
        schedulers.push(scheduler.clone());
    }
}

impl Drop for SchedulerService {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
