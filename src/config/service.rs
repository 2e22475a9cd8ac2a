//! Service and scheduler configuration structures.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::AppResult;

/// Environment variable overriding [`ServiceConfig::worker_threads`].
pub const WORKER_THREADS_ENV: &str = "THROTTLED_SCHEDULER_WORKER_THREADS";
/// Environment variable overriding [`ServiceConfig::timer_threads`].
pub const TIMER_THREADS_ENV: &str = "THROTTLED_SCHEDULER_TIMER_THREADS";
/// Environment variable overriding [`ServiceConfig::shutdown_timeout_ms`].
pub const SHUTDOWN_TIMEOUT_ENV: &str = "THROTTLED_SCHEDULER_SHUTDOWN_TIMEOUT_MS";

const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;
const DEFAULT_TIMER_THREADS: usize = 4;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;

/// Shared thread pools behind every scheduler of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Threads executing immediate tasks.
    pub worker_threads: usize,
    /// Shared threads dispatching deferred fires. Each throttled scheduler
    /// also gets `min(timer_threads, limit)` dispatch threads of its own.
    pub timer_threads: usize,
    /// Stack size for every spawned thread.
    pub thread_stack_size: usize,
    /// Bound on each wait of a graceful stop, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get().max(1),
            timer_threads: DEFAULT_TIMER_THREADS,
            thread_stack_size: DEFAULT_STACK_SIZE,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl ServiceConfig {
    /// Set the number of worker threads.
    #[must_use]
    pub const fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Set the number of timer dispatch threads.
    #[must_use]
    pub const fn with_timer_threads(mut self, threads: usize) -> Self {
        self.timer_threads = threads;
        self
    }

    /// Set the stack size of spawned threads.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = bytes;
        self
    }

    /// Set the graceful stop timeout.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Graceful stop timeout.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Validate thread counts and sizes.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_threads == 0 {
            return Err("worker_threads must be greater than 0".into());
        }
        if self.timer_threads == 0 {
            return Err("timer_threads must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        Ok(())
    }

    /// Defaults overridden by a `.env` file and the process environment.
    ///
    /// # Errors
    ///
    /// Fails if a variable is set but not a number, or the result does not
    /// validate.
    pub fn from_env() -> AppResult<Self> {
        // A missing .env file is fine.
        let _ = dotenvy::dotenv();

        let mut config = Self::default();
        if let Some(threads) = env_number::<usize>(WORKER_THREADS_ENV)? {
            config.worker_threads = threads;
        }
        if let Some(threads) = env_number::<usize>(TIMER_THREADS_ENV)? {
            config.timer_threads = threads;
        }
        if let Some(timeout_ms) = env_number::<u64>(SHUTDOWN_TIMEOUT_ENV)? {
            config.shutdown_timeout_ms = timeout_ms;
        }
        config
            .validate()
            .map_err(anyhow::Error::msg)
            .context("invalid service configuration from environment")?;
        Ok(config)
    }
}

fn env_number<T>(key: &str) -> AppResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{key}={raw:?} is not a valid number")),
        Err(_) => Ok(None),
    }
}

/// Construction-time settings of one throttled scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Scheduler name, used for display and logging.
    pub name: String,
    /// Maximum tasks in flight at once.
    pub max_concurrent_tasks: u32,
}

impl ThrottleConfig {
    /// Config for a scheduler named `name` admitting `max_concurrent_tasks`.
    pub fn new(name: impl Into<String>, max_concurrent_tasks: u32) -> Self {
        Self {
            name: name.into(),
            max_concurrent_tasks,
        }
    }

    /// Validate name and limit.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("scheduler name must not be empty".into());
        }
        if self.max_concurrent_tasks == 0 {
            return Err(format!(
                "scheduler `{}`: max_concurrent_tasks must be greater than 0",
                self.name
            ));
        }
        Ok(())
    }
}

/// Root configuration: the shared service plus named throttled schedulers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulersConfig {
    /// Shared pools.
    #[serde(default)]
    pub service: ServiceConfig,
    /// Map of scheduler name to its max concurrent tasks.
    pub schedulers: HashMap<String, u32>,
}

impl SchedulersConfig {
    /// Validate the service and every scheduler; at least one scheduler
    /// must be defined.
    pub fn validate(&self) -> Result<(), String> {
        self.service
            .validate()
            .map_err(|e| format!("service invalid: {e}"))?;
        if self.schedulers.is_empty() {
            return Err("at least one scheduler must be defined".into());
        }
        for config in self.throttle_configs() {
            config.validate()?;
        }
        Ok(())
    }

    /// One [`ThrottleConfig`] per scheduler, sorted by name.
    #[must_use]
    pub fn throttle_configs(&self) -> Vec<ThrottleConfig> {
        let mut configs: Vec<ThrottleConfig> = self
            .schedulers
            .iter()
            .map(|(name, limit)| ThrottleConfig::new(name.clone(), *limit))
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
