//! # Throttled Scheduler
//!
//! A task scheduler decorator that caps how many tasks of one scheduler are in
//! flight at once.
//!
//! Schedulers created from one [`SchedulerService`](scheduler::SchedulerService)
//! share a worker pool and a timer service. A
//! [`ThrottledScheduler`](scheduler::ThrottledScheduler) adds admission
//! control on top through an [`AdmissionGate`](core::AdmissionGate), a
//! blocking counting semaphore scoped to the scheduler's identity.
//!
//! ## Admission
//!
//! - **Immediate tasks**: the submitting thread waits for a slot before the
//!   task is registered. The slot is returned when the task is deregistered
//!   (completed, failed, or cancelled).
//! - **Deferred tasks** (delay, fixed rate, fixed delay, cron): registration
//!   is not gated. Each fire takes a slot on one of the scheduler's own
//!   dispatch threads right before the body runs and returns it right
//!   after, including when the body panics.
//! - **Cancellation**: a caller waiting for a slot is woken by its
//!   [`CancelToken`](core::CancelToken) and never takes the slot.
//!
//! ```rust
//! use std::time::Duration;
//! use throttled_scheduler::config::{ServiceConfig, ThrottleConfig};
//! use throttled_scheduler::scheduler::SchedulerService;
//!
//! let service = SchedulerService::new(
//!     ServiceConfig::default().with_worker_threads(2).with_timer_threads(2),
//! )
//! .unwrap();
//! let flows = service
//!     .create_throttled_scheduler(&ThrottleConfig::new("flows", 1))
//!     .unwrap();
//!
//! let first = flows.submit(|| 1 + 1).unwrap();
//! let later = flows.schedule(|| "later", Duration::from_millis(10)).unwrap();
//! assert_eq!(first.wait().unwrap(), 2);
//! assert_eq!(later.wait().unwrap(), "later");
//!
//! service.shutdown().unwrap();
//! ```
//!
//! ## Capacity planning
//!
//! Each throttled scheduler gets `min(timer_threads, max_concurrent_tasks)`
//! dispatch threads of its own. Deferred admission blocks one of them while it
//! waits, so that number bounds the scheduler's deferred throughput, and a
//! saturated scheduler never delays the deferred work of another.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling abstractions and admission accounting.
pub mod core;
/// Configuration models for the service and its schedulers.
pub mod config;
/// Builders to construct schedulers from configuration.
pub mod builders;
/// Base scheduler, throttling decorator, and the owning service.
pub mod scheduler;
/// Shared utilities.
pub mod util;
