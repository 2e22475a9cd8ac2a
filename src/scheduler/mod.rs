//! Schedulers built on the shared worker pool and timer service.

pub mod base;
pub mod service;
pub mod throttled;

pub use base::{Scheduler, ShutdownCallback};
pub use service::SchedulerService;
pub use throttled::{ThrottledScheduler, ThrottlingHooks};
