//! Configuration models for the shared service and its schedulers.

pub mod service;

pub use service::{
    SchedulersConfig, ServiceConfig, ThrottleConfig, SHUTDOWN_TIMEOUT_ENV, TIMER_THREADS_ENV,
    WORKER_THREADS_ENV,
};
