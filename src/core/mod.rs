//! Core scheduling abstractions and admission accounting.

pub mod cancel;
pub mod error;
pub mod gate;
pub mod hooks;
pub mod registry;
pub mod task;
pub mod timer;
pub mod worker_pool;

pub use cancel::{CallbackId, CancelToken};
pub use error::{AppResult, SchedulerError};
pub use gate::{AdmissionGate, AdmissionPermit, PerSchedulerGate};
pub use hooks::{DeferredRun, PassthroughHooks, RunOutcome, SchedulerHooks};
pub use registry::TaskRegistry;
pub use task::{CronExpression, TaskHandle, TaskInfo, TaskStatus, Trigger, TriggerKind};
pub use timer::TimerService;
pub use worker_pool::{Job, PoolStats, WorkerPool};
