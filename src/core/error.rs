//! Error types for scheduler operations.

use thiserror::Error;

/// Errors produced by scheduler components.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// Construction-time configuration was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The caller or the task was cancelled, possibly while waiting for admission.
    #[error("task cancelled")]
    Cancelled,
    /// The scheduler (or its admission lane) has been shut down.
    #[error("scheduler has been shut down")]
    Shutdown,
    /// The task body failed while executing.
    #[error("task failed: {0}")]
    TaskFailed(String),
    /// A bounded wait expired.
    #[error("operation timed out")]
    Timeout,
    /// Internal failure (thread spawn, closed channel, ...).
    #[error("internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Whether this error reports a cancellation rather than a malfunction.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Shutdown)
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
