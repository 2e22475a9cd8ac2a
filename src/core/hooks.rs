//! Extension points a scheduler exposes to admission policies.
//!
//! The base scheduler calls these hooks at three points of a task's life:
//! before it is registered, when it is deregistered, and when the runnable
//! handed to the timer service is built. Implementations compose with any
//! scheduler instead of overriding it.

use crate::core::{SchedulerError, TaskInfo};

/// Result of one invocation of a deferred runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The task body was executed (successfully or not).
    Ran,
    /// The body did not run: the task was cancelled or admission was refused.
    Skipped,
}

/// Runnable executed by the timer service each time a deferred task fires.
pub type DeferredRun = Box<dyn FnMut() -> RunOutcome + Send>;

/// Hooks invoked by [`Scheduler`](crate::scheduler::Scheduler).
///
/// Every method has a pass-through default.
pub trait SchedulerHooks: Send + Sync {
    /// Called with the registration step of a newly submitted task. The hook
    /// must call `register` at most once and return its result.
    ///
    /// # Errors
    ///
    /// Whatever `register` fails with, or an error of the hook itself (for
    /// example a cancelled admission wait).
    fn before_register(
        &self,
        task: &TaskInfo,
        register: &mut dyn FnMut() -> Result<(), SchedulerError>,
    ) -> Result<(), SchedulerError> {
        let _ = task;
        register()
    }

    /// Called with the deregistration step of a task. `deregister` returns
    /// whether the task was tracked and has now been removed; the hook
    /// returns the same answer.
    fn on_deregister(&self, task: &TaskInfo, deregister: &mut dyn FnMut() -> bool) -> bool {
        let _ = task;
        deregister()
    }

    /// Wrap the runnable the timer service invokes for a deferred task.
    fn wrap_deferred(&self, task: &TaskInfo, run: DeferredRun) -> DeferredRun {
        let _ = task;
        run
    }

    /// Called once when the scheduler shuts down.
    fn on_shutdown(&self) {}

    /// Extra text for the scheduler's `Display` output.
    fn describe(&self) -> Option<String> {
        None
    }
}

/// Hooks that change nothing; used by unthrottled schedulers.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughHooks;

impl SchedulerHooks for PassthroughHooks {}
