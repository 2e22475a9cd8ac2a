//! Task model: trigger marker, hook-facing task info, and caller-facing handles.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::core::{CancelToken, SchedulerError};
use crate::util::TaskId;

/// Source of fire times for cron-triggered tasks.
///
/// Expression parsing and evaluation live outside this crate; the scheduler
/// only asks for the next occurrence.
pub trait CronExpression: Send + Sync + fmt::Debug {
    /// Next fire time strictly after `after`, or `None` once exhausted.
    fn next_after(&self, after: SystemTime) -> Option<SystemTime>;
}

/// When a submitted task should run.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Run as soon as possible; no timer involved.
    Immediate,
    /// Run once after the given delay.
    Delay(Duration),
    /// Run repeatedly, `period` apart measured from each scheduled start.
    FixedRate {
        /// Delay before the first run.
        initial_delay: Duration,
        /// Distance between scheduled starts.
        period: Duration,
    },
    /// Run repeatedly, `delay` apart measured from the end of each run.
    FixedDelay {
        /// Delay before the first run.
        initial_delay: Duration,
        /// Pause between the end of a run and the next start.
        delay: Duration,
    },
    /// Run at each occurrence of a cron expression.
    Cron(Arc<dyn CronExpression>),
}

/// Classification of a [`Trigger`] used to pick the admission path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// No timer: admission gates registration.
    Immediate,
    /// Timer or cron owned: admission gates each execution.
    Deferred,
}

impl Trigger {
    /// Classify this trigger.
    #[must_use]
    pub const fn kind(&self) -> TriggerKind {
        match self {
            Self::Immediate => TriggerKind::Immediate,
            _ => TriggerKind::Deferred,
        }
    }

    /// Whether the trigger fires more than once.
    #[must_use]
    pub const fn is_periodic(&self) -> bool {
        matches!(
            self,
            Self::FixedRate { .. } | Self::FixedDelay { .. } | Self::Cron(_)
        )
    }

    /// First fire time, measured from `now`. `None` for immediate triggers
    /// and for cron expressions without any upcoming occurrence.
    #[must_use]
    pub fn first_fire(&self, now: Instant) -> Option<Instant> {
        match self {
            Self::Immediate => None,
            Self::Delay(delay) => Some(now + *delay),
            Self::FixedRate { initial_delay, .. } | Self::FixedDelay { initial_delay, .. } => {
                Some(now + *initial_delay)
            }
            Self::Cron(cron) => next_cron_fire(cron.as_ref()),
        }
    }

    /// Fire time following a run that was scheduled for `scheduled` and
    /// finished at `finished`. `None` when the trigger is done.
    #[must_use]
    pub fn next_fire(&self, scheduled: Instant, finished: Instant) -> Option<Instant> {
        match self {
            Self::Immediate | Self::Delay(_) => None,
            Self::FixedRate { period, .. } => Some(scheduled + *period),
            Self::FixedDelay { delay, .. } => Some(finished + *delay),
            Self::Cron(cron) => next_cron_fire(cron.as_ref()),
        }
    }
}

fn next_cron_fire(cron: &dyn CronExpression) -> Option<Instant> {
    let wall_now = SystemTime::now();
    let now = Instant::now();
    let next = cron.next_after(wall_now)?;
    Some(now + next.duration_since(wall_now).unwrap_or_default())
}

/// Hook-facing view of a submitted task.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    id: TaskId,
    kind: TriggerKind,
    cancel: CancelToken,
}

impl TaskInfo {
    /// Describe a task.
    #[must_use]
    pub const fn new(id: TaskId, kind: TriggerKind, cancel: CancelToken) -> Self {
        Self { id, kind, cancel }
    }

    /// Task identifier.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Admission path of the task.
    #[must_use]
    pub const fn kind(&self) -> TriggerKind {
        self.kind
    }

    /// Whether the task was submitted without a trigger.
    #[must_use]
    pub fn is_immediate(&self) -> bool {
        self.kind == TriggerKind::Immediate
    }

    /// Token that cancels this task (and any admission wait done for it).
    #[must_use]
    pub const fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// Status of a task in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Registered, waiting for a worker or its next fire time.
    Pending,
    /// Body is executing.
    Running,
    /// Finished successfully (or a periodic trigger ran out of fire times).
    Completed,
    /// Body panicked with the given message.
    Failed(String),
    /// Cancelled before it could finish.
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transitions can happen.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }
}

struct CellState<R> {
    status: TaskStatus,
    result: Option<R>,
    staged: Option<Result<R, String>>,
}

/// Completion signal shared by the scheduler and the caller's handle.
pub(crate) struct TaskCell<R> {
    info: TaskInfo,
    periodic: bool,
    state: Mutex<CellState<R>>,
    done: Condvar,
}

impl<R> TaskCell<R> {
    pub(crate) fn new(info: TaskInfo, periodic: bool) -> Self {
        Self {
            info,
            periodic,
            state: Mutex::new(CellState {
                status: TaskStatus::Pending,
                result: None,
                staged: None,
            }),
            done: Condvar::new(),
        }
    }

    pub(crate) const fn info(&self) -> &TaskInfo {
        &self.info
    }

    pub(crate) const fn id(&self) -> TaskId {
        self.info.id
    }

    pub(crate) fn status(&self) -> TaskStatus {
        self.state.lock().status.clone()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.lock().status.is_final()
    }

    /// Pending -> Running. `false` if the task must not run.
    pub(crate) fn start(&self) -> bool {
        let mut state = self.state.lock();
        if state.status != TaskStatus::Pending || self.info.cancel.is_cancelled() {
            return false;
        }
        state.status = TaskStatus::Running;
        true
    }

    /// Keep the outcome of a run aside until [`publish`](Self::publish), so
    /// waiters are only woken once the scheduler finished its own cleanup.
    pub(crate) fn record(&self, outcome: Result<R, String>) {
        self.state.lock().staged = Some(outcome);
    }

    /// Apply the outcome kept by [`record`](Self::record), if any.
    pub(crate) fn publish(&self) {
        let staged = self.state.lock().staged.take();
        match staged {
            Some(Ok(value)) => self.settle(value),
            Some(Err(message)) => self.fail(message),
            None => {}
        }
    }

    /// Store the final value unless the task already reached a final state.
    pub(crate) fn settle(&self, value: R) {
        let mut state = self.state.lock();
        if state.status.is_final() {
            return;
        }
        state.status = TaskStatus::Completed;
        state.result = Some(value);
        self.done.notify_all();
    }

    /// Running -> Pending between runs of a periodic task.
    pub(crate) fn rearm(&self) {
        let mut state = self.state.lock();
        if state.status == TaskStatus::Running {
            state.status = TaskStatus::Pending;
        }
    }

    pub(crate) fn fail(&self, message: String) {
        let mut state = self.state.lock();
        if state.status.is_final() {
            return;
        }
        state.status = TaskStatus::Failed(message);
        self.done.notify_all();
    }

    /// Move to `Cancelled` if the task has not started yet. Periodic tasks are
    /// also stopped mid-run; the run in progress finishes but is not repeated.
    pub(crate) fn cancel_unstarted(&self) -> bool {
        let mut state = self.state.lock();
        let cancellable = match state.status {
            TaskStatus::Pending => true,
            TaskStatus::Running => self.periodic,
            _ => false,
        };
        if cancellable {
            state.status = TaskStatus::Cancelled;
            self.done.notify_all();
        }
        cancellable
    }

    /// Force a non-final task to `Cancelled`.
    pub(crate) fn abort(&self) {
        let mut state = self.state.lock();
        if !state.status.is_final() {
            state.status = TaskStatus::Cancelled;
            self.done.notify_all();
        }
    }

    fn outcome(state: &mut CellState<R>) -> Result<R, SchedulerError> {
        match &state.status {
            TaskStatus::Completed => state
                .result
                .take()
                .ok_or_else(|| SchedulerError::Internal("task result already taken".into())),
            TaskStatus::Failed(message) => Err(SchedulerError::TaskFailed(message.clone())),
            TaskStatus::Cancelled => Err(SchedulerError::Cancelled),
            TaskStatus::Pending | TaskStatus::Running => Err(SchedulerError::Timeout),
        }
    }

    fn wait(&self) -> Result<R, SchedulerError> {
        let mut state = self.state.lock();
        self.done.wait_while(&mut state, |s| !s.status.is_final());
        Self::outcome(&mut state)
    }

    fn wait_timeout(&self, timeout: Duration) -> Result<R, SchedulerError> {
        let mut state = self.state.lock();
        let deadline = Instant::now() + timeout;
        while !state.status.is_final() {
            if self.done.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        Self::outcome(&mut state)
    }
}

/// Caller-side handle of a submitted task.
///
/// A handle belongs to exactly one submission; tasks cannot be resubmitted.
pub struct TaskHandle<R> {
    cell: Arc<TaskCell<R>>,
}

impl<R> TaskHandle<R> {
    pub(crate) const fn new(cell: Arc<TaskCell<R>>) -> Self {
        Self { cell }
    }

    /// Task identifier.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.cell.id()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.cell.status()
    }

    /// Whether the task reached a final state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.cell.is_finished()
    }

    /// Request cancellation.
    ///
    /// A task that has not started will never run and releases any admission
    /// slot it holds. A one-shot task already running finishes normally.
    /// Returns `true` if this call was the one that requested cancellation.
    pub fn cancel(&self) -> bool {
        self.cell.info().cancel_token().cancel()
    }

    /// Block until the task finishes.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::TaskFailed` if the body panicked
    /// - `SchedulerError::Cancelled` if the task was cancelled
    pub fn wait(self) -> Result<R, SchedulerError> {
        self.cell.wait()
    }

    /// Block until the task finishes or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Same as [`wait`](Self::wait), plus `SchedulerError::Timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<R, SchedulerError> {
        self.cell.wait_timeout(timeout)
    }
}

#[cfg(feature = "tokio-runtime")]
impl<R: Send + 'static> TaskHandle<R> {
    /// Wait for completion from async code.
    ///
    /// The blocking wait is moved to tokio's blocking thread pool.
    ///
    /// # Errors
    ///
    /// Same as [`wait`](Self::wait), plus `SchedulerError::Internal` if the
    /// blocking task could not be joined.
    pub async fn wait_async(self) -> Result<R, SchedulerError> {
        tokio::task::spawn_blocking(move || self.wait())
            .await
            .map_err(|e| SchedulerError::Internal(format!("join error: {e}")))?
    }
}

impl<R> fmt::Debug for TaskHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

/// Render a panic payload as text.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "task panicked".to_string())
}
