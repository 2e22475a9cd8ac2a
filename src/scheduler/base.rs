//! The base scheduler: task registration, immediate execution on the shared
//! worker pool, and deferred execution through the shared timer service.
//!
//! Every submitted task is recorded in the scheduler's registry from
//! registration until it finishes, fails, or is cancelled. Admission policies
//! attach through [`SchedulerHooks`] rather than by wrapping this type.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::core::task::{panic_message, TaskCell};
use crate::core::{
    CancelToken, CronExpression, DeferredRun, Job, RunOutcome, SchedulerError, SchedulerHooks,
    TaskHandle, TaskInfo, TaskRegistry, TimerService, Trigger, TriggerKind, WorkerPool,
};
use crate::util::ids::next_task_id;
use crate::util::{SchedulerId, TaskId};

/// Callback run once when a scheduler shuts down.
pub type ShutdownCallback = Box<dyn FnOnce(&SchedulerId) + Send>;

/// A named scheduler sharing a worker pool and timer service with its
/// siblings.
///
/// Cheap to clone; clones drive the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    id: SchedulerId,
    workers: Arc<WorkerPool>,
    timer: Arc<TimerService>,
    /// Pool the timer hands this scheduler's fires to; the shared dispatch
    /// pool when `None`.
    dispatch: Option<Arc<WorkerPool>>,
    registry: TaskRegistry,
    hooks: Arc<dyn SchedulerHooks>,
    shutdown: AtomicBool,
    shutdown_timeout: Duration,
    shutdown_callback: Mutex<Option<ShutdownCallback>>,
}

impl Scheduler {
    /// Create a scheduler running on `workers` and `timer`.
    ///
    /// `shutdown_timeout` bounds each of the two waits performed by
    /// [`stop`](Self::stop).
    #[must_use]
    pub fn new(
        id: SchedulerId,
        workers: Arc<WorkerPool>,
        timer: Arc<TimerService>,
        hooks: Arc<dyn SchedulerHooks>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self::build(id, workers, timer, None, hooks, shutdown_timeout)
    }

    /// Create a scheduler whose deferred fires run on `dispatch` rather than
    /// on the timer's shared dispatch threads.
    ///
    /// The pool is shut down by [`stop`](Self::stop).
    #[must_use]
    pub fn with_dispatch(
        id: SchedulerId,
        workers: Arc<WorkerPool>,
        timer: Arc<TimerService>,
        dispatch: Arc<WorkerPool>,
        hooks: Arc<dyn SchedulerHooks>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self::build(id, workers, timer, Some(dispatch), hooks, shutdown_timeout)
    }

    fn build(
        id: SchedulerId,
        workers: Arc<WorkerPool>,
        timer: Arc<TimerService>,
        dispatch: Option<Arc<WorkerPool>>,
        hooks: Arc<dyn SchedulerHooks>,
        shutdown_timeout: Duration,
    ) -> Self {
        debug!(scheduler = %id, dedicated_dispatch = dispatch.is_some(), "scheduler created");
        Self {
            inner: Arc::new(SchedulerInner {
                id,
                workers,
                timer,
                dispatch,
                registry: TaskRegistry::new(),
                hooks,
                shutdown: AtomicBool::new(false),
                shutdown_timeout,
                shutdown_callback: Mutex::new(None),
            }),
        }
    }

    /// Install the callback run once on shutdown, replacing any previous one.
    pub fn set_shutdown_callback<F>(&self, callback: F)
    where
        F: FnOnce(&SchedulerId) + Send + 'static,
    {
        *self.inner.shutdown_callback.lock() = Some(Box::new(callback));
    }

    /// Scheduler identity.
    #[must_use]
    pub fn id(&self) -> &SchedulerId {
        &self.inner.id
    }

    /// Scheduler name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.id.name()
    }

    /// Tasks registered and not yet finished.
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        self.inner.registry.len()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Shut down and every registered task has finished.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.is_shutdown() && self.inner.registry.is_empty()
    }

    /// Run `task` on the worker pool as soon as possible.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::Shutdown` if the scheduler is shut down
    /// - any error raised by the admission hook (for example
    ///   `SchedulerError::Cancelled`)
    pub fn submit<F, R>(&self, task: F) -> Result<TaskHandle<R>, SchedulerError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.submit_with_cancel(task, CancelToken::new())
    }

    /// Like [`submit`](Self::submit), with a caller-owned cancellation token.
    /// Cancelling the token while the submission waits for admission aborts
    /// the submission.
    ///
    /// # Errors
    ///
    /// Same as [`submit`](Self::submit); `SchedulerError::Cancelled` if
    /// `cancel` is already cancelled.
    pub fn submit_with_cancel<F, R>(
        &self,
        task: F,
        cancel: CancelToken,
    ) -> Result<TaskHandle<R>, SchedulerError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let inner = &self.inner;
        inner.ensure_running()?;
        if cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }

        let info = TaskInfo::new(next_task_id(), TriggerKind::Immediate, cancel);
        inner
            .hooks
            .before_register(&info, &mut || inner.register(&info))?;

        let cell = Arc::new(TaskCell::new(info, false));
        SchedulerInner::watch_cancel(inner, &cell);

        let job_inner = Arc::clone(inner);
        let job_cell = Arc::clone(&cell);
        let job: Job = Box::new(move || {
            if job_cell.start() {
                job_cell.record(execute(&job_inner.id, job_cell.id(), task));
            }
            job_inner.deregister(job_cell.info());
            job_cell.publish();
            job_cell.abort();
        });

        if let Err(e) = inner.workers.execute(job) {
            warn!(scheduler = %inner.id, task_id = cell.id(), error = %e, "worker pool rejected task");
            cell.abort();
            inner.deregister(cell.info());
            return Err(e);
        }
        debug!(scheduler = %inner.id, task_id = cell.id(), "task submitted");
        Ok(TaskHandle::new(cell))
    }

    /// Run `task` once after `delay`.
    ///
    /// # Errors
    ///
    /// `SchedulerError::Shutdown` if the scheduler is shut down.
    pub fn schedule<F, R>(&self, task: F, delay: Duration) -> Result<TaskHandle<R>, SchedulerError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.schedule_once(task, delay, CancelToken::new())
    }

    /// Like [`schedule`](Self::schedule), with a caller-owned cancellation
    /// token.
    ///
    /// # Errors
    ///
    /// Same as [`schedule`](Self::schedule); `SchedulerError::Cancelled` if
    /// `cancel` is already cancelled.
    pub fn schedule_once<F, R>(
        &self,
        task: F,
        delay: Duration,
        cancel: CancelToken,
    ) -> Result<TaskHandle<R>, SchedulerError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let scheduler = self.inner.id.clone();
        self.submit_deferred(
            Trigger::Delay(delay),
            cancel,
            |cell| one_shot_run(scheduler, cell, task),
            TaskCell::abort,
        )
    }

    /// Run `task` every `period`, the first time after `initial_delay`.
    /// Starts are `period` apart; an overrunning run delays the next start.
    ///
    /// # Errors
    ///
    /// `SchedulerError::Shutdown` if the scheduler is shut down.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        task: F,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<TaskHandle<()>, SchedulerError>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule_with_trigger(
            task,
            Trigger::FixedRate {
                initial_delay,
                period,
            },
            CancelToken::new(),
        )
    }

    /// Run `task` repeatedly with `delay` between the end of one run and the
    /// start of the next, the first time after `initial_delay`.
    ///
    /// # Errors
    ///
    /// `SchedulerError::Shutdown` if the scheduler is shut down.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        task: F,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<TaskHandle<()>, SchedulerError>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule_with_trigger(
            task,
            Trigger::FixedDelay {
                initial_delay,
                delay,
            },
            CancelToken::new(),
        )
    }

    /// Run `task` at every occurrence of `cron`. The handle completes once the
    /// expression has no further occurrence.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::Shutdown` if the scheduler is shut down
    /// - `SchedulerError::InvalidConfig` if `cron` has no upcoming occurrence
    pub fn schedule_with_cron<F>(
        &self,
        task: F,
        cron: Arc<dyn CronExpression>,
    ) -> Result<TaskHandle<()>, SchedulerError>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule_with_trigger(task, Trigger::Cron(cron), CancelToken::new())
    }

    /// Submit `task` under an arbitrary trigger. Periodic triggers call it
    /// once per fire; one-shot triggers call it once.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::Shutdown` if the scheduler is shut down
    /// - `SchedulerError::Cancelled` if `cancel` is already cancelled or fires
    ///   during an immediate task's admission wait
    /// - `SchedulerError::InvalidConfig` if the trigger never fires
    pub fn schedule_with_trigger<F>(
        &self,
        mut task: F,
        trigger: Trigger,
        cancel: CancelToken,
    ) -> Result<TaskHandle<()>, SchedulerError>
    where
        F: FnMut() + Send + 'static,
    {
        match trigger {
            Trigger::Immediate => self.submit_with_cancel(move || task(), cancel),
            Trigger::Delay(delay) => self.schedule_once(move || task(), delay, cancel),
            periodic => {
                let scheduler = self.inner.id.clone();
                self.submit_deferred(
                    periodic,
                    cancel,
                    |cell| periodic_run(scheduler, cell, task),
                    complete_periodic,
                )
            }
        }
    }

    /// Stop accepting tasks and cancel every deferred task. Immediate tasks
    /// already submitted still run. Idempotent.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(scheduler = %inner.id, active_tasks = inner.registry.len(), "shutting down scheduler");

        for task in inner.registry.snapshot() {
            if !task.is_immediate() {
                task.cancel_token().cancel();
            }
        }
        inner.hooks.on_shutdown();

        let callback = inner.shutdown_callback.lock().take();
        if let Some(callback) = callback {
            callback(&inner.id);
        }
    }

    /// Shut down and cancel every registered task. Tasks already running are
    /// not interrupted. Returns how many tasks this call cancelled.
    pub fn shutdown_now(&self) -> usize {
        self.shutdown();
        let cancelled = self
            .inner
            .registry
            .snapshot()
            .iter()
            .filter(|task| task.cancel_token().cancel())
            .count();
        info!(scheduler = %self.inner.id, cancelled, "scheduler stopped immediately");
        cancelled
    }

    /// Block until every registered task has finished or `timeout` elapses.
    /// Returns `true` if the registry drained.
    #[must_use]
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.inner.registry.wait_drained(timeout)
    }

    /// Graceful stop: shut down, wait for in-flight work, then cancel what is
    /// left and wait once more.
    ///
    /// # Errors
    ///
    /// `SchedulerError::Timeout` if tasks are still running after both waits.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        let timeout = self.inner.shutdown_timeout;
        let result = self.drain(timeout);
        if let Some(dispatch) = &self.inner.dispatch {
            dispatch.shutdown(timeout);
        }
        result
    }

    fn drain(&self, timeout: Duration) -> Result<(), SchedulerError> {
        self.shutdown();
        if self.await_termination(timeout) {
            return Ok(());
        }

        warn!(
            scheduler = %self.inner.id,
            active_tasks = self.active_tasks(),
            "tasks still running after {timeout:?}; cancelling"
        );
        self.shutdown_now();
        if self.await_termination(timeout) {
            Ok(())
        } else {
            error!(scheduler = %self.inner.id, active_tasks = self.active_tasks(), "scheduler did not terminate");
            Err(SchedulerError::Timeout)
        }
    }

    fn submit_deferred<R, B>(
        &self,
        trigger: Trigger,
        cancel: CancelToken,
        build: B,
        on_exhausted: fn(&TaskCell<R>),
    ) -> Result<TaskHandle<R>, SchedulerError>
    where
        R: Send + 'static,
        B: FnOnce(Arc<TaskCell<R>>) -> DeferredRun,
    {
        let inner = &self.inner;
        inner.ensure_running()?;
        if cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }
        let first = trigger.first_fire(Instant::now()).ok_or_else(|| {
            SchedulerError::InvalidConfig("trigger has no upcoming fire time".into())
        })?;

        let info = TaskInfo::new(next_task_id(), TriggerKind::Deferred, cancel);
        inner
            .hooks
            .before_register(&info, &mut || inner.register(&info))?;

        let cell = Arc::new(TaskCell::new(info, trigger.is_periodic()));
        let run = inner.hooks.wrap_deferred(cell.info(), build(Arc::clone(&cell)));
        SchedulerInner::watch_cancel(inner, &cell);

        if let Err(e) = arm(inner, Arc::clone(&cell), trigger, run, first, on_exhausted) {
            cell.abort();
            inner.deregister(cell.info());
            return Err(e);
        }
        debug!(scheduler = %inner.id, task_id = cell.id(), "deferred task scheduled");
        Ok(TaskHandle::new(cell))
    }
}

impl SchedulerInner {
    fn ensure_running(&self) -> Result<(), SchedulerError> {
        if self.shutdown.load(Ordering::SeqCst) {
            Err(SchedulerError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn register(&self, task: &TaskInfo) -> Result<(), SchedulerError> {
        self.ensure_running()?;
        if !self.registry.put(task.clone()) {
            return Err(SchedulerError::Internal(format!(
                "task {} registered twice",
                task.id()
            )));
        }
        // A shutdown racing this registration may have missed the new entry.
        if self.shutdown.load(Ordering::SeqCst) {
            self.registry.remove(task.id());
            return Err(SchedulerError::Shutdown);
        }
        debug!(scheduler = %self.id, task_id = task.id(), kind = ?task.kind(), "task registered");
        Ok(())
    }

    fn deregister(&self, task: &TaskInfo) -> bool {
        let id = task.id();
        self.hooks
            .on_deregister(task, &mut || self.registry.remove(id).is_some())
    }

    /// Stop and deregister the task as soon as its token fires.
    fn watch_cancel<R: Send + 'static>(inner: &Arc<Self>, cell: &Arc<TaskCell<R>>) {
        let weak_inner = Arc::downgrade(inner);
        let weak_cell = Arc::downgrade(cell);
        let _ = cell.info().cancel_token().on_cancel(move || {
            let (Some(inner), Some(cell)) = (weak_inner.upgrade(), weak_cell.upgrade()) else {
                return;
            };
            if cell.cancel_unstarted() {
                debug!(scheduler = %inner.id, task_id = cell.id(), "task cancelled");
                if !cell.info().is_immediate() {
                    inner.timer.cancel(cell.id());
                }
                inner.deregister(cell.info());
            }
        });
    }
}

/// Hand the next fire of a deferred task to the timer service. Each fire
/// re-arms the task until its trigger is exhausted or it reaches a final
/// state.
fn arm<R: Send + 'static>(
    inner: &Arc<SchedulerInner>,
    cell: Arc<TaskCell<R>>,
    trigger: Trigger,
    mut run: DeferredRun,
    due: Instant,
    on_exhausted: fn(&TaskCell<R>),
) -> Result<(), SchedulerError> {
    let task_id = cell.id();
    let job_inner = Arc::clone(inner);
    let job: Job = Box::new(move || {
        let outcome = if cell.is_finished() {
            RunOutcome::Skipped
        } else {
            run()
        };
        cell.publish();

        let next = match outcome {
            RunOutcome::Ran if !cell.is_finished() => {
                cell.rearm();
                trigger.next_fire(due, Instant::now())
            }
            _ => None,
        };
        let Some(next) = next else {
            if outcome == RunOutcome::Ran {
                on_exhausted(&cell);
            } else {
                cell.abort();
            }
            job_inner.deregister(cell.info());
            return;
        };

        if let Err(e) = arm(&job_inner, Arc::clone(&cell), trigger, run, next, on_exhausted) {
            debug!(scheduler = %job_inner.id, task_id = cell.id(), error = %e, "could not re-arm task");
            cell.abort();
            job_inner.deregister(cell.info());
        }
    });
    match &inner.dispatch {
        Some(dispatch) => inner.timer.schedule_on(task_id, due, job, Arc::clone(dispatch)),
        None => inner.timer.schedule(task_id, due, job),
    }
}

fn one_shot_run<F, R>(scheduler: SchedulerId, cell: Arc<TaskCell<R>>, task: F) -> DeferredRun
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let mut body = Some(task);
    Box::new(move || {
        let Some(body) = body.take() else {
            return RunOutcome::Skipped;
        };
        if !cell.start() {
            return RunOutcome::Skipped;
        }
        cell.record(execute(&scheduler, cell.id(), body));
        RunOutcome::Ran
    })
}

fn periodic_run<F>(scheduler: SchedulerId, cell: Arc<TaskCell<()>>, mut task: F) -> DeferredRun
where
    F: FnMut() + Send + 'static,
{
    Box::new(move || {
        if !cell.start() {
            return RunOutcome::Skipped;
        }
        if let Err(message) = execute(&scheduler, cell.id(), &mut task) {
            cell.record(Err(message));
        }
        RunOutcome::Ran
    })
}

fn execute<R>(scheduler: &SchedulerId, task: TaskId, body: impl FnOnce() -> R) -> Result<R, String> {
    catch_unwind(AssertUnwindSafe(body)).map_err(|payload| {
        let message = panic_message(payload.as_ref());
        error!(scheduler = %scheduler, task_id = task, panic = %message, "task panicked");
        message
    })
}

fn complete_periodic(cell: &TaskCell<()>) {
    cell.settle(());
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Scheduler[{}, active_tasks={}",
            self.inner.id,
            self.inner.registry.len()
        )?;
        if let Some(extra) = self.inner.hooks.describe() {
            write!(f, ", {extra}")?;
        }
        f.write_str("]")
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.inner.id)
            .field("active_tasks", &self.inner.registry.len())
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        if !self.shutdown.load(Ordering::SeqCst) {
            debug!(scheduler = %self.id, "scheduler dropped without shutdown");
            self.hooks.on_shutdown();
        }
    }
}
