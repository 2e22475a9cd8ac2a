//! Throttling decorator: caps how many tasks of one scheduler run at once.
//!
//! Immediate tasks take their slot before registration, so a saturated
//! scheduler blocks the submitting thread. Deferred tasks take a slot each
//! time they fire, on the scheduler's own dispatch threads, and give it back
//! as soon as that run ends. Tasks that are cancelled or fail still give their slot
//! back.

use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::ThrottleConfig;
use crate::core::{
    AdmissionGate, AdmissionPermit, DeferredRun, PerSchedulerGate, RunOutcome, SchedulerError,
    SchedulerHooks, TaskInfo, TimerService, WorkerPool,
};
use crate::scheduler::Scheduler;
use crate::util::{SchedulerId, TaskId};

/// Admission hooks binding a scheduler to an [`AdmissionGate`].
pub struct ThrottlingHooks<G: AdmissionGate> {
    gate: Arc<G>,
    limit: u32,
    owner: SchedulerId,
    /// Immediate tasks holding a slot taken at registration.
    admitted: Mutex<HashSet<TaskId>>,
}

impl<G: AdmissionGate> ThrottlingHooks<G> {
    /// Register `owner` with `gate` and build hooks enforcing `limit`.
    pub fn new(gate: Arc<G>, limit: u32, owner: SchedulerId) -> Self {
        gate.register(&owner);
        Self {
            gate,
            limit,
            owner,
            admitted: Mutex::new(HashSet::new()),
        }
    }

    /// Configured limit.
    #[must_use]
    pub const fn limit(&self) -> u32 {
        self.limit
    }

    /// Slots currently held.
    #[must_use]
    pub fn in_flight(&self) -> u32 {
        self.gate.in_flight(&self.owner)
    }

    /// Callers currently waiting for a slot.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.gate.waiting(&self.owner)
    }
}

impl<G: AdmissionGate + 'static> SchedulerHooks for ThrottlingHooks<G> {
    fn before_register(
        &self,
        task: &TaskInfo,
        register: &mut dyn FnMut() -> Result<(), SchedulerError>,
    ) -> Result<(), SchedulerError> {
        if !task.is_immediate() {
            return register();
        }

        let registered = self.gate.acquire_and_run(
            self.limit,
            register,
            task,
            &self.owner,
            task.cancel_token(),
        )?;
        match registered {
            Ok(()) => {
                self.admitted.lock().insert(task.id());
                Ok(())
            }
            Err(e) => {
                debug!(scheduler = %self.owner, task_id = task.id(), error = %e, "registration failed; returning slot");
                self.gate.release(&self.owner);
                Err(e)
            }
        }
    }

    fn on_deregister(&self, task: &TaskInfo, deregister: &mut dyn FnMut() -> bool) -> bool {
        let removed = deregister();
        // Deferred slots are returned by the wrapped runnable, never here.
        if removed && self.admitted.lock().remove(&task.id()) {
            self.gate.release(&self.owner);
        }
        removed
    }

    fn wrap_deferred(&self, task: &TaskInfo, mut run: DeferredRun) -> DeferredRun {
        let gate = Arc::clone(&self.gate);
        let owner = self.owner.clone();
        let limit = self.limit;
        let task = task.clone();
        Box::new(move || {
            let permit = match AdmissionPermit::acquire(
                &*gate,
                limit,
                &task,
                &owner,
                task.cancel_token(),
            ) {
                Ok(permit) => permit,
                Err(e) => {
                    debug!(scheduler = %owner, task_id = task.id(), error = %e, "deferred run not admitted");
                    return RunOutcome::Skipped;
                }
            };
            let outcome = run();
            drop(permit);
            outcome
        })
    }

    fn on_shutdown(&self) {
        self.gate.unregister(&self.owner);
    }

    fn describe(&self) -> Option<String> {
        Some(format!(
            "max_concurrent_tasks={}, in_flight={}, waiting={}",
            self.limit,
            self.in_flight(),
            self.waiting()
        ))
    }
}

/// A [`Scheduler`] whose tasks are admitted through an [`AdmissionGate`].
///
/// Dereferences to the underlying scheduler for submission and lifecycle
/// calls.
pub struct ThrottledScheduler<G: AdmissionGate + 'static = PerSchedulerGate> {
    base: Scheduler,
    hooks: Arc<ThrottlingHooks<G>>,
}

impl<G: AdmissionGate + 'static> ThrottledScheduler<G> {
    /// Create a throttled scheduler named after `config`.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::InvalidConfig` if `config.max_concurrent_tasks` is
    ///   zero or the name is empty
    /// - `SchedulerError::Internal` if a dispatch thread cannot be spawned
    pub fn new(
        config: &ThrottleConfig,
        workers: Arc<WorkerPool>,
        timer: Arc<TimerService>,
        gate: Arc<G>,
        shutdown_timeout: Duration,
    ) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;

        // Fires waiting for a slot park here, never on threads other
        // schedulers dispatch on.
        let dispatch = timer.dedicated_dispatch(
            &format!("{}-dispatch", config.name),
            usize::try_from(config.max_concurrent_tasks).unwrap_or(usize::MAX),
        )?;

        let id = SchedulerId::new(config.name.clone());
        let hooks = Arc::new(ThrottlingHooks::new(
            gate,
            config.max_concurrent_tasks,
            id.clone(),
        ));
        let base = Scheduler::with_dispatch(
            id,
            workers,
            timer,
            Arc::new(dispatch),
            Arc::clone(&hooks) as Arc<dyn SchedulerHooks>,
            shutdown_timeout,
        );

        info!(
            scheduler = %base.id(),
            max_concurrent_tasks = config.max_concurrent_tasks,
            "throttled scheduler created"
        );
        Ok(Self { base, hooks })
    }

    /// Configured admission limit.
    #[must_use]
    pub fn max_concurrent_tasks(&self) -> u32 {
        self.hooks.limit()
    }

    /// Slots currently held by this scheduler's tasks.
    #[must_use]
    pub fn in_flight(&self) -> u32 {
        self.hooks.in_flight()
    }

    /// Callers currently blocked waiting for a slot.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.hooks.waiting()
    }

    /// The undecorated scheduler.
    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler {
        &self.base
    }
}

impl<G: AdmissionGate + 'static> Deref for ThrottledScheduler<G> {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.base
    }
}

impl<G: AdmissionGate + 'static> Clone for ThrottledScheduler<G> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
            hooks: Arc::clone(&self.hooks),
        }
    }
}

impl<G: AdmissionGate + 'static> fmt::Display for ThrottledScheduler<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Throttled{}", self.base)
    }
}

impl<G: AdmissionGate + 'static> fmt::Debug for ThrottledScheduler<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottledScheduler")
            .field("scheduler", &self.base)
            .field("max_concurrent_tasks", &self.hooks.limit())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
