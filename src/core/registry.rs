//! Bookkeeping of in-flight tasks for one scheduler.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::core::TaskInfo;
use crate::util::TaskId;

/// Registered tasks keyed by id, with a drained signal for shutdown.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<TaskId, TaskInfo>>,
    drained: Condvar,
}

impl TaskRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a task. Returns `false` if the id was already registered.
    pub fn put(&self, task: TaskInfo) -> bool {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&task.id()) {
            return false;
        }
        tasks.insert(task.id(), task);
        true
    }

    /// Stop tracking a task. `None` if it was unknown or already removed.
    pub fn remove(&self, id: TaskId) -> Option<TaskInfo> {
        let mut tasks = self.tasks.lock();
        let removed = tasks.remove(&id);
        if removed.is_some() && tasks.is_empty() {
            self.drained.notify_all();
        }
        removed
    }

    /// Whether the task is currently tracked.
    #[must_use]
    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.lock().contains_key(&id)
    }

    /// Number of tracked tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Whether no task is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Copy of every tracked task.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TaskInfo> {
        self.tasks.lock().values().cloned().collect()
    }

    /// Block until the registry is empty or `timeout` elapses.
    /// Returns `true` if it drained.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut tasks = self.tasks.lock();
        while !tasks.is_empty() {
            if self.drained.wait_until(&mut tasks, deadline).timed_out() {
                return tasks.is_empty();
            }
        }
        true
    }
}
