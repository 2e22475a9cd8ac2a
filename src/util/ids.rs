//! Identifier types shared by schedulers, gates, and tasks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

/// Task identifier, unique within the process.
pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh task identifier.
pub(crate) fn next_task_id() -> TaskId {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Opaque identity of one scheduler instance.
///
/// Admission accounting is scoped per identity, so two schedulers sharing a
/// worker pool are throttled independently even if they carry the same name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchedulerId {
    uuid: Uuid,
    name: Arc<str>,
}

impl SchedulerId {
    /// Create a new identity with a random UUID.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: Arc::from(name.into()),
        }
    }

    /// Human-readable scheduler name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unique part of the identity.
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.uuid.simple())
    }
}
