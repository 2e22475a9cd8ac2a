//! Admission gate: caps how many tasks of one scheduler may be in flight.
//!
//! The gate is a blocking, per-scheduler counting semaphore. Callers wait until
//! the in-flight count for their scheduler is below the limit, take a slot, and
//! give it back with an explicit [`AdmissionGate::release`] (or by dropping an
//! [`AdmissionPermit`]).
//!
//! # Example
//!
//! ```rust
//! use throttled_scheduler::core::{
//!     AdmissionGate, CancelToken, PerSchedulerGate, TaskInfo, TriggerKind,
//! };
//! use throttled_scheduler::util::SchedulerId;
//!
//! let gate = PerSchedulerGate::new();
//! let owner = SchedulerId::new("flows");
//! gate.register(&owner);
//!
//! let task = TaskInfo::new(1, TriggerKind::Immediate, CancelToken::new());
//! let value = gate
//!     .acquire_and_run(2, || 40 + 2, &task, &owner, task.cancel_token())
//!     .unwrap();
//! assert_eq!(value, 42);
//! assert_eq!(gate.in_flight(&owner), 1);
//!
//! gate.release(&owner);
//! assert_eq!(gate.in_flight(&owner), 0);
//! ```

mod by_scheduler;

use std::sync::Arc;

use crate::core::{CancelToken, SchedulerError, TaskInfo};
use crate::util::SchedulerId;

pub use by_scheduler::PerSchedulerGate;

/// Pluggable admission policy.
///
/// Implementations must be safe to call from many threads at once, must never
/// let the count for an owner exceed the limit passed to
/// [`acquire`](Self::acquire), and must treat a release without a matching
/// acquire as a logged no-op.
pub trait AdmissionGate: Send + Sync {
    /// Create the accounting state for `owner`.
    fn register(&self, owner: &SchedulerId);

    /// Tear down the accounting state for `owner`. Waiting and future
    /// acquires fail with `SchedulerError::Shutdown`; slots still held can be
    /// released.
    fn unregister(&self, owner: &SchedulerId);

    /// Block until `owner` has fewer than `limit` tasks in flight, then take
    /// a slot.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::Cancelled` if `cancel` fires while waiting
    /// - `SchedulerError::Shutdown` if `owner` is not (or no longer) registered
    /// - `SchedulerError::InvalidConfig` if `limit` is zero
    fn acquire(
        &self,
        limit: u32,
        task: &TaskInfo,
        owner: &SchedulerId,
        cancel: &CancelToken,
    ) -> Result<(), SchedulerError>;

    /// Give back one slot of `owner` and wake waiters.
    fn release(&self, owner: &SchedulerId);

    /// Slots currently held by `owner`.
    fn in_flight(&self, owner: &SchedulerId) -> u32;

    /// Callers currently blocked for `owner`.
    fn waiting(&self, owner: &SchedulerId) -> usize;

    /// Acquire a slot, then run `body` on the calling thread.
    ///
    /// The slot stays held after `body` returns; releasing it is the caller's
    /// job.
    ///
    /// # Errors
    ///
    /// Same as [`acquire`](Self::acquire); `body` does not run on error.
    fn acquire_and_run<R, F>(
        &self,
        limit: u32,
        body: F,
        task: &TaskInfo,
        owner: &SchedulerId,
        cancel: &CancelToken,
    ) -> Result<R, SchedulerError>
    where
        Self: Sized,
        F: FnOnce() -> R,
    {
        self.acquire(limit, task, owner, cancel)?;
        Ok(body())
    }
}

impl<G: AdmissionGate + ?Sized> AdmissionGate for Arc<G> {
    fn register(&self, owner: &SchedulerId) {
        (**self).register(owner);
    }

    fn unregister(&self, owner: &SchedulerId) {
        (**self).unregister(owner);
    }

    fn acquire(
        &self,
        limit: u32,
        task: &TaskInfo,
        owner: &SchedulerId,
        cancel: &CancelToken,
    ) -> Result<(), SchedulerError> {
        (**self).acquire(limit, task, owner, cancel)
    }

    fn release(&self, owner: &SchedulerId) {
        (**self).release(owner);
    }

    fn in_flight(&self, owner: &SchedulerId) -> u32 {
        (**self).in_flight(owner)
    }

    fn waiting(&self, owner: &SchedulerId) -> usize {
        (**self).waiting(owner)
    }
}

/// A held slot that is released when dropped, on every exit path including
/// unwinding.
#[must_use = "dropping the permit releases the slot immediately"]
pub struct AdmissionPermit<'a, G: AdmissionGate + ?Sized> {
    gate: &'a G,
    owner: &'a SchedulerId,
}

impl<'a, G: AdmissionGate + ?Sized> AdmissionPermit<'a, G> {
    /// Acquire a slot and wrap it in a guard.
    ///
    /// # Errors
    ///
    /// Same as [`AdmissionGate::acquire`].
    pub fn acquire(
        gate: &'a G,
        limit: u32,
        task: &TaskInfo,
        owner: &'a SchedulerId,
        cancel: &CancelToken,
    ) -> Result<Self, SchedulerError> {
        gate.acquire(limit, task, owner, cancel)?;
        Ok(Self { gate, owner })
    }
}

impl<G: AdmissionGate + ?Sized> Drop for AdmissionPermit<'_, G> {
    fn drop(&mut self) {
        self.gate.release(self.owner);
    }
}
