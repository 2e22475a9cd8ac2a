//! Default admission policy: one FIFO lane per scheduler identity.
//!
//! # Design
//!
//! - **Per-owner lanes**: RwLock'd map from identity to lane, read-mostly
//! - **FIFO tickets**: each waiter takes a ticket; only the queue head may take a slot
//! - **No polling**: waiters park on the lane's Condvar; cancel tokens wake them

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, warn};

use super::AdmissionGate;
use crate::core::{CancelToken, SchedulerError, TaskInfo};
use crate::util::SchedulerId;

#[derive(Debug, Default)]
struct LaneState {
    in_flight: u32,
    queue: VecDeque<u64>,
    next_ticket: u64,
    closed: bool,
}

impl LaneState {
    fn leave(&mut self, ticket: u64) {
        self.queue.retain(|t| *t != ticket);
    }
}

#[derive(Debug, Default)]
struct Lane {
    state: Mutex<LaneState>,
    cond: Condvar,
}

impl Lane {
    fn wake_all(&self) {
        // Taking the lock orders the notification after any waiter's check.
        let _state = self.state.lock();
        self.cond.notify_all();
    }
}

/// Admission gate scoping its limit and count to each scheduler identity.
///
/// Waiters of one identity are admitted in arrival order, so no waiter starves
/// while slots keep freeing up.
#[derive(Debug, Default)]
pub struct PerSchedulerGate {
    lanes: RwLock<HashMap<SchedulerId, Arc<Lane>>>,
}

impl PerSchedulerGate {
    /// Create a gate with no registered schedulers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of identities with live accounting state.
    #[must_use]
    pub fn lane_count(&self) -> usize {
        self.lanes.read().len()
    }

    fn lane(&self, owner: &SchedulerId) -> Option<Arc<Lane>> {
        self.lanes.read().get(owner).cloned()
    }

    fn drop_lane(&self, owner: &SchedulerId) {
        self.lanes.write().remove(owner);
        debug!(scheduler = %owner, "admission lane removed");
    }
}

impl AdmissionGate for PerSchedulerGate {
    fn register(&self, owner: &SchedulerId) {
        self.lanes
            .write()
            .entry(owner.clone())
            .or_insert_with(|| Arc::new(Lane::default()));
        debug!(scheduler = %owner, "admission lane registered");
    }

    fn unregister(&self, owner: &SchedulerId) {
        let Some(lane) = self.lane(owner) else {
            return;
        };
        let idle = {
            let mut state = lane.state.lock();
            state.closed = true;
            lane.cond.notify_all();
            state.in_flight == 0
        };
        if idle {
            self.drop_lane(owner);
        }
    }

    fn acquire(
        &self,
        limit: u32,
        task: &TaskInfo,
        owner: &SchedulerId,
        cancel: &CancelToken,
    ) -> Result<(), SchedulerError> {
        if limit == 0 {
            return Err(SchedulerError::InvalidConfig(
                "admission limit must be greater than 0".into(),
            ));
        }
        let Some(lane) = self.lane(owner) else {
            return Err(SchedulerError::Shutdown);
        };
        if cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }

        let waker_lane = Arc::clone(&lane);
        let waker = cancel.on_cancel(move || waker_lane.wake_all());

        let result = {
            let mut state = lane.state.lock();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.queue.push_back(ticket);

            let outcome = loop {
                if state.closed {
                    state.leave(ticket);
                    break Err(SchedulerError::Shutdown);
                }
                if cancel.is_cancelled() {
                    state.leave(ticket);
                    break Err(SchedulerError::Cancelled);
                }
                if state.queue.front() == Some(&ticket) && state.in_flight < limit {
                    state.queue.pop_front();
                    state.in_flight += 1;
                    break Ok(());
                }
                lane.cond.wait(&mut state);
            };

            // The queue head may have changed, or more than one slot may be free.
            if !state.queue.is_empty() {
                lane.cond.notify_all();
            }
            outcome
        };

        if let Some(id) = waker {
            cancel.remove(id);
        }

        match &result {
            Ok(()) => debug!(scheduler = %owner, task_id = task.id(), limit, "slot acquired"),
            Err(e) => warn!(scheduler = %owner, task_id = task.id(), error = %e, "admission wait aborted"),
        }
        result
    }

    fn release(&self, owner: &SchedulerId) {
        let Some(lane) = self.lane(owner) else {
            error!(scheduler = %owner, "release without a matching acquire (unknown scheduler); ignoring");
            return;
        };
        let drained = {
            let mut state = lane.state.lock();
            if state.in_flight == 0 {
                error!(scheduler = %owner, "release without a matching acquire; ignoring");
                return;
            }
            state.in_flight -= 1;
            lane.cond.notify_all();
            state.closed && state.in_flight == 0
        };
        debug!(scheduler = %owner, "slot released");
        if drained {
            self.drop_lane(owner);
        }
    }

    fn in_flight(&self, owner: &SchedulerId) -> u32 {
        self.lane(owner).map_or(0, |lane| lane.state.lock().in_flight)
    }

    fn waiting(&self, owner: &SchedulerId) -> usize {
        self.lane(owner).map_or(0, |lane| lane.state.lock().queue.len())
    }
}
