//! Timer service: fires deferred jobs at their due time.
//!
//! One ordering thread keeps a min-heap of due times and hands each due job to
//! a dispatch pool: the shared one, or the dedicated pool the job was
//! scheduled on with [`TimerService::schedule_on`]. Throttled schedulers
//! dispatch on their own pool, so a fire waiting for admission only ever
//! occupies a thread of the scheduler it belongs to.
//!
//! Capacity planning: a throttled scheduler's deferred throughput is bounded
//! by `min(dispatch threads, admission limit)`; with more simultaneously due
//! tasks than that, its later fires start late.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::core::worker_pool::{Job, PoolStats, WorkerPool};
use crate::core::SchedulerError;
use crate::util::TaskId;

struct TimerEntry {
    due: Instant,
    seq: u64,
    task: TaskId,
    job: Job,
    target: Option<Arc<WorkerPool>>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

enum TimerCommand {
    Schedule(TimerEntry),
    Cancel(TaskId),
}

/// Delay/periodic/cron dispatcher shared by the schedulers of one service.
pub struct TimerService {
    control_tx: Mutex<Option<Sender<TimerCommand>>>,
    dispatch: Arc<WorkerPool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    next_seq: AtomicU64,
    dispatch_threads: usize,
    stack_size: usize,
}

impl TimerService {
    /// Start the ordering thread and `dispatch_threads` dispatch threads.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::InvalidConfig` if `dispatch_threads` is zero
    /// - `SchedulerError::Internal` if a thread cannot be spawned
    pub fn new(dispatch_threads: usize, stack_size: usize) -> Result<Self, SchedulerError> {
        let dispatch = Arc::new(WorkerPool::new("timer-dispatch", dispatch_threads, stack_size)?);
        let (control_tx, control_rx) = unbounded();

        let timer_dispatch = Arc::clone(&dispatch);
        let thread = thread::Builder::new()
            .name("timer".into())
            .spawn(move || run_timer(&control_rx, &timer_dispatch))
            .map_err(|e| SchedulerError::Internal(format!("failed to spawn timer thread: {e}")))?;

        info!(dispatch_threads, "timer service started");
        Ok(Self {
            control_tx: Mutex::new(Some(control_tx)),
            dispatch,
            thread: Mutex::new(Some(thread)),
            next_seq: AtomicU64::new(0),
            dispatch_threads,
            stack_size,
        })
    }

    /// Run `job` on a dispatch thread at `due` (or as soon as possible if
    /// `due` is in the past).
    ///
    /// # Errors
    ///
    /// `SchedulerError::Shutdown` if the service has been shut down.
    pub fn schedule(&self, task: TaskId, due: Instant, job: Job) -> Result<(), SchedulerError> {
        self.push(task, due, job, None)
    }

    /// Like [`schedule`](Self::schedule), but run `job` on `target` instead
    /// of the shared dispatch pool.
    ///
    /// # Errors
    ///
    /// `SchedulerError::Shutdown` if the service has been shut down.
    pub fn schedule_on(
        &self,
        task: TaskId,
        due: Instant,
        job: Job,
        target: Arc<WorkerPool>,
    ) -> Result<(), SchedulerError> {
        self.push(task, due, job, Some(target))
    }

    /// Spawn a dispatch pool for one scheduler, sized like the shared pool
    /// but never larger than `max_threads`.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::InvalidConfig` if `max_threads` is zero
    /// - `SchedulerError::Internal` if a thread cannot be spawned
    pub fn dedicated_dispatch(
        &self,
        name: &str,
        max_threads: usize,
    ) -> Result<WorkerPool, SchedulerError> {
        WorkerPool::new(name, self.dispatch_threads.min(max_threads), self.stack_size)
    }

    /// Drop every pending fire of `task`. A fire already handed to a dispatch
    /// thread is not recalled.
    pub fn cancel(&self, task: TaskId) {
        if self.send(TimerCommand::Cancel(task)).is_err() {
            debug!(task_id = task, "timer already stopped; nothing to cancel");
        }
    }

    /// Dispatch pool statistics.
    #[must_use]
    pub fn dispatch_stats(&self) -> PoolStats {
        self.dispatch.stats()
    }

    /// Stop the ordering thread, dropping pending fires, then drain the
    /// dispatch pool.
    pub fn shutdown(&self, join_timeout: Duration) {
        if self.control_tx.lock().take().is_none() {
            return;
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!("timer thread panicked");
            }
        }
        self.dispatch.shutdown(join_timeout);
        info!("timer service stopped");
    }

    fn push(
        &self,
        task: TaskId,
        due: Instant,
        job: Job,
        target: Option<Arc<WorkerPool>>,
    ) -> Result<(), SchedulerError> {
        let entry = TimerEntry {
            due,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            task,
            job,
            target,
        };
        self.send(TimerCommand::Schedule(entry))
    }

    fn send(&self, command: TimerCommand) -> Result<(), SchedulerError> {
        let control_tx = self.control_tx.lock();
        let Some(control_tx) = control_tx.as_ref() else {
            return Err(SchedulerError::Shutdown);
        };
        control_tx.send(command).map_err(|_| SchedulerError::Shutdown)
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        // Disconnecting the control channel stops the ordering thread.
        self.control_tx.lock().take();
    }
}

fn run_timer(control_rx: &Receiver<TimerCommand>, dispatch: &WorkerPool) {
    let mut heap: BinaryHeap<Reverse<TimerEntry>> = BinaryHeap::new();
    loop {
        let next_due = heap.peek().map(|Reverse(entry)| entry.due);
        let command = match next_due {
            Some(due) => {
                let now = Instant::now();
                if due <= now {
                    if let Some(Reverse(entry)) = heap.pop() {
                        debug!(task_id = entry.task, "timer fired");
                        let pool = entry.target.as_deref().unwrap_or(dispatch);
                        if pool.execute(entry.job).is_err() {
                            debug!(task_id = entry.task, "dispatch closed; dropping fire");
                        }
                    }
                    continue;
                }
                match control_rx.recv_timeout(due - now) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match control_rx.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            TimerCommand::Schedule(entry) => heap.push(Reverse(entry)),
            TimerCommand::Cancel(task) => heap.retain(|Reverse(entry)| entry.task != task),
        }
    }
    debug!(pending = heap.len(), "timer thread exiting");
}
