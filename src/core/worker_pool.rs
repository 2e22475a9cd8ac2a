//! Shared pool of dedicated OS threads executing scheduler jobs.
//!
//! Immediate tasks of every scheduler created from one service run here, and
//! the timer service uses a second instance for its dispatch threads.
//!
//! # Design Principles
//!
//! - **No polling**: workers block on channel recv
//! - **Panic isolation**: a panicking job is caught; the worker keeps serving
//! - **Clean shutdown**: dropping the sender unblocks workers naturally

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::core::task::panic_message;
use crate::core::SchedulerError;

/// Unit of work executed by a pool thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Jobs currently executing.
    pub active_jobs: u64,
    /// Jobs waiting in the queue.
    pub queued_jobs: u64,
    /// Total jobs accepted.
    pub submitted_jobs: u64,
    /// Total jobs that returned normally.
    pub completed_jobs: u64,
    /// Total jobs that panicked.
    pub panicked_jobs: u64,
}

/// Internal counters for pool statistics (thread-safe).
#[derive(Debug, Default)]
struct PoolCounters {
    active_jobs: AtomicU64,
    queued_jobs: AtomicU64,
    submitted_jobs: AtomicU64,
    completed_jobs: AtomicU64,
    panicked_jobs: AtomicU64,
}

impl PoolCounters {
    fn snapshot(&self, worker_count: usize) -> PoolStats {
        PoolStats {
            worker_count,
            active_jobs: self.active_jobs.load(Ordering::Relaxed),
            queued_jobs: self.queued_jobs.load(Ordering::Relaxed),
            submitted_jobs: self.submitted_jobs.load(Ordering::Relaxed),
            completed_jobs: self.completed_jobs.load(Ordering::Relaxed),
            panicked_jobs: self.panicked_jobs.load(Ordering::Relaxed),
        }
    }
}

/// Fixed-size thread pool fed through a crossbeam channel.
pub struct WorkerPool {
    /// Thread name prefix.
    name: String,
    /// Job sender. `None` once shut down.
    job_tx: Mutex<Option<Sender<Job>>>,
    counters: Arc<PoolCounters>,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl WorkerPool {
    /// Spawn `worker_count` threads named `{name}-{index}`.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::InvalidConfig` if `worker_count` is zero
    /// - `SchedulerError::Internal` if a thread cannot be spawned
    pub fn new(name: &str, worker_count: usize, stack_size: usize) -> Result<Self, SchedulerError> {
        if worker_count == 0 {
            return Err(SchedulerError::InvalidConfig(format!(
                "pool `{name}` needs at least one thread"
            )));
        }

        let (job_tx, job_rx) = unbounded::<Job>();
        let counters = Arc::new(PoolCounters::default());

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let worker = spawn_worker(
                name,
                worker_id,
                job_rx.clone(),
                Arc::clone(&counters),
                stack_size,
            )?;
            workers.push(worker);
        }

        info!(pool = name, worker_count, "worker pool initialized");

        Ok(Self {
            name: name.to_string(),
            job_tx: Mutex::new(Some(job_tx)),
            counters,
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(workers),
            worker_count,
        })
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a job. Never blocks.
    ///
    /// # Errors
    ///
    /// `SchedulerError::Shutdown` if the pool has been shut down.
    pub fn execute(&self, job: Job) -> Result<(), SchedulerError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(SchedulerError::Shutdown);
        }
        let job_tx = self.job_tx.lock();
        let Some(job_tx) = job_tx.as_ref() else {
            return Err(SchedulerError::Shutdown);
        };
        // Count before sending so a fast worker never decrements below zero.
        self.counters.queued_jobs.fetch_add(1, Ordering::Relaxed);
        if job_tx.send(job).is_err() {
            self.counters.queued_jobs.fetch_sub(1, Ordering::Relaxed);
            return Err(SchedulerError::Shutdown);
        }
        self.counters.submitted_jobs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.worker_count)
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting jobs, let queued jobs drain, and join the workers.
    ///
    /// Workers that don't exit within `join_timeout` are detached.
    pub fn shutdown(&self, join_timeout: Duration) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(pool = %self.name, "shutting down worker pool");

        // Drop the sender; workers exit once the queue is empty.
        self.job_tx.lock().take();

        let mut workers = self.workers.lock();
        for (idx, worker) in workers.drain(..).enumerate() {
            let (tx, rx) = crossbeam_channel::bounded(1);
            let joiner = thread::spawn(move || {
                let _ = tx.send(worker.join().is_ok());
            });
            match rx.recv_timeout(join_timeout) {
                Ok(true) => debug!(pool = %self.name, worker_id = idx, "worker joined"),
                Ok(false) => warn!(pool = %self.name, worker_id = idx, "worker panicked"),
                Err(_) => {
                    warn!(pool = %self.name, worker_id = idx, "worker did not exit within timeout - detaching");
                    continue;
                }
            }
            let _ = joiner.join();
        }
        info!(pool = %self.name, "worker pool shut down complete");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Signal shutdown but don't join; explicit shutdown() joins.
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.job_tx.lock().take();
            debug!(pool = %self.name, "worker pool dropped without explicit shutdown - workers detached");
        }
    }
}

fn spawn_worker(
    pool: &str,
    worker_id: usize,
    job_rx: Receiver<Job>,
    counters: Arc<PoolCounters>,
    stack_size: usize,
) -> Result<JoinHandle<()>, SchedulerError> {
    let pool_name = pool.to_string();
    thread::Builder::new()
        .name(format!("{pool}-{worker_id}"))
        .stack_size(stack_size)
        .spawn(move || {
            debug!(pool = %pool_name, worker_id, "worker thread started");
            // Blocking recv; returns Err once the sender is dropped and the queue drained.
            while let Ok(job) = job_rx.recv() {
                counters.queued_jobs.fetch_sub(1, Ordering::Relaxed);
                counters.active_jobs.fetch_add(1, Ordering::Relaxed);

                match catch_unwind(AssertUnwindSafe(job)) {
                    Ok(()) => {
                        counters.completed_jobs.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(payload) => {
                        counters.panicked_jobs.fetch_add(1, Ordering::Relaxed);
                        error!(
                            pool = %pool_name,
                            worker_id,
                            panic = %panic_message(payload.as_ref()),
                            "job panicked"
                        );
                    }
                }

                counters.active_jobs.fetch_sub(1, Ordering::Relaxed);
            }
            debug!(pool = %pool_name, worker_id, "worker thread exiting");
        })
        .map_err(|e| SchedulerError::Internal(format!("failed to spawn worker thread: {e}")))
}
