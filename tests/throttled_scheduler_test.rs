//! Integration tests for ThrottledScheduler
//!
//! These tests validate admission behaviour end to end:
//! - Immediate tasks wait for a slot before registration
//! - Deferred tasks take a slot per execution on the scheduler's dispatch threads
//! - Slots come back on completion, failure, and cancellation
//! - Periodic and cron tasks
//! - Shutdown and graceful stop

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use rand::Rng;
use throttled_scheduler::config::{ServiceConfig, ThrottleConfig};
use throttled_scheduler::core::{
    CancelToken, CronExpression, SchedulerError, TaskHandle, TaskStatus,
};
use throttled_scheduler::scheduler::{SchedulerService, ThrottledScheduler};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

const WAIT: Duration = Duration::from_secs(5);

fn service(worker_threads: usize, timer_threads: usize) -> SchedulerService {
    SchedulerService::new(
        ServiceConfig::default()
            .with_worker_threads(worker_threads)
            .with_timer_threads(timer_threads)
            .with_thread_stack_size(256 * 1024)
            .with_shutdown_timeout(Duration::from_secs(2)),
    )
    .unwrap()
}

fn throttled(service: &SchedulerService, name: &str, limit: u32) -> ThrottledScheduler {
    service
        .create_throttled_scheduler(&ThrottleConfig::new(name, limit))
        .unwrap()
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Tracks how many bodies run at once and the highest value seen.
#[derive(Default)]
struct ConcurrencyTracker {
    current: AtomicU32,
    peak: AtomicU32,
}

impl ConcurrencyTracker {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Fires every `interval` until `remaining` occurrences have been handed out.
#[derive(Debug)]
struct CountdownCron {
    interval: Duration,
    remaining: AtomicUsize,
}

impl CronExpression for CountdownCron {
    fn next_after(&self, after: SystemTime) -> Option<SystemTime> {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| after + self.interval)
    }
}

// ============================================================================
// IMMEDIATE TASKS
// ============================================================================

#[test]
fn test_limit_one_second_task_waits_for_first() {
    let service = service(4, 2);
    let scheduler = throttled(&service, "serial", 1);
    let events = Arc::new(Mutex::new(Vec::new()));

    let a_events = Arc::clone(&events);
    let a = scheduler
        .submit(move || {
            a_events.lock().push("a-start");
            thread::sleep(Duration::from_millis(100));
            a_events.lock().push("a-end");
        })
        .unwrap();
    assert_eq!(scheduler.in_flight(), 1);

    let submitter = scheduler.clone();
    let b_events = Arc::clone(&events);
    let started = Instant::now();
    let b_thread = thread::spawn(move || {
        let handle = submitter
            .submit(move || b_events.lock().push("b-start"))
            .unwrap();
        (started.elapsed(), handle)
    });

    let (blocked_for, b) = b_thread.join().unwrap();
    a.wait().unwrap();
    b.wait().unwrap();

    assert!(blocked_for >= Duration::from_millis(50), "B was admitted after {blocked_for:?}");
    assert_eq!(*events.lock(), vec!["a-start", "a-end", "b-start"]);
    assert_eq!(scheduler.in_flight(), 0);
    service.shutdown().unwrap();
}

#[test]
fn test_immediate_concurrency_never_exceeds_limit() {
    let service = service(8, 2);
    let scheduler = throttled(&service, "bounded", 3);
    let tracker = Arc::new(ConcurrencyTracker::default());

    // Sample the registered count and the held slots while work flows.
    let done = Arc::new(AtomicBool::new(false));
    let sampler = {
        let scheduler = scheduler.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut peak = (0, 0);
            while !done.load(Ordering::SeqCst) {
                peak.0 = peak.0.max(scheduler.active_tasks());
                peak.1 = peak.1.max(scheduler.in_flight());
                thread::yield_now();
            }
            peak
        })
    };

    let submitters: Vec<_> = (0..4)
        .map(|_| {
            let scheduler = scheduler.clone();
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                let mut rng = rand::rng();
                let mut handles = Vec::new();
                for _ in 0..10 {
                    let tracker = Arc::clone(&tracker);
                    let sleep_ms = rng.random_range(1..15);
                    handles.push(
                        scheduler
                            .submit(move || {
                                tracker.enter();
                                thread::sleep(Duration::from_millis(sleep_ms));
                                tracker.exit();
                            })
                            .unwrap(),
                    );
                }
                handles
            })
        })
        .collect();

    for submitter in submitters {
        for handle in submitter.join().unwrap() {
            handle.wait().unwrap();
        }
    }

    done.store(true, Ordering::SeqCst);
    let (peak_registered, peak_in_flight) = sampler.join().unwrap();

    assert!(tracker.peak() <= 3, "peak concurrency was {}", tracker.peak());
    assert!(tracker.peak() >= 1);
    assert!(peak_registered <= 3, "peak registered was {peak_registered}");
    assert!(peak_in_flight <= 3, "peak in flight was {peak_in_flight}");
    assert_eq!(scheduler.in_flight(), 0);
    assert_eq!(scheduler.waiting(), 0);
    assert!(wait_until(|| scheduler.active_tasks() == 0));
    service.shutdown().unwrap();
}

#[test]
fn test_cancel_blocked_submitter_takes_no_slot() {
    let service = service(4, 2);
    let scheduler = throttled(&service, "cancel-wait", 1);

    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
    let holder = scheduler
        .submit(move || {
            let _ = release_rx.recv();
        })
        .unwrap();

    let cancel = CancelToken::new();
    let submitter = scheduler.clone();
    let token = cancel.clone();
    let ran = Arc::new(AtomicBool::new(false));
    let ran_flag = Arc::clone(&ran);
    let blocked = thread::spawn(move || {
        submitter.submit_with_cancel(move || ran_flag.store(true, Ordering::SeqCst), token)
    });

    assert!(wait_until(|| scheduler.waiting() == 1));
    cancel.cancel();

    let result = blocked.join().unwrap();
    assert_eq!(result.unwrap_err(), SchedulerError::Cancelled);
    assert_eq!(scheduler.in_flight(), 1);
    assert_eq!(scheduler.waiting(), 0);

    release_tx.send(()).unwrap();
    holder.wait().unwrap();
    assert_eq!(scheduler.in_flight(), 0);
    assert!(!ran.load(Ordering::SeqCst));
    service.shutdown().unwrap();
}

#[test]
fn test_failing_immediate_task_releases_slot() {
    let service = service(2, 1);
    let scheduler = throttled(&service, "panics", 1);

    let failed = scheduler.submit(|| -> u32 { panic!("immediate boom") }).unwrap();
    assert_eq!(
        failed.wait(),
        Err(SchedulerError::TaskFailed("immediate boom".to_string()))
    );
    assert_eq!(scheduler.in_flight(), 0);

    let next = scheduler.submit(|| 7).unwrap();
    assert_eq!(next.wait_timeout(WAIT), Ok(7));
    service.shutdown().unwrap();
}

#[test]
fn test_schedulers_are_throttled_independently() {
    let service = service(4, 2);
    let first = throttled(&service, "first", 1);
    let second = throttled(&service, "second", 1);

    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
    let holder = first
        .submit(move || {
            let _ = release_rx.recv();
        })
        .unwrap();

    // The other scheduler's lane is untouched by the held slot.
    let other = second.submit(|| "free").unwrap();
    assert_eq!(other.wait_timeout(WAIT), Ok("free"));
    assert_eq!(first.in_flight(), 1);
    assert_eq!(second.in_flight(), 0);

    release_tx.send(()).unwrap();
    holder.wait().unwrap();
    service.shutdown().unwrap();
}

// ============================================================================
// DEFERRED TASKS
// ============================================================================

#[test]
fn test_saturated_scheduler_does_not_stall_other_deferred_work() {
    let service = service(4, 2);
    let saturated = throttled(&service, "saturated", 1);
    let other = throttled(&service, "other", 4);

    // The holder waits on the other scheduler's deferred task before it
    // gives its slot back.
    let (handle_tx, handle_rx) = crossbeam_channel::bounded(1);
    let holder = saturated
        .submit(move || {
            let handle: TaskHandle<&str> = handle_rx.recv().unwrap();
            handle.wait_timeout(WAIT)
        })
        .unwrap();

    let queued: Vec<_> = (0..2_u32)
        .map(|i| saturated.schedule(move || i, Duration::ZERO).unwrap())
        .collect();
    // One dispatch thread per slot: a single fire waits on the gate.
    assert!(wait_until(|| saturated.waiting() == 1));

    let started = Instant::now();
    let deferred = other.schedule(|| "other ran", Duration::from_millis(10)).unwrap();
    handle_tx.send(deferred).unwrap();

    assert_eq!(holder.wait_timeout(WAIT), Ok(Ok("other ran")));
    assert!(started.elapsed() < WAIT);
    assert_eq!(other.in_flight(), 0);

    let mut results: Vec<u32> = queued
        .into_iter()
        .map(|h| h.wait_timeout(WAIT).unwrap())
        .collect();
    results.sort_unstable();
    assert_eq!(results, vec![0, 1]);
    assert_eq!(saturated.in_flight(), 0);
    service.shutdown().unwrap();
}

#[test]
fn test_deferred_tasks_fire_together_limit_two() {
    let service = service(2, 5);
    let scheduler = throttled(&service, "deferred", 2);
    let tracker = Arc::new(ConcurrencyTracker::default());

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let tracker = Arc::clone(&tracker);
            scheduler
                .schedule(
                    move || {
                        tracker.enter();
                        thread::sleep(Duration::from_millis(50));
                        tracker.exit();
                        i
                    },
                    Duration::from_millis(30),
                )
                .unwrap()
        })
        .collect();

    // Deferred registration is not gated.
    assert_eq!(scheduler.in_flight(), 0);

    let mut results: Vec<u32> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
    results.sort_unstable();
    assert_eq!(results, vec![0, 1, 2, 3, 4]);
    assert!(tracker.peak() <= 2, "peak concurrency was {}", tracker.peak());
    assert_eq!(scheduler.in_flight(), 0);
    assert!(wait_until(|| scheduler.active_tasks() == 0));
    service.shutdown().unwrap();
}

#[test]
fn test_deferred_panic_releases_slot_and_reports_failure() {
    let service = service(2, 2);
    let scheduler = throttled(&service, "deferred-panic", 1);

    let failed = scheduler
        .schedule(|| -> u32 { panic!("deferred boom") }, Duration::from_millis(10))
        .unwrap();
    assert_eq!(
        failed.wait(),
        Err(SchedulerError::TaskFailed("deferred boom".to_string()))
    );
    assert_eq!(scheduler.in_flight(), 0);

    // The freed slot admits the next task right away.
    let next = scheduler.submit(|| 1).unwrap();
    assert_eq!(next.wait_timeout(WAIT), Ok(1));
    service.shutdown().unwrap();
}

#[test]
fn test_deferred_waits_behind_immediate() {
    let service = service(2, 2);
    let scheduler = throttled(&service, "mixed", 1);
    let events = Arc::new(Mutex::new(Vec::new()));

    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
    let held_events = Arc::clone(&events);
    let holder = scheduler
        .submit(move || {
            let _ = release_rx.recv();
            held_events.lock().push("immediate");
        })
        .unwrap();

    let deferred_events = Arc::clone(&events);
    let deferred = scheduler
        .schedule(
            move || deferred_events.lock().push("deferred"),
            Duration::from_millis(5),
        )
        .unwrap();

    assert!(wait_until(|| scheduler.waiting() == 1));
    assert_eq!(deferred.status(), TaskStatus::Pending);

    release_tx.send(()).unwrap();
    holder.wait().unwrap();
    deferred.wait().unwrap();
    assert_eq!(*events.lock(), vec!["immediate", "deferred"]);
    assert_eq!(scheduler.in_flight(), 0);
    service.shutdown().unwrap();
}

#[test]
fn test_cancel_deferred_while_waiting_for_slot() {
    let service = service(2, 2);
    let scheduler = throttled(&service, "deferred-cancel", 1);

    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
    let holder = scheduler
        .submit(move || {
            let _ = release_rx.recv();
        })
        .unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let ran_flag = Arc::clone(&ran);
    let deferred = scheduler
        .schedule(move || ran_flag.store(true, Ordering::SeqCst), Duration::ZERO)
        .unwrap();

    assert!(wait_until(|| scheduler.waiting() == 1));
    assert!(deferred.cancel());
    assert_eq!(deferred.wait_timeout(WAIT), Err(SchedulerError::Cancelled));
    assert!(wait_until(|| scheduler.waiting() == 0));
    assert_eq!(scheduler.in_flight(), 1);

    release_tx.send(()).unwrap();
    holder.wait().unwrap();
    assert_eq!(scheduler.in_flight(), 0);
    assert!(wait_until(|| scheduler.active_tasks() == 0));
    assert!(!ran.load(Ordering::SeqCst));
    service.shutdown().unwrap();
}

#[test]
fn test_cancel_pending_deferred_before_fire() {
    let service = service(1, 1);
    let scheduler = throttled(&service, "pending", 1);

    let handle = scheduler.schedule(|| 5, Duration::from_secs(30)).unwrap();
    assert_eq!(scheduler.active_tasks(), 1);
    assert!(handle.cancel());
    assert_eq!(handle.status(), TaskStatus::Cancelled);
    assert_eq!(scheduler.active_tasks(), 0);
    assert_eq!(scheduler.in_flight(), 0);
    service.shutdown().unwrap();
}

// ============================================================================
// PERIODIC AND CRON TASKS
// ============================================================================

#[test]
fn test_fixed_rate_takes_slot_per_run() {
    let service = service(2, 2);
    let scheduler = throttled(&service, "fixed-rate", 1);
    let runs = Arc::new(AtomicU32::new(0));
    let slot_held = Arc::new(AtomicBool::new(true));

    let observer = scheduler.clone();
    let counter = Arc::clone(&runs);
    let held = Arc::clone(&slot_held);
    let handle = scheduler
        .schedule_at_fixed_rate(
            move || {
                if observer.in_flight() != 1 {
                    held.store(false, Ordering::SeqCst);
                }
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(5),
            Duration::from_millis(10),
        )
        .unwrap();

    assert!(wait_until(|| runs.load(Ordering::SeqCst) >= 3));
    assert!(handle.cancel());
    assert_eq!(handle.status(), TaskStatus::Cancelled);
    assert!(wait_until(|| scheduler.active_tasks() == 0));
    assert!(wait_until(|| scheduler.in_flight() == 0));
    assert!(slot_held.load(Ordering::SeqCst));

    let settled = runs.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));
    assert!(runs.load(Ordering::SeqCst) <= settled + 1);
    service.shutdown().unwrap();
}

#[test]
fn test_fixed_delay_failure_stops_task() {
    let service = service(2, 2);
    let scheduler = throttled(&service, "fixed-delay", 1);
    let runs = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&runs);
    let handle = scheduler
        .schedule_with_fixed_delay(
            move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                    panic!("second run fails");
                }
            },
            Duration::ZERO,
            Duration::from_millis(5),
        )
        .unwrap();

    assert_eq!(
        handle.wait_timeout(WAIT),
        Err(SchedulerError::TaskFailed("second run fails".to_string()))
    );
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(wait_until(|| scheduler.active_tasks() == 0));
    assert_eq!(scheduler.in_flight(), 0);
    service.shutdown().unwrap();
}

#[test]
fn test_cron_runs_until_exhausted() {
    let service = service(2, 2);
    let scheduler = throttled(&service, "cron", 1);
    let runs = Arc::new(AtomicU32::new(0));

    let cron = Arc::new(CountdownCron {
        interval: Duration::from_millis(10),
        remaining: AtomicUsize::new(3),
    });
    let counter = Arc::clone(&runs);
    let handle = scheduler
        .schedule_with_cron(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            cron,
        )
        .unwrap();

    assert_eq!(handle.wait_timeout(WAIT), Ok(()));
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(scheduler.in_flight(), 0);
    assert!(wait_until(|| scheduler.active_tasks() == 0));
    service.shutdown().unwrap();
}

#[test]
fn test_cron_without_occurrence_rejected() {
    let service = service(1, 1);
    let scheduler = throttled(&service, "cron-empty", 1);
    let cron = Arc::new(CountdownCron {
        interval: Duration::from_millis(10),
        remaining: AtomicUsize::new(0),
    });

    let result = scheduler.schedule_with_cron(|| {}, cron);
    assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));
    assert_eq!(scheduler.active_tasks(), 0);
    service.shutdown().unwrap();
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[test]
fn test_shutdown_wakes_blocked_submitter() {
    let service = service(4, 2);
    let scheduler = throttled(&service, "shutdown", 1);

    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
    let holder = scheduler
        .submit(move || {
            let _ = release_rx.recv();
            "held"
        })
        .unwrap();

    let submitter = scheduler.clone();
    let blocked = thread::spawn(move || submitter.submit(|| "never"));
    assert!(wait_until(|| scheduler.waiting() == 1));

    scheduler.shutdown();
    assert_eq!(blocked.join().unwrap().unwrap_err(), SchedulerError::Shutdown);
    assert_eq!(scheduler.submit(|| 1).unwrap_err(), SchedulerError::Shutdown);

    // Work already admitted still finishes.
    release_tx.send(()).unwrap();
    assert_eq!(holder.wait(), Ok("held"));
    assert!(scheduler.await_termination(WAIT));
    assert!(scheduler.is_terminated());
    assert_eq!(scheduler.in_flight(), 0);
    service.shutdown().unwrap();
}

#[test]
fn test_shutdown_cancels_deferred_and_runs_callback() {
    let service = service(1, 1);
    let scheduler = throttled(&service, "callback", 2);
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    scheduler.set_shutdown_callback(move |id| {
        assert_eq!(id.name(), "callback");
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let deferred = scheduler.schedule(|| 1, Duration::from_secs(30)).unwrap();
    scheduler.shutdown();
    scheduler.shutdown();

    assert_eq!(deferred.wait_timeout(WAIT), Err(SchedulerError::Cancelled));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(scheduler.await_termination(WAIT));
    assert_eq!(
        scheduler.schedule(|| 2, Duration::ZERO).unwrap_err(),
        SchedulerError::Shutdown
    );
    service.shutdown().unwrap();
}

#[test]
fn test_stop_times_out_on_stuck_task() {
    let service = SchedulerService::new(
        ServiceConfig::default()
            .with_worker_threads(2)
            .with_timer_threads(1)
            .with_shutdown_timeout(Duration::from_millis(30)),
    )
    .unwrap();
    let scheduler = throttled(&service, "stuck", 1);

    let handle = scheduler
        .submit(|| thread::sleep(Duration::from_millis(300)))
        .unwrap();
    assert!(wait_until(|| handle.status() == TaskStatus::Running));

    assert_eq!(scheduler.stop(), Err(SchedulerError::Timeout));
    handle.wait().unwrap();
    assert!(scheduler.await_termination(WAIT));
    assert_eq!(scheduler.in_flight(), 0);
}

#[test]
fn test_shutdown_now_cancels_queued_tasks() {
    let service = service(1, 1);
    let scheduler = service.create_scheduler("plain").unwrap();

    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
    let running = scheduler
        .submit(move || {
            let _ = release_rx.recv();
        })
        .unwrap();
    assert!(wait_until(|| running.status() == TaskStatus::Running));
    let queued = scheduler.submit(|| 1).unwrap();

    assert_eq!(scheduler.shutdown_now(), 2);
    assert_eq!(queued.status(), TaskStatus::Cancelled);

    release_tx.send(()).unwrap();
    running.wait().unwrap();
    assert!(scheduler.await_termination(WAIT));
    service.shutdown().unwrap();
}

#[test]
fn test_display_reports_throttling() {
    let service = service(1, 1);
    let scheduler = throttled(&service, "shown", 2);

    let text = scheduler.to_string();
    assert!(text.starts_with("ThrottledScheduler[shown@"), "{text}");
    assert!(text.contains("max_concurrent_tasks=2"), "{text}");
    assert!(text.contains("in_flight=0"), "{text}");
    service.shutdown().unwrap();
}

#[test]
fn test_zero_limit_rejected() {
    let service = service(1, 1);
    let result = service.create_throttled_scheduler(&ThrottleConfig::new("zero", 0));
    assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));
    service.shutdown().unwrap();
}

#[tokio::test]
async fn test_wait_async() {
    let service = service(2, 1);
    let scheduler = throttled(&service, "async", 1);

    let handle = scheduler.schedule(|| 40 + 2, Duration::from_millis(5)).unwrap();
    assert_eq!(handle.wait_async().await, Ok(42));
    assert_eq!(scheduler.in_flight(), 0);
    service.shutdown().unwrap();
}
