//! Cooperative cancellation for blocked callers and pending tasks.
//!
//! A [`CancelToken`] stands in for thread interruption: whoever blocks on behalf
//! of a task (the submitter waiting for admission, or a timer dispatch thread)
//! registers a wake-up callback on the token, so cancelling wakes it without
//! any polling.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type Callback = Box<dyn FnOnce() + Send>;

/// Identifier of a callback registered with [`CancelToken::on_cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

#[derive(Default)]
struct Callbacks {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

struct Inner {
    cancelled: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

/// Shared, clonable cancellation flag with wake-up callbacks.
///
/// Cancelling is idempotent; only the first call runs the registered callbacks.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Create a token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                callbacks: Mutex::new(Callbacks::default()),
            }),
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Cancel the token and run every registered callback on this thread.
    ///
    /// Returns `true` if this call performed the cancellation.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Callbacks run outside the lock so they may touch the token again.
        let callbacks = std::mem::take(&mut self.inner.callbacks.lock().entries);
        for (_, callback) in callbacks {
            callback();
        }
        true
    }

    /// Register `callback` to run when the token is cancelled.
    ///
    /// If the token is already cancelled the callback runs immediately and
    /// `None` is returned.
    pub fn on_cancel<F>(&self, callback: F) -> Option<CallbackId>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut callbacks = self.inner.callbacks.lock();
        if self.is_cancelled() {
            drop(callbacks);
            callback();
            return None;
        }
        let id = callbacks.next_id;
        callbacks.next_id += 1;
        callbacks.entries.push((id, Box::new(callback)));
        Some(CallbackId(id))
    }

    /// Drop a previously registered callback. No-op once the token fired.
    pub fn remove(&self, id: CallbackId) {
        self.inner
            .callbacks
            .lock()
            .entries
            .retain(|(entry, _)| *entry != id.0);
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
