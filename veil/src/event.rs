//! User-waitable event objects
//!
//! A `UserEvent` is what a client waits on. Channels set it from the
//! deferred workers; watches set it from the store. It is a
//! synchronization event: a successful wait consumes the signal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct UserEvent {
    signalled: Mutex<bool>,
    cond: Condvar,
    sets: AtomicU64,
}

impl UserEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event and wake one waiter
    pub fn set(&self) {
        self.sets.fetch_add(1, Ordering::AcqRel);
        let mut signalled = self.signalled.lock().unwrap_or_else(|e| e.into_inner());
        *signalled = true;
        self.cond.notify_one();
    }

    pub fn reset(&self) {
        let mut signalled = self.signalled.lock().unwrap_or_else(|e| e.into_inner());
        *signalled = false;
    }

    pub fn is_set(&self) -> bool {
        *self.signalled.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of times the event has been set since creation
    pub fn set_count(&self) -> u64 {
        self.sets.load(Ordering::Acquire)
    }

    /// Wait up to `timeout` for the event; consumes the signal on success
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.signalled.lock().unwrap_or_else(|e| e.into_inner());
        let (mut guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |signalled| !*signalled)
            .unwrap_or_else(|e| e.into_inner());

        let was_set = *guard;
        *guard = false;
        was_set
    }
}
