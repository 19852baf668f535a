//! Binary event.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// A binary, auto-resetting event with a single intended waiter.
#[derive(Debug, Default)]
pub struct Event {
    posted: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub const fn new() -> Self {
        Self {
            posted: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Set the event. Posting an already-set event is a no-op.
    pub fn post(&self) {
        let mut posted = self.posted.lock().unwrap_or_else(PoisonError::into_inner);
        *posted = true;
        self.cond.notify_all();
    }

    /// Wait up to `timeout` for the event. Consumes the event on success.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let posted = self.posted.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut posted, _) = self
            .cond
            .wait_timeout_while(posted, timeout, |p| !*p)
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *posted, false)
    }

    /// Clear the event without waiting.
    pub fn reset(&self) {
        *self.posted.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}
