//! Counting semaphore.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// A counting semaphore.
///
/// Context-pool waiters block here while the pool lock is *not* held. Each
/// `post` wakes at most one waiter.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    /// Create a semaphore with the given initial count.
    pub const fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Increment the count and wake one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += 1;
        self.cond.notify_one();
    }

    /// Block until the count is positive, then decrement it.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count == 0 {
            count = self
                .cond
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *count -= 1;
    }

    /// Like [`Semaphore::wait`], but give up after `timeout`.
    /// Return `true` if the semaphore was acquired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut count, _) = self
            .cond
            .wait_timeout_while(count, timeout, |c| *c == 0)
            .unwrap_or_else(PoisonError::into_inner);
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_post_then_wait() {
        let sema = Semaphore::new(0);
        sema.post();
        sema.post();
        sema.wait();
        assert!(sema.wait_timeout(Duration::from_millis(1)));
        assert!(!sema.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_wakes_blocked_waiter() {
        let sema = Arc::new(Semaphore::new(0));
        let waiter = {
            let sema = sema.clone();
            thread::spawn(move || sema.wait())
        };
        thread::sleep(Duration::from_millis(20));
        sema.post();
        waiter.join().unwrap();
        assert!(!sema.wait_timeout(Duration::from_millis(1)));
    }
}
