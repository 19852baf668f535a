//! Response queue for poll-based consumers.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::EntryId;
use crate::utils::sema::Semaphore;

/// Bounded queue of released entries awaiting their consumer.
///
/// Storage is allocated once; pushing never grows it.
#[derive(Debug)]
pub struct RespQueue {
    items: Mutex<VecDeque<EntryId>>,
    capacity: usize,
    ready: Semaphore,
}

impl RespQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            ready: Semaphore::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue an entry. Gives the entry back if the queue is full.
    pub fn push(&self, id: EntryId) -> Result<(), EntryId> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        if items.len() >= self.capacity {
            return Err(id);
        }
        items.push_back(id);
        drop(items);
        self.ready.post();
        Ok(())
    }

    /// Dequeue an entry, waiting at most `timeout`.
    pub fn pop(&self, timeout: Duration) -> Option<EntryId> {
        if !self.ready.wait_timeout(timeout) {
            return None;
        }
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}
