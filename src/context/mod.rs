//! Context pool: bounded, hashed, retry-capable request slots.
//!
//! A pool owns a fixed array of [`ContextEntry`] slots allocated once at
//! construction. An entry is either on the free list or allocated; an
//! allocated entry with an outbound request is additionally hashed by
//! `(destination lid, tid)` so that the response can be matched in O(1).
//!
//! Completion is delivered either to a [`Completion`] handler, which is
//! invoked with the pool lock held, or through a bounded [`RespQueue`] that a
//! poll-based consumer drains with [`ContextPool::poll_response`].
//!
//! # Locking
//!
//! [`ContextPool`] is the locked front end. The handler runs inside the
//! pool's critical section and receives the [`PoolCore`], whose methods are
//! the "already locked" API: a handler may get, reuse, send and retire
//! entries through it but must not block. Whether the handler kept the
//! released entry (by retiring, reusing or re-getting it) is detected after
//! it returns; an entry it did not touch is returned to the free list.
//!
//! No method of `PoolCore` allocates on the get/reuse/send/retire/release
//! paths, so pool exhaustion inside a handler is reported, not fatal.

mod entry;
mod list;
mod queue;
mod retry;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use quanta::{Clock, Instant};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::Serialize;
use thiserror::Error;

pub use self::entry::*;
pub use self::queue::RespQueue;
use self::list::{Lists, Membership};
use self::retry::Timeout;
use crate::mad::{mask_tid, Lid, Mad, MadKind};
use crate::transport::{SendError, Transport};
use crate::utils::sema::Semaphore;

/// Context pool error type.
#[derive(Debug, Error)]
pub enum ContextError {
    /// No free entry is available.
    #[error("no free context entry")]
    Exhausted,

    /// The bound response queue cannot hold every entry.
    #[error("response queue too small: {queue} < {pool}")]
    QueueTooSmall { queue: usize, pool: usize },

    #[error("context pool must have at least one entry")]
    EmptyPool,

    /// The handle does not refer to an allocated entry.
    #[error("context entry {0} is not allocated")]
    NotAllocated(EntryId),

    /// Callback and response-queue delivery are mutually exclusive.
    #[error("context entry {0} already has a delivery mode")]
    DeliveryConflict(EntryId),

    #[error("pool has no response queue")]
    NoResponseQueue,

    #[error("send failed")]
    SendFailed(#[from] SendError),
}

/// Pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of entries.
    pub size: usize,
    /// Number of hash buckets.
    pub hash_depth: usize,
    /// Transmissions per request in non-stepped mode.
    pub max_retries: u32,
    /// Timeout of the first attempt.
    pub default_timeout: Duration,
    /// Non-zero enables stepped retries.
    pub min_timeout: Duration,
    /// Timeout budget of a request in stepped mode.
    pub total_timeout: Duration,
    /// Grace added to the timeout of requests that were sent successfully.
    pub timeout_adder: Duration,
    /// Release an entry as soon as a resend fails.
    pub error_on_send_fail: bool,
    /// Capacity of the response queue, if one is bound.
    pub response_queue: Option<usize>,
    pub rng_seed: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 20,
            hash_depth: 79,
            max_retries: 3,
            default_timeout: Duration::from_millis(100),
            min_timeout: Duration::ZERO,
            total_timeout: Duration::from_millis(300),
            timeout_adder: Duration::ZERO,
            error_on_send_fail: true,
            response_queue: None,
            rng_seed: None,
        }
    }
}

impl PoolConfig {
    #[inline]
    pub fn stepped(&self) -> bool {
        !self.min_timeout.is_zero()
    }
}

/// Snapshot of pool occupancy and traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub allocated: usize,
    pub free: usize,
    pub waiters: usize,
    pub transmits: u64,
    pub retransmits: u64,
    pub retries_exhausted: u64,
    pub send_failures: u64,
    pub unexpected_responses: u64,
}

/// Receiver of released entries.
///
/// `complete` is invoked with the pool lock held. `mad` is the response on
/// [`Status::Ok`] and `None` otherwise. If the handler neither retires nor
/// reuses `entry`, the pool retires it after `complete` returns.
pub trait Completion<T: Transport> {
    /// Per-entry callback data.
    type Tag: Copy + fmt::Debug;

    fn complete(
        &mut self,
        pool: &mut PoolCore<T, Self::Tag>,
        entry: EntryId,
        tag: Self::Tag,
        status: Status,
        mad: Option<&Mad>,
    );
}

/// A handler for pools that only use the response queue.
impl<T: Transport> Completion<T> for () {
    type Tag = ();

    fn complete(&mut self, _: &mut PoolCore<T, ()>, _: EntryId, _: (), _: Status, _: Option<&Mad>) {}
}

/// The pool proper, as seen from inside its lock.
pub struct PoolCore<T, Tag> {
    entries: Box<[ContextEntry<Tag>]>,
    lists: Lists,
    cfg: PoolConfig,
    transport: T,
    clock: Clock,
    rng: SmallRng,

    num_alloc: usize,
    num_free: usize,
    num_waiters: usize,
    stats: PoolStats,

    free_wait: Arc<Semaphore>,
    queue: Option<Arc<RespQueue>>,
}

impl<T: Transport, Tag: Copy + fmt::Debug> PoolCore<T, Tag> {
    /// Create a pool. All entries start on the free list.
    pub fn new(cfg: PoolConfig, transport: T, clock: Clock) -> Result<Self, ContextError> {
        if cfg.size == 0 || cfg.size > u32::MAX as usize {
            return Err(ContextError::EmptyPool);
        }
        let queue = match cfg.response_queue {
            Some(capacity) if capacity < cfg.size => {
                log::error!(
                    "madsweep: response queue too small: {} need {}",
                    capacity,
                    cfg.size
                );
                return Err(ContextError::QueueTooSmall {
                    queue: capacity,
                    pool: cfg.size,
                });
            }
            Some(capacity) => Some(Arc::new(RespQueue::new(capacity))),
            None => None,
        };

        let now = clock.now();
        let entries = (0..cfg.size as u32)
            .map(|i| ContextEntry::new(i, now))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let mut lists = Lists::new(cfg.size, cfg.hash_depth);
        for i in 0..cfg.size as u32 {
            lists.push_free(i);
        }
        let rng = match cfg.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };
        log::debug!(
            "madsweep: context pool of {} entries, {} buckets",
            cfg.size,
            lists.depth()
        );

        Ok(Self {
            entries,
            lists,
            num_alloc: 0,
            num_free: cfg.size,
            num_waiters: 0,
            stats: PoolStats::default(),
            cfg,
            transport,
            clock,
            rng,
            free_wait: Arc::new(Semaphore::new(0)),
            queue,
        })
    }

    #[inline]
    pub fn config(&self) -> &PoolConfig {
        &self.cfg
    }

    #[inline]
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    #[inline]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    #[inline]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[inline]
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Entry behind a handle, allocated or not.
    #[inline]
    pub fn entry(&self, id: EntryId) -> Option<&ContextEntry<Tag>> {
        self.entries.get(id.index())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.entries.len(),
            allocated: self.num_alloc,
            free: self.num_free,
            waiters: self.num_waiters,
            ..self.stats
        }
    }

    fn slot(&self, id: EntryId) -> Result<usize, ContextError> {
        match self.entries.get(id.index()) {
            Some(e) if e.alloced => Ok(id.index()),
            _ => Err(ContextError::NotAllocated(id)),
        }
    }

    #[inline]
    fn bucket_of(&self, lid: Lid) -> usize {
        lid as usize % self.lists.depth()
    }

    fn reserve(&mut self, i: usize) {
        let bucket = self.bucket_of(self.entries[i].mad.addr.dlid);
        let e = &mut self.entries[i];
        debug_assert!(e.alloced && !e.hashed && !e.releasing);
        e.lid = e.mad.addr.dlid;
        e.tid = e.mad.base.tid;
        e.resp_timeout = self.cfg.default_timeout;
        e.send_failed = false;
        e.hashed = true;
        e.timestamp = self.clock.now();
        self.lists.insert_bucket(bucket, i as u32);
    }

    fn unhash(&mut self, i: usize) {
        let e = &mut self.entries[i];
        if e.hashed {
            e.hashed = false;
            self.lists.remove(i as u32);
        }
    }

    /// Allocate an entry. With a request, the request is copied in and the
    /// entry is hashed.
    ///
    /// When the pool is exhausted, returns [`ContextError::Exhausted`]; with
    /// `wait` set the caller is also registered as a waiter and must block on
    /// the pool's free-entry semaphore before trying again.
    pub fn get(&mut self, mad: Option<&Mad>, wait: bool) -> Result<EntryId, ContextError> {
        let Some(i) = self.lists.pop_free() else {
            if wait {
                self.num_waiters += 1;
            } else {
                log::info!("madsweep: no free context available at this time");
            }
            return Err(ContextError::Exhausted);
        };
        let i = i as usize;
        self.num_alloc += 1;
        self.num_free -= 1;

        let e = &mut self.entries[i];
        e.alloced = true;
        e.total_timeout = self.cfg.total_timeout;
        if let Some(mad) = mad {
            e.mad.clone_from(mad);
            self.reserve(i);
        }
        Ok(EntryId(i as u32))
    }

    /// Return an entry to the free list, waking one waiter.
    pub fn retire(&mut self, id: EntryId) -> Result<(), ContextError> {
        let i = self.slot(id)?;
        self.retire_slot(i);
        Ok(())
    }

    fn retire_slot(&mut self, i: usize) {
        self.unhash(i);
        self.entries[i].reset();
        self.lists.push_free(i as u32);
        self.num_free += 1;
        self.num_alloc -= 1;

        if self.num_waiters > 0 {
            self.num_waiters -= 1;
            self.free_wait.post();
        }
    }

    /// Re-arm an allocated entry for a new request without a free-list round
    /// trip.
    pub fn reuse(&mut self, id: EntryId, mad: Option<&Mad>) -> Result<(), ContextError> {
        let i = self.slot(id)?;
        self.unhash(i);
        let e = &mut self.entries[i];
        e.reset();
        e.alloced = true;
        e.total_timeout = self.cfg.total_timeout;
        if let Some(mad) = mad {
            e.mad.clone_from(mad);
            self.reserve(i);
        }
        Ok(())
    }

    /// Bind a completion tag to an entry, or unbind it with `None`.
    pub fn set_callback(&mut self, id: EntryId, tag: Option<Tag>) -> Result<(), ContextError> {
        let i = self.slot(id)?;
        let e = &mut self.entries[i];
        if tag.is_some() && e.sender_wants_response {
            return Err(ContextError::DeliveryConflict(id));
        }
        e.tag = tag;
        Ok(())
    }

    /// Deliver this entry through the response queue instead of a callback.
    pub fn set_response_queue(&mut self, id: EntryId) -> Result<(), ContextError> {
        let i = self.slot(id)?;
        if self.queue.is_none() {
            return Err(ContextError::NoResponseQueue);
        }
        let e = &mut self.entries[i];
        if e.tag.is_some() {
            return Err(ContextError::DeliveryConflict(id));
        }
        e.sender_wants_response = true;
        Ok(())
    }

    /// Send the entry's request with its current per-attempt timeout.
    ///
    /// A failed send leaves the entry hashed and marked so the next aging
    /// pass checks it without the grace adder.
    pub fn send(&mut self, id: EntryId) -> Result<(), ContextError> {
        let i = self.slot(id)?;
        if !self.entries[i].hashed {
            self.reserve(i);
        } else {
            self.entries[i].send_failed = false;
        }

        let e = &mut self.entries[i];
        if e.retries > 0 {
            self.stats.retransmits += 1;
        }
        self.stats.transmits += 1;
        e.retries += 1;

        if let Err(err) = self.transport.send(&e.mad, e.resp_timeout) {
            log::error!(
                "madsweep: {} sending method {:#x} attr {:#x} in context entry[{}] to lid {:#x}, tid {:#x}",
                err,
                e.mad.base.method,
                e.mad.base.attr_id,
                i,
                e.mad.addr.dlid,
                e.tid
            );
            e.send_failed = true;
            self.stats.send_failures += 1;
            return Err(err.into());
        }
        Ok(())
    }

    fn find(&self, mad: &Mad) -> Option<usize> {
        let slid = mad.addr.slid;
        let tid = mask_tid(mad.base.tid);
        self.lists
            .bucket(self.bucket_of(slid))
            .map(|i| i as usize)
            .find(|&i| {
                let e = &self.entries[i];
                e.lid == slid && mask_tid(e.tid) == tid
            })
    }

    fn release<H>(&mut self, handler: &mut H, i: usize, status: Status, mad: Option<&Mad>)
    where
        H: Completion<T, Tag = Tag>,
    {
        self.unhash(i);
        let e = &mut self.entries[i];
        e.releasing = true;

        if e.sender_wants_response {
            if let Some(queue) = &self.queue {
                match mad {
                    Some(mad) => e.mad.clone_from(mad),
                    None => e.mad.kind = MadKind::Error,
                }
                e.resp_status = status;
                if queue.push(e.index).is_err() {
                    log::error!(
                        "madsweep: unable to queue response for context entry[{}]",
                        i
                    );
                    self.retire_slot(i);
                }
                return;
            }
        }

        if let Some(tag) = e.tag {
            let id = e.index;
            handler.complete(self, id, tag, status, mad);
        }

        // Retired, reused or re-got by the handler otherwise.
        if self.entries[i].releasing {
            self.retire_slot(i);
        }
    }

    fn release_after_timeout<H>(&mut self, handler: &mut H, i: usize, outcome: Timeout) -> bool
    where
        H: Completion<T, Tag = Tag>,
    {
        let status = match outcome {
            Timeout::Exhausted => Status::Timeout,
            Timeout::SendFailed if self.cfg.error_on_send_fail => Status::SendFailed,
            _ => return false,
        };
        self.release(handler, i, status, None);
        true
    }

    /// Match a response and release its entry with [`Status::Ok`].
    /// Returns whether an entry matched.
    pub fn find_release<H>(&mut self, handler: &mut H, mad: &Mad) -> bool
    where
        H: Completion<T, Tag = Tag>,
    {
        match self.find(mad) {
            Some(i) => {
                self.release(handler, i, Status::Ok, Some(mad));
                true
            }
            None => {
                self.stats.unexpected_responses += 1;
                log::info!(
                    "madsweep: discarding unexpected response: class {:#x} attr {:#x} slid {:#x} tid {:#x}",
                    mad.base.mgmt_class,
                    mad.base.attr_id,
                    mad.addr.slid,
                    mad.base.tid
                );
                false
            }
        }
    }

    /// Match a send failure or missing-response indication. The entry is
    /// retried or, once exhausted, released with a failure status.
    pub fn find_release_error<H>(&mut self, handler: &mut H, mad: &Mad) -> bool
    where
        H: Completion<T, Tag = Tag>,
    {
        match self.find(mad) {
            Some(i) => {
                let now = self.clock.now();
                let outcome = self.process_timeout(i, now);
                self.release_after_timeout(handler, i, outcome);
                true
            }
            None => {
                self.stats.unexpected_responses += 1;
                log::info!(
                    "madsweep: discarding unexpected error: class {:#x} attr {:#x} slid {:#x} tid {:#x}",
                    mad.base.mgmt_class,
                    mad.base.attr_id,
                    mad.addr.slid,
                    mad.base.tid
                );
                false
            }
        }
    }

    /// Retry or fail every hashed entry whose attempt has timed out.
    ///
    /// Returns the smallest time left until a pending entry times out, or
    /// `None` if nothing is pending.
    pub fn age<H>(&mut self, handler: &mut H) -> Option<Duration>
    where
        H: Completion<T, Tag = Tag>,
    {
        let now = self.clock.now();
        let mut smallest: Option<Duration> = None;

        for bucket in 0..self.lists.depth() {
            let mut cursor = self.lists.bucket_head(bucket);
            while let Some(idx) = cursor {
                let i = idx as usize;
                let mut next = self.lists.next(idx);

                let e = &self.entries[i];
                let adder = if e.send_failed {
                    Duration::ZERO
                } else {
                    self.cfg.timeout_adder
                };
                if now.saturating_duration_since(e.timestamp) >= e.resp_timeout + adder {
                    let outcome = self.process_timeout(i, now);
                    if self.release_after_timeout(handler, i, outcome) {
                        // The handler may have reshaped this bucket.
                        if let Some(n) = next {
                            if self.lists.membership(n) != Membership::Bucket(bucket as u32) {
                                next = self.lists.bucket_head(bucket);
                            }
                        }
                        cursor = next;
                        continue;
                    }
                }

                let e = &self.entries[i];
                let adder = if e.send_failed {
                    Duration::ZERO
                } else {
                    self.cfg.timeout_adder
                };
                let left = (e.resp_timeout + adder)
                    .saturating_sub(now.saturating_duration_since(e.timestamp));
                smallest = Some(smallest.map_or(left, |s| s.min(left)));
                cursor = next;
            }
        }
        smallest
    }
}

/// State behind the pool lock.
struct Locked<T: Transport, H: Completion<T>> {
    core: PoolCore<T, H::Tag>,
    handler: H,
}

/// Context pool with its lock.
///
/// Every method takes the lock for its duration. Blocking (`get_wait`,
/// `poll_response`) happens outside it.
pub struct ContextPool<T: Transport, H: Completion<T>> {
    inner: Mutex<Locked<T, H>>,
    free_wait: Arc<Semaphore>,
    queue: Option<Arc<RespQueue>>,
}

impl<T: Transport, H: Completion<T>> ContextPool<T, H> {
    /// Create a pool backed by the system clock.
    pub fn new(cfg: PoolConfig, transport: T, handler: H) -> Result<Self, ContextError> {
        Self::with_clock(cfg, transport, handler, Clock::new())
    }

    pub fn with_clock(
        cfg: PoolConfig,
        transport: T,
        handler: H,
        clock: Clock,
    ) -> Result<Self, ContextError> {
        let core = PoolCore::new(cfg, transport, clock)?;
        Ok(Self {
            free_wait: core.free_wait.clone(),
            queue: core.queue.clone(),
            inner: Mutex::new(Locked { core, handler }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Locked<T, H>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            log::error!("madsweep: context pool lock poisoned, continuing");
            PoisonError::into_inner(poisoned)
        })
    }

    /// Run `f` inside the pool's critical section.
    pub fn with<R>(&self, f: impl FnOnce(&mut PoolCore<T, H::Tag>, &mut H) -> R) -> R {
        let mut guard = self.lock();
        let Locked { core, handler } = &mut *guard;
        f(core, handler)
    }

    pub fn get(&self, mad: Option<&Mad>, wait: bool) -> Result<EntryId, ContextError> {
        self.lock().core.get(mad, wait)
    }

    /// Allocate an entry, blocking until one is free.
    pub fn get_wait(&self, mad: Option<&Mad>) -> Result<EntryId, ContextError> {
        loop {
            match self.get(mad, true) {
                Err(ContextError::Exhausted) => self.free_wait.wait(),
                res => return res,
            }
        }
    }

    pub fn send(&self, id: EntryId) -> Result<(), ContextError> {
        self.lock().core.send(id)
    }

    pub fn retire(&self, id: EntryId) -> Result<(), ContextError> {
        self.lock().core.retire(id)
    }

    pub fn reuse(&self, id: EntryId, mad: Option<&Mad>) -> Result<(), ContextError> {
        self.lock().core.reuse(id, mad)
    }

    pub fn set_callback(&self, id: EntryId, tag: Option<H::Tag>) -> Result<(), ContextError> {
        self.lock().core.set_callback(id, tag)
    }

    pub fn set_response_queue(&self, id: EntryId) -> Result<(), ContextError> {
        self.lock().core.set_response_queue(id)
    }

    pub fn find_release(&self, mad: &Mad) -> bool {
        self.with(|core, handler| core.find_release(handler, mad))
    }

    pub fn find_release_error(&self, mad: &Mad) -> bool {
        self.with(|core, handler| core.find_release_error(handler, mad))
    }

    pub fn age(&self) -> Option<Duration> {
        self.with(|core, handler| core.age(handler))
    }

    /// Take the next released entry off the response queue, waiting at most
    /// `timeout`. The entry is retired; its final MAD and status are
    /// returned. A MAD of kind [`MadKind::Error`] is the original request.
    pub fn poll_response(&self, timeout: Duration) -> Result<Option<(Mad, Status)>, ContextError> {
        let queue = self.queue.as_ref().ok_or(ContextError::NoResponseQueue)?;
        let Some(id) = queue.pop(timeout) else {
            return Ok(None);
        };
        let mut guard = self.lock();
        let core = &mut guard.core;
        let i = core.slot(id)?;
        let e = &core.entries[i];
        let out = (e.mad.clone(), e.resp_status);
        core.retire_slot(i);
        Ok(Some(out))
    }

    pub fn stats(&self) -> PoolStats {
        self.lock().core.stats()
    }

    pub fn now(&self) -> Instant {
        self.lock().core.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mad::{attr, method, TidAllocator};
    use quanta::Mock;
    use rand::Rng;
    use std::thread;

    const MS: Duration = Duration::from_millis(1);

    #[derive(Default)]
    struct Wire {
        sent: Vec<(Lid, u64, Duration)>,
        fail: bool,
    }

    impl Transport for Wire {
        fn send(&mut self, mad: &Mad, timeout: Duration) -> Result<(), SendError> {
            if self.fail {
                return Err(SendError::Closed);
            }
            self.sent.push((mad.addr.dlid, mad.base.tid, timeout));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Done {
        done: Vec<(u32, Status)>,
    }

    impl<T: Transport> Completion<T> for Done {
        type Tag = u32;

        fn complete(&mut self, _: &mut PoolCore<T, u32>, _: EntryId, tag: u32, status: Status, _: Option<&Mad>) {
            self.done.push((tag, status));
        }
    }

    fn config(size: usize) -> PoolConfig {
        PoolConfig {
            size,
            rng_seed: Some(7),
            ..PoolConfig::default()
        }
    }

    fn request(dlid: Lid, tid: u64) -> Mad {
        let mut mad = Mad::new();
        mad.init_pm_request(method::GET, attr::DATA_PORT_COUNTERS, 1 << 24, tid);
        mad.addr.dlid = dlid;
        mad
    }

    fn response_to(req: &Mad) -> Mad {
        let mut mad = req.clone();
        mad.make_response(0);
        mad
    }

    fn core(cfg: PoolConfig) -> (PoolCore<Wire, u32>, Arc<Mock>) {
        let (clock, mock) = Clock::mock();
        (PoolCore::new(cfg, Wire::default(), clock).unwrap(), mock)
    }

    impl<T: Transport, Tag: Copy + fmt::Debug> PoolCore<T, Tag> {
        fn assert_consistent(&self) {
            assert_eq!(self.num_alloc + self.num_free, self.entries.len());
            let mut free = 0;
            for (i, e) in self.entries.iter().enumerate() {
                match self.lists.membership(i as u32) {
                    Membership::Free => {
                        free += 1;
                        assert!(!e.alloced && !e.hashed);
                    }
                    Membership::Bucket(b) => {
                        assert!(e.alloced && e.hashed);
                        assert_eq!(b as usize, self.bucket_of(e.lid));
                    }
                    Membership::Detached => assert!(e.alloced && !e.hashed),
                }
            }
            assert_eq!(free, self.num_free);
        }
    }

    #[test]
    fn test_get_until_exhausted() {
        let (mut core, _mock) = core(config(2));
        core.get(Some(&request(1, 1)), false).unwrap();
        core.get(Some(&request(1, 2)), false).unwrap();
        assert!(matches!(core.get(None, false), Err(ContextError::Exhausted)));
        assert_eq!(core.stats().waiters, 0);
        assert!(matches!(core.get(None, true), Err(ContextError::Exhausted)));
        assert_eq!(core.stats().waiters, 1);
        core.assert_consistent();
    }

    #[test]
    fn test_release_wakes_waiter() {
        let cfg = config(2);
        let (clock, _mock) = Clock::mock();
        let pool = Arc::new(ContextPool::with_clock(cfg, Wire::default(), Done::default(), clock).unwrap());

        let req = request(5, 1);
        let first = pool.get(Some(&req), false).unwrap();
        pool.set_callback(first, Some(1)).unwrap();
        pool.send(first).unwrap();
        pool.get(Some(&request(5, 2)), false).unwrap();
        assert!(matches!(pool.get(None, false), Err(ContextError::Exhausted)));

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.get_wait(None).unwrap())
        };
        while pool.stats().waiters == 0 {
            thread::sleep(MS);
        }

        assert!(pool.find_release(&response_to(&req)));
        let got = waiter.join().unwrap();
        assert_eq!(got, first);
        let stats = pool.stats();
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.free, 0);
        pool.with(|core, handler| {
            assert_eq!(handler.done, vec![(1, Status::Ok)]);
            core.assert_consistent();
        });
    }

    #[test]
    fn test_non_stepped_transmits_max_retries_times() {
        let (mut core, mock) = core(config(4));
        let mut done = Done::default();
        let id = core.get(Some(&request(3, 0x1_0000_0042)), false).unwrap();
        core.set_callback(id, Some(9)).unwrap();
        core.send(id).unwrap();

        for _ in 0..2 {
            mock.increment(100 * MS);
            assert_eq!(core.age(&mut done), Some(100 * MS));
            assert!(done.done.is_empty());
        }
        mock.increment(100 * MS);
        assert_eq!(core.age(&mut done), None);
        assert_eq!(done.done, vec![(9, Status::Timeout)]);

        let sent = &core.transport().sent;
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|&(lid, tid, _)| lid == 3 && tid == 0x1_0000_0042));
        let stats = core.stats();
        assert_eq!(stats.retransmits, 2);
        assert_eq!(stats.retries_exhausted, 1);
        assert_eq!(stats.free, 4);
    }

    #[test]
    fn test_stepped_timeout_trace() {
        let cfg = PoolConfig {
            default_timeout: 100 * MS,
            min_timeout: 100 * MS,
            total_timeout: 250 * MS,
            ..config(2)
        };
        let (mut core, mock) = core(cfg);
        let mut done = Done::default();
        let id = core.get(Some(&request(1, 1)), false).unwrap();
        core.set_callback(id, Some(0)).unwrap();
        core.send(id).unwrap();

        let mut used = vec![];
        while done.done.is_empty() {
            let timeout = core.entry(id).unwrap().resp_timeout();
            used.push(timeout);
            mock.increment(timeout);
            core.age(&mut done);
        }
        assert_eq!(used, vec![100 * MS, 150 * MS]);
        assert_eq!(done.done, vec![(0, Status::Timeout)]);
        assert_eq!(core.transport().sent[1].2, 150 * MS);
    }

    #[test]
    fn test_stepped_budget_bound() {
        for seed in 0..20 {
            for min_ms in [10u32, 37, 100] {
                for budget_ms in [50u32, 250, 333, 1000, 1234] {
                    let min = min_ms * MS;
                    let budget = budget_ms * MS;
                    let cfg = PoolConfig {
                        default_timeout: min,
                        min_timeout: min,
                        total_timeout: budget,
                        rng_seed: Some(seed),
                        ..config(1)
                    };
                    let (mut core, mock) = core(cfg);
                    let mut done = Done::default();
                    let id = core.get(Some(&request(1, 1)), false).unwrap();
                    core.set_callback(id, Some(0)).unwrap();
                    core.send(id).unwrap();

                    let mut used = vec![];
                    while done.done.is_empty() {
                        let timeout = core.entry(id).unwrap().resp_timeout();
                        used.push(timeout);
                        mock.increment(timeout);
                        core.age(&mut done);
                    }

                    let total: Duration = used.iter().sum();
                    assert!(total <= budget + min, "{used:?}");
                    let last = used.len() - 1;
                    for (k, t) in used.iter().enumerate().skip(1) {
                        let candidate = min * (k as u32 + 1);
                        assert!(*t < candidate + candidate / 5, "{used:?}");
                        if k < last {
                            assert!(*t >= candidate - candidate / 5, "{used:?}");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_send_failure_policy() {
        for fail_fast in [true, false] {
            let cfg = PoolConfig {
                error_on_send_fail: fail_fast,
                timeout_adder: 1000 * MS,
                ..config(2)
            };
            let (mut core, mock) = core(cfg);
            core.transport_mut().fail = true;
            let mut done = Done::default();
            let id = core.get(Some(&request(2, 1)), false).unwrap();
            core.set_callback(id, Some(4)).unwrap();
            assert!(matches!(core.send(id), Err(ContextError::SendFailed(_))));
            assert!(core.entry(id).unwrap().send_failed());
            assert!(core.entry(id).unwrap().is_hashed());

            // A failed send is re-checked without the grace adder.
            mock.increment(100 * MS);
            core.age(&mut done);
            if fail_fast {
                assert_eq!(done.done, vec![(4, Status::SendFailed)]);
                assert_eq!(core.stats().allocated, 0);
            } else {
                assert!(done.done.is_empty());
                assert!(core.entry(id).unwrap().is_hashed());
            }
            assert_eq!(core.stats().send_failures, 2);
            core.assert_consistent();
        }
    }

    #[test]
    fn test_release_error_retries_then_fails() {
        let (mut core, _mock) = core(config(2));
        let mut done = Done::default();
        let req = request(8, 77);
        let id = core.get(Some(&req), false).unwrap();
        core.set_callback(id, Some(1)).unwrap();
        core.send(id).unwrap();

        let mut failed = req.clone();
        failed.kind = MadKind::Error;
        failed.addr.slid = 8;
        assert!(core.find_release_error(&mut done, &failed));
        assert!(core.find_release_error(&mut done, &failed));
        assert!(done.done.is_empty());
        assert!(core.find_release_error(&mut done, &failed));
        assert_eq!(done.done, vec![(1, Status::Timeout)]);
        assert!(!core.find_release_error(&mut done, &failed));
        assert_eq!(core.transport().sent.len(), 3);
    }

    #[test]
    fn test_unexpected_response_counted() {
        let (mut core, _mock) = core(config(2));
        let mut done = Done::default();
        let req = request(8, 1);
        let id = core.get(Some(&req), false).unwrap();
        core.send(id).unwrap();
        // Same tid, different lid.
        let mut other = response_to(&request(9, 1));
        assert!(!core.find_release(&mut done, &other));
        // Upper tid bits are not compared.
        other = response_to(&req);
        other.base.tid |= 0xabcd_0000_0000;
        assert!(core.find_release(&mut done, &other));
        assert_eq!(core.stats().unexpected_responses, 1);
        assert_eq!(core.stats().allocated, 0);
    }

    struct Chain {
        next: Option<Mad>,
    }

    impl Completion<Wire> for Chain {
        type Tag = u32;

        fn complete(&mut self, pool: &mut PoolCore<Wire, u32>, entry: EntryId, _: u32, _: Status, _: Option<&Mad>) {
            if let Some(next) = self.next.take() {
                pool.reuse(entry, Some(&next)).unwrap();
                pool.set_callback(entry, Some(2)).unwrap();
                pool.send(entry).unwrap();
            }
        }
    }

    #[test]
    fn test_handler_reuse_keeps_entry() {
        let (clock, _mock) = Clock::mock();
        let mut core = PoolCore::new(config(1), Wire::default(), clock).unwrap();
        let mut chain = Chain {
            next: Some(request(4, 2)),
        };
        let req = request(4, 1);
        let id = core.get(Some(&req), false).unwrap();
        core.set_callback(id, Some(1)).unwrap();
        core.send(id).unwrap();

        assert!(core.find_release(&mut chain, &response_to(&req)));
        let e = core.entry(id).unwrap();
        assert!(e.is_allocated() && e.is_hashed());
        assert_eq!(e.tid(), 2);
        assert_eq!(e.retries(), 1);
        core.assert_consistent();

        assert!(core.find_release(&mut chain, &response_to(&request(4, 2))));
        assert_eq!(core.stats().free, 1);
    }

    #[test]
    fn test_response_queue_delivery() {
        let cfg = PoolConfig {
            response_queue: Some(2),
            ..config(2)
        };
        let (clock, mock) = Clock::mock();
        let pool = ContextPool::with_clock(cfg, Wire::default(), (), clock).unwrap();

        let req = request(6, 10);
        let id = pool.get(Some(&req), false).unwrap();
        pool.set_response_queue(id).unwrap();
        pool.send(id).unwrap();
        let lost = pool.get(Some(&request(6, 11)), false).unwrap();
        pool.set_response_queue(lost).unwrap();
        pool.send(lost).unwrap();

        let mut resp = response_to(&req);
        resp.data[0] = 0x5a;
        resp.datasize = 1;
        assert!(pool.find_release(&resp));
        // Released to the queue, still allocated.
        assert_eq!(pool.stats().allocated, 2);

        let (mad, status) = pool.poll_response(MS).unwrap().unwrap();
        assert_eq!(status, Status::Ok);
        assert_eq!(mad.payload(), &[0x5a]);
        assert_eq!(pool.stats().allocated, 1);

        for _ in 0..3 {
            mock.increment(100 * MS);
            pool.age();
        }
        let (mad, status) = pool.poll_response(MS).unwrap().unwrap();
        assert_eq!(status, Status::Timeout);
        assert_eq!(mad.kind, MadKind::Error);
        assert_eq!(mad.base.tid, 11);
        assert!(pool.poll_response(MS).unwrap().is_none());
        assert_eq!(pool.stats().allocated, 0);
    }

    #[test]
    fn test_config_errors() {
        let (clock, _) = Clock::mock();
        let cfg = PoolConfig {
            response_queue: Some(1),
            ..config(2)
        };
        assert!(matches!(
            PoolCore::<Wire, u32>::new(cfg, Wire::default(), clock.clone()),
            Err(ContextError::QueueTooSmall { queue: 1, pool: 2 })
        ));
        assert!(matches!(
            PoolCore::<Wire, u32>::new(config(0), Wire::default(), clock.clone()),
            Err(ContextError::EmptyPool)
        ));

        let cfg = PoolConfig {
            response_queue: Some(2),
            ..config(2)
        };
        let mut core = PoolCore::<Wire, u32>::new(cfg, Wire::default(), clock.clone()).unwrap();
        let id = core.get(None, false).unwrap();
        core.set_callback(id, Some(1)).unwrap();
        assert!(matches!(
            core.set_response_queue(id),
            Err(ContextError::DeliveryConflict(_))
        ));
        core.retire(id).unwrap();
        assert!(matches!(core.retire(id), Err(ContextError::NotAllocated(_))));

        let mut core = PoolCore::<Wire, u32>::new(config(1), Wire::default(), clock).unwrap();
        let id = core.get(None, false).unwrap();
        assert!(matches!(
            core.set_response_queue(id),
            Err(ContextError::NoResponseQueue)
        ));
    }

    #[test]
    fn test_conservation_under_random_ops() {
        let mut rng = SmallRng::seed_from_u64(42);
        let (mut core, mock) = core(config(6));
        let mut done = Done::default();
        let mut tids = TidAllocator::new();

        for _ in 0..2000 {
            let allocated: Vec<EntryId> = (0..6u32)
                .map(EntryId)
                .filter(|id| core.entry(*id).unwrap().is_allocated())
                .collect();
            let pick = |rng: &mut SmallRng| allocated[rng.random_range(0..allocated.len())];
            let lid = rng.random_range(1..200);

            match rng.random_range(0..6) {
                0 => {
                    let with_mad = rng.random_bool(0.8);
                    let req = request(lid, tids.next_tid());
                    if let Ok(id) = core.get(with_mad.then_some(&req), false) {
                        core.set_callback(id, Some(id.0)).unwrap();
                    }
                }
                1 if !allocated.is_empty() => {
                    let _ = core.send(pick(&mut rng));
                }
                2 if !allocated.is_empty() => core.retire(pick(&mut rng)).unwrap(),
                3 if !allocated.is_empty() => {
                    let req = request(lid, tids.next_tid());
                    core.reuse(pick(&mut rng), Some(&req)).unwrap();
                }
                4 if !allocated.is_empty() => {
                    let id = pick(&mut rng);
                    let resp = response_to(core.entry(id).unwrap().mad());
                    core.find_release(&mut done, &resp);
                }
                5 => {
                    mock.increment(rng.random_range(0..150u32) * MS);
                    core.age(&mut done);
                }
                _ => {}
            }
            core.assert_consistent();
        }
    }
}
