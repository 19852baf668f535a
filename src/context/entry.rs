use std::fmt;
use std::time::Duration;

use quanta::Instant;

use crate::mad::{Lid, Mad};

/// Handle of a context entry.
///
/// Handles are indices into the pool's entry array and stay valid for the
/// lifetime of the pool. Whether the entry behind a handle is still the
/// request the holder allocated is up to the holder to track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub(crate) u32);

impl EntryId {
    /// Slot index of this entry.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Completion status delivered with a released entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Status {
    /// A matching response arrived.
    #[default]
    Ok,
    /// Retries or the timeout budget ran out.
    Timeout,
    /// The last (re)send failed and the pool fails entries on send errors.
    SendFailed,
}

/// One in-flight request slot.
///
/// All fields are owned by the pool; holders read them through
/// [`PoolCore::entry`](super::PoolCore::entry).
pub struct ContextEntry<Tag> {
    pub(super) index: EntryId,

    /// Time of the last send attempt.
    pub(super) timestamp: Instant,
    pub(super) tid: u64,
    /// Peer the request went to. Responses are matched on their source lid.
    pub(super) lid: Lid,

    pub(super) hashed: bool,
    pub(super) alloced: bool,
    pub(super) releasing: bool,
    pub(super) send_failed: bool,
    pub(super) sender_wants_response: bool,

    /// Transmissions so far.
    pub(super) retries: u32,
    pub(super) resp_timeout: Duration,
    pub(super) cum_timeout: Duration,
    pub(super) total_timeout: Duration,

    pub(super) tag: Option<Tag>,
    pub(super) resp_status: Status,
    /// Outbound request; replaced by the response in response-queue mode.
    pub(super) mad: Mad,
}

impl<Tag> ContextEntry<Tag> {
    pub(super) fn new(index: u32, now: Instant) -> Self {
        Self {
            index: EntryId(index),
            timestamp: now,
            tid: 0,
            lid: 0,
            hashed: false,
            alloced: false,
            releasing: false,
            send_failed: false,
            sender_wants_response: false,
            retries: 0,
            resp_timeout: Duration::ZERO,
            cum_timeout: Duration::ZERO,
            total_timeout: Duration::ZERO,
            tag: None,
            resp_status: Status::Ok,
            mad: Mad::new(),
        }
    }

    /// Return to the just-initialized state. The index is kept.
    pub(super) fn reset(&mut self) {
        self.tid = 0;
        self.lid = 0;
        self.hashed = false;
        self.alloced = false;
        self.releasing = false;
        self.send_failed = false;
        self.sender_wants_response = false;
        self.retries = 0;
        self.resp_timeout = Duration::ZERO;
        self.cum_timeout = Duration::ZERO;
        self.total_timeout = Duration::ZERO;
        self.tag = None;
        self.resp_status = Status::Ok;
        self.mad.clear();
    }

    #[inline]
    pub fn id(&self) -> EntryId {
        self.index
    }

    #[inline]
    pub fn tid(&self) -> u64 {
        self.tid
    }

    #[inline]
    pub fn lid(&self) -> Lid {
        self.lid
    }

    /// Number of transmissions of the current request.
    #[inline]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Timeout of the current attempt.
    #[inline]
    pub fn resp_timeout(&self) -> Duration {
        self.resp_timeout
    }

    /// Sum of the timeouts of all completed attempts.
    #[inline]
    pub fn cumulative_timeout(&self) -> Duration {
        self.cum_timeout
    }

    #[inline]
    pub fn total_timeout(&self) -> Duration {
        self.total_timeout
    }

    #[inline]
    pub fn is_hashed(&self) -> bool {
        self.hashed
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.alloced
    }

    #[inline]
    pub fn send_failed(&self) -> bool {
        self.send_failed
    }

    #[inline]
    pub fn mad(&self) -> &Mad {
        &self.mad
    }
}

impl<Tag: fmt::Debug> fmt::Debug for ContextEntry<Tag> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextEntry")
            .field("index", &self.index)
            .field("tid", &self.tid)
            .field("lid", &self.lid)
            .field("hashed", &self.hashed)
            .field("alloced", &self.alloced)
            .field("retries", &self.retries)
            .field("resp_timeout", &self.resp_timeout)
            .field("tag", &self.tag)
            .finish()
    }
}
