//! Per-port scheduling descriptors.
//!
//! A node builds one [`PortDescriptor`] per port number when it enters the
//! data phase and re-sorts the same array at the start of every later phase.
//! The comparators are pure functions of the descriptor so the schedule of a
//! phase depends only on the descriptors' contents.

use std::cmp::Ordering;
use std::fmt;

/// Scheduling flags of a port descriptor.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PortFlags(u8);

impl PortFlags {
    /// The port is in a packet of the current phase, or has resolved.
    pub const IS_DISPATCHED: Self = Self(1 << 0);
    /// The port is only ever sent on its own.
    pub const DO_NOT_MERGE: Self = Self(1 << 1);
    /// Tabulation asked for a clear.
    pub const NEEDS_CLEAR: Self = Self(1 << 2);
    /// The data counters asked for an error counter query.
    pub const NEEDS_ERROR: Self = Self(1 << 3);
    /// The port is absent or inactive and is never queried.
    pub const SKIP: Self = Self(1 << 4);

    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl fmt::Debug for PortFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PortFlags({:#04x})", self.0)
    }
}

/// Scheduling state of one port of the node being swept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortDescriptor {
    /// Port number, `0xff` for skipped descriptors.
    pub port_num: u8,
    pub flags: PortFlags,
    /// Number of VLs in `vl_select`.
    pub num_vls: u8,
    pub vl_select: u32,
    /// Counters to clear, as decided by tabulation.
    pub clear_select: u32,
}

impl PortDescriptor {
    /// Port number recorded for descriptors that are never queried.
    pub const SKIPPED_PORT: u8 = 0xff;

    pub fn new(port_num: u8, vl_select: u32) -> Self {
        Self {
            port_num,
            flags: PortFlags::empty(),
            num_vls: vl_select.count_ones() as u8,
            vl_select,
            clear_select: 0,
        }
    }

    pub fn skipped() -> Self {
        Self {
            port_num: Self::SKIPPED_PORT,
            flags: PortFlags::SKIP,
            num_vls: 0,
            vl_select: 0,
            clear_select: 0,
        }
    }

    #[inline]
    pub fn is_skipped(&self) -> bool {
        self.flags.contains(PortFlags::SKIP)
    }

    #[inline]
    pub fn is_dispatched(&self) -> bool {
        self.flags.contains(PortFlags::IS_DISPATCHED)
    }

    #[inline]
    pub fn needs_error(&self) -> bool {
        self.flags.contains(PortFlags::NEEDS_ERROR)
    }

    #[inline]
    pub fn needs_clear(&self) -> bool {
        self.flags.contains(PortFlags::NEEDS_CLEAR)
    }
}

#[inline]
fn skip_last(a: &PortDescriptor, b: &PortDescriptor) -> Ordering {
    a.is_skipped().cmp(&b.is_skipped())
}

/// More VLs first, then the smaller VL mask.
#[inline]
fn by_vls(a: &PortDescriptor, b: &PortDescriptor) -> Ordering {
    b.num_vls
        .cmp(&a.num_vls)
        .then_with(|| a.vl_select.cmp(&b.vl_select))
}

/// Order of the data counter phase: skipped ports last, then by VLs.
pub fn data_order(a: &PortDescriptor, b: &PortDescriptor) -> Ordering {
    skip_last(a, b)
        .then_with(|| by_vls(a, b))
        .then_with(|| a.port_num.cmp(&b.port_num))
}

/// Order of the error counter phase: ports needing errors lead.
pub fn error_order(a: &PortDescriptor, b: &PortDescriptor) -> Ordering {
    skip_last(a, b)
        .then_with(|| b.needs_error().cmp(&a.needs_error()))
        .then_with(|| by_vls(a, b))
        .then_with(|| a.port_num.cmp(&b.port_num))
}

/// Order of the clear phase: ports needing a clear lead, grouped by the
/// counters they clear.
pub fn clear_order(a: &PortDescriptor, b: &PortDescriptor) -> Ordering {
    skip_last(a, b)
        .then_with(|| b.needs_clear().cmp(&a.needs_clear()))
        .then_with(|| a.clear_select.cmp(&b.clear_select))
        .then_with(|| a.port_num.cmp(&b.port_num))
}
