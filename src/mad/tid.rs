/// Bits of a transaction id the transport stack is guaranteed to preserve.
pub const TID_MASK: u64 = 0xffff_ffff;

/// Mask a transaction id down to its preserved bits.
#[inline]
pub const fn mask_tid(tid: u64) -> u64 {
    tid & TID_MASK
}

/// Transaction id source for outgoing requests.
#[derive(Debug, Default, Clone)]
pub struct TidAllocator {
    last: u32,
}

impl TidAllocator {
    pub const fn new() -> Self {
        Self { last: 0 }
    }

    /// Allocate the next transaction id. Ids wrap within the preserved bits
    /// and never return zero.
    pub fn next_tid(&mut self) -> u64 {
        self.last = self.last.wrapping_add(1);
        if self.last == 0 {
            self.last = 1;
        }
        self.last as u64
    }
}
