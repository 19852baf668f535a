//! Management datagrams.
//!
//! A [`Mad`] is the single wire unit exchanged with a device's management
//! agent: a common header, the addressing it travelled with, and a bounded
//! payload. The payload layouts of the performance-management attributes
//! live in [`wire`].

mod tid;
pub mod wire;

use std::fmt;

pub use self::tid::*;

/// Local identifier of a fabric endpoint.
pub type Lid = u32;

/// Maximum payload of a PM datagram (2048-byte MAD minus the 24-byte common
/// header).
pub const MAX_PAYLOAD: usize = 2024;

/// Base version of STL MADs.
pub const STL_BASE_VERSION: u8 = 0x80;

/// Performance management class version.
pub const PM_CLASS_VERSION: u8 = 0x80;

/// Performance management class.
pub const MCLASS_PERF: u8 = 0x04;

/// Management pkey, full membership.
pub const MGMT_PKEY: u16 = 0xffff;

/// MAD methods.
pub mod method {
    /// Request (read) an attribute.
    pub const GET: u8 = 0x01;
    /// Request a write of an attribute.
    pub const SET: u8 = 0x02;
    /// Response to a Get or Set.
    pub const GET_RESP: u8 = 0x81;
}

/// PM attribute identifiers.
pub mod attr {
    pub const CLASS_PORT_INFO: u16 = 0x01;
    pub const PORT_STATUS: u16 = 0x40;
    pub const CLEAR_PORT_STATUS: u16 = 0x41;
    pub const DATA_PORT_COUNTERS: u16 = 0x42;
    pub const ERROR_PORT_COUNTERS: u16 = 0x43;
}

/// MAD status codes.
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const BUSY: u16 = 0x0001;
    pub const REDIRECT: u16 = 0x0002;
    pub const BAD_CLASS: u16 = 0x0004;
    pub const BAD_METHOD: u16 = 0x0008;
    pub const BAD_ATTR: u16 = 0x000c;
    pub const BAD_FIELD: u16 = 0x001c;
}

/// How a datagram reached us.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MadKind {
    /// Received from the wire.
    #[default]
    External,
    /// A previously sent request handed back by the transport because it
    /// could not be sent or got no response.
    Error,
}

/// MAD common header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MadHeader {
    pub base_version: u8,
    pub mgmt_class: u8,
    pub class_version: u8,
    pub method: u8,
    pub status: u16,
    pub tid: u64,
    pub attr_id: u16,
    pub attr_mod: u32,
}

/// Addressing a datagram carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddrInfo {
    pub sl: u8,
    pub slid: Lid,
    pub dlid: Lid,
    pub pkey: u16,
    pub src_qp: u32,
    pub dest_qp: u32,
    pub qkey: u32,
}

/// A management datagram.
#[derive(Clone, PartialEq, Eq)]
pub struct Mad {
    pub kind: MadKind,
    pub base: MadHeader,
    pub addr: AddrInfo,
    pub data: [u8; MAX_PAYLOAD],
    /// Number of meaningful bytes in `data`.
    pub datasize: usize,
}

impl Default for Mad {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Mad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mad")
            .field("kind", &self.kind)
            .field("base", &self.base)
            .field("addr", &self.addr)
            .field("datasize", &self.datasize)
            .finish()
    }
}

impl Mad {
    /// An all-zero datagram.
    pub const fn new() -> Self {
        Self {
            kind: MadKind::External,
            base: MadHeader {
                base_version: 0,
                mgmt_class: 0,
                class_version: 0,
                method: 0,
                status: 0,
                tid: 0,
                attr_id: 0,
                attr_mod: 0,
            },
            addr: AddrInfo {
                sl: 0,
                slid: 0,
                dlid: 0,
                pkey: 0,
                src_qp: 0,
                dest_qp: 0,
                qkey: 0,
            },
            data: [0; MAX_PAYLOAD],
            datasize: 0,
        }
    }

    /// Reinitialize as a PM request with an empty payload.
    pub fn init_pm_request(&mut self, method: u8, attr_id: u16, attr_mod: u32, tid: u64) {
        self.kind = MadKind::External;
        self.base = MadHeader {
            base_version: STL_BASE_VERSION,
            mgmt_class: MCLASS_PERF,
            class_version: PM_CLASS_VERSION,
            method,
            status: status::SUCCESS,
            tid,
            attr_id,
            attr_mod,
        };
        self.data.fill(0);
        self.datasize = 0;
    }

    /// Turn a received request into its response, swapping the addressing.
    /// The payload is left for the caller to fill.
    pub fn make_response(&mut self, status: u16) {
        self.base.method = method::GET_RESP;
        self.base.status = status;
        std::mem::swap(&mut self.addr.slid, &mut self.addr.dlid);
        std::mem::swap(&mut self.addr.src_qp, &mut self.addr.dest_qp);
    }

    /// Whether the header matches the performance-management class.
    #[inline]
    pub fn is_pm(&self) -> bool {
        self.base.base_version == STL_BASE_VERSION
            && self.base.class_version == PM_CLASS_VERSION
            && self.base.mgmt_class == MCLASS_PERF
    }

    /// Meaningful payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.datasize.min(MAX_PAYLOAD)]
    }

    /// Zero everything.
    pub fn clear(&mut self) {
        self.kind = MadKind::External;
        self.base = MadHeader::default();
        self.addr = AddrInfo::default();
        self.data.fill(0);
        self.datasize = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pm_request_header() {
        let mut mad = Mad::new();
        mad.data[0] = 0xaa;
        mad.datasize = 10;
        mad.init_pm_request(method::GET, attr::DATA_PORT_COUNTERS, 3 << 24, 42);
        assert!(mad.is_pm());
        assert_eq!(mad.base.attr_mod, 3 << 24);
        assert_eq!(mad.base.tid, 42);
        assert_eq!(mad.datasize, 0);
        assert_eq!(mad.data[0], 0);
    }

    #[test]
    fn test_make_response_swaps_lids() {
        let mut mad = Mad::new();
        mad.addr.slid = 1;
        mad.addr.dlid = 7;
        mad.make_response(status::BUSY);
        assert_eq!(mad.addr.slid, 7);
        assert_eq!(mad.addr.dlid, 1);
        assert_eq!(mad.base.method, method::GET_RESP);
        assert_eq!(mad.base.status, status::BUSY);
    }
}
