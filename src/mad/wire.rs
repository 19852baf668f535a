//! Explicit big-endian packing of PM attribute bodies.
//!
//! Nothing here relies on in-memory struct layout: every field is written
//! and read through [`Writer`]/[`Reader`] at a known offset. Sizes of the
//! variable-length responses are exposed so the dispatcher can plan packets
//! without building them.

use thiserror::Error;

use crate::fabric::counters::*;

/// Size of a PortSelectMask on the wire.
pub const PORT_SELECT_SIZE: usize = 32;

/// DataPortCounters / ErrorPortCounters request, and their response header.
pub const COUNTERS_QUERY_SIZE: usize = PORT_SELECT_SIZE + 8;
/// ClearPortStatus request and response.
pub const CLEAR_PORT_STATUS_SIZE: usize = PORT_SELECT_SIZE + 4;
/// PortStatus request.
pub const PORT_STATUS_REQ_SIZE: usize = 8;
/// ClassPortInfo response.
pub const CLASS_PORT_INFO_SIZE: usize = 80;

pub const DATA_PORT_BASE: usize = 136;
pub const DATA_PORT_VL: usize = 104;
pub const ERROR_PORT_BASE: usize = 96;
pub const ERROR_PORT_VL: usize = 8;
pub const PORT_STATUS_BASE: usize = 216;
pub const PORT_STATUS_VL: usize = 112;

/// Bytes one port occupies in a DataPortCounters response.
#[inline]
pub const fn data_port_size(num_vls: usize) -> usize {
    DATA_PORT_BASE + DATA_PORT_VL * num_vls
}

/// Bytes one port occupies in an ErrorPortCounters response.
#[inline]
pub const fn error_port_size(num_vls: usize) -> usize {
    ERROR_PORT_BASE + ERROR_PORT_VL * num_vls
}

/// Bytes of a PortStatus response.
#[inline]
pub const fn port_status_size(num_vls: usize) -> usize {
    PORT_STATUS_BASE + PORT_STATUS_VL * num_vls
}

/// VL indices selected by a mask, ascending.
pub fn selected_vls(vl_select: u32) -> impl Iterator<Item = usize> {
    (0..MAX_VLS).filter(move |vl| vl_select >> vl & 1 == 1)
}

/// Wire (de)serialization error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    /// The buffer ended before the field did.
    #[error("truncated payload: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
}

/// Sequential big-endian writer over a byte buffer.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes written so far.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    fn reserve(&mut self, n: usize) -> Result<&mut [u8], WireError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(WireError::Truncated {
                need: end,
                have: self.buf.len(),
            });
        }
        let slice = &mut self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn put_u8(&mut self, v: u8) -> Result<(), WireError> {
        self.reserve(1)?[0] = v;
        Ok(())
    }

    pub fn put_u16(&mut self, v: u16) -> Result<(), WireError> {
        self.reserve(2)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn put_u32(&mut self, v: u32) -> Result<(), WireError> {
        self.reserve(4)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    pub fn put_u64(&mut self, v: u64) -> Result<(), WireError> {
        self.reserve(8)?.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    /// Write `n` zero bytes.
    pub fn zero(&mut self, n: usize) -> Result<(), WireError> {
        self.reserve(n)?.fill(0);
        Ok(())
    }
}

/// Sequential big-endian reader over a byte buffer.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let end = self.pos + N;
        if end > self.buf.len() {
            return Err(WireError::Truncated {
                need: end,
                have: self.buf.len(),
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.take()?))
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.take()?))
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_be_bytes(self.take()?))
    }

    pub fn skip(&mut self, n: usize) -> Result<(), WireError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(WireError::Truncated {
                need: end,
                have: self.buf.len(),
            });
        }
        self.pos = end;
        Ok(())
    }
}

/// 256-bit mask of port numbers.
///
/// Word 3 holds ports 0-63, word 0 holds ports 192-255; the words go on the
/// wire in index order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PortSelectMask(pub [u64; 4]);

impl PortSelectMask {
    pub const fn new() -> Self {
        Self([0; 4])
    }

    #[inline]
    const fn locate(port: u8) -> (usize, u32) {
        let port = port as usize;
        (3 - port / 64, (port % 64) as u32)
    }

    pub fn single(port: u8) -> Self {
        let mut mask = Self::new();
        mask.set(port);
        mask
    }

    pub fn set(&mut self, port: u8) {
        let (word, bit) = Self::locate(port);
        self.0[word] |= 1u64 << bit;
    }

    pub fn contains(&self, port: u8) -> bool {
        let (word, bit) = Self::locate(port);
        self.0[word] >> bit & 1 == 1
    }

    pub fn clear(&mut self) {
        self.0 = [0; 4];
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    pub fn count(&self) -> u32 {
        self.0.iter().map(|w| w.count_ones()).sum()
    }

    /// Selected ports, ascending.
    pub fn ports(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=u8::MAX).filter(move |p| self.contains(*p))
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), WireError> {
        for word in self.0 {
            w.put_u64(word)?;
        }
        Ok(())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let mut mask = Self::new();
        for word in mask.0.iter_mut() {
            *word = r.get_u64()?;
        }
        Ok(mask)
    }
}

/// Body of DataPortCounters and ErrorPortCounters requests. Responses echo it
/// as their header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersQuery {
    pub port_select: PortSelectMask,
    pub vl_select: u32,
    /// Resolution word of DataPortCounters, reserved for ErrorPortCounters.
    pub res: u32,
}

impl CountersQuery {
    /// A DataPortCounters query. Resolutions are 4-bit right-shift counts
    /// the agent applies before folding counters into the error summary.
    pub fn data(port_select: PortSelectMask, vl_select: u32, lli_res: u8, ler_res: u8) -> Self {
        Self {
            port_select,
            vl_select,
            res: ((lli_res as u32 & 0xf) << 4) | (ler_res as u32 & 0xf),
        }
    }

    pub fn error(port_select: PortSelectMask, vl_select: u32) -> Self {
        Self {
            port_select,
            vl_select,
            res: 0,
        }
    }

    #[inline]
    pub fn lli_resolution(&self) -> u8 {
        (self.res >> 4 & 0xf) as u8
    }

    #[inline]
    pub fn ler_resolution(&self) -> u8 {
        (self.res & 0xf) as u8
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), WireError> {
        self.port_select.encode(w)?;
        w.put_u32(self.vl_select)?;
        w.put_u32(self.res)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            port_select: PortSelectMask::decode(r)?,
            vl_select: r.get_u32()?,
            res: r.get_u32()?,
        })
    }
}

/// Body of a ClearPortStatus request and response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearPortStatus {
    pub port_select: PortSelectMask,
    pub counter_select: u32,
}

impl ClearPortStatus {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), WireError> {
        self.port_select.encode(w)?;
        w.put_u32(self.counter_select)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            port_select: PortSelectMask::decode(r)?,
            counter_select: r.get_u32()?,
        })
    }
}

/// Body of a PortStatus request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStatusReq {
    pub port: u8,
    pub vl_select: u32,
}

impl PortStatusReq {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), WireError> {
        w.put_u8(self.port)?;
        w.zero(3)?;
        w.put_u32(self.vl_select)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let port = r.get_u8()?;
        r.skip(3)?;
        Ok(Self {
            port,
            vl_select: r.get_u32()?,
        })
    }
}

/// The parts of a PMA ClassPortInfo the sweep cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassPortInfo {
    pub base_version: u8,
    pub class_version: u8,
    pub cap_mask: u16,
    /// 27-bit extended capability mask.
    pub cap_mask2: u32,
    /// 5-bit response time value.
    pub resp_time_value: u8,
}

impl ClassPortInfo {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), WireError> {
        w.put_u8(self.base_version)?;
        w.put_u8(self.class_version)?;
        w.put_u16(self.cap_mask)?;
        w.put_u32((self.cap_mask2 & 0x07ff_ffff) << 5 | (self.resp_time_value as u32 & 0x1f))?;
        w.zero(CLASS_PORT_INFO_SIZE - 8)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let base_version = r.get_u8()?;
        let class_version = r.get_u8()?;
        let cap_mask = r.get_u16()?;
        let word = r.get_u32()?;
        Ok(Self {
            base_version,
            class_version,
            cap_mask,
            cap_mask2: word >> 5,
            resp_time_value: (word & 0x1f) as u8,
        })
    }
}

/// Port number of the `index`-th port block of a multi-port response.
pub fn port_number_at(buf: &[u8], header: usize, block: usize, index: usize) -> Result<u8, WireError> {
    let at = header + block * index;
    buf.get(at).copied().ok_or(WireError::Truncated {
        need: at + 1,
        have: buf.len(),
    })
}

/// Write one port block of a DataPortCounters response.
pub fn write_data_port(
    w: &mut Writer<'_>,
    port: u8,
    c: &PortCounters,
    vls: &[VlCounters; MAX_VLS],
    vl_select: u32,
) -> Result<(), WireError> {
    w.put_u8(port)?;
    w.zero(3)?;
    w.put_u32(c.link_quality_indicator as u32 & 0x7)?;
    for v in c.data_fields() {
        w.put_u64(v)?;
    }
    w.put_u64(c.error_counter_summary)?;
    for vl in selected_vls(vl_select) {
        for v in vls[vl].data_fields() {
            w.put_u64(v)?;
        }
    }
    Ok(())
}

/// Read one port block of a DataPortCounters response. Returns its port
/// number.
pub fn read_data_port(
    r: &mut Reader<'_>,
    vl_select: u32,
    c: &mut PortCounters,
    vls: &mut [VlCounters; MAX_VLS],
) -> Result<u8, WireError> {
    let port = r.get_u8()?;
    r.skip(3)?;
    c.link_quality_indicator = (r.get_u32()? & 0x7) as u8;
    for f in c.data_fields_mut() {
        *f = r.get_u64()?;
    }
    c.error_counter_summary = r.get_u64()?;
    for vl in selected_vls(vl_select) {
        for f in vls[vl].data_fields_mut() {
            *f = r.get_u64()?;
        }
    }
    Ok(port)
}

/// Write one port block of an ErrorPortCounters response.
pub fn write_error_port(
    w: &mut Writer<'_>,
    port: u8,
    c: &PortCounters,
    vls: &[VlCounters; MAX_VLS],
    vl_select: u32,
) -> Result<(), WireError> {
    w.put_u8(port)?;
    w.zero(7)?;
    for v in c.error_fields() {
        w.put_u64(v)?;
    }
    w.put_u32(c.link_error_recovery)?;
    w.put_u32(c.link_downed)?;
    w.put_u8(c.uncorrectable_errors)?;
    w.zero(7)?;
    for vl in selected_vls(vl_select) {
        w.put_u64(vls[vl].xmit_discards)?;
    }
    Ok(())
}

/// Read one port block of an ErrorPortCounters response. Returns its port
/// number.
pub fn read_error_port(
    r: &mut Reader<'_>,
    vl_select: u32,
    c: &mut PortCounters,
    vls: &mut [VlCounters; MAX_VLS],
) -> Result<u8, WireError> {
    let port = r.get_u8()?;
    r.skip(7)?;
    for f in c.error_fields_mut() {
        *f = r.get_u64()?;
    }
    c.link_error_recovery = r.get_u32()?;
    c.link_downed = r.get_u32()?;
    c.uncorrectable_errors = r.get_u8()?;
    r.skip(7)?;
    for vl in selected_vls(vl_select) {
        vls[vl].xmit_discards = r.get_u64()?;
    }
    Ok(port)
}

/// Write a PortStatus response body.
pub fn write_port_status(
    w: &mut Writer<'_>,
    port: u8,
    vl_select: u32,
    c: &PortCounters,
    vls: &[VlCounters; MAX_VLS],
) -> Result<(), WireError> {
    w.put_u8(port)?;
    w.zero(3)?;
    w.put_u32(vl_select)?;
    for v in c.data_fields() {
        w.put_u64(v)?;
    }
    for v in c.error_fields() {
        w.put_u64(v)?;
    }
    w.put_u32(c.link_error_recovery)?;
    w.put_u32(c.link_downed)?;
    w.put_u8(c.uncorrectable_errors)?;
    w.put_u8(c.link_quality_indicator & 0x7)?;
    w.zero(6)?;
    for vl in selected_vls(vl_select) {
        for v in vls[vl].data_fields() {
            w.put_u64(v)?;
        }
        w.put_u64(vls[vl].xmit_discards)?;
    }
    Ok(())
}

/// Read a PortStatus response body. Returns the echoed port number and VL
/// mask.
pub fn read_port_status(
    r: &mut Reader<'_>,
    c: &mut PortCounters,
    vls: &mut [VlCounters; MAX_VLS],
) -> Result<(u8, u32), WireError> {
    let port = r.get_u8()?;
    r.skip(3)?;
    let vl_select = r.get_u32()?;
    for f in c.data_fields_mut() {
        *f = r.get_u64()?;
    }
    for f in c.error_fields_mut() {
        *f = r.get_u64()?;
    }
    c.link_error_recovery = r.get_u32()?;
    c.link_downed = r.get_u32()?;
    c.uncorrectable_errors = r.get_u8()?;
    c.link_quality_indicator = r.get_u8()? & 0x7;
    r.skip(6)?;
    for vl in selected_vls(vl_select) {
        for f in vls[vl].data_fields_mut() {
            *f = r.get_u64()?;
        }
        vls[vl].xmit_discards = r.get_u64()?;
    }
    Ok((port, vl_select))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mad::MAX_PAYLOAD;

    #[test]
    fn test_port_select_layout() {
        let mut mask = PortSelectMask::new();
        mask.set(0);
        mask.set(65);
        mask.set(255);
        assert_eq!(mask.0[3], 1);
        assert_eq!(mask.0[2], 1 << 1);
        assert_eq!(mask.0[0], 1 << 63);
        assert_eq!(mask.count(), 3);
        assert_eq!(mask.ports().collect::<Vec<_>>(), vec![0, 65, 255]);

        let mut buf = [0u8; PORT_SELECT_SIZE];
        mask.encode(&mut Writer::new(&mut buf)).unwrap();
        // Word 0 goes first, big-endian.
        assert_eq!(buf[0], 0x80);
        assert_eq!(buf[31], 0x01);
    }

    #[test]
    fn test_resolution_packing() {
        let q = CountersQuery::data(PortSelectMask::single(1), 0x8001, 0xa, 0x3);
        assert_eq!(q.res, 0xa3);
        assert_eq!(q.lli_resolution(), 0xa);
        assert_eq!(q.ler_resolution(), 0x3);

        let mut buf = [0u8; COUNTERS_QUERY_SIZE];
        let mut w = Writer::new(&mut buf);
        q.encode(&mut w).unwrap();
        assert_eq!(w.position(), COUNTERS_QUERY_SIZE);
        assert_eq!(&buf[32..36], &[0x00, 0x00, 0x80, 0x01]);
        assert_eq!(buf[39], 0xa3);
    }

    #[test]
    fn test_block_sizes_match_layout() {
        let c = PortCounters::default();
        let vls = [VlCounters::default(); MAX_VLS];
        let mut buf = [0u8; MAX_PAYLOAD * 2];

        for mask in [0u32, 0x8001, 0x800f] {
            let n = mask.count_ones() as usize;

            let mut w = Writer::new(&mut buf);
            write_data_port(&mut w, 1, &c, &vls, mask).unwrap();
            assert_eq!(w.position(), data_port_size(n));

            let mut w = Writer::new(&mut buf);
            write_error_port(&mut w, 1, &c, &vls, mask).unwrap();
            assert_eq!(w.position(), error_port_size(n));

            let mut w = Writer::new(&mut buf);
            write_port_status(&mut w, 1, mask, &c, &vls).unwrap();
            assert_eq!(w.position(), port_status_size(n));
        }
    }

    #[test]
    fn test_data_port_counters_vl_placement() {
        let mut c = PortCounters::default();
        c.rcv_data = 77;
        c.error_counter_summary = 3;
        c.link_quality_indicator = 5;
        let mut vls = [VlCounters::default(); MAX_VLS];
        vls[15].xmit_pkts = 9;

        let mut buf = [0u8; 512];
        write_data_port(&mut Writer::new(&mut buf), 4, &c, &vls, 1 << 15).unwrap();

        let mut out = PortCounters::default();
        let mut out_vls = [VlCounters::default(); MAX_VLS];
        let port = read_data_port(&mut Reader::new(&buf), 1 << 15, &mut out, &mut out_vls).unwrap();
        assert_eq!(port, 4);
        assert_eq!(out.rcv_data, 77);
        assert_eq!(out.error_counter_summary, 3);
        assert_eq!(out.link_quality_indicator, 5);
        assert_eq!(out_vls[15].xmit_pkts, 9);
        assert_eq!(out_vls[0], VlCounters::default());
    }

    #[test]
    fn test_truncated_read() {
        let buf = [0u8; 10];
        let mut r = Reader::new(&buf);
        assert_eq!(
            PortSelectMask::decode(&mut r),
            Err(WireError::Truncated { need: 16, have: 10 })
        );
        assert!(port_number_at(&buf, 40, 136, 0).is_err());
    }

    #[test]
    fn test_class_port_info_fields() {
        let info = ClassPortInfo {
            base_version: 0x80,
            class_version: 0x80,
            cap_mask: 0x0100,
            cap_mask2: 0x12345,
            resp_time_value: 18,
        };
        let mut buf = [0u8; CLASS_PORT_INFO_SIZE];
        info.encode(&mut Writer::new(&mut buf)).unwrap();
        assert_eq!(ClassPortInfo::decode(&mut Reader::new(&buf)).unwrap(), info);
    }
}
