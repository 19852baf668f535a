//! Dispatcher packets.
//!
//! A [`DispatchPacket`] groups ports of one node into a single request of the
//! node's current phase. Ports are merged greedily off the sorted descriptor
//! array; a packet never plans more bytes than the transport's payload
//! ceiling.

use quanta::Instant;
use thiserror::Error;

use super::port::{PortDescriptor, PortFlags};
use crate::config::PmConfig;
use crate::context::Status;
use crate::fabric::{Device, NodeKind};
use crate::mad::wire::*;
use crate::mad::{attr, method, status, Mad};

/// A phase of a node that sends packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    DataCounters,
    ErrorCounters,
    ClearPortStatus,
}

/// Fixed bytes of a response, before the port blocks.
pub fn header_size(phase: Phase, kind: NodeKind) -> usize {
    match (phase, kind) {
        (Phase::DataCounters, NodeKind::Hfi) => 0,
        (Phase::DataCounters, NodeKind::Switch) | (Phase::ErrorCounters, _) => COUNTERS_QUERY_SIZE,
        (Phase::ClearPortStatus, _) => CLEAR_PORT_STATUS_SIZE,
    }
}

/// Bytes one port adds to a response carrying `num_vls` VLs.
pub fn port_size(phase: Phase, kind: NodeKind, num_vls: usize) -> usize {
    match (phase, kind) {
        (Phase::DataCounters, NodeKind::Hfi) => port_status_size(num_vls),
        (Phase::DataCounters, NodeKind::Switch) => data_port_size(num_vls),
        (Phase::ErrorCounters, _) => error_port_size(num_vls),
        (Phase::ClearPortStatus, _) => 0,
    }
}

/// Attribute a phase queries.
pub fn attr_of(phase: Phase, kind: NodeKind) -> u16 {
    match (phase, kind) {
        (Phase::DataCounters, NodeKind::Hfi) => attr::PORT_STATUS,
        (Phase::DataCounters, NodeKind::Switch) => attr::DATA_PORT_COUNTERS,
        (Phase::ErrorCounters, _) => attr::ERROR_PORT_COUNTERS,
        (Phase::ClearPortStatus, _) => attr::CLEAR_PORT_STATUS,
    }
}

/// Outcome of offering one port to a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    /// The port was added; more may follow.
    Continue,
    /// The port was passed over.
    NoMerge,
    /// The packet takes no more ports.
    Full,
    /// The port does not fit even an empty packet.
    Oversized,
}

/// Outcome of filling a packet off a descriptor array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// The packet holds ports and is ready to send.
    Ready,
    /// No undispatched port is left.
    Empty,
    /// The descriptor at this index can never be sent.
    Oversized(usize),
}

/// Why a response was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResponseError {
    #[error("no response ({0:?})")]
    NoResponse(Status),

    #[error("mad status {0:#06x}")]
    MadStatus(u16),

    #[error("unexpected attribute {0:#x}")]
    WrongAttr(u16),

    /// The port or VL selection was not echoed back.
    #[error("selection mismatch")]
    WrongSelect,

    #[error("port {found} where {expected} was expected")]
    WrongPort { expected: u8, found: u8 },

    #[error("port {0} is not present")]
    UnknownPort(u8),

    #[error("malformed response")]
    Wire(#[from] WireError),
}

/// One request's worth of ports.
#[derive(Debug, Clone)]
pub struct DispatchPacket {
    /// Indices into the node's descriptor array.
    ports: Vec<usize>,
    port_select: PortSelectMask,
    vl_select: u32,
    num_vls: u8,
    clear_select: u32,
    pub(super) sent_at: Option<Instant>,
}

impl DispatchPacket {
    /// Most ports a packet can name.
    pub const MAX_PORTS: usize = 256;

    pub fn new() -> Self {
        Self {
            ports: Vec::with_capacity(Self::MAX_PORTS),
            port_select: PortSelectMask::new(),
            vl_select: 0,
            num_vls: 0,
            clear_select: 0,
            sent_at: None,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Descriptor indices of the ports in this packet.
    #[inline]
    pub fn ports(&self) -> &[usize] {
        &self.ports
    }

    #[inline]
    pub fn port_select(&self) -> &PortSelectMask {
        &self.port_select
    }

    #[inline]
    pub fn vl_select(&self) -> u32 {
        self.vl_select
    }

    #[inline]
    pub fn num_vls(&self) -> u8 {
        self.num_vls
    }

    /// Empty the packet. Capacity is kept.
    pub fn clear(&mut self) {
        self.ports.clear();
        self.port_select.clear();
        self.vl_select = 0;
        self.num_vls = 0;
        self.clear_select = 0;
        self.sent_at = None;
    }

    /// Bytes the response to this packet occupies.
    pub fn wire_size(&self, phase: Phase, kind: NodeKind) -> usize {
        header_size(phase, kind) + port_size(phase, kind, self.num_vls as usize) * self.ports.len()
    }

    fn push(&mut self, index: usize, desc: &mut PortDescriptor) {
        if self.ports.is_empty() {
            self.vl_select = desc.vl_select;
            self.num_vls = desc.num_vls;
            self.clear_select = desc.clear_select;
        }
        self.ports.push(index);
        self.port_select.set(desc.port_num);
        desc.flags.insert(PortFlags::IS_DISPATCHED);
    }

    /// Offer the descriptor at `index` to this packet.
    ///
    /// A port is added only while the space left after the ports already in
    /// the packet is strictly greater than one more port. Query phases take
    /// ports whose VL mask is a subset of the packet's; the clear phase takes
    /// ports with the same counter select.
    pub fn merge(
        &mut self,
        index: usize,
        desc: &mut PortDescriptor,
        phase: Phase,
        kind: NodeKind,
        max_payload: usize,
    ) -> Merge {
        if desc.is_dispatched() {
            return Merge::NoMerge;
        }
        let num_vls = if self.is_empty() {
            desc.num_vls
        } else {
            self.num_vls
        };
        let size = port_size(phase, kind, num_vls as usize);
        let remaining = max_payload
            .saturating_sub(header_size(phase, kind))
            .saturating_sub(size * self.ports.len());
        if remaining <= size {
            return if self.is_empty() {
                Merge::Oversized
            } else {
                Merge::Full
            };
        }

        if desc.flags.contains(PortFlags::DO_NOT_MERGE) {
            if !self.is_empty() {
                return Merge::NoMerge;
            }
            self.push(index, desc);
            return Merge::Full;
        }
        // HFI PortStatus names a single port.
        if kind == NodeKind::Hfi && phase == Phase::DataCounters && !self.is_empty() {
            return Merge::Full;
        }

        if !self.is_empty() {
            let compatible = match phase {
                Phase::ClearPortStatus => desc.clear_select == self.clear_select,
                _ => desc.vl_select | self.vl_select == self.vl_select,
            };
            if !compatible {
                return Merge::NoMerge;
            }
        }
        self.push(index, desc);
        Merge::Continue
    }

    /// Fill this packet by scanning `ports` from the top. The scan stops at
    /// the first skipped descriptor.
    pub fn fill(&mut self, ports: &mut [PortDescriptor], phase: Phase, kind: NodeKind, max_payload: usize) -> Fill {
        for (i, desc) in ports.iter_mut().enumerate() {
            if desc.is_skipped() {
                break;
            }
            match self.merge(i, desc, phase, kind, max_payload) {
                Merge::Continue | Merge::NoMerge => {}
                Merge::Full => return Fill::Ready,
                Merge::Oversized => return Fill::Oversized(i),
            }
        }
        if self.is_empty() {
            Fill::Empty
        } else {
            Fill::Ready
        }
    }

    /// Put the ports in ascending port order, the order responses carry them.
    pub fn sort_by_port(&mut self, ports: &[PortDescriptor]) {
        self.ports.sort_unstable_by_key(|&i| ports[i].port_num);
    }

    /// Build the request of this packet into `mad`. Addressing is left to the
    /// caller.
    pub fn build_request(
        &self,
        mad: &mut Mad,
        ports: &[PortDescriptor],
        phase: Phase,
        kind: NodeKind,
        cfg: &PmConfig,
        tid: u64,
    ) -> Result<(), WireError> {
        let n = self.ports.len() as u32;
        let attr_id = attr_of(phase, kind);
        match (phase, kind) {
            (Phase::DataCounters, NodeKind::Hfi) => {
                mad.init_pm_request(method::GET, attr_id, 1 << 24, tid);
                let req = PortStatusReq {
                    port: ports[self.ports[0]].port_num,
                    vl_select: self.vl_select,
                };
                req.encode(&mut Writer::new(&mut mad.data))?;
                mad.datasize = PORT_STATUS_REQ_SIZE;
            }
            (Phase::DataCounters, NodeKind::Switch) => {
                mad.init_pm_request(method::GET, attr_id, n << 24, tid);
                let req = CountersQuery::data(
                    self.port_select,
                    self.vl_select,
                    cfg.lli_resolution,
                    cfg.ler_resolution,
                );
                req.encode(&mut Writer::new(&mut mad.data))?;
                mad.datasize = COUNTERS_QUERY_SIZE;
            }
            (Phase::ErrorCounters, _) => {
                mad.init_pm_request(method::GET, attr_id, n << 24, tid);
                let req = CountersQuery::error(self.port_select, self.vl_select);
                req.encode(&mut Writer::new(&mut mad.data))?;
                mad.datasize = COUNTERS_QUERY_SIZE;
            }
            (Phase::ClearPortStatus, _) => {
                mad.init_pm_request(method::SET, attr_id, 1 << 24, tid);
                let req = ClearPortStatus {
                    port_select: self.port_select,
                    counter_select: self.clear_select,
                };
                req.encode(&mut Writer::new(&mut mad.data))?;
                mad.datasize = CLEAR_PORT_STATUS_SIZE;
            }
        }
        Ok(())
    }

    /// Validate a response to this packet and copy its counters into the
    /// device's port images.
    ///
    /// Nothing is written unless the whole response is valid. Returns whether
    /// any port now needs its error counters queried.
    pub fn accept_response(
        &self,
        ports: &mut [PortDescriptor],
        phase: Phase,
        device: &mut Device,
        st: Status,
        mad: Option<&Mad>,
    ) -> Result<bool, ResponseError> {
        let mad = match (st, mad) {
            (Status::Ok, Some(mad)) => mad,
            _ => return Err(ResponseError::NoResponse(st)),
        };
        if mad.base.status != status::SUCCESS {
            return Err(ResponseError::MadStatus(mad.base.status));
        }
        let kind = device.kind;
        if mad.base.attr_id != attr_of(phase, kind) {
            return Err(ResponseError::WrongAttr(mad.base.attr_id));
        }
        let payload = mad.payload();

        match (phase, kind) {
            (Phase::DataCounters, NodeKind::Hfi) => {
                let expected = ports[self.ports[0]].port_num;
                let found = port_number_at(payload, 0, 0, 0)?;
                if found != expected {
                    return Err(ResponseError::WrongPort { expected, found });
                }
                let mut r = Reader::new(payload);
                r.skip(4)?;
                let vl_select = r.get_u32()?;
                let need = port_status_size(vl_select.count_ones() as usize);
                if payload.len() < need {
                    return Err(WireError::Truncated {
                        need,
                        have: payload.len(),
                    }
                    .into());
                }
                let port = device
                    .port_mut(expected)
                    .ok_or(ResponseError::UnknownPort(expected))?;
                let image = &mut port.image;
                read_port_status(&mut Reader::new(payload), &mut image.counters, &mut image.vl_counters)?;
                image.got_data = true;
                image.got_error = true;
                Ok(false)
            }
            (Phase::DataCounters, NodeKind::Switch) | (Phase::ErrorCounters, _) => {
                let echo = CountersQuery::decode(&mut Reader::new(payload))?;
                if echo.port_select != self.port_select || echo.vl_select != self.vl_select {
                    return Err(ResponseError::WrongSelect);
                }
                let block = port_size(phase, kind, self.vl_select.count_ones() as usize);
                let need = COUNTERS_QUERY_SIZE + block * self.ports.len();
                if payload.len() < need {
                    return Err(WireError::Truncated {
                        need,
                        have: payload.len(),
                    }
                    .into());
                }
                for (k, &i) in self.ports.iter().enumerate() {
                    let expected = ports[i].port_num;
                    let found = port_number_at(payload, COUNTERS_QUERY_SIZE, block, k)?;
                    if found != expected {
                        return Err(ResponseError::WrongPort { expected, found });
                    }
                    if device.port(expected).is_none() {
                        return Err(ResponseError::UnknownPort(expected));
                    }
                }

                let mut need_error = false;
                for (k, &i) in self.ports.iter().enumerate() {
                    let desc = &mut ports[i];
                    let Some(port) = device.port_mut(desc.port_num) else {
                        continue;
                    };
                    let at = COUNTERS_QUERY_SIZE + block * k;
                    let mut r = Reader::new(&payload[at..at + block]);
                    let image = &mut port.image;
                    if phase == Phase::DataCounters {
                        read_data_port(&mut r, self.vl_select, &mut image.counters, &mut image.vl_counters)?;
                        image.got_data = true;
                        let summary = image.counters.error_counter_summary;
                        let needs = match &port.prev {
                            Some(prev) => prev.counters.error_counter_summary != summary,
                            None => summary != 0,
                        };
                        if needs {
                            desc.flags.insert(PortFlags::NEEDS_ERROR);
                            need_error = true;
                        }
                    } else {
                        read_error_port(&mut r, self.vl_select, &mut image.counters, &mut image.vl_counters)?;
                        image.got_error = true;
                    }
                }
                Ok(need_error)
            }
            (Phase::ClearPortStatus, _) => {
                let echo = ClearPortStatus::decode(&mut Reader::new(payload))?;
                if echo.port_select != self.port_select || echo.counter_select != self.clear_select {
                    return Err(ResponseError::WrongSelect);
                }
                for &i in &self.ports {
                    if let Some(port) = device.port_mut(ports[i].port_num) {
                        port.image.cleared = true;
                    }
                }
                Ok(false)
            }
        }
    }
}

impl Default for DispatchPacket {
    fn default() -> Self {
        Self::new()
    }
}
