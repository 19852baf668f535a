//! Per-device state machine.
//!
//! A node walks `None -> ClassInfo -> GetDataCounters -> [GetErrorCounters]
//! -> [ClearPortStatus] -> Done`. Each step either puts work in flight and
//! returns, or falls through to the next state in the same call.

use quanta::Instant;

use super::packet::{DispatchPacket, Fill, Phase};
use super::port::{clear_order, data_order, error_order, PortDescriptor, PortFlags};
use super::{send_request, Dispatcher, Tabulator, Tag};
use crate::context::PoolCore;
use crate::fabric::{Device, DeviceId, NodeKind, Port, QueryStatus};
use crate::mad::{attr, method, Mad, MAX_PAYLOAD};
use crate::transport::Transport;

/// State of a dispatcher node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NodeState {
    #[default]
    None,
    ClassInfo,
    GetDataCounters,
    GetErrorCounters,
    ClearPortStatus,
    Done,
}

impl NodeState {
    /// The packet phase of this state, if it sends packets.
    pub fn phase(self) -> Option<Phase> {
        match self {
            NodeState::GetDataCounters => Some(Phase::DataCounters),
            NodeState::GetErrorCounters => Some(Phase::ErrorCounters),
            NodeState::ClearPortStatus => Some(Phase::ClearPortStatus),
            _ => None,
        }
    }
}

/// Result of trying to put one more packet in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Dispatch {
    Sent,
    /// Every port of the phase is dispatched.
    NoPort,
    /// A packet was built but failed before it was in flight.
    Failed,
    Shutdown,
}

/// One parallel slot of the dispatcher.
#[derive(Debug)]
pub(super) struct DispatchNode {
    pub(super) device: Option<DeviceId>,
    pub(super) state: NodeState,
    pub(super) outstanding_packets: usize,
    pub(super) ports: Vec<PortDescriptor>,
    pub(super) packets: Box<[DispatchPacket]>,
    pub(super) failed: bool,
    pub(super) need_error: bool,
    pub(super) need_clear_some: bool,
    pub(super) sent_at: Option<Instant>,
}

impl DispatchNode {
    pub(super) fn new(batch: usize) -> Self {
        Self {
            device: None,
            state: NodeState::None,
            outstanding_packets: 0,
            ports: Vec::with_capacity(DispatchPacket::MAX_PORTS),
            packets: (0..batch).map(|_| DispatchPacket::new()).collect(),
            failed: false,
            need_error: false,
            need_clear_some: false,
            sent_at: None,
        }
    }

    /// Take a device into this slot.
    pub(super) fn start(&mut self, device: DeviceId) {
        self.device = Some(device);
        self.state = NodeState::None;
        self.outstanding_packets = 0;
        self.ports.clear();
        for packet in self.packets.iter_mut() {
            packet.clear();
        }
        self.failed = false;
        self.need_error = false;
        self.need_clear_some = false;
        self.sent_at = None;
    }

    #[inline]
    pub(super) fn is_active(&self) -> bool {
        self.device.is_some() && self.state != NodeState::Done
    }
}

/// Stamp PMA addressing into a request.
pub(super) fn address(mad: &mut Mad, device: &Device, slid: u32) {
    mad.addr.sl = device.addr.sl;
    mad.addr.slid = slid;
    mad.addr.dlid = device.lid;
    mad.addr.pkey = device.addr.pkey;
    mad.addr.src_qp = 1;
    mad.addr.dest_qp = device.addr.qpn;
    mad.addr.qkey = device.addr.qkey;
}

/// Mark a port's query as failed. Returns whether it was not failed before.
pub(super) fn fail_image(port: &mut Port, status: QueryStatus) -> bool {
    if port.image.query_status != QueryStatus::Ok {
        return false;
    }
    port.image.query_status = status;
    true
}

impl<B: Tabulator> Dispatcher<B> {
    /// Advance a node until work is in flight or it is done.
    ///
    /// Returns `true` if the node has requests in flight; otherwise the node
    /// has been completed with [`node_done`](Self::node_done).
    pub(super) fn node_next_step<T: Transport>(&mut self, pool: &mut PoolCore<T, Tag>, slot: usize) -> bool {
        loop {
            let node = &mut self.nodes[slot];
            let Some(id) = node.device else {
                return false;
            };
            let state = node.state;
            log::trace!(
                "madsweep: node lid {:#x} in state {:?}",
                self.fabric.device(id).lid,
                state
            );

            match state {
                NodeState::None => {
                    node.state = NodeState::ClassInfo;
                    if self.fabric.device(id).class_info.is_none() {
                        return self.send_class_port_info(pool, slot);
                    }
                }
                NodeState::ClassInfo => {
                    node.state = NodeState::GetDataCounters;
                    self.enter_data_counters(slot);
                    if self.start_sweep_all_ports(pool, slot) > 0 {
                        return true;
                    }
                }
                NodeState::GetDataCounters => {
                    node.state = NodeState::GetErrorCounters;
                    if node.need_error && self.fabric.device(id).is_switch() {
                        self.enter_error_counters(slot);
                        if self.start_sweep_all_ports(pool, slot) > 0 {
                            return true;
                        }
                    }
                }
                NodeState::GetErrorCounters => {
                    node.state = NodeState::ClearPortStatus;
                    self.tabulate(slot);
                    if self.nodes[slot].need_clear_some {
                        self.enter_clear(slot);
                        if self.start_sweep_all_ports(pool, slot) > 0 {
                            return true;
                        }
                    }
                }
                NodeState::ClearPortStatus => {
                    self.node_done(slot);
                    return false;
                }
                NodeState::Done => return false,
            }
        }
    }

    fn send_class_port_info<T: Transport>(&mut self, pool: &mut PoolCore<T, Tag>, slot: usize) -> bool {
        let Some(id) = self.nodes[slot].device else {
            return false;
        };
        let device = self.fabric.device(id);
        let tid = self.tids.next_tid();
        self.scratch
            .init_pm_request(method::GET, attr::CLASS_PORT_INFO, 0, tid);
        address(&mut self.scratch, device, self.cfg.pm_slid);
        self.counters.get_class_port_info += 1;

        let tag = Tag::Node { slot: slot as u16 };
        match send_request(pool, &self.scratch, tag) {
            Ok(_) => {
                self.nodes[slot].sent_at = Some(pool.now());
                true
            }
            Err(err) => {
                log::warn!(
                    "madsweep: unable to send Get(ClassPortInfo) to {} guid {:#018x} lid {:#x}: {}",
                    device.name,
                    device.guid,
                    device.lid,
                    err
                );
                self.fail_node(slot);
                false
            }
        }
    }

    /// Build this sweep's descriptors and order them for the data phase.
    fn enter_data_counters(&mut self, slot: usize) {
        let node = &mut self.nodes[slot];
        let Some(id) = node.device else {
            return;
        };
        let device = self.fabric.device(id);
        let port_nums = if device.is_switch() {
            0..=device.num_ports()
        } else {
            let num = device.present_ports().next().map_or(0, |p| p.num);
            num..=num
        };

        node.ports.clear();
        for num in port_nums {
            let desc = match device.port(num) {
                Some(port) if port.active => {
                    let vl_select = if self.cfg.process_vl_counters {
                        port.vl_select
                    } else {
                        0
                    };
                    let mut desc = PortDescriptor::new(port.num, vl_select);
                    if self.cfg.no_merge {
                        desc.flags.insert(PortFlags::DO_NOT_MERGE);
                    }
                    desc
                }
                _ => PortDescriptor::skipped(),
            };
            node.ports.push(desc);
        }
        node.ports.sort_unstable_by(data_order);
    }

    fn enter_error_counters(&mut self, slot: usize) {
        let ports = &mut self.nodes[slot].ports;
        ports.sort_unstable_by(error_order);
        for desc in ports.iter_mut().take_while(|d| d.needs_error()) {
            desc.flags.remove(PortFlags::IS_DISPATCHED);
        }
    }

    fn enter_clear(&mut self, slot: usize) {
        let ports = &mut self.nodes[slot].ports;
        ports.sort_unstable_by(clear_order);
        for desc in ports.iter_mut().take_while(|d| d.needs_clear()) {
            desc.flags.remove(PortFlags::IS_DISPATCHED);
        }
    }

    /// Ask the tabulator which ports need a clear.
    fn tabulate(&mut self, slot: usize) {
        let node = &mut self.nodes[slot];
        node.need_clear_some = false;
        let Some(id) = node.device else {
            return;
        };

        for desc in node.ports.iter_mut() {
            if desc.is_skipped() {
                break;
            }
            let device = self.fabric.device(id);
            let select = match device.port(desc.port_num) {
                Some(port) if port.image.query_status == QueryStatus::Ok => {
                    self.tabulator.tabulate(device, port)
                }
                _ => 0,
            };
            if select == 0 {
                continue;
            }
            desc.flags.insert(PortFlags::NEEDS_CLEAR);
            desc.clear_select = select;
            node.need_clear_some = true;
            if let Some(port) = self.fabric.device_mut(id).port_mut(desc.port_num) {
                port.image.clear_select = select;
            }
        }
    }

    /// Put up to a batch of packets in flight. Returns how many are.
    pub(super) fn start_sweep_all_ports<T: Transport>(&mut self, pool: &mut PoolCore<T, Tag>, slot: usize) -> usize {
        let batch = self.nodes[slot].packets.len();
        let mut sent = 0;
        while sent < batch {
            match self.dispatch_next_packet(pool, slot, sent) {
                Dispatch::Sent => sent += 1,
                Dispatch::NoPort => return sent,
                // The failed packet's ports are resolved; try the next ones.
                Dispatch::Failed => {}
                Dispatch::Shutdown => break,
            }
        }
        sent
    }

    /// Fill packet slot `pkt` of a node and send it.
    pub(super) fn dispatch_next_packet<T: Transport>(
        &mut self,
        pool: &mut PoolCore<T, Tag>,
        slot: usize,
        pkt: usize,
    ) -> Dispatch {
        if self.is_shutdown() {
            log::info!("madsweep: engine shutdown requested");
            self.nodes[slot].need_clear_some = false;
            return Dispatch::Shutdown;
        }
        let max_payload = pool.transport().max_payload().min(MAX_PAYLOAD);

        loop {
            let node = &mut self.nodes[slot];
            let (Some(id), Some(phase)) = (node.device, node.state.phase()) else {
                return Dispatch::NoPort;
            };
            let device = self.fabric.device(id);
            let DispatchNode { ports, packets, .. } = node;

            match packets[pkt].fill(ports, phase, device.kind, max_payload) {
                Fill::Empty => return Dispatch::NoPort,
                Fill::Ready => return self.send_packet(pool, slot, pkt, phase),
                Fill::Oversized(i) => {
                    let desc = &mut ports[i];
                    desc.flags.insert(PortFlags::IS_DISPATCHED);
                    log::error!(
                        "madsweep: {:?} of port {} on {} lid {:#x} exceeds {} bytes",
                        phase,
                        desc.port_num,
                        device.name,
                        device.lid,
                        max_payload
                    );
                    let port_num = desc.port_num;
                    self.nodes[slot].failed = true;
                    self.fail_port(id, port_num, phase);
                }
            }
        }
    }

    fn send_packet<T: Transport>(
        &mut self,
        pool: &mut PoolCore<T, Tag>,
        slot: usize,
        pkt: usize,
        phase: Phase,
    ) -> Dispatch {
        let node = &mut self.nodes[slot];
        let Some(id) = node.device else {
            return Dispatch::NoPort;
        };
        node.outstanding_packets += 1;
        let device = self.fabric.device(id);
        let kind = device.kind;
        let DispatchNode { ports, packets, .. } = node;
        let packet = &mut packets[pkt];
        if phase != Phase::ClearPortStatus {
            packet.sort_by_port(ports);
        }

        let tid = self.tids.next_tid();
        if let Err(err) = packet.build_request(&mut self.scratch, ports, phase, kind, &self.cfg, tid) {
            log::error!(
                "madsweep: cannot build {:?} request for {} lid {:#x}: {}",
                phase,
                device.name,
                device.lid,
                err
            );
            self.fail_packet(slot, pkt, phase);
            return Dispatch::Failed;
        }
        address(&mut self.scratch, device, self.cfg.pm_slid);
        match (phase, kind) {
            (Phase::DataCounters, NodeKind::Hfi) => self.counters.get_port_status += 1,
            (Phase::DataCounters, NodeKind::Switch) => self.counters.get_data_port_counters += 1,
            (Phase::ErrorCounters, _) => self.counters.get_error_port_counters += 1,
            (Phase::ClearPortStatus, _) => self.counters.set_clear_port_status += 1,
        }
        log::debug!(
            "madsweep: {:?} of {} ports on {} lid {:#x}, vl select {:#010x}",
            phase,
            packet.len(),
            device.name,
            device.lid,
            packet.vl_select()
        );

        let tag = Tag::Packet {
            slot: slot as u16,
            packet: pkt as u16,
        };
        match send_request(pool, &self.scratch, tag) {
            Ok(_) => {
                packet.sent_at = Some(pool.now());
                Dispatch::Sent
            }
            Err(err) => {
                log::warn!(
                    "madsweep: unable to send {:?} to {} guid {:#018x} lid {:#x}: {}",
                    phase,
                    device.name,
                    device.guid,
                    device.lid,
                    err
                );
                self.fail_packet(slot, pkt, phase);
                Dispatch::Failed
            }
        }
    }

    fn fail_port(&mut self, id: DeviceId, port_num: u8, phase: Phase) {
        let status = match phase {
            Phase::ClearPortStatus => QueryStatus::FailClear,
            _ => QueryStatus::FailQuery,
        };
        if let Some(port) = self.fabric.device_mut(id).port_mut(port_num) {
            if fail_image(port, status) {
                self.summary.no_resp_ports += 1;
                self.counters.no_resp_ports += 1;
            }
        }
    }

    /// Fail every port of a packet and retire the packet.
    pub(super) fn fail_packet(&mut self, slot: usize, pkt: usize, phase: Phase) {
        let status = match phase {
            Phase::ClearPortStatus => QueryStatus::FailClear,
            _ => QueryStatus::FailQuery,
        };
        let node = &mut self.nodes[slot];
        node.failed = true;
        if let Some(id) = node.device {
            let device = self.fabric.device_mut(id);
            for &i in node.packets[pkt].ports() {
                let Some(port) = device.port_mut(node.ports[i].port_num) else {
                    continue;
                };
                if fail_image(port, status) {
                    self.summary.no_resp_ports += 1;
                    self.counters.no_resp_ports += 1;
                }
            }
        }
        self.packet_done(slot, pkt);
    }

    /// Return a failed packet's ports to the phase, each to be sent alone.
    pub(super) fn isolate_packet(&mut self, slot: usize, pkt: usize) {
        let DispatchNode { ports, packets, .. } = &mut self.nodes[slot];
        let packet = &packets[pkt];
        for &i in packet.ports() {
            ports[i].flags.remove(PortFlags::IS_DISPATCHED);
            ports[i].flags.insert(PortFlags::DO_NOT_MERGE);
        }
        self.summary.isolated_ports += packet.len() as u64;
        self.packet_done(slot, pkt);
    }

    pub(super) fn packet_done(&mut self, slot: usize, pkt: usize) {
        let node = &mut self.nodes[slot];
        node.outstanding_packets = node.outstanding_packets.saturating_sub(1);
        node.packets[pkt].clear();
    }

    /// Fail every port of a node and complete it.
    pub(super) fn fail_node(&mut self, slot: usize) {
        let node = &mut self.nodes[slot];
        node.failed = true;
        if let Some(id) = node.device {
            for port in self.fabric.device_mut(id).ports.iter_mut().flatten() {
                if fail_image(port, QueryStatus::FailQuery) {
                    self.summary.no_resp_ports += 1;
                    self.counters.no_resp_ports += 1;
                }
            }
        }
        self.node_done(slot);
    }

    /// Complete a node and free its slot.
    pub(super) fn node_done(&mut self, slot: usize) {
        let node = &mut self.nodes[slot];
        if node.state == NodeState::Done {
            return;
        }
        if node.failed {
            self.summary.no_resp_nodes += 1;
            self.counters.no_resp_nodes += 1;
        }
        node.state = NodeState::Done;
        node.outstanding_packets = 0;
        node.ports.clear();
        for packet in node.packets.iter_mut() {
            packet.clear();
        }
        self.outstanding_nodes = self.outstanding_nodes.saturating_sub(1);
        self.summary.nodes_done += 1;
        if let Some(id) = node.device {
            let device = self.fabric.device(id);
            log::debug!(
                "madsweep: done with {} lid {:#x}{}",
                device.name,
                device.lid,
                if node.failed { ", with failures" } else { "" }
            );
        }
    }
}
