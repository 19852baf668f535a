//! Sweep dispatcher.
//!
//! A sweep walks every lid of the [`Fabric`] in ascending order and runs each
//! device through its query phases: ClassPortInfo (once per device), then
//! data counters, then error counters for the ports whose data asked for
//! them, then clears for the ports the [`Tabulator`] picked.
//!
//! At most `max_parallel_nodes` devices are in flight at once and each of
//! them has at most `pma_batch_size` packets outstanding. Everything is
//! driven from the context pool's completion callbacks: a response advances
//! its node, and a finished node immediately pulls the next device into its
//! slot. [`Dispatcher::done_event`] is posted exactly once per sweep, when
//! the last node completes.

mod node;
pub mod packet;
pub mod port;
pub mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use self::node::NodeState;
pub use self::packet::{DispatchPacket, Fill, Merge, Phase, ResponseError};
pub use self::port::{PortDescriptor, PortFlags};
pub use self::stats::*;

use self::node::{Dispatch, DispatchNode};
use crate::config::PmConfig;
use crate::context::{Completion, ContextError, EntryId, PoolCore, Status};
use crate::fabric::{Device, DeviceId, Fabric, PmaClassInfo, Port, QueryStatus};
use crate::mad::wire::{ClassPortInfo, Reader};
use crate::mad::{attr, status, Lid, Mad, TidAllocator};
use crate::transport::Transport;
use crate::utils::event::Event;

/// Completion tag of dispatcher requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// ClassPortInfo of the node in `slot`.
    Node { slot: u16 },
    /// Packet `packet` of the node in `slot`.
    Packet { slot: u16, packet: u16 },
}

/// Decides which counters of a port to clear once its queries are done.
pub trait Tabulator {
    /// Counter-select mask to clear on `port`, zero for none.
    fn tabulate(&mut self, device: &Device, port: &Port) -> u32;
}

/// Never clears anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoClear;

impl Tabulator for NoClear {
    #[inline]
    fn tabulate(&mut self, _: &Device, _: &Port) -> u32 {
        0
    }
}

impl<F> Tabulator for F
where
    F: FnMut(&Device, &Port) -> u32,
{
    #[inline]
    fn tabulate(&mut self, device: &Device, port: &Port) -> u32 {
        self(device, port)
    }
}

/// Allocate a hashed entry for `mad`, bind `tag` and send it. The entry is
/// retired again if anything fails.
fn send_request<T: Transport>(pool: &mut PoolCore<T, Tag>, mad: &Mad, tag: Tag) -> Result<EntryId, ContextError> {
    let id = pool.get(Some(mad), false)?;
    let sent = pool.set_callback(id, Some(tag)).and_then(|()| pool.send(id));
    if let Err(err) = sent {
        if let Err(e) = pool.retire(id) {
            log::error!("madsweep: cannot retire context entry {}: {}", id, e);
        }
        return Err(err);
    }
    Ok(id)
}

/// The sweep state machine. Used as the completion handler of a
/// [`ContextPool`](crate::context::ContextPool).
pub struct Dispatcher<B> {
    cfg: PmConfig,
    fabric: Fabric,
    tabulator: B,

    nodes: Box<[DispatchNode]>,
    next_lid: Lid,
    outstanding_nodes: usize,
    posted: bool,
    done: Arc<Event>,
    shutdown: Arc<AtomicBool>,

    tids: TidAllocator,
    scratch: Box<Mad>,

    counters: PmCounters,
    summary: SweepSummary,
    round_trips: RoundTrips,
}

impl<B: Tabulator> Dispatcher<B> {
    pub fn new(cfg: PmConfig, fabric: Fabric, tabulator: B) -> Self {
        let nodes = (0..cfg.max_parallel_nodes)
            .map(|_| DispatchNode::new(cfg.pma_batch_size))
            .collect();
        Self {
            nodes,
            next_lid: 1,
            outstanding_nodes: 0,
            posted: false,
            done: Arc::new(Event::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            tids: TidAllocator::new(),
            scratch: Box::new(Mad::new()),
            counters: PmCounters::default(),
            summary: SweepSummary::default(),
            round_trips: RoundTrips::default(),
            cfg,
            fabric,
            tabulator,
        }
    }

    #[inline]
    pub fn config(&self) -> &PmConfig {
        &self.cfg
    }

    #[inline]
    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    /// The fabric, for updates between sweeps.
    #[inline]
    pub fn fabric_mut(&mut self) -> &mut Fabric {
        &mut self.fabric
    }

    #[inline]
    pub fn tabulator_mut(&mut self) -> &mut B {
        &mut self.tabulator
    }

    #[inline]
    pub fn counters(&self) -> &PmCounters {
        &self.counters
    }

    /// Summary of the current or last sweep.
    #[inline]
    pub fn summary(&self) -> &SweepSummary {
        &self.summary
    }

    #[inline]
    pub fn round_trips(&self) -> &RoundTrips {
        &self.round_trips
    }

    #[inline]
    pub fn outstanding_nodes(&self) -> usize {
        self.outstanding_nodes
    }

    /// Whether a sweep has started and not yet signalled completion.
    #[inline]
    pub fn is_sweeping(&self) -> bool {
        !self.posted && self.counters.sweeps > 0
    }

    /// Event posted once when a sweep completes.
    pub fn done_event(&self) -> Arc<Event> {
        self.done.clone()
    }

    /// Flag that stops the sweep from starting new work once set.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Count a PM response seen by the receive path.
    pub fn record_response(&mut self, mad: &Mad) {
        self.counters.rx_get_resp += 1;
        self.counters.rx_status.record(mad.base.status);
    }

    /// Begin a sweep, filling every node slot.
    ///
    /// Returns `false` without doing anything if the previous sweep is still
    /// in flight. The done event may already be posted when this returns.
    pub fn start_sweep<T: Transport>(&mut self, pool: &mut PoolCore<T, Tag>) -> bool {
        if self.is_sweeping() {
            log::warn!(
                "madsweep: sweep {} still has {} nodes in flight",
                self.counters.sweeps,
                self.outstanding_nodes
            );
            return false;
        }

        self.fabric.begin_sweep();
        self.counters.sweeps += 1;
        self.summary = SweepSummary::default();
        self.next_lid = 1;
        self.outstanding_nodes = 0;
        self.posted = false;
        self.done.reset();
        log::info!(
            "madsweep: starting sweep {} of {} devices, max lid {:#x}",
            self.counters.sweeps,
            self.fabric.len(),
            self.fabric.max_lid()
        );

        for slot in 0..self.nodes.len() {
            if !self.next_node(pool, slot) {
                break;
            }
        }
        if self.outstanding_nodes == 0 {
            self.post_done();
        }
        true
    }

    /// Put the next eligible device into `slot`. Returns whether one is in
    /// flight there.
    fn next_node<T: Transport>(&mut self, pool: &mut PoolCore<T, Tag>, slot: usize) -> bool {
        let started = loop {
            if self.is_shutdown() {
                log::info!("madsweep: engine shutdown requested, not starting more nodes");
                break false;
            }
            if self.next_lid > self.fabric.max_lid() {
                break false;
            }
            let lid = self.next_lid;
            self.next_lid += 1;

            let Some(id) = self.fabric.lookup(lid) else {
                continue;
            };
            if self.fabric.device(id).pma_avoid {
                self.skip_device(id);
                continue;
            }
            if self.dispatch_node(pool, slot, id) {
                break true;
            }
        };

        if !started && self.outstanding_nodes == 0 {
            self.post_done();
        }
        started
    }

    fn dispatch_node<T: Transport>(&mut self, pool: &mut PoolCore<T, Tag>, slot: usize, id: DeviceId) -> bool {
        self.nodes[slot].start(id);
        self.outstanding_nodes += 1;
        self.summary.nodes_started += 1;
        self.summary.peak_parallel_nodes = self
            .summary
            .peak_parallel_nodes
            .max(self.outstanding_nodes as u64);
        self.node_next_step(pool, slot)
    }

    fn skip_device(&mut self, id: DeviceId) {
        let device = self.fabric.device_mut(id);
        log::debug!("madsweep: skipping {} lid {:#x}", device.name, device.lid);
        for port in device.ports.iter_mut().flatten() {
            port.image.query_status = QueryStatus::Skip;
            self.summary.skipped_ports += 1;
        }
        self.summary.skipped_nodes += 1;
    }

    fn post_done(&mut self) {
        if self.posted {
            return;
        }
        self.posted = true;
        self.summary.completion_signals += 1;
        log::debug!(
            "madsweep: sweep {} done, {} nodes",
            self.counters.sweeps,
            self.summary.nodes_done
        );
        self.done.post();
    }

    fn node_callback<T: Transport>(
        &mut self,
        pool: &mut PoolCore<T, Tag>,
        entry: EntryId,
        slot: usize,
        st: Status,
        mad: Option<&Mad>,
    ) {
        if let Err(err) = pool.retire(entry) {
            log::error!("madsweep: cannot retire context entry {}: {}", entry, err);
        }
        let Some(node) = self.nodes.get(slot) else {
            log::warn!("madsweep: completion for unknown node slot {}", slot);
            return;
        };
        let (Some(id), NodeState::ClassInfo) = (node.device, node.state) else {
            log::debug!("madsweep: stale ClassPortInfo completion in slot {}", slot);
            return;
        };
        let sent_at = node.sent_at;

        match class_info_of(st, mad) {
            Ok(info) => {
                if let Some(sent) = sent_at {
                    self.round_trips
                        .class_port_info
                        .record(pool.now().saturating_duration_since(sent));
                }
                self.fabric.device_mut(id).class_info = Some(info);
                if self.node_next_step(pool, slot) {
                    return;
                }
            }
            Err(err) => {
                let device = self.fabric.device(id);
                log::warn!(
                    "madsweep: Get(ClassPortInfo) of {} guid {:#018x} lid {:#x} failed: {}",
                    device.name,
                    device.guid,
                    device.lid,
                    err
                );
                self.fail_node(slot);
            }
        }
        self.next_node(pool, slot);
    }

    fn packet_callback<T: Transport>(
        &mut self,
        pool: &mut PoolCore<T, Tag>,
        entry: EntryId,
        slot: usize,
        pkt: usize,
        st: Status,
        mad: Option<&Mad>,
    ) {
        if let Err(err) = pool.retire(entry) {
            log::error!("madsweep: cannot retire context entry {}: {}", entry, err);
        }
        let Some(node) = self.nodes.get_mut(slot) else {
            log::warn!("madsweep: completion for unknown node slot {}", slot);
            return;
        };
        let (Some(id), Some(phase)) = (node.device, node.state.phase()) else {
            log::debug!("madsweep: stale packet completion in slot {}", slot);
            return;
        };
        if node.packets.get(pkt).map_or(true, DispatchPacket::is_empty) {
            log::debug!("madsweep: stale packet completion in slot {}", slot);
            return;
        }
        if st == Status::Ok {
            if let Some(sent) = node.packets[pkt].sent_at {
                self.round_trips
                    .phase_mut(phase)
                    .record(pool.now().saturating_duration_since(sent));
            }
        }

        let DispatchNode { ports, packets, .. } = node;
        let packet = &packets[pkt];
        let device = self.fabric.device_mut(id);
        match packet.accept_response(ports, phase, device, st, mad) {
            Ok(need_error) => {
                self.nodes[slot].need_error |= need_error;
                self.packet_done(slot, pkt);
            }
            Err(err) => {
                log::warn!(
                    "madsweep: {:?} of {} ports on {} guid {:#018x} lid {:#x} failed: {}",
                    phase,
                    packet.len(),
                    device.name,
                    device.guid,
                    device.lid,
                    err
                );
                let isolate = self.cfg.isolate_failed_ports
                    && packet.len() > 1
                    && phase != Phase::ClearPortStatus
                    && !matches!(err, ResponseError::NoResponse(_));
                if isolate {
                    self.isolate_packet(slot, pkt);
                } else {
                    self.fail_packet(slot, pkt, phase);
                }
            }
        }

        loop {
            match self.dispatch_next_packet(pool, slot, pkt) {
                Dispatch::Sent => return,
                Dispatch::Failed => continue,
                Dispatch::NoPort | Dispatch::Shutdown => break,
            }
        }
        if self.nodes[slot].outstanding_packets > 0 {
            return;
        }
        if self.node_next_step(pool, slot) {
            return;
        }
        self.next_node(pool, slot);
    }
}

/// Validate a ClassPortInfo response.
fn class_info_of(st: Status, mad: Option<&Mad>) -> Result<PmaClassInfo, ResponseError> {
    let mad = match (st, mad) {
        (Status::Ok, Some(mad)) => mad,
        _ => return Err(ResponseError::NoResponse(st)),
    };
    if mad.base.status != status::SUCCESS {
        return Err(ResponseError::MadStatus(mad.base.status));
    }
    if mad.base.attr_id != attr::CLASS_PORT_INFO {
        return Err(ResponseError::WrongAttr(mad.base.attr_id));
    }
    let info = ClassPortInfo::decode(&mut Reader::new(mad.payload()))?;
    Ok(PmaClassInfo {
        base_version: info.base_version,
        class_version: info.class_version,
        cap_mask: info.cap_mask,
        resp_time_value: info.resp_time_value,
    })
}

impl<T: Transport, B: Tabulator> Completion<T> for Dispatcher<B> {
    type Tag = Tag;

    fn complete(
        &mut self,
        pool: &mut PoolCore<T, Tag>,
        entry: EntryId,
        tag: Tag,
        status: Status,
        mad: Option<&Mad>,
    ) {
        match tag {
            Tag::Node { slot } => self.node_callback(pool, entry, slot as usize, status, mad),
            Tag::Packet { slot, packet } => {
                self.packet_callback(pool, entry, slot as usize, packet as usize, status, mad)
            }
        }
    }
}
