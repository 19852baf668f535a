//! The device/LID graph a sweep walks.
//!
//! The fabric is owned by the dispatcher for the duration of a sweep. Every
//! device records its PMA addressing, its cached ClassPortInfo and one
//! [`Port`] per port number; ports hold the counter image the response
//! handlers fill in plus the image of the previous sweep.

pub mod counters;

use self::counters::PortImage;
use crate::mad::{Lid, MGMT_PKEY};

/// Index of a device in a [`Fabric`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub usize);

/// Kind of a fabric device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A switch. Port 0 is the management port; ports `1..=num_ports` are
    /// external.
    Switch,
    /// A host fabric interface with a single port.
    Hfi,
}

/// Outcome of a port's queries this sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub enum QueryStatus {
    #[default]
    Ok,
    /// A counter query got no usable response.
    FailQuery,
    /// A clear got no usable response.
    FailClear,
    /// The port was not queried.
    Skip,
}

/// Where PM requests for a device are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmaAddress {
    pub sl: u8,
    pub pkey: u16,
    pub qpn: u32,
    pub qkey: u32,
}

impl Default for PmaAddress {
    fn default() -> Self {
        Self {
            sl: 0,
            pkey: MGMT_PKEY,
            qpn: 1,
            qkey: 0x8001_0000,
        }
    }
}

/// PMA capabilities learned from ClassPortInfo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PmaClassInfo {
    pub base_version: u8,
    pub class_version: u8,
    pub cap_mask: u16,
    pub resp_time_value: u8,
}

/// A port of a device.
#[derive(Debug, Clone)]
pub struct Port {
    pub num: u8,
    pub active: bool,
    /// VLs this port reports on.
    pub vl_select: u32,
    pub image: Box<PortImage>,
    /// Image as of the end of the previous sweep, if that sweep got data.
    pub prev: Option<Box<PortImage>>,
}

impl Port {
    pub fn new(num: u8, active: bool, vl_select: u32) -> Self {
        Self {
            num,
            active,
            vl_select,
            image: Box::default(),
            prev: None,
        }
    }
}

/// A fabric device.
#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub guid: u64,
    pub lid: Lid,
    pub kind: NodeKind,
    /// The device has no queryable PMA.
    pub pma_avoid: bool,
    pub addr: PmaAddress,
    pub class_info: Option<PmaClassInfo>,
    /// Ports indexed by port number.
    pub ports: Vec<Option<Port>>,
}

impl Device {
    /// A switch with ports `0..=num_ports`, all active.
    pub fn switch(name: impl Into<String>, guid: u64, lid: Lid, num_ports: u8, vl_select: u32) -> Self {
        let ports = (0..=num_ports)
            .map(|p| Some(Port::new(p, true, vl_select)))
            .collect();
        Self {
            name: name.into(),
            guid,
            lid,
            kind: NodeKind::Switch,
            pma_avoid: false,
            addr: PmaAddress::default(),
            class_info: None,
            ports,
        }
    }

    /// An HFI whose single port is `port`.
    pub fn hfi(name: impl Into<String>, guid: u64, lid: Lid, port: u8, vl_select: u32) -> Self {
        let mut ports = vec![None; port as usize + 1];
        ports[port as usize] = Some(Port::new(port, true, vl_select));
        Self {
            name: name.into(),
            guid,
            lid,
            kind: NodeKind::Hfi,
            pma_avoid: false,
            addr: PmaAddress::default(),
            class_info: None,
            ports,
        }
    }

    #[inline]
    pub fn is_switch(&self) -> bool {
        self.kind == NodeKind::Switch
    }

    /// Highest port number.
    #[inline]
    pub fn num_ports(&self) -> u8 {
        self.ports.len().saturating_sub(1) as u8
    }

    #[inline]
    pub fn port(&self, num: u8) -> Option<&Port> {
        self.ports.get(num as usize).and_then(Option::as_ref)
    }

    #[inline]
    pub fn port_mut(&mut self, num: u8) -> Option<&mut Port> {
        self.ports.get_mut(num as usize).and_then(Option::as_mut)
    }

    /// Present ports, ascending.
    pub fn present_ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter().flatten()
    }
}

/// The device graph with its lid map.
#[derive(Debug, Clone, Default)]
pub struct Fabric {
    devices: Vec<Device>,
    lid_map: Vec<Option<DeviceId>>,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device. A device already mapped at the same lid is shadowed.
    pub fn add(&mut self, device: Device) -> DeviceId {
        let id = DeviceId(self.devices.len());
        let lid = device.lid as usize;
        if self.lid_map.len() <= lid {
            self.lid_map.resize(lid + 1, None);
        }
        self.lid_map[lid] = Some(id);
        self.devices.push(device);
        id
    }

    #[inline]
    pub fn lookup(&self, lid: Lid) -> Option<DeviceId> {
        self.lid_map.get(lid as usize).copied().flatten()
    }

    /// Highest lid with a device.
    pub fn max_lid(&self) -> Lid {
        self.lid_map
            .iter()
            .rposition(Option::is_some)
            .unwrap_or(0) as Lid
    }

    #[inline]
    pub fn device(&self, id: DeviceId) -> &Device {
        &self.devices[id.0]
    }

    #[inline]
    pub fn device_mut(&mut self, id: DeviceId) -> &mut Device {
        &mut self.devices[id.0]
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Rotate port images ahead of a sweep.
    ///
    /// Ports that got data last sweep have their image copied into `prev`;
    /// others lose their previous image. Per-sweep flags are reset, counter
    /// values are kept.
    pub fn begin_sweep(&mut self) {
        for port in self.devices.iter_mut().flat_map(|d| d.ports.iter_mut().flatten()) {
            if port.image.got_data {
                match port.prev.as_mut() {
                    Some(prev) => prev.clone_from(&port.image),
                    None => port.prev = Some(port.image.clone()),
                }
            } else {
                port.prev = None;
            }
            port.image.reset_flags();
        }
    }
}
