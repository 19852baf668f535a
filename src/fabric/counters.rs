//! Counter storage filled in by the response handlers.
//!
//! The layouts follow the PortStatus response: fifteen data counters, nine
//! error counters and a handful of narrow fields per port, fourteen counters
//! per VL. DataPortCounters and ErrorPortCounters responses each carry a
//! subset of these.

use super::QueryStatus;

/// Maximum number of VLs a port reports on.
pub const MAX_VLS: usize = 32;

/// Number of per-port data counters.
pub const PORT_DATA_FIELDS: usize = 15;
/// Number of per-port 64-bit error counters.
pub const PORT_ERROR_FIELDS: usize = 9;
/// Number of per-VL counters carried by DataPortCounters.
pub const VL_DATA_FIELDS: usize = 13;

/// Point-in-time counters of one port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortCounters {
    pub xmit_data: u64,
    pub rcv_data: u64,
    pub xmit_pkts: u64,
    pub rcv_pkts: u64,
    pub multicast_xmit_pkts: u64,
    pub multicast_rcv_pkts: u64,
    pub xmit_wait: u64,
    pub sw_port_congestion: u64,
    pub rcv_fecn: u64,
    pub rcv_becn: u64,
    pub xmit_time_cong: u64,
    pub xmit_wasted_bw: u64,
    pub xmit_wait_data: u64,
    pub rcv_bubble: u64,
    pub mark_fecn: u64,

    pub rcv_constraint_errors: u64,
    pub rcv_switch_relay_errors: u64,
    pub xmit_discards: u64,
    pub xmit_constraint_errors: u64,
    pub rcv_remote_physical_errors: u64,
    pub local_link_integrity_errors: u64,
    pub rcv_errors: u64,
    pub excessive_buffer_overruns: u64,
    pub fm_config_errors: u64,

    pub link_error_recovery: u32,
    pub link_downed: u32,
    pub uncorrectable_errors: u8,
    /// 3-bit link quality indicator.
    pub link_quality_indicator: u8,

    /// Weighted error summary as reported by DataPortCounters.
    pub error_counter_summary: u64,
}

impl PortCounters {
    /// Data counters in wire order.
    pub fn data_fields_mut(&mut self) -> [&mut u64; PORT_DATA_FIELDS] {
        [
            &mut self.xmit_data,
            &mut self.rcv_data,
            &mut self.xmit_pkts,
            &mut self.rcv_pkts,
            &mut self.multicast_xmit_pkts,
            &mut self.multicast_rcv_pkts,
            &mut self.xmit_wait,
            &mut self.sw_port_congestion,
            &mut self.rcv_fecn,
            &mut self.rcv_becn,
            &mut self.xmit_time_cong,
            &mut self.xmit_wasted_bw,
            &mut self.xmit_wait_data,
            &mut self.rcv_bubble,
            &mut self.mark_fecn,
        ]
    }

    pub fn data_fields(&self) -> [u64; PORT_DATA_FIELDS] {
        [
            self.xmit_data,
            self.rcv_data,
            self.xmit_pkts,
            self.rcv_pkts,
            self.multicast_xmit_pkts,
            self.multicast_rcv_pkts,
            self.xmit_wait,
            self.sw_port_congestion,
            self.rcv_fecn,
            self.rcv_becn,
            self.xmit_time_cong,
            self.xmit_wasted_bw,
            self.xmit_wait_data,
            self.rcv_bubble,
            self.mark_fecn,
        ]
    }

    /// 64-bit error counters in wire order.
    pub fn error_fields_mut(&mut self) -> [&mut u64; PORT_ERROR_FIELDS] {
        [
            &mut self.rcv_constraint_errors,
            &mut self.rcv_switch_relay_errors,
            &mut self.xmit_discards,
            &mut self.xmit_constraint_errors,
            &mut self.rcv_remote_physical_errors,
            &mut self.local_link_integrity_errors,
            &mut self.rcv_errors,
            &mut self.excessive_buffer_overruns,
            &mut self.fm_config_errors,
        ]
    }

    pub fn error_fields(&self) -> [u64; PORT_ERROR_FIELDS] {
        [
            self.rcv_constraint_errors,
            self.rcv_switch_relay_errors,
            self.xmit_discards,
            self.xmit_constraint_errors,
            self.rcv_remote_physical_errors,
            self.local_link_integrity_errors,
            self.rcv_errors,
            self.excessive_buffer_overruns,
            self.fm_config_errors,
        ]
    }
}

/// Point-in-time counters of one VL of a port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VlCounters {
    pub xmit_data: u64,
    pub rcv_data: u64,
    pub xmit_pkts: u64,
    pub rcv_pkts: u64,
    pub xmit_wait: u64,
    pub sw_port_congestion: u64,
    pub rcv_fecn: u64,
    pub rcv_becn: u64,
    pub xmit_time_cong: u64,
    pub xmit_wasted_bw: u64,
    pub xmit_wait_data: u64,
    pub rcv_bubble: u64,
    pub mark_fecn: u64,
    pub xmit_discards: u64,
}

impl VlCounters {
    /// Data counters in wire order (everything but `xmit_discards`).
    pub fn data_fields_mut(&mut self) -> [&mut u64; VL_DATA_FIELDS] {
        [
            &mut self.xmit_data,
            &mut self.rcv_data,
            &mut self.xmit_pkts,
            &mut self.rcv_pkts,
            &mut self.xmit_wait,
            &mut self.sw_port_congestion,
            &mut self.rcv_fecn,
            &mut self.rcv_becn,
            &mut self.xmit_time_cong,
            &mut self.xmit_wasted_bw,
            &mut self.xmit_wait_data,
            &mut self.rcv_bubble,
            &mut self.mark_fecn,
        ]
    }

    pub fn data_fields(&self) -> [u64; VL_DATA_FIELDS] {
        [
            self.xmit_data,
            self.rcv_data,
            self.xmit_pkts,
            self.rcv_pkts,
            self.xmit_wait,
            self.sw_port_congestion,
            self.rcv_fecn,
            self.rcv_becn,
            self.xmit_time_cong,
            self.xmit_wasted_bw,
            self.xmit_wait_data,
            self.rcv_bubble,
            self.mark_fecn,
        ]
    }
}

/// Everything a sweep records about one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortImage {
    pub counters: PortCounters,
    pub vl_counters: [VlCounters; MAX_VLS],

    /// Data counters were filled in this sweep.
    pub got_data: bool,
    /// Error counters were filled in this sweep.
    pub got_error: bool,
    /// A requested clear was acknowledged this sweep.
    pub cleared: bool,
    pub query_status: QueryStatus,
    /// Counter-select mask to clear, as decided by tabulation.
    pub clear_select: u32,
}

impl Default for PortImage {
    fn default() -> Self {
        Self {
            counters: PortCounters::default(),
            vl_counters: [VlCounters::default(); MAX_VLS],
            got_data: false,
            got_error: false,
            cleared: false,
            query_status: QueryStatus::Ok,
            clear_select: 0,
        }
    }
}

impl PortImage {
    /// Reset per-sweep state. Counter values are kept.
    pub fn reset_flags(&mut self) {
        self.got_data = false;
        self.got_error = false;
        self.cleared = false;
        self.query_status = QueryStatus::Ok;
        self.clear_select = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_views_agree() {
        let mut c = PortCounters::default();
        for (i, f) in c.data_fields_mut().into_iter().enumerate() {
            *f = i as u64 + 1;
        }
        assert_eq!(c.xmit_data, 1);
        assert_eq!(c.mark_fecn, 15);
        assert_eq!(c.data_fields()[14], 15);

        let mut v = VlCounters::default();
        *v.data_fields_mut()[12] = 9;
        assert_eq!(v.mark_fecn, 9);
        assert_eq!(v.xmit_discards, 0);
    }

    #[test]
    fn test_reset_keeps_values() {
        let mut image = PortImage::default();
        image.counters.rcv_errors = 5;
        image.got_data = true;
        image.query_status = QueryStatus::FailQuery;
        image.reset_flags();
        assert_eq!(image.counters.rcv_errors, 5);
        assert!(!image.got_data);
        assert_eq!(image.query_status, QueryStatus::Ok);
    }
}
