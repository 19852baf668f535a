//! Sweep counters.
//!
//! Everything here is plain data updated under the pool lock and rendered by
//! whoever reports on the sweep. All types are `Serialize`.

use std::time::Duration;

use serde::Serialize;

use super::packet::Phase;
use crate::mad::status;

/// Received PMA responses by MAD status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MadStatusCounters {
    pub success: u64,
    pub busy: u64,
    pub redirect: u64,
    pub bad_class: u64,
    pub bad_method: u64,
    /// Unsupported method/attribute combination.
    pub bad_attr: u64,
    pub bad_field: u64,
    pub other: u64,
}

impl MadStatusCounters {
    pub fn record(&mut self, mad_status: u16) {
        let counter = match mad_status {
            status::SUCCESS => &mut self.success,
            status::BUSY => &mut self.busy,
            status::REDIRECT => &mut self.redirect,
            status::BAD_CLASS => &mut self.bad_class,
            status::BAD_METHOD => &mut self.bad_method,
            status::BAD_ATTR => &mut self.bad_attr,
            status::BAD_FIELD => &mut self.bad_field,
            _ => &mut self.other,
        };
        *counter += 1;
    }
}

/// Engine counters, kept across sweeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PmCounters {
    pub sweeps: u64,
    pub get_class_port_info: u64,
    pub get_port_status: u64,
    pub set_clear_port_status: u64,
    pub get_data_port_counters: u64,
    pub get_error_port_counters: u64,
    pub rx_get_resp: u64,
    pub rx_status: MadStatusCounters,
    pub no_resp_ports: u64,
    pub no_resp_nodes: u64,
}

impl PmCounters {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub nodes_started: u64,
    pub nodes_done: u64,
    /// Nodes with at least one failed query, counted once per node.
    pub no_resp_nodes: u64,
    /// Ports with a failed query, counted once per port.
    pub no_resp_ports: u64,
    pub skipped_nodes: u64,
    pub skipped_ports: u64,
    pub peak_parallel_nodes: u64,
    pub completion_signals: u64,
    /// Ports re-queried alone after their merged packet failed.
    pub isolated_ports: u64,
}

impl SweepSummary {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Round-trip times of one kind of exchange, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoundTrip {
    pub count: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub sum_us: u64,
}

impl RoundTrip {
    pub fn record(&mut self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        if self.count == 0 || us < self.min_us {
            self.min_us = us;
        }
        self.max_us = self.max_us.max(us);
        self.sum_us = self.sum_us.saturating_add(us);
        self.count += 1;
    }

    pub fn mean(&self) -> Option<Duration> {
        (self.count > 0).then(|| Duration::from_micros(self.sum_us / self.count))
    }
}

/// Round-trip statistics per exchange kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoundTrips {
    pub class_port_info: RoundTrip,
    pub data_counters: RoundTrip,
    pub error_counters: RoundTrip,
    pub clear_port_status: RoundTrip,
}

impl RoundTrips {
    pub fn phase_mut(&mut self, phase: Phase) -> &mut RoundTrip {
        match phase {
            Phase::DataCounters => &mut self.data_counters,
            Phase::ErrorCounters => &mut self.error_counters,
            Phase::ClearPortStatus => &mut self.clear_port_status,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_buckets() {
        let mut rx = MadStatusCounters::default();
        for s in [status::SUCCESS, status::SUCCESS, status::BUSY, status::BAD_ATTR, 0x0100] {
            rx.record(s);
        }
        assert_eq!(rx.success, 2);
        assert_eq!(rx.busy, 1);
        assert_eq!(rx.bad_attr, 1);
        assert_eq!(rx.other, 1);
    }

    #[test]
    fn test_round_trip() {
        let mut rt = RoundTrip::default();
        assert_eq!(rt.mean(), None);
        rt.record(Duration::from_micros(300));
        rt.record(Duration::from_micros(100));
        assert_eq!((rt.count, rt.min_us, rt.max_us), (2, 100, 300));
        assert_eq!(rt.mean(), Some(Duration::from_micros(200)));
    }

    #[test]
    fn test_counters_json() -> anyhow::Result<()> {
        let mut counters = PmCounters::default();
        counters.sweeps = 3;
        counters.rx_status.busy = 1;
        let value: serde_json::Value = serde_json::from_str(&counters.to_json()?)?;
        assert_eq!(value["sweeps"], 3);
        assert_eq!(value["rx_status"]["busy"], 1);
        Ok(())
    }
}
