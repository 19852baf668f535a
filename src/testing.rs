//! Simulated PMAs for unit tests.

use crate::fabric::counters::PortImage;
use crate::fabric::{Device, Fabric};
use crate::mad::wire::*;
use crate::mad::{attr, status, Lid, Mad, PM_CLASS_VERSION, STL_BASE_VERSION};

/// Answers PM requests from a fabric of true counters.
pub(crate) struct Pma {
    pub truth: Fabric,
    /// Lids that answer ClassPortInfo and nothing else.
    pub silent: Vec<Lid>,
    /// Answer every multi-port request with BUSY.
    pub busy_multi: bool,
}

impl Pma {
    pub fn new(truth: Fabric) -> Self {
        Self {
            truth,
            silent: Vec::new(),
            busy_multi: false,
        }
    }

    /// The response to `req`, or `None` if it goes unanswered.
    pub fn respond(&self, req: &Mad) -> Option<Mad> {
        if self.silent.contains(&req.addr.dlid) && req.base.attr_id != attr::CLASS_PORT_INFO {
            return None;
        }
        let device = self.truth.device(self.truth.lookup(req.addr.dlid)?);
        let mut resp = req.clone();
        resp.make_response(status::SUCCESS);
        if self.busy_multi && req.base.attr_mod >> 24 > 1 {
            resp.base.status = status::BUSY;
            resp.datasize = 0;
            return Some(resp);
        }
        resp.datasize = body(device, req, &mut resp.data).ok()?;
        Some(resp)
    }
}

fn body(device: &Device, req: &Mad, out: &mut [u8]) -> Result<usize, WireError> {
    let blank = PortImage::default();
    let image = |p: u8| device.port(p).map_or(&blank, |port| &*port.image);
    let mut w = Writer::new(out);
    match req.base.attr_id {
        attr::CLASS_PORT_INFO => {
            let info = ClassPortInfo {
                base_version: STL_BASE_VERSION,
                class_version: PM_CLASS_VERSION,
                cap_mask: 0x1400,
                cap_mask2: 0,
                resp_time_value: 18,
            };
            info.encode(&mut w)?;
        }
        attr::PORT_STATUS => {
            let q = PortStatusReq::decode(&mut Reader::new(req.payload()))?;
            let i = image(q.port);
            write_port_status(&mut w, q.port, q.vl_select, &i.counters, &i.vl_counters)?;
        }
        attr::DATA_PORT_COUNTERS | attr::ERROR_PORT_COUNTERS => {
            let q = CountersQuery::decode(&mut Reader::new(req.payload()))?;
            q.encode(&mut w)?;
            for p in q.port_select.ports() {
                let i = image(p);
                if req.base.attr_id == attr::DATA_PORT_COUNTERS {
                    write_data_port(&mut w, p, &i.counters, &i.vl_counters, q.vl_select)?;
                } else {
                    write_error_port(&mut w, p, &i.counters, &i.vl_counters, q.vl_select)?;
                }
            }
        }
        _ => {
            let q = ClearPortStatus::decode(&mut Reader::new(req.payload()))?;
            q.encode(&mut w)?;
        }
    }
    Ok(w.position())
}
