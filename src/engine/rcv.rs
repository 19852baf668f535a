//! Receive and aging loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use quanta::Instant;

use super::PmEngine;
use crate::dispatch::Tabulator;
use crate::mad::{method, Mad, MadKind};
use crate::transport::{Receiver, RecvError, Transport};

/// Longest time between two aging passes.
pub const MAX_AGE_WAIT: Duration = Duration::from_millis(100);

/// Receive timeout when retries are not stepped.
pub const RECV_WAIT: Duration = Duration::from_millis(50);

/// Wait before the next aging pass, given what the last pass reported left.
pub fn next_wait(left: Option<Duration>, min: Duration) -> Duration {
    let wait = match left {
        Some(left) if !left.is_zero() && left >= min / 4 => left,
        _ => min,
    };
    wait.min(MAX_AGE_WAIT)
}

/// Aging cadence of one receive loop.
#[derive(Debug, Clone, Copy)]
pub struct RcvState {
    last_age: Instant,
    wait: Duration,
}

impl RcvState {
    pub fn new(now: Instant, min: Duration) -> Self {
        Self {
            last_age: now,
            wait: min.min(MAX_AGE_WAIT),
        }
    }

    /// Wait before the next aging pass.
    #[inline]
    pub fn wait(&self) -> Duration {
        self.wait
    }
}

impl<T: Transport, B: Tabulator> PmEngine<T, B> {
    /// Hand one received MAD to the pool. Returns whether it completed a
    /// request.
    ///
    /// GetResp MADs are responses. Get and Set MADs of kind
    /// [`MadKind::Error`] are requests the transport gave up on, addressed
    /// like a response. Everything else is dropped.
    pub fn deliver(&self, mad: &Mad) -> bool {
        if !mad.is_pm() {
            log::debug!(
                "madsweep: dropping non-PM MAD, class {:#x} version {:#x}/{:#x}",
                mad.base.mgmt_class,
                mad.base.base_version,
                mad.base.class_version
            );
            return false;
        }
        log::trace!(
            "madsweep: received {:?} method {:#x} attr {:#x} from lid {:#x}, tid {:#x}",
            mad.kind,
            mad.base.method,
            mad.base.attr_id,
            mad.addr.slid,
            mad.base.tid
        );

        match (mad.kind, mad.base.method) {
            (MadKind::External, method::GET_RESP) => self.pool.with(|core, dispatcher| {
                dispatcher.record_response(mad);
                core.find_release(dispatcher, mad)
            }),
            (MadKind::Error, method::GET | method::SET) => self.pool.find_release_error(mad),
            _ => {
                log::info!(
                    "madsweep: dropping PM MAD method {:#x} attr {:#x} from lid {:#x}",
                    mad.base.method,
                    mad.base.attr_id,
                    mad.addr.slid
                );
                false
            }
        }
    }

    /// Receive at most one MAD, then age the pool if its wait has passed.
    pub fn step<R: Receiver>(&self, rx: &mut R, state: &mut RcvState) -> Result<(), RecvError> {
        let timeout = if self.stepped { state.wait } else { RECV_WAIT };
        if let Some(mad) = rx.recv(timeout)? {
            self.deliver(&mad);
        }

        let now = self.pool.now();
        if now.saturating_duration_since(state.last_age) >= state.wait {
            let left = self.pool.age();
            state.wait = next_wait(left, self.min_wait);
            state.last_age = now;
        }
        Ok(())
    }

    /// Run the receive loop until `stop` is set or the receiver fails.
    pub fn run_receiver<R: Receiver>(&self, rx: &mut R, stop: &AtomicBool) -> Result<(), RecvError> {
        let mut state = RcvState::new(self.pool.now(), self.min_wait);
        while !stop.load(Ordering::Acquire) {
            if let Err(err) = self.step(rx, &mut state) {
                log::error!("madsweep: receive loop stopped: {}", err);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Run the receive loop on its own thread.
    pub fn spawn_receiver<R>(
        self: &Arc<Self>,
        mut rx: R,
        stop: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<Result<(), RecvError>>>
    where
        T: Send + 'static,
        B: Send + 'static,
        R: Receiver + Send + 'static,
    {
        let engine = Arc::clone(self);
        thread::Builder::new()
            .name("pm_async_rcv".to_owned())
            .spawn(move || engine.run_receiver(&mut rx, &stop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_next_wait() {
        // Nothing pending.
        assert_eq!(next_wait(None, 40 * MS), 40 * MS);
        assert_eq!(next_wait(Some(Duration::ZERO), 40 * MS), 40 * MS);
        // Below a quarter of the minimum.
        assert_eq!(next_wait(Some(9 * MS), 40 * MS), 40 * MS);
        assert_eq!(next_wait(Some(10 * MS), 40 * MS), 10 * MS);
        assert_eq!(next_wait(Some(70 * MS), 40 * MS), 70 * MS);
        // Capped.
        assert_eq!(next_wait(Some(500 * MS), 40 * MS), MAX_AGE_WAIT);
        assert_eq!(next_wait(None, 300 * MS), MAX_AGE_WAIT);
        // Non-stepped pools age on every pass until something is pending.
        assert_eq!(next_wait(None, Duration::ZERO), Duration::ZERO);
        assert_eq!(next_wait(Some(30 * MS), Duration::ZERO), 30 * MS);
    }

    #[test]
    fn test_initial_state() {
        let (clock, _mock) = quanta::Clock::mock();
        let state = RcvState::new(clock.now(), 20 * MS);
        assert_eq!(state.wait(), 20 * MS);
        let state = RcvState::new(clock.now(), Duration::from_secs(1));
        assert_eq!(state.wait(), MAX_AGE_WAIT);
    }
}
