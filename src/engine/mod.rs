//! Performance manager engine.
//!
//! [`PmEngine`] owns the context pool and, through it, the [`Dispatcher`].
//! One thread drives sweeps with [`PmEngine::sweep_all`]; another runs the
//! receive loop ([`PmEngine::run_receiver`]), which feeds responses to the
//! pool and ages it. Completion callbacks run on the receive thread.

mod rcv;

pub use self::rcv::{next_wait, RcvState, MAX_AGE_WAIT, RECV_WAIT};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quanta::Clock;
use thiserror::Error;

use crate::config::{ConfigError, PmConfig};
use crate::context::{ContextError, ContextPool};
use crate::dispatch::{Dispatcher, PmCounters, SweepSummary, Tabulator};
use crate::fabric::Fabric;
use crate::transport::Transport;
use crate::utils::event::Event;

/// How often a waiting sweep wakes up to look at the shutdown flag.
pub const SWEEP_POLL: Duration = Duration::from_secs(1);

/// Engine construction error type.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),

    #[error("cannot create context pool")]
    Context(#[from] ContextError),
}

/// Sweep error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SweepError {
    /// Shutdown was requested; the sweep is incomplete.
    #[error("sweep interrupted by shutdown")]
    Shutdown,

    /// The previous sweep has not completed.
    #[error("a sweep is already in progress")]
    InProgress,
}

/// The PM engine.
pub struct PmEngine<T: Transport, B: Tabulator> {
    pool: ContextPool<T, Dispatcher<B>>,
    done: Arc<Event>,
    shutdown: Arc<AtomicBool>,
    stepped: bool,
    min_wait: Duration,
}

impl<T: Transport, B: Tabulator> PmEngine<T, B> {
    pub fn new(cfg: PmConfig, transport: T, fabric: Fabric, tabulator: B) -> Result<Self, EngineError> {
        Self::with_clock(cfg, transport, fabric, tabulator, Clock::new())
    }

    pub fn with_clock(
        cfg: PmConfig,
        transport: T,
        fabric: Fabric,
        tabulator: B,
        clock: Clock,
    ) -> Result<Self, EngineError> {
        cfg.validate()?;
        let pool_cfg = cfg.pool_config();
        let stepped = cfg.stepped();
        let min_wait = cfg.min_rcv_wait_interval();

        let dispatcher = Dispatcher::new(cfg, fabric, tabulator);
        let done = dispatcher.done_event();
        let shutdown = dispatcher.shutdown_flag();
        let pool = ContextPool::with_clock(pool_cfg, transport, dispatcher, clock)?;
        log::debug!(
            "madsweep: engine up, {} retries",
            if stepped { "stepped" } else { "fixed" }
        );

        Ok(Self {
            pool,
            done,
            shutdown,
            stepped,
            min_wait,
        })
    }

    #[inline]
    pub fn pool(&self) -> &ContextPool<T, Dispatcher<B>> {
        &self.pool
    }

    /// Run `f` on the dispatcher, inside the pool lock.
    pub fn with_dispatcher<R>(&self, f: impl FnOnce(&mut Dispatcher<B>) -> R) -> R {
        self.pool.with(|_, dispatcher| f(dispatcher))
    }

    /// Run `f` on the fabric, inside the pool lock.
    pub fn with_fabric<R>(&self, f: impl FnOnce(&mut Fabric) -> R) -> R {
        self.with_dispatcher(|dispatcher| f(dispatcher.fabric_mut()))
    }

    pub fn counters(&self) -> PmCounters {
        self.with_dispatcher(|dispatcher| *dispatcher.counters())
    }

    /// Stop starting new work. In-flight requests still drain.
    pub fn request_shutdown(&self) {
        log::info!("madsweep: engine shutdown requested");
        self.shutdown.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Sweep the whole fabric and wait for the sweep to complete.
    ///
    /// The receive loop must be running on another thread.
    pub fn sweep_all(&self) -> Result<SweepSummary, SweepError> {
        self.sweep_polling(SWEEP_POLL)
    }

    fn sweep_polling(&self, poll: Duration) -> Result<SweepSummary, SweepError> {
        if !self.pool.with(|core, dispatcher| dispatcher.start_sweep(core)) {
            return Err(SweepError::InProgress);
        }
        while !self.done.wait_timeout(poll) {
            if self.is_shutdown() {
                log::debug!("madsweep: waiting for in-flight requests to drain");
            }
        }

        let summary = self.with_dispatcher(|dispatcher| *dispatcher.summary());
        if summary.no_resp_ports > 0 {
            log::warn!(
                "madsweep: unable to get {} ports on {} nodes",
                summary.no_resp_ports,
                summary.no_resp_nodes
            );
        }
        if self.is_shutdown() {
            log::info!("madsweep: sweep stopped by shutdown");
            return Err(SweepError::Shutdown);
        }
        log::info!(
            "madsweep: sweep done, {} nodes, {} skipped",
            summary.nodes_done,
            summary.skipped_nodes
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::NoClear;
    use crate::fabric::{Device, QueryStatus};
    use crate::mad::{attr, method, Lid, Mad, MadKind};
    use crate::testing::Pma;
    use crate::transport::{Receiver, RecvError, SendError};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::thread;

    type Inbox = Arc<Mutex<VecDeque<Mad>>>;

    /// Transport whose responses land in an inbox.
    struct Loopback {
        pma: Arc<Pma>,
        inbox: Inbox,
        sent: Arc<AtomicUsize>,
    }

    impl Transport for Loopback {
        fn send(&mut self, mad: &Mad, _: Duration) -> Result<(), SendError> {
            self.sent.fetch_add(1, Ordering::Relaxed);
            if let Some(resp) = self.pma.respond(mad) {
                self.inbox.lock().unwrap().push_back(resp);
            }
            Ok(())
        }
    }

    struct InboxRx(Inbox);

    impl Receiver for InboxRx {
        fn recv(&mut self, timeout: Duration) -> Result<Option<Mad>, RecvError> {
            let mad = self.0.lock().unwrap().pop_front();
            if mad.is_none() {
                thread::sleep(timeout.min(Duration::from_millis(1)));
            }
            Ok(mad)
        }
    }

    struct Setup {
        engine: PmEngine<Loopback, NoClear>,
        inbox: Inbox,
        sent: Arc<AtomicUsize>,
    }

    fn setup(cfg: PmConfig, fabric: Fabric, silent: &[Lid], clock: Clock) -> Setup {
        let mut pma = Pma::new(fabric.clone());
        pma.silent.extend_from_slice(silent);
        let inbox = Inbox::default();
        let sent = Arc::new(AtomicUsize::new(0));
        let transport = Loopback {
            pma: Arc::new(pma),
            inbox: inbox.clone(),
            sent: sent.clone(),
        };
        let engine = PmEngine::with_clock(cfg, transport, fabric, NoClear, clock).unwrap();
        Setup { engine, inbox, sent }
    }

    fn two_switches() -> Fabric {
        let mut fabric = Fabric::new();
        fabric.add(Device::switch("sw1", 0x11, 1, 4, 0x1));
        fabric.add(Device::switch("sw2", 0x12, 2, 4, 0x1));
        fabric
    }

    #[test]
    fn test_sweep_with_receiver_thread() -> anyhow::Result<()> {
        let s = setup(PmConfig::default(), two_switches(), &[], Clock::new());
        let engine = Arc::new(s.engine);
        let stop = Arc::new(AtomicBool::new(false));
        let rcv = engine.spawn_receiver(InboxRx(s.inbox.clone()), stop.clone())?;

        let summary = engine.sweep_all()?;
        assert_eq!(summary.nodes_done, 2);
        assert_eq!(summary.no_resp_ports, 0);
        let summary = engine.sweep_all()?;
        assert_eq!(summary.nodes_done, 2);

        stop.store(true, Ordering::Release);
        rcv.join().unwrap()?;

        let counters = engine.counters();
        assert_eq!(counters.sweeps, 2);
        assert_eq!(counters.get_class_port_info, 2);
        assert_eq!(counters.rx_get_resp, 6);
        assert_eq!(counters.rx_status.success, 6);
        assert_eq!(s.sent.load(Ordering::Relaxed), 6);
        engine.with_fabric(|fabric| {
            assert!(fabric.devices().all(|d| d.present_ports().all(|p| p.image.got_data)));
        });
        Ok(())
    }

    #[test]
    fn test_aging_fails_silent_device() {
        let (clock, mock) = Clock::mock();
        let mut fabric = Fabric::new();
        fabric.add(Device::switch("sw1", 0x11, 1, 2, 0x1));
        let s = setup(PmConfig::default(), fabric, &[1], clock);
        let engine = &s.engine;
        let done = engine.with_dispatcher(|d| d.done_event());
        let mut rx = InboxRx(s.inbox.clone());
        let mut state = RcvState::new(engine.pool().now(), Duration::ZERO);

        engine.pool().with(|core, d| assert!(d.start_sweep(core)));
        // ClassPortInfo answered, data request sent.
        engine.step(&mut rx, &mut state).unwrap();
        assert_eq!(s.sent.load(Ordering::Relaxed), 2);
        engine.step(&mut rx, &mut state).unwrap();
        assert_eq!(s.sent.load(Ordering::Relaxed), 2);

        for sent in [3, 4] {
            mock.increment(Duration::from_millis(100));
            engine.step(&mut rx, &mut state).unwrap();
            assert_eq!(s.sent.load(Ordering::Relaxed), sent);
        }
        assert!(!done.wait_timeout(Duration::ZERO));
        mock.increment(Duration::from_millis(100));
        engine.step(&mut rx, &mut state).unwrap();
        assert!(done.wait_timeout(Duration::ZERO));

        engine.with_dispatcher(|d| {
            assert_eq!(d.summary().no_resp_nodes, 1);
            assert_eq!(d.summary().no_resp_ports, 3);
            let port = d.fabric().device(d.fabric().lookup(1).unwrap()).port(1).unwrap();
            assert_eq!(port.image.query_status, QueryStatus::FailQuery);
        });
        assert_eq!(engine.pool().stats().retries_exhausted, 1);
        assert_eq!(engine.pool().stats().allocated, 0);
    }

    #[test]
    fn test_shutdown_interrupts_sweep() {
        let s = setup(PmConfig::default(), two_switches(), &[], Clock::new());
        s.engine.request_shutdown();
        assert_eq!(s.engine.sweep_polling(Duration::from_millis(1)), Err(SweepError::Shutdown));
        assert_eq!(s.sent.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_deliver_filters() {
        let s = setup(PmConfig::default(), two_switches(), &[], Clock::new());
        let mut mad = Mad::new();
        assert!(!s.engine.deliver(&mad));

        mad.init_pm_request(method::GET, attr::CLASS_PORT_INFO, 0, 7);
        // A request, not a response.
        assert!(!s.engine.deliver(&mad));
        mad.make_response(crate::mad::status::BUSY);
        // Unexpected, but counted.
        assert!(!s.engine.deliver(&mad));
        mad.kind = MadKind::Error;
        assert!(!s.engine.deliver(&mad));

        let counters = s.engine.counters();
        assert_eq!(counters.rx_get_resp, 1);
        assert_eq!(counters.rx_status.busy, 1);
        assert_eq!(s.engine.pool().stats().unexpected_responses, 1);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let cfg = PmConfig {
            pma_batch_size: 0,
            ..PmConfig::default()
        };
        let transport = Loopback {
            pma: Arc::new(Pma::new(Fabric::new())),
            inbox: Inbox::default(),
            sent: Arc::new(AtomicUsize::new(0)),
        };
        let res = PmEngine::new(cfg, transport, Fabric::new(), NoClear);
        assert!(matches!(res, Err(EngineError::Config(_))));
    }
}
