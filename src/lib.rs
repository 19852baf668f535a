//! The request core of a fabric performance manager: a bounded context pool
//! that correlates and retries management datagrams (MADs), and a dispatcher
//! that sweeps per-port counters off every device of the fabric.
//!
//! `madsweep` does not talk to hardware itself. Requests leave through a
//! [`Transport`] and responses come back through a [`Receiver`], both
//! provided by the caller. Everything in between lives here:
//!
//! - The [`ContextPool`] owns a fixed set of request slots. A slot is hashed
//!   by destination lid and transaction id while its request is in flight, so
//!   responses are matched in constant time. Timed-out requests are resent,
//!   either with a fixed timeout or with stepped, randomized backoff, and
//!   finally failed. No allocation happens on the request path.
//! - The [`Dispatcher`] is the pool's completion handler. It walks the
//!   [`Fabric`] one lid at a time with a bounded number of devices in flight,
//!   packing as many ports as fit into each request.
//! - The [`PmEngine`] ties both together with a receive and aging loop and a
//!   blocking [`PmEngine::sweep_all`].
//!
//! Configuration comes from the `[pm]` table of a TOML file ([`PmConfig`]).
//! All logging goes through the [`log`] facade.
//!
//! # Example
//!
//! ```rust
//! use madsweep::*;
//! use madsweep::mad::Mad;
//! use std::time::Duration;
//!
//! struct Null;
//!
//! impl Transport for Null {
//!     fn send(&mut self, _: &Mad, _: Duration) -> Result<(), SendError> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let cfg = PmConfig::from_toml_str("[pm]\nmax_parallel_nodes = 4\n")?;
//!
//!     let mut fabric = Fabric::new();
//!     fabric.add(Device::switch("edge01", 0x0011_7501_0000_0001, 1, 48, 0x8001));
//!     fabric.add(Device::hfi("node01", 0x0011_7501_0100_0001, 2, 1, 0x8001));
//!
//!     let engine = PmEngine::new(cfg, Null, fabric, NoClear)?;
//!     assert_eq!(engine.pool().stats().size, 8);
//!     Ok(())
//! }
//! ```
//!
//! ## Warning
//!
//! **The interfaces are unstable and up to change!**

pub mod config;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod fabric;
pub mod mad;
pub mod prelude;
pub mod transport;

mod utils;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, PmConfig};
pub use context::{Completion, ContextError, ContextPool, EntryId, PoolConfig, PoolCore, PoolStats, Status};
pub use dispatch::{Dispatcher, NoClear, PmCounters, SweepSummary, Tabulator, Tag};
pub use engine::{EngineError, PmEngine, SweepError};
pub use fabric::{Device, DeviceId, Fabric, NodeKind, Port, QueryStatus};
pub use transport::{Receiver, RecvError, SendError, Transport};
pub use utils::event::Event;
