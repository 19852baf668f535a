//! The `madsweep` prelude.
//!
//! The purpose of this module is to alleviate imports of the types needed to
//! run sweeps.

pub use crate::config::PmConfig;
pub use crate::context::{Completion, ContextPool, EntryId, PoolCore, Status};
pub use crate::dispatch::{Dispatcher, NoClear, SweepSummary, Tabulator};
pub use crate::engine::{PmEngine, SweepError};
pub use crate::fabric::{Device, Fabric, Port, QueryStatus};
pub use crate::mad::{Mad, MadKind};
pub use crate::transport::{Receiver, Transport};
