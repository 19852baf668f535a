//! Transport seams.
//!
//! The MAD transport itself lives outside this crate. The context pool sends
//! through a [`Transport`] while holding its lock, so implementations must not
//! block indefinitely; the receive path pulls through a [`Receiver`].

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::mad::{Mad, MAX_PAYLOAD};

/// Send error type.
#[derive(Debug, Error)]
pub enum SendError {
    /// `std::io::Error` reported by the underlying device.
    #[error("I/O error from transport")]
    Io(#[from] io::Error),

    /// The transport has been closed.
    #[error("transport closed")]
    Closed,
}

/// Receive error type.
#[derive(Debug, Error)]
pub enum RecvError {
    /// `std::io::Error` reported by the underlying device.
    #[error("I/O error from transport")]
    Io(#[from] io::Error),

    /// The transport has been closed.
    #[error("transport closed")]
    Closed,
}

/// Send half of a MAD transport.
pub trait Transport {
    /// Send `mad` to `mad.addr.dlid`. `timeout` is the per-attempt response
    /// timeout the transport may use for its own bookkeeping.
    fn send(&mut self, mad: &Mad, timeout: Duration) -> Result<(), SendError>;

    /// Largest payload this transport carries.
    #[inline]
    fn max_payload(&self) -> usize {
        MAX_PAYLOAD
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, mad: &Mad, timeout: Duration) -> Result<(), SendError> {
        (**self).send(mad, timeout)
    }

    fn max_payload(&self) -> usize {
        (**self).max_payload()
    }
}

/// Receive half of a MAD transport.
pub trait Receiver {
    /// Receive one MAD, waiting at most `timeout`. `Ok(None)` means the wait
    /// timed out.
    ///
    /// Requests the transport failed to deliver may be handed back with
    /// [`MadKind::Error`](crate::mad::MadKind::Error), addressed like a
    /// response: `slid` is the lid the request was sent to.
    fn recv(&mut self, timeout: Duration) -> Result<Option<Mad>, RecvError>;
}
