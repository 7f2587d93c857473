//! Datagram transport & monotonic time
//!
//! The aggregator is a single-threaded cooperative loop with exactly two
//! suspension points: waiting for a datagram (deadline-bounded) and waiting
//! for the next cycle open. [`UdpEndpoint`] owns the socket exclusively and
//! hides the timeout plumbing; [`Clock`] abstracts the host-local monotonic
//! clock so the state machines can be driven by a [`ManualClock`] in tests
//! and simulations.
//!
//! Transport is plain UDP on the isolated control subnet. Loss is expected
//! and absorbed by the rateless code; there is no retransmission and no
//! backpressure here.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::cell::Cell;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use crate::wire::{Frame, WireError, MAX_DATAGRAM};

/// Microseconds on the host-local monotonic clock.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Micros(pub u64);

impl Micros {
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn saturating_add(self, other: Micros) -> Micros {
        Micros(self.0.saturating_add(other.0))
    }

    #[inline]
    pub fn saturating_sub(self, other: Micros) -> Micros {
        Micros(self.0.saturating_sub(other.0))
    }

    /// Convert to a `Duration` (for socket timeouts).
    #[inline]
    pub fn to_duration(self) -> Duration {
        Duration::from_micros(self.0)
    }

    /// Build from milliseconds (configuration convenience).
    #[inline]
    pub fn from_millis(ms: u64) -> Micros {
        Micros(ms * 1_000)
    }
}

/// Monotonic time source. Injected everywhere a state machine needs "now".
pub trait Clock {
    fn now(&self) -> Micros;
}

/// The production clock: `Instant` anchored at construction.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Micros {
        Micros(self.origin.elapsed().as_micros() as u64)
    }
}

/// A hand-driven clock for tests and deterministic simulation.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<u64>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock { now: Cell::new(0) }
    }

    pub fn advance(&self, by: Micros) {
        self.now.set(self.now.get() + by.0);
    }

    pub fn set(&self, to: Micros) {
        self.now.set(to.0);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Micros {
        Micros(self.now.get())
    }
}

/// Opaque transport identity of a datagram source, used only for rate
/// limiting. Stable for the life of the process, never authoritative.
pub fn sender_key(addr: &SocketAddr) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    addr.hash(&mut h);
    h.finish()
}

/// Errors surfaced by the transport.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Exclusive owner of the control-subnet socket.
pub struct UdpEndpoint {
    sock: UdpSocket,
}

impl UdpEndpoint {
    /// Bind the control socket.
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self, NetError> {
        let sock = UdpSocket::bind(addr)?;
        Ok(UdpEndpoint { sock })
    }

    /// Local bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.sock.local_addr()?)
    }

    /// Wait up to `timeout` for one frame.
    ///
    /// Undecodable datagrams are logged, counted by the caller via the `None`
    /// path, and never abort the loop: a garbled datagram on a lossy subnet
    /// is an expected event, not an error.
    pub fn poll(&self, timeout: Duration) -> Result<Option<(Frame, SocketAddr)>, NetError> {
        let timeout = timeout.max(Duration::from_millis(1));
        self.sock.set_read_timeout(Some(timeout))?;
        let mut buf = [0u8; MAX_DATAGRAM + 64];
        match self.sock.recv_from(&mut buf) {
            Ok((len, from)) => match Frame::decode(&buf[..len]) {
                Ok(frame) => {
                    #[cfg(feature = "trace-frames")]
                    tracing::trace!(?frame, %from, len, "frame in");
                    Ok(Some((frame, from)))
                }
                Err(err) => {
                    tracing::warn!(%from, len, %err, "dropping undecodable datagram");
                    Ok(None)
                }
            },
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(NetError::Io(e)),
        }
    }

    /// Encode and send one frame.
    pub fn send(&self, frame: &Frame, dest: SocketAddr) -> Result<(), NetError> {
        let buf = frame.encode()?;
        #[cfg(feature = "trace-frames")]
        tracing::trace!(?frame, %dest, len = buf.len(), "frame out");
        self.sock.send_to(&buf, dest)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_on_demand() {
        let c = ManualClock::new();
        assert_eq!(c.now(), Micros(0));
        c.advance(Micros(250));
        assert_eq!(c.now(), Micros(250));
        c.set(Micros::from_millis(5));
        assert_eq!(c.now(), Micros(5_000));
    }

    #[test]
    fn micros_arithmetic_saturates() {
        assert_eq!(Micros(5).saturating_sub(Micros(9)), Micros(0));
        assert_eq!(Micros(u64::MAX).saturating_add(Micros(1)), Micros(u64::MAX));
    }

    #[test]
    fn endpoint_round_trips_a_frame_over_loopback() {
        let a = UdpEndpoint::bind("127.0.0.1:0").unwrap();
        let b = UdpEndpoint::bind("127.0.0.1:0").unwrap();
        let frame = Frame::ClaimPrimary {
            cycle: crate::wire::CycleId(3),
            committed_epoch: crate::wire::Epoch(1),
            node_id: crate::wire::NodeId(2),
        };
        a.send(&frame, b.local_addr().unwrap()).unwrap();
        let got = b.poll(Duration::from_millis(500)).unwrap();
        assert_eq!(got.map(|(f, _)| f), Some(frame));
    }
}
