//! Byte-stream transports between the harness and a device adapter.
//!
//! Every transport offers the same contract regardless of what carries the bytes:
//!
//! - [`send`](Transport::send) blocks until every byte has been handed to the OS.
//! - [`recv`](Transport::recv) returns as soon as *some* bytes are available, `Ok(0)`
//!   at end of stream, or [`CortexError::Timeout`] once `timeout` elapses. A zero
//!   timeout is a non-blocking poll. Short reads are normal; callers loop.
//! - [`close`](Transport::close) is idempotent. Closing a loopback transport is how the
//!   harness tells a local adapter to exit.
//!
//! # Variants
//!
//! | URI                     | Type                  | Notes                                 |
//! |-------------------------|-----------------------|---------------------------------------|
//! | `local://`              | [`LoopbackTransport`] / [`StdioTransport`] | socket pair to a spawned child |
//! | `tcp://host:port`       | [`TcpTransport`]      | harness dials, `TCP_NODELAY` + keep-alive |
//! | `tcp://:port`           | [`TcpServer`]         | adapter listens, accepts exactly one peer |
//! | `serial:///dev/ttyX`    | [`SerialTransport`]   | 8-N-1 raw, no flow control            |
//! | `shm://name`            | `ShmTransport`        | Linux only, two SPSC rings + semaphores |
//!
//! Use [`uri::open`] to build the right variant for a given [`Role`].

use std::time::Duration;

use crate::Result;
use crate::clock;

#[cfg(unix)]
mod loopback;
#[cfg(unix)]
mod poll;
mod serial;
#[cfg(target_os = "linux")]
mod shm;
#[cfg(unix)]
mod stdio;
mod tcp;
pub mod uri;

#[cfg(unix)]
pub use loopback::LoopbackTransport;
pub use serial::{DEFAULT_BAUD_RATE, SerialTransport};
#[cfg(target_os = "linux")]
pub use shm::{RING_CAPACITY, ShmTransport};
#[cfg(unix)]
pub use stdio::StdioTransport;
pub use tcp::{TcpServer, TcpTransport};
pub use uri::{Role, TransportUri};

/// A bidirectional byte stream with timeout-bounded reads.
pub trait Transport: Send {
    /// Write all of `data`, blocking until the OS has accepted it.
    ///
    /// Returns the number of bytes written, which is always `data.len()` on success.
    fn send(&mut self, data: &[u8]) -> Result<usize>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// Returns:
    /// - `Ok(n)` with `n > 0` - bytes were read
    /// - `Ok(0)` - the peer closed the stream
    /// - `Err(CortexError::Timeout)` - nothing arrived in time
    /// - `Err(CortexError::ConnectionReset)` - the peer vanished
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Release the underlying resource. Safe to call more than once.
    fn close(&mut self);

    /// Short human-readable label used in logs.
    fn kind(&self) -> &'static str;

    /// Monotonic timestamp in nanoseconds.
    fn now_ns(&self) -> u64 {
        clock::monotonic_ns()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        (**self).send(data)
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).recv(buf, timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn kind(&self) -> &'static str {
        (**self).kind()
    }

    fn now_ns(&self) -> u64 {
        (**self).now_ns()
    }
}

/// Error returned by operations on a transport that was already closed.
pub(crate) fn closed_error(kind: &str) -> crate::CortexError {
    crate::CortexError::ConnectionReset { context: format!("{} transport is closed", kind) }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::CortexError;
    use std::time::Instant;

    #[test]
    fn boxed_transport_delegates() {
        let (a, b) = LoopbackTransport::pair().unwrap();
        let mut a: Box<dyn Transport> = Box::new(a);
        let mut b: Box<dyn Transport> = Box::new(b);

        assert_eq!(a.send(b"ping").unwrap(), 4);
        let mut buf = [0u8; 8];
        let n = b.recv(&mut buf, Duration::from_millis(500)).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(b.kind(), "loopback");
    }

    #[test]
    fn zero_timeout_is_a_poll() {
        let (mut a, _b) = LoopbackTransport::pair().unwrap();
        let start = Instant::now();
        let err = a.recv(&mut [0u8; 4], Duration::ZERO).unwrap_err();
        assert!(matches!(err, CortexError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
