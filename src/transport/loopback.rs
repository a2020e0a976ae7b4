//! Loopback transport over a connected Unix socket pair.

use std::io::Write;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use tracing::trace;

use super::{Transport, closed_error, poll};
use crate::{CortexError, Result};

/// One end of a local socket pair.
///
/// Used when the adapter runs as a child process on the same machine: the other
/// end of the pair becomes the child's stdin and stdout.
#[derive(Debug)]
pub struct LoopbackTransport {
    stream: Option<UnixStream>,
}

impl LoopbackTransport {
    /// Create two connected transports.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair().map_err(|e| CortexError::from_io("socketpair", e))?;
        Ok((Self::from_stream(a), Self::from_stream(b)))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream: Some(stream) }
    }

    /// Create a socket pair, returning this side as a transport and the raw far end.
    ///
    /// Both descriptors are close-on-exec; the far end only reaches a child when it
    /// is explicitly installed as that child's standard streams.
    pub fn with_far_end() -> Result<(Self, UnixStream)> {
        let (near, far) = UnixStream::pair().map_err(|e| CortexError::from_io("socketpair", e))?;
        Ok((Self::from_stream(near), far))
    }
}

impl Transport for LoopbackTransport {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or_else(|| closed_error("loopback"))?;
        stream.write_all(data).map_err(|e| CortexError::from_io("loopback write", e))?;
        trace!(bytes = data.len(), "loopback send");
        Ok(data.len())
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or_else(|| closed_error("loopback"))?;
        poll::read_with_timeout(stream, buf, timeout, "loopback")
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn kind(&self) -> &'static str {
        "loopback"
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.close();
    }
}
