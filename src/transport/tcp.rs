//! TCP client and single-connection server transports.

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::{Transport, closed_error};
use crate::{CortexError, Result};

/// A connected TCP stream.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    /// Dial `host:port`, giving up after `timeout`.
    ///
    /// Every resolved address is tried in turn. The connected socket has Nagle's
    /// algorithm disabled and keep-alive enabled.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| CortexError::from_io(format!("resolve {}:{}", host, port), e))?
            .collect();
        if addrs.is_empty() {
            return Err(CortexError::invalid_uri(
                format!("tcp://{}:{}", host, port),
                "host did not resolve to any address",
            ));
        }

        let deadline = Instant::now() + timeout;
        let mut last_error = None;
        for addr in addrs {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match TcpStream::connect_timeout(&addr, remaining) {
                Ok(stream) => {
                    info!(%addr, "TCP connection established");
                    return Self::from_stream(stream);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "TCP connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => CortexError::from_io(format!("connect {}:{}", host, port), e),
            None => CortexError::Timeout { duration: timeout },
        })
    }

    /// Wrap a connected stream, applying the socket options every session uses.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true).map_err(|e| CortexError::from_io("TCP_NODELAY", e))?;
        stream.set_nonblocking(false).map_err(|e| CortexError::from_io("set blocking", e))?;
        enable_keepalive(&stream)?;
        let peer = stream.peer_addr().ok();
        Ok(Self { stream: Some(stream), peer })
    }

    /// Address of the remote end, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or_else(|| closed_error("tcp"))?;
        stream.write_all(data).map_err(|e| CortexError::from_io("tcp write", e))?;
        Ok(data.len())
    }

    #[cfg(unix)]
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or_else(|| closed_error("tcp"))?;
        super::poll::read_with_timeout(stream, buf, timeout, "tcp")
    }

    #[cfg(not(unix))]
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        use std::io::Read;

        let stream = self.stream.as_mut().ok_or_else(|| closed_error("tcp"))?;
        if timeout.is_zero() {
            stream.set_nonblocking(true).map_err(|e| CortexError::from_io("tcp poll", e))?;
            let result = stream.read(buf);
            stream.set_nonblocking(false).map_err(|e| CortexError::from_io("tcp poll", e))?;
            return result.map_err(|e| match CortexError::from_io("tcp read", e) {
                CortexError::Timeout { .. } => CortexError::Timeout { duration: timeout },
                other => other,
            });
        }
        stream.set_read_timeout(Some(timeout)).map_err(|e| CortexError::from_io("tcp timeout", e))?;
        stream.read(buf).map_err(|e| match CortexError::from_io("tcp read", e) {
            CortexError::Timeout { .. } => CortexError::Timeout { duration: timeout },
            other => other,
        })
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn kind(&self) -> &'static str {
        "tcp"
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Listening socket that hands out exactly one connection.
///
/// Listening and accepting are separate steps so the caller can announce the bound
/// port (for example when binding port 0) before blocking on the peer.
#[derive(Debug)]
pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    /// Listen on all interfaces at `port` with a backlog of one.
    pub fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|e| CortexError::from_io(format!("bind port {}", port), e))?;
        restrict_backlog(&listener)?;
        info!(port = listener.local_addr().map(|a| a.port()).unwrap_or(port), "Listening for harness");
        Ok(Self { listener })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(|e| CortexError::from_io("local_addr", e))
    }

    /// Wait up to `timeout` for one peer and return the connected transport.
    ///
    /// Consumes the server: the listening socket is closed once a session exists.
    pub fn accept(self, timeout: Duration) -> Result<TcpTransport> {
        let deadline = Instant::now() + timeout;
        self.listener.set_nonblocking(true).map_err(|e| CortexError::from_io("listener", e))?;
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    info!(%addr, "Accepted harness connection");
                    return TcpTransport::from_stream(stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(CortexError::Timeout { duration: timeout });
                    }
                    wait_for_peer(&self.listener, remaining)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CortexError::from_io("accept", e)),
            }
        }
    }
}

#[cfg(unix)]
fn wait_for_peer(listener: &TcpListener, remaining: Duration) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    super::poll::wait_readable(listener.as_raw_fd(), remaining)
        .map(|_| ())
        .map_err(|e| CortexError::from_io("accept poll", e))
}

#[cfg(not(unix))]
fn wait_for_peer(_listener: &TcpListener, remaining: Duration) -> Result<()> {
    std::thread::sleep(remaining.min(Duration::from_millis(10)));
    Ok(())
}

#[cfg(unix)]
fn restrict_backlog(listener: &TcpListener) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    // Re-listening on a bound socket only updates the backlog.
    // SAFETY: the descriptor belongs to `listener`, which outlives the call.
    let rc = unsafe { libc::listen(listener.as_raw_fd(), 1) };
    if rc != 0 {
        return Err(CortexError::from_io("listen", std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn restrict_backlog(_listener: &TcpListener) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn enable_keepalive(stream: &TcpStream) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let enable: libc::c_int = 1;
    // SAFETY: the descriptor belongs to `stream`; the option pointer and length
    // describe `enable`, a live c_int.
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &enable as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(CortexError::from_io("SO_KEEPALIVE", std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn enable_keepalive(_stream: &TcpStream) -> Result<()> {
    Ok(())
}
