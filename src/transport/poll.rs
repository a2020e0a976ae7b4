//! Readiness wait on raw file descriptors.

use std::io;
use std::io::Read;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use crate::{CortexError, Result};

/// Outcome of waiting for a descriptor to become readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// Data, EOF or an error is waiting; a read will not block.
    Ready,
    TimedOut,
}

/// Block until `fd` is readable or `timeout` elapses.
///
/// Hang-ups count as ready so that the following read observes EOF.
pub(crate) fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<Readiness> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut pollfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
        // SAFETY: `pollfd` is a valid, writable pollfd and the count of 1 matches it.
        let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms(remaining)) };

        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if result == 0 {
            return Ok(Readiness::TimedOut);
        }
        if pollfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
            return Ok(Readiness::Ready);
        }
        if pollfd.revents & libc::POLLNVAL != 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        // Spurious wakeup
        if remaining.is_zero() {
            return Ok(Readiness::TimedOut);
        }
    }
}

/// Wait for readiness, then perform a single read.
pub(crate) fn read_with_timeout<S>(
    stream: &mut S,
    buf: &mut [u8],
    timeout: Duration,
    kind: &str,
) -> Result<usize>
where
    S: Read + AsRawFd,
{
    if buf.is_empty() {
        return Ok(0);
    }
    match wait_readable(stream.as_raw_fd(), timeout)
        .map_err(|e| CortexError::from_io(format!("{} poll", kind), e))?
    {
        Readiness::TimedOut => Err(CortexError::Timeout { duration: timeout }),
        Readiness::Ready => loop {
            match stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(CortexError::Timeout { duration: timeout });
                }
                Err(e) => return Err(CortexError::from_io(format!("{} read", kind), e)),
            }
        },
    }
}

/// Round up to whole milliseconds so short waits never become busy polls.
fn timeout_ms(timeout: Duration) -> i32 {
    let ms = timeout.as_micros().div_ceil(1000);
    ms.min(i32::MAX as u128) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[test]
    fn times_out_without_data() {
        let (a, _b) = UnixStream::pair().unwrap();
        let start = Instant::now();
        let r = wait_readable(a.as_raw_fd(), Duration::from_millis(30)).unwrap();
        assert_eq!(r, Readiness::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn ready_when_peer_writes_or_hangs_up() {
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"x").unwrap();
        assert_eq!(wait_readable(a.as_raw_fd(), Duration::from_millis(100)).unwrap(), Readiness::Ready);

        let (c, d) = UnixStream::pair().unwrap();
        drop(d);
        assert_eq!(wait_readable(c.as_raw_fd(), Duration::from_millis(100)).unwrap(), Readiness::Ready);
    }

    #[test]
    fn rounds_partial_milliseconds_up() {
        assert_eq!(timeout_ms(Duration::from_micros(1)), 1);
        assert_eq!(timeout_ms(Duration::ZERO), 0);
        assert_eq!(timeout_ms(Duration::from_millis(1500)), 1500);
    }
}
