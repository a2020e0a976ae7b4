//! Shared-memory transport for same-host benchmarking.
//!
//! The segment is a file under `/dev/shm` holding two single-producer/single-consumer
//! byte rings, one per direction. Each ring has a POSIX named semaphore that the
//! producer posts after publishing bytes and the consumer waits on with the usual
//! receive timeout.
//!
//! ```text
//! segment = [ ring 0: harness -> adapter ][ ring 1: adapter -> harness ]
//! ring    = [ head u64 | tail u64 | writer_closed u32 | reader_closed u32 | pad ][ data ... ]
//! ```
//!
//! `head` and `tail` are free-running byte counters; the fill level is `head - tail`.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use memmap2::MmapMut;
use tracing::{debug, info, trace};

use super::{Transport, closed_error};
use crate::protocol::WINDOW_TIMEOUT;
use crate::{CortexError, Result};

/// Bytes of payload each ring can hold.
pub const RING_CAPACITY: usize = 256 * 1024;

const RING_HEADER_SIZE: usize = 64;
const RING_SIZE: usize = RING_HEADER_SIZE + RING_CAPACITY;
const SEGMENT_SIZE: usize = 2 * RING_SIZE;

const HEAD_OFFSET: usize = 0;
const TAIL_OFFSET: usize = 8;
const WRITER_CLOSED_OFFSET: usize = 16;
const READER_CLOSED_OFFSET: usize = 20;

/// Raw view of one ring inside the mapped segment.
#[derive(Clone, Copy)]
struct Ring {
    base: *mut u8,
}

impl Ring {
    fn head(&self) -> &AtomicU64 {
        // SAFETY: the header lives inside the mapping, is 8-byte aligned (the mapping is
        // page aligned and rings start at multiples of 64) and is only accessed atomically.
        unsafe { AtomicU64::from_ptr(self.base.add(HEAD_OFFSET) as *mut u64) }
    }

    fn tail(&self) -> &AtomicU64 {
        // SAFETY: see `head`.
        unsafe { AtomicU64::from_ptr(self.base.add(TAIL_OFFSET) as *mut u64) }
    }

    fn writer_closed(&self) -> &AtomicU32 {
        // SAFETY: see `head`.
        unsafe { AtomicU32::from_ptr(self.base.add(WRITER_CLOSED_OFFSET) as *mut u32) }
    }

    fn reader_closed(&self) -> &AtomicU32 {
        // SAFETY: see `head`.
        unsafe { AtomicU32::from_ptr(self.base.add(READER_CLOSED_OFFSET) as *mut u32) }
    }

    fn data(&self) -> *mut u8 {
        // SAFETY: the data region directly follows the header within the same mapping.
        unsafe { self.base.add(RING_HEADER_SIZE) }
    }

    /// Copy as much of `src` as fits; returns bytes written.
    fn push(&self, src: &[u8]) -> usize {
        let head = self.head().load(Ordering::Relaxed);
        let tail = self.tail().load(Ordering::Acquire);
        let free = RING_CAPACITY - (head - tail) as usize;
        let n = free.min(src.len());
        if n == 0 {
            return 0;
        }

        let start = (head % RING_CAPACITY as u64) as usize;
        let first = n.min(RING_CAPACITY - start);
        // SAFETY: both regions are inside the data area and the consumer never reads
        // bytes beyond the published head.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.data().add(start), first);
            std::ptr::copy_nonoverlapping(src.as_ptr().add(first), self.data(), n - first);
        }
        self.head().store(head + n as u64, Ordering::Release);
        n
    }

    /// Copy up to `dst.len()` published bytes; returns bytes read.
    fn pop(&self, dst: &mut [u8]) -> usize {
        let tail = self.tail().load(Ordering::Relaxed);
        let head = self.head().load(Ordering::Acquire);
        let n = ((head - tail) as usize).min(dst.len());
        if n == 0 {
            return 0;
        }

        let start = (tail % RING_CAPACITY as u64) as usize;
        let first = n.min(RING_CAPACITY - start);
        // SAFETY: the bytes in [tail, head) were published by the producer with Release.
        unsafe {
            std::ptr::copy_nonoverlapping(self.data().add(start), dst.as_mut_ptr(), first);
            std::ptr::copy_nonoverlapping(self.data(), dst.as_mut_ptr().add(first), n - first);
        }
        self.tail().store(tail + n as u64, Ordering::Release);
        n
    }
}

/// Named POSIX semaphore handle.
struct Semaphore {
    handle: *mut libc::sem_t,
    name: CString,
}

impl Semaphore {
    fn open(name: &str, create: bool) -> Result<Self> {
        let name = CString::new(name)
            .map_err(|_| CortexError::invalid_uri(name, "semaphore name contains NUL"))?;
        // SAFETY: `name` is a valid NUL-terminated string; the variadic arguments match
        // what sem_open expects when O_CREAT is passed.
        let handle = unsafe {
            if create {
                libc::sem_unlink(name.as_ptr());
                libc::sem_open(
                    name.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL,
                    0o600 as libc::c_uint,
                    0 as libc::c_uint,
                )
            } else {
                libc::sem_open(name.as_ptr(), 0)
            }
        };
        if handle == libc::SEM_FAILED {
            return Err(CortexError::from_io(
                format!("sem_open {}", name.to_string_lossy()),
                std::io::Error::last_os_error(),
            ));
        }
        Ok(Self { handle, name })
    }

    fn post(&self) {
        // SAFETY: handle is a live semaphore for the lifetime of self.
        unsafe { libc::sem_post(self.handle) };
    }

    /// Wait until posted or `deadline` passes. Returns false on timeout.
    fn wait_until(&self, deadline: Instant) -> Result<bool> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let abs = realtime_after(remaining);
            // SAFETY: handle is live and `abs` is a valid timespec.
            let rc = unsafe { libc::sem_timedwait(self.handle, &abs) };
            if rc == 0 {
                return Ok(true);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(CortexError::from_io("sem_timedwait", err)),
            }
        }
    }

    fn unlink(&self) {
        // SAFETY: name is a valid C string.
        unsafe { libc::sem_unlink(self.name.as_ptr()) };
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: handle came from a successful sem_open and is closed exactly once.
        unsafe { libc::sem_close(self.handle) };
    }
}

fn realtime_after(delta: Duration) -> libc::timespec {
    let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: `now` is a valid, writable timespec.
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    let total_nsec = now.tv_nsec as i64 + delta.subsec_nanos() as i64;
    libc::timespec {
        tv_sec: now.tv_sec + delta.as_secs() as libc::time_t + (total_nsec / 1_000_000_000) as libc::time_t,
        tv_nsec: (total_nsec % 1_000_000_000) as _,
    }
}

/// Which side of the segment this process holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    /// Created the segment; writes ring 0, reads ring 1.
    Creator,
    /// Attached to an existing segment; writes ring 1, reads ring 0.
    Attacher,
}

/// Shared-memory transport built from two rings.
pub struct ShmTransport {
    name: String,
    side: Side,
    map: Option<MmapMut>,
    tx_sem: Semaphore,
    rx_sem: Semaphore,
    send_timeout: Duration,
}

// SAFETY: the mapping and semaphore handles are owned exclusively by this value and the
// ring protocol itself is process-safe; moving the owner to another thread is sound.
unsafe impl Send for ShmTransport {}

impl ShmTransport {
    /// Create a fresh segment named `name` (harness side).
    pub fn create(name: &str) -> Result<Self> {
        let path = segment_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| CortexError::from_io(format!("create {}", path.display()), e))?;
        file.set_len(SEGMENT_SIZE as u64)
            .map_err(|e| CortexError::from_io("size shared memory segment", e))?;
        let map = map_segment(&file)?;

        let tx_sem = Semaphore::open(&semaphore_name(name, 0), true)?;
        let rx_sem = Semaphore::open(&semaphore_name(name, 1), true)?;

        info!(segment = %path.display(), bytes = SEGMENT_SIZE, "Created shared memory transport");
        Ok(Self {
            name: name.to_string(),
            side: Side::Creator,
            map: Some(map),
            tx_sem,
            rx_sem,
            send_timeout: WINDOW_TIMEOUT,
        })
    }

    /// Attach to a segment created by the peer (adapter side).
    pub fn open(name: &str) -> Result<Self> {
        let path = segment_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| CortexError::from_io(format!("open {}", path.display()), e))?;
        let len = file.metadata().map_err(|e| CortexError::from_io("stat segment", e))?.len();
        if len != SEGMENT_SIZE as u64 {
            return Err(CortexError::malformed(
                "shared memory segment",
                format!("expected {} bytes, found {}", SEGMENT_SIZE, len),
            ));
        }
        let map = map_segment(&file)?;

        let tx_sem = Semaphore::open(&semaphore_name(name, 1), false)?;
        let rx_sem = Semaphore::open(&semaphore_name(name, 0), false)?;

        info!(segment = %path.display(), "Attached to shared memory transport");
        Ok(Self {
            name: name.to_string(),
            side: Side::Attacher,
            map: Some(map),
            tx_sem,
            rx_sem,
            send_timeout: WINDOW_TIMEOUT,
        })
    }

    /// Longest a single `send` may wait for ring space before failing with
    /// [`CortexError::Timeout`]. A peer that dies without closing never drains.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    fn rings(&mut self) -> Result<(Ring, Ring)> {
        let map = self.map.as_mut().ok_or_else(|| closed_error("shm"))?;
        let base = map.as_mut_ptr();
        // SAFETY: both ring offsets lie within the SEGMENT_SIZE mapping.
        let (ring0, ring1) = unsafe { (Ring { base }, Ring { base: base.add(RING_SIZE) }) };
        Ok(match self.side {
            Side::Creator => (ring0, ring1),
            Side::Attacher => (ring1, ring0),
        })
    }
}

impl Transport for ShmTransport {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        let (tx, _) = self.rings()?;
        let deadline = Instant::now() + self.send_timeout;
        let mut written = 0;
        while written < data.len() {
            if tx.reader_closed().load(Ordering::Acquire) != 0 {
                return Err(CortexError::ConnectionReset {
                    context: format!("shm peer closed '{}'", self.name),
                });
            }
            let n = tx.push(&data[written..]);
            if n == 0 {
                if Instant::now() >= deadline {
                    return Err(CortexError::Timeout { duration: self.send_timeout });
                }
                // Ring full: the consumer drains without signalling, so spin.
                std::hint::spin_loop();
                std::thread::yield_now();
                continue;
            }
            written += n;
            self.tx_sem.post();
        }
        trace!(bytes = data.len(), "shm send");
        Ok(written)
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (_, rx) = self.rings()?;
        let deadline = Instant::now() + timeout;
        loop {
            let n = rx.pop(buf);
            if n > 0 {
                return Ok(n);
            }
            if rx.writer_closed().load(Ordering::Acquire) != 0 {
                return Ok(0);
            }
            if timeout.is_zero() || !self.rx_sem.wait_until(deadline)? {
                // One last look: a post may have raced with the timeout.
                let n = rx.pop(buf);
                if n > 0 {
                    return Ok(n);
                }
                return Err(CortexError::Timeout { duration: timeout });
            }
        }
    }

    fn close(&mut self) {
        if let Ok((tx, rx)) = self.rings() {
            tx.writer_closed().store(1, Ordering::Release);
            rx.reader_closed().store(1, Ordering::Release);
            // Wake a consumer blocked on our ring so it observes EOF.
            self.tx_sem.post();
        }
        if self.map.take().is_some() && self.side == Side::Creator {
            self.tx_sem.unlink();
            self.rx_sem.unlink();
            let _ = std::fs::remove_file(segment_path(&self.name));
            debug!(name = %self.name, "Removed shared memory segment");
        }
    }

    fn kind(&self) -> &'static str {
        "shm"
    }
}

impl Drop for ShmTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn map_segment(file: &File) -> Result<MmapMut> {
    // SAFETY: the segment is only resized by its creator before either side maps it.
    unsafe { MmapMut::map_mut(file) }.map_err(|e| CortexError::from_io("mmap segment", e))
}

fn segment_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/dev/shm/cortex-{}", name))
}

fn semaphore_name(name: &str, ring: usize) -> String {
    format!("/cortex-{}-{}", name, ring)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn unique(name: &str) -> String {
        format!("{}-{}", name, std::process::id())
    }

    #[test]
    fn round_trip_between_sides() {
        let name = unique("roundtrip");
        let mut harness = ShmTransport::create(&name).unwrap();
        let mut adapter = ShmTransport::open(&name).unwrap();

        harness.send(b"window").unwrap();
        let mut buf = [0u8; 16];
        let n = adapter.recv(&mut buf, Duration::from_millis(500)).unwrap();
        assert_eq!(&buf[..n], b"window");

        adapter.send(b"result").unwrap();
        let n = harness.recv(&mut buf, Duration::from_millis(500)).unwrap();
        assert_eq!(&buf[..n], b"result");
    }

    #[test]
    fn recv_times_out() {
        let name = unique("timeout");
        let mut harness = ShmTransport::create(&name).unwrap();
        let start = Instant::now();
        let err = harness.recv(&mut [0u8; 4], Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, CortexError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn payload_larger_than_ring_streams_through() {
        let name = unique("large");
        let mut harness = ShmTransport::create(&name).unwrap();
        let mut adapter = ShmTransport::open(&name).unwrap();

        let payload: Vec<u8> = (0..RING_CAPACITY * 2 + 123).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = thread::spawn(move || {
            harness.send(&payload).unwrap();
            harness
        });

        let mut received = Vec::with_capacity(expected.len());
        let mut buf = vec![0u8; 8192];
        while received.len() < expected.len() {
            let n = adapter.recv(&mut buf, Duration::from_secs(2)).unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, expected);
        drop(writer.join().unwrap());
    }

    #[test]
    fn send_to_a_stalled_peer_times_out() {
        let name = unique("stalled");
        let mut harness = ShmTransport::create(&name).unwrap().with_send_timeout(Duration::from_millis(100));
        // Attached but never reading and never closing, like a crashed adapter.
        let _adapter = ShmTransport::open(&name).unwrap();

        let start = Instant::now();
        let err = harness.send(&vec![0u8; RING_CAPACITY + 1]).unwrap_err();
        assert!(matches!(err, CortexError::Timeout { .. }), "{err:?}");
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn close_reads_as_eof() {
        let name = unique("eof");
        let mut harness = ShmTransport::create(&name).unwrap();
        let mut adapter = ShmTransport::open(&name).unwrap();
        adapter.close();
        assert_eq!(harness.recv(&mut [0u8; 4], Duration::from_millis(200)).unwrap(), 0);
    }
}
