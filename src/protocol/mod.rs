//! Wire protocol between the harness and device adapters.
//!
//! ## Frame Layout
//!
//! Every unit on the wire is a 16-byte header followed by the payload. All multi-byte
//! fields are little-endian.
//!
//! ```text
//! offset  size  field
//!      0     4  magic            "CRTX"
//!      4     1  version          PROTOCOL_VERSION
//!      5     1  frame_type       HELLO=1 CONFIG=2 ACK=3 WINDOW_CHUNK=4 RESULT=5 ERROR=6
//!      6     2  flags
//!      8     4  payload_length   <= MAX_FRAME_PAYLOAD
//!     12     4  crc32            over header[0..12] ++ payload
//! ```
//!
//! Logical messages larger than one frame (input windows, result samples) are carried
//! by the chunking sub-protocol in [`chunk`].
//!
//! ## Failure Semantics
//!
//! Nothing here retries. The first error is returned to the caller, which owns the
//! retry policy.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::transport::Transport;
use crate::{CortexError, Result};

pub mod chunk;
pub mod messages;

pub use chunk::{ChunkHeader, recv_any_chunked, recv_chunked, send_chunked};
pub use messages::{Ack, Config, ErrorPayload, Hello, ResultHeader};

/// Frame magic; the little-endian bytes spell `CRTX` on the wire.
pub const MAGIC: u32 = u32::from_le_bytes(*b"CRTX");

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Largest payload a single frame may carry.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Payload bytes per chunk of a fragmented message.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Largest logical window or result message.
pub const MAX_WINDOW_BYTES: usize = 256 * 1024;

/// Bytes per sample on the wire (little-endian f32).
pub const SAMPLE_SIZE: usize = 4;

/// Default time allowed for the HELLO/CONFIG/ACK exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default time allowed from sending a window until its result is complete.
pub const WINDOW_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Default time allowed between consecutive chunks of one message.
pub const CHUNK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default time an adapter waits for the harness to connect.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Hello = 1,
    Config = 2,
    Ack = 3,
    WindowChunk = 4,
    Result = 5,
    Error = 6,
}

impl FrameType {
    /// Decode a wire code.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(FrameType::Hello),
            2 => Ok(FrameType::Config),
            3 => Ok(FrameType::Ack),
            4 => Ok(FrameType::WindowChunk),
            5 => Ok(FrameType::Result),
            6 => Ok(FrameType::Error),
            _ => Err(CortexError::UnknownFrameType { code }),
        }
    }

    /// Name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            FrameType::Hello => "HELLO",
            FrameType::Config => "CONFIG",
            FrameType::Ack => "ACK",
            FrameType::WindowChunk => "WINDOW_CHUNK",
            FrameType::Result => "RESULT",
            FrameType::Error => "ERROR",
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub flags: u16,
    pub payload_length: u32,
    pub crc32: u32,
}

impl FrameHeader {
    /// Serialize with a CRC computed over the header prefix and `payload`.
    pub fn encode(frame_type: FrameType, flags: u16, payload: &[u8]) -> Result<[u8; HEADER_SIZE]> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(CortexError::FrameTooLarge { length: payload.len(), max: MAX_FRAME_PAYLOAD });
        }
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        header[4] = PROTOCOL_VERSION;
        header[5] = frame_type as u8;
        header[6..8].copy_from_slice(&flags.to_le_bytes());
        header[8..12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        let crc = frame_crc(&header[..12], payload);
        header[12..16].copy_from_slice(&crc.to_le_bytes());
        Ok(header)
    }
}

/// CRC32 over the first 12 header bytes followed by the payload.
pub fn frame_crc(header_prefix: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header_prefix);
    hasher.update(payload);
    hasher.finalize()
}

/// Send one frame: header first, then payload.
pub fn send_frame<T: Transport + ?Sized>(
    transport: &mut T,
    frame_type: FrameType,
    flags: u16,
    payload: &[u8],
) -> Result<()> {
    let header = FrameHeader::encode(frame_type, flags, payload)?;
    transport.send(&header)?;
    if !payload.is_empty() {
        transport.send(payload)?;
    }
    trace!(frame = frame_type.name(), bytes = payload.len(), "frame sent");
    Ok(())
}

/// Receive one frame into `buf`, bounded by a single end-to-end `timeout`.
///
/// Leading garbage is skipped by hunting for the magic one byte at a time. Returns
/// the validated header; the payload occupies `buf[..header.payload_length]`.
///
/// If the deadline passes before any byte arrives the result is
/// [`CortexError::Timeout`]; if bytes arrived but never formed the magic it is
/// [`CortexError::MagicNotFound`].
pub fn recv_frame<T: Transport + ?Sized>(
    transport: &mut T,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<FrameHeader> {
    let deadline = Instant::now() + timeout;
    let first = read_byte_until(transport, deadline, timeout)?;
    finish_frame(transport, buf, first, deadline, timeout)
}

/// Receive one frame after waiting up to `idle` for it to start.
///
/// Only the wait for the first byte is bounded by `idle`; once a byte has been
/// consumed the rest of the frame gets a fresh `timeout`, so a frame that straddles
/// the idle boundary is still received whole. Nothing arriving within `idle` is
/// [`CortexError::Timeout`].
pub fn recv_frame_after_idle<T: Transport + ?Sized>(
    transport: &mut T,
    buf: &mut [u8],
    idle: Duration,
    timeout: Duration,
) -> Result<FrameHeader> {
    let first = read_byte_until(transport, Instant::now() + idle, idle)?;
    finish_frame(transport, buf, first, Instant::now() + timeout, timeout)
}

fn read_byte_until<T: Transport + ?Sized>(transport: &mut T, deadline: Instant, timeout: Duration) -> Result<u8> {
    let mut byte = [0u8; 1];
    read_exact_until(transport, &mut byte, deadline, timeout)?;
    Ok(byte[0])
}

fn finish_frame<T: Transport + ?Sized>(
    transport: &mut T,
    buf: &mut [u8],
    first: u8,
    deadline: Instant,
    timeout: Duration,
) -> Result<FrameHeader> {
    // 1. Magic hunting
    let mut window = [0u8; 4];
    window[3] = first;
    let mut scanned = 1usize;
    while scanned < 4 || u32::from_le_bytes(window) != MAGIC {
        let byte = match read_byte_until(transport, deadline, timeout) {
            Ok(byte) => byte,
            Err(CortexError::Timeout { .. }) => return Err(CortexError::MagicNotFound { scanned }),
            Err(e) => return Err(e),
        };
        window.copy_within(1..4, 0);
        window[3] = byte;
        scanned += 1;
    }
    if scanned > 4 {
        trace!(skipped = scanned - 4, "skipped bytes before frame magic");
    }

    // 2. Remaining header bytes
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&window);
    read_exact_until(transport, &mut header[4..], deadline, timeout)?;

    // 3. Version
    if header[4] != PROTOCOL_VERSION {
        return Err(CortexError::VersionMismatch { expected: PROTOCOL_VERSION, found: header[4] });
    }

    // 4. Length against the hard cap and the caller's buffer
    let payload_length = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    let length = payload_length as usize;
    if length > MAX_FRAME_PAYLOAD {
        return Err(CortexError::FrameTooLarge { length, max: MAX_FRAME_PAYLOAD });
    }
    if length > buf.len() {
        return Err(CortexError::BufferTooSmall { needed: length, capacity: buf.len() });
    }

    // 5. Payload
    read_exact_until(transport, &mut buf[..length], deadline, timeout)?;

    // 6. CRC
    let expected = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
    let actual = frame_crc(&header[..12], &buf[..length]);
    if expected != actual {
        return Err(CortexError::CrcMismatch { expected, actual });
    }

    let frame_type = FrameType::from_code(header[5])?;
    let flags = u16::from_le_bytes([header[6], header[7]]);
    trace!(frame = frame_type.name(), bytes = length, "frame received");
    Ok(FrameHeader { frame_type, flags, payload_length, crc32: expected })
}

/// Receive a frame and require a specific type.
///
/// An ERROR frame in place of the expected type is decoded and surfaced as
/// [`CortexError::Adapter`].
pub fn recv_expected<T: Transport + ?Sized>(
    transport: &mut T,
    expected: FrameType,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<usize> {
    let header = recv_frame(transport, buf, timeout)?;
    let length = header.payload_length as usize;
    if header.frame_type == expected {
        return Ok(length);
    }
    if header.frame_type == FrameType::Error {
        let err = ErrorPayload::decode(&buf[..length])?;
        return Err(CortexError::Adapter { code: err.code, message: err.message });
    }
    Err(CortexError::UnexpectedFrame { expected: expected.name(), found: header.frame_type.name() })
}

/// Fill `buf` completely or fail once `deadline` passes.
///
/// End of stream mid-read is a reset: frames are never legitimately truncated.
pub(crate) fn read_exact_until<T: Transport + ?Sized>(
    transport: &mut T,
    buf: &mut [u8],
    deadline: Instant,
    timeout: Duration,
) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let n = match transport.recv(&mut buf[filled..], remaining) {
            Ok(n) => n,
            Err(CortexError::Timeout { .. }) => return Err(CortexError::Timeout { duration: timeout }),
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Err(CortexError::ConnectionReset {
                context: format!("{} peer closed the stream", transport.kind()),
            });
        }
        filled += n;
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use proptest::prelude::*;

    fn encoded(frame_type: FrameType, payload: &[u8]) -> Vec<u8> {
        let mut bytes = FrameHeader::encode(frame_type, 0, payload).unwrap().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn magic_spells_crtx() {
        assert_eq!(&MAGIC.to_le_bytes(), b"CRTX");
    }

    #[test]
    fn frame_round_trip() {
        let (mut a, mut b) = LoopbackTransport::pair().unwrap();
        send_frame(&mut a, FrameType::Ack, 0x0102, b"payload").unwrap();

        let mut buf = [0u8; 64];
        let header = recv_frame(&mut b, &mut buf, Duration::from_millis(500)).unwrap();
        assert_eq!(header.frame_type, FrameType::Ack);
        assert_eq!(header.flags, 0x0102);
        assert_eq!(&buf[..header.payload_length as usize], b"payload");
    }

    #[test]
    fn skips_garbage_before_magic() {
        let (mut a, mut b) = LoopbackTransport::pair().unwrap();
        let mut bytes = b"\x00\xffCRT noise CR".to_vec();
        bytes.extend(encoded(FrameType::Hello, &[1, 2, 3]));
        a.send(&bytes).unwrap();

        let mut buf = [0u8; 16];
        let header = recv_frame(&mut b, &mut buf, Duration::from_millis(500)).unwrap();
        assert_eq!(header.frame_type, FrameType::Hello);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[test]
    fn garbage_only_is_magic_not_found() {
        let (mut a, mut b) = LoopbackTransport::pair().unwrap();
        a.send(b"this is not a frame").unwrap();
        let err = recv_frame(&mut b, &mut [0u8; 16], Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, CortexError::MagicNotFound { scanned: 19 }));
    }

    #[test]
    fn silence_is_timeout_within_bound() {
        let (_a, mut b) = LoopbackTransport::pair().unwrap();
        let start = Instant::now();
        let err = recv_frame(&mut b, &mut [0u8; 16], Duration::from_millis(60)).unwrap_err();
        let elapsed = start.elapsed();
        assert!(matches!(err, CortexError::Timeout { .. }));
        assert!(elapsed >= Duration::from_millis(55));
        assert!(elapsed < Duration::from_millis(600));
    }

    #[test]
    fn frame_straddling_the_idle_wait_is_received_whole() {
        let (mut a, mut b) = LoopbackTransport::pair().unwrap();
        let bytes = encoded(FrameType::WindowChunk, &[5u8; 64]);
        let writer = std::thread::spawn(move || {
            a.send(&bytes[..8]).unwrap();
            std::thread::sleep(Duration::from_millis(150));
            a.send(&bytes[8..]).unwrap();
            a
        });

        let mut buf = [0u8; 128];
        let header =
            recv_frame_after_idle(&mut b, &mut buf, Duration::from_millis(100), Duration::from_secs(1)).unwrap();
        assert_eq!(header.frame_type, FrameType::WindowChunk);
        assert_eq!(&buf[..header.payload_length as usize], &[5u8; 64]);
        drop(writer.join().unwrap());
    }

    #[test]
    fn idle_wait_without_bytes_is_timeout() {
        let (_a, mut b) = LoopbackTransport::pair().unwrap();
        let err = recv_frame_after_idle(&mut b, &mut [0u8; 16], Duration::from_millis(30), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, CortexError::Timeout { .. }));
    }

    #[test]
    fn rejects_wrong_version() {
        let (mut a, mut b) = LoopbackTransport::pair().unwrap();
        let mut bytes = encoded(FrameType::Ack, &[0; 12]);
        bytes[4] = 9;
        a.send(&bytes).unwrap();
        let err = recv_frame(&mut b, &mut [0u8; 16], Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, CortexError::VersionMismatch { expected: 1, found: 9 }));
    }

    #[test]
    fn rejects_oversized_and_undersized_buffers() {
        assert!(matches!(
            FrameHeader::encode(FrameType::Result, 0, &vec![0u8; MAX_FRAME_PAYLOAD + 1]),
            Err(CortexError::FrameTooLarge { .. })
        ));

        let (mut a, mut b) = LoopbackTransport::pair().unwrap();
        let mut forged = encoded(FrameType::Ack, &[]);
        forged[8..12].copy_from_slice(&((MAX_FRAME_PAYLOAD as u32) + 1).to_le_bytes());
        a.send(&forged).unwrap();
        let err = recv_frame(&mut b, &mut [0u8; 16], Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, CortexError::FrameTooLarge { .. }));

        send_frame(&mut a, FrameType::Ack, 0, &[0u8; 32]).unwrap();
        let err = recv_frame(&mut b, &mut [0u8; 16], Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, CortexError::BufferTooSmall { needed: 32, capacity: 16 }));
    }

    #[test]
    fn truncated_frame_is_connection_reset() {
        let (mut a, mut b) = LoopbackTransport::pair().unwrap();
        let bytes = encoded(FrameType::Ack, &[7u8; 12]);
        a.send(&bytes[..20]).unwrap();
        a.close();
        let err = recv_frame(&mut b, &mut [0u8; 16], Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, CortexError::ConnectionReset { .. }));
    }

    #[test]
    fn error_frame_surfaces_as_adapter_error() {
        let (mut a, mut b) = LoopbackTransport::pair().unwrap();
        let payload = ErrorPayload { code: 4242, message: "kernel missing".into() }.encode();
        send_frame(&mut a, FrameType::Error, 0, &payload).unwrap();
        let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];
        let err = recv_expected(&mut b, FrameType::Ack, &mut buf, Duration::from_millis(200)).unwrap_err();
        match err {
            CortexError::Adapter { code, message } => {
                assert_eq!(code, 4242);
                assert_eq!(message, "kernel missing");
            }
            other => panic!("expected adapter error, got {other:?}"),
        }

        send_frame(&mut a, FrameType::Hello, 0, &[]).unwrap();
        let err = recv_expected(&mut b, FrameType::Ack, &mut buf, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, CortexError::UnexpectedFrame { expected: "ACK", found: "HELLO" }));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn single_bit_flip_in_payload_is_detected(
            payload in prop::collection::vec(any::<u8>(), 1..2048),
            bit in any::<prop::sample::Index>(),
        ) {
            let mut bytes = encoded(FrameType::WindowChunk, &payload);
            let bit = bit.index(payload.len() * 8);
            bytes[HEADER_SIZE + bit / 8] ^= 1 << (bit % 8);

            let (mut a, mut b) = LoopbackTransport::pair().unwrap();
            a.send(&bytes).unwrap();
            let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];
            let result = recv_frame(&mut b, &mut buf, Duration::from_millis(500));
            prop_assert!(matches!(result, Err(CortexError::CrcMismatch { .. })), "got {:?}", result);
        }
    }
}
