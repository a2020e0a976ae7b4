//! Fragmentation of logical messages into WINDOW_CHUNK frames.
//!
//! A message is cut into [`CHUNK_SIZE`] pieces that share one sequence number. Each
//! piece carries a 20-byte [`ChunkHeader`] ahead of its data and the final piece sets
//! [`ChunkHeader::FLAG_LAST`].

use std::time::{Duration, Instant};

use tracing::trace;

use super::messages::parse_u32_le;
use super::{
    CHUNK_SIZE, ErrorPayload, FrameType, MAX_FRAME_PAYLOAD, MAX_WINDOW_BYTES, recv_frame,
    recv_frame_after_idle, send_frame,
};
use crate::transport::Transport;
use crate::{CortexError, Result};

/// Per-chunk envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub sequence: u32,
    pub total_bytes: u32,
    pub offset_bytes: u32,
    pub chunk_length: u32,
    pub flags: u32,
}

impl ChunkHeader {
    pub const SIZE: usize = 20;
    pub const FLAG_LAST: u32 = 0x1;

    pub fn is_last(&self) -> bool {
        self.flags & Self::FLAG_LAST != 0
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        for field in [self.sequence, self.total_bytes, self.offset_bytes, self.chunk_length, self.flags] {
            out.extend_from_slice(&field.to_le_bytes());
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(CortexError::malformed(
                "WINDOW_CHUNK",
                format!("payload is {} bytes, header needs {}", data.len(), Self::SIZE),
            ));
        }
        Ok(Self {
            sequence: parse_u32_le(data, 0)?,
            total_bytes: parse_u32_le(data, 4)?,
            offset_bytes: parse_u32_le(data, 8)?,
            chunk_length: parse_u32_le(data, 12)?,
            flags: parse_u32_le(data, 16)?,
        })
    }
}

/// Send `payload` as a sequence of WINDOW_CHUNK frames tagged with `sequence`.
///
/// An empty payload still produces one (empty) LAST chunk so the receiver completes.
pub fn send_chunked<T: Transport + ?Sized>(
    transport: &mut T,
    sequence: u32,
    payload: &[u8],
) -> Result<()> {
    if payload.len() > MAX_WINDOW_BYTES {
        return Err(CortexError::FrameTooLarge { length: payload.len(), max: MAX_WINDOW_BYTES });
    }
    let total = payload.len() as u32;
    let mut frame = Vec::with_capacity(ChunkHeader::SIZE + CHUNK_SIZE);
    let mut offset = 0usize;

    loop {
        let end = (offset + CHUNK_SIZE).min(payload.len());
        let last = end == payload.len();
        let header = ChunkHeader {
            sequence,
            total_bytes: total,
            offset_bytes: offset as u32,
            chunk_length: (end - offset) as u32,
            flags: if last { ChunkHeader::FLAG_LAST } else { 0 },
        };
        frame.clear();
        header.write_to(&mut frame);
        frame.extend_from_slice(&payload[offset..end]);
        send_frame(transport, FrameType::WindowChunk, 0, &frame)?;
        trace!(sequence, offset, len = end - offset, last, "chunk sent");

        if last {
            return Ok(());
        }
        offset = end;
    }
}

/// Reassemble the message with `sequence` into `dst`, returning its length.
///
/// `timeout` bounds the whole message; each chunk must also arrive within
/// `chunk_timeout`. A chunk with any other sequence number fails the message before
/// any of its bytes are copied. An ERROR frame in place of a chunk is surfaced as
/// [`CortexError::Adapter`].
pub fn recv_chunked<T: Transport + ?Sized>(
    transport: &mut T,
    sequence: u32,
    dst: &mut [u8],
    timeout: Duration,
    chunk_timeout: Duration,
) -> Result<usize> {
    let deadline = Instant::now() + timeout;
    let (_, len) = recv_message(transport, Some(sequence), dst, Some((deadline, timeout)), None, chunk_timeout)?;
    Ok(len)
}

/// Reassemble the next message whatever its sequence number, returning `(sequence, length)`.
///
/// The first chunk may take up to `idle` to start arriving and fixes the sequence
/// for the rest of the message. Once it has started, every frame including the
/// first is bounded by `chunk_timeout`. Used by adapters, which learn the sequence
/// from the harness rather than choosing it.
pub fn recv_any_chunked<T: Transport + ?Sized>(
    transport: &mut T,
    dst: &mut [u8],
    idle: Duration,
    chunk_timeout: Duration,
) -> Result<(u32, usize)> {
    recv_message(transport, None, dst, None, Some(idle), chunk_timeout)
}

fn recv_message<T: Transport + ?Sized>(
    transport: &mut T,
    mut expected: Option<u32>,
    dst: &mut [u8],
    deadline: Option<(Instant, Duration)>,
    idle: Option<Duration>,
    chunk_timeout: Duration,
) -> Result<(u32, usize)> {
    let mut frame = vec![0u8; MAX_FRAME_PAYLOAD];
    let mut received = 0usize;
    let mut total: Option<usize> = None;

    loop {
        let mut wait = chunk_timeout;
        if let Some((deadline, timeout)) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CortexError::Timeout { duration: timeout });
            }
            wait = wait.min(remaining);
        }
        let header = match idle {
            Some(idle) if total.is_none() => recv_frame_after_idle(transport, &mut frame, idle, wait)?,
            _ => recv_frame(transport, &mut frame, wait)?,
        };
        let payload = &frame[..header.payload_length as usize];

        match header.frame_type {
            FrameType::WindowChunk => {}
            FrameType::Error => {
                let err = ErrorPayload::decode(payload)?;
                return Err(CortexError::Adapter { code: err.code, message: err.message });
            }
            other => {
                return Err(CortexError::UnexpectedFrame {
                    expected: FrameType::WindowChunk.name(),
                    found: other.name(),
                });
            }
        }

        let chunk = ChunkHeader::decode(payload)?;
        let sequence = *expected.get_or_insert(chunk.sequence);
        if chunk.sequence != sequence {
            return Err(CortexError::SequenceMismatch { expected: sequence, found: chunk.sequence });
        }
        let data = &payload[ChunkHeader::SIZE..];
        if data.len() != chunk.chunk_length as usize {
            return Err(CortexError::malformed(
                "WINDOW_CHUNK",
                format!("declares {} data bytes, carries {}", chunk.chunk_length, data.len()),
            ));
        }

        let chunk_total = chunk.total_bytes as usize;
        match total {
            None => {
                if chunk_total > dst.len() {
                    return Err(CortexError::BufferTooSmall { needed: chunk_total, capacity: dst.len() });
                }
                total = Some(chunk_total);
            }
            Some(t) if t != chunk_total => {
                return Err(CortexError::malformed(
                    "WINDOW_CHUNK",
                    format!("total changed from {} to {} mid-message", t, chunk_total),
                ));
            }
            Some(_) => {}
        }

        let offset = chunk.offset_bytes as usize;
        if offset != received {
            return Err(CortexError::malformed(
                "WINDOW_CHUNK",
                format!("offset {} is not contiguous with {} bytes received", offset, received),
            ));
        }
        let end = offset + data.len();
        if end > chunk_total {
            return Err(CortexError::malformed(
                "WINDOW_CHUNK",
                format!("chunk ends at {} past total {}", end, chunk_total),
            ));
        }

        dst[offset..end].copy_from_slice(data);
        received = end;
        trace!(sequence, offset, len = data.len(), last = chunk.is_last(), "chunk received");

        if chunk.is_last() {
            if received != chunk_total {
                return Err(CortexError::malformed(
                    "WINDOW_CHUNK",
                    format!("LAST chunk ends at {} but total is {}", received, chunk_total),
                ));
            }
            return Ok((sequence, received));
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use proptest::prelude::*;
    use std::thread;

    const T: Duration = Duration::from_secs(5);

    fn round_trip(payload: Vec<u8>) -> Vec<u8> {
        let (mut tx, mut rx) = LoopbackTransport::pair().unwrap();
        let expected_len = payload.len();
        let writer = thread::spawn(move || send_chunked(&mut tx, 3, &payload).unwrap());
        let mut dst = vec![0u8; MAX_WINDOW_BYTES];
        let n = recv_chunked(&mut rx, 3, &mut dst, T, T).unwrap();
        writer.join().unwrap();
        assert_eq!(n, expected_len);
        dst.truncate(n);
        dst
    }

    fn raw_chunk(header: ChunkHeader, data: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        header.write_to(&mut frame);
        frame.extend_from_slice(data);
        frame
    }

    #[test]
    fn reassembles_exact_chunk_multiples() {
        for size in [CHUNK_SIZE, 2 * CHUNK_SIZE, MAX_WINDOW_BYTES] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            assert_eq!(round_trip(payload.clone()), payload);
        }
    }

    #[test]
    fn chunk_boundaries_and_last_flag() {
        let (mut tx, mut rx) = LoopbackTransport::pair().unwrap();
        send_chunked(&mut tx, 9, &vec![1u8; CHUNK_SIZE + 10]).unwrap();

        let mut frame = vec![0u8; MAX_FRAME_PAYLOAD];
        let first = recv_frame(&mut rx, &mut frame, T).unwrap();
        assert_eq!(first.payload_length as usize, ChunkHeader::SIZE + CHUNK_SIZE);
        let h = ChunkHeader::decode(&frame).unwrap();
        assert_eq!((h.sequence, h.offset_bytes, h.is_last()), (9, 0, false));

        recv_frame(&mut rx, &mut frame, T).unwrap();
        let h = ChunkHeader::decode(&frame).unwrap();
        assert_eq!((h.offset_bytes, h.chunk_length, h.is_last()), (CHUNK_SIZE as u32, 10, true));
    }

    #[test]
    fn empty_message_round_trips() {
        assert!(round_trip(Vec::new()).is_empty());
    }

    #[test]
    fn rejects_oversized_message() {
        let (mut tx, _rx) = LoopbackTransport::pair().unwrap();
        let err = send_chunked(&mut tx, 0, &vec![0u8; MAX_WINDOW_BYTES + 1]).unwrap_err();
        assert!(matches!(err, CortexError::FrameTooLarge { .. }));
    }

    #[test]
    fn wrong_sequence_is_rejected_without_touching_destination() {
        let (mut tx, mut rx) = LoopbackTransport::pair().unwrap();
        send_chunked(&mut tx, 6, &[0xAB; 64]).unwrap();

        let mut dst = vec![0x11u8; 128];
        let err = recv_chunked(&mut rx, 5, &mut dst, T, T).unwrap_err();
        assert!(matches!(err, CortexError::SequenceMismatch { expected: 5, found: 6 }));
        assert!(dst.iter().all(|&b| b == 0x11));
    }

    #[test]
    fn destination_too_small() {
        let (mut tx, mut rx) = LoopbackTransport::pair().unwrap();
        send_chunked(&mut tx, 1, &[0u8; 100]).unwrap();
        let err = recv_chunked(&mut rx, 1, &mut [0u8; 50], T, T).unwrap_err();
        assert!(matches!(err, CortexError::BufferTooSmall { needed: 100, capacity: 50 }));
    }

    #[test]
    fn gaps_and_short_totals_are_malformed() {
        let (mut tx, mut rx) = LoopbackTransport::pair().unwrap();
        let gap = ChunkHeader { sequence: 1, total_bytes: 8, offset_bytes: 4, chunk_length: 4, flags: 1 };
        send_frame(&mut tx, FrameType::WindowChunk, 0, &raw_chunk(gap, &[0; 4])).unwrap();
        let err = recv_chunked(&mut rx, 1, &mut [0u8; 8], T, T).unwrap_err();
        assert!(matches!(err, CortexError::Malformed { .. }));

        let short = ChunkHeader { sequence: 1, total_bytes: 8, offset_bytes: 0, chunk_length: 4, flags: 1 };
        send_frame(&mut tx, FrameType::WindowChunk, 0, &raw_chunk(short, &[0; 4])).unwrap();
        let err = recv_chunked(&mut rx, 1, &mut [0u8; 8], T, T).unwrap_err();
        assert!(matches!(err, CortexError::Malformed { .. }));
    }

    #[test]
    fn stalled_sender_hits_chunk_timeout() {
        let (mut tx, mut rx) = LoopbackTransport::pair().unwrap();
        let first = ChunkHeader { sequence: 2, total_bytes: 16, offset_bytes: 0, chunk_length: 8, flags: 0 };
        send_frame(&mut tx, FrameType::WindowChunk, 0, &raw_chunk(first, &[1; 8])).unwrap();

        let start = Instant::now();
        let err = recv_chunked(&mut rx, 2, &mut [0u8; 16], T, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, CortexError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn any_sequence_adopts_first_chunk() {
        let (mut tx, mut rx) = LoopbackTransport::pair().unwrap();
        let payload = vec![5u8; CHUNK_SIZE * 2 + 1];
        send_chunked(&mut tx, 77, &payload).unwrap();
        let mut dst = vec![0u8; MAX_WINDOW_BYTES];
        let (sequence, n) = recv_any_chunked(&mut rx, &mut dst, T, T).unwrap();
        assert_eq!((sequence, n), (77, payload.len()));

        // A second chunk from a different message mid-stream is still rejected.
        let first = ChunkHeader { sequence: 1, total_bytes: 8, offset_bytes: 0, chunk_length: 4, flags: 0 };
        let stray = ChunkHeader { sequence: 2, total_bytes: 8, offset_bytes: 4, chunk_length: 4, flags: 1 };
        send_frame(&mut tx, FrameType::WindowChunk, 0, &raw_chunk(first, &[0; 4])).unwrap();
        send_frame(&mut tx, FrameType::WindowChunk, 0, &raw_chunk(stray, &[0; 4])).unwrap();
        let err = recv_any_chunked(&mut rx, &mut dst, T, T).unwrap_err();
        assert!(matches!(err, CortexError::SequenceMismatch { expected: 1, found: 2 }));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn reassemble_of_split_is_identity(size in 1usize..=MAX_WINDOW_BYTES, seed in any::<u8>()) {
            let payload: Vec<u8> = (0..size).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect();
            prop_assert_eq!(round_trip(payload.clone()), payload);
        }
    }
}
