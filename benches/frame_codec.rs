//! Benchmarks for the wire codec
//!
//! Measures the per-window protocol overhead:
//! - Header encoding with CRC32 over single-frame payloads
//! - f32 sample encode/decode for a 160 x 64 window
//! - A full frame send/receive over a loopback socket pair
//!
//! Platform: the loopback benchmark is Unix only

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use cortex::protocol::messages::{decode_samples, encode_samples};
use cortex::protocol::{CHUNK_SIZE, FrameHeader, FrameType, MAX_FRAME_PAYLOAD};
use cortex::test_utils::ramp;
use std::hint::black_box;

fn bench_header_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_header_encode");

    for size in [64usize, CHUNK_SIZE, MAX_FRAME_PAYLOAD] {
        let payload = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| black_box(FrameHeader::encode(FrameType::WindowChunk, 0, black_box(payload)).unwrap()))
        });
    }

    group.finish();
}

fn bench_samples(c: &mut Criterion) {
    let window = ramp(160, 64, 0.0);
    let mut bytes = Vec::with_capacity(window.len() * 4);
    encode_samples(&window, &mut bytes);

    let mut group = c.benchmark_group("samples_160x64");
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    group.bench_function("encode", |b| {
        let mut out = Vec::with_capacity(bytes.len());
        b.iter(|| {
            out.clear();
            encode_samples(black_box(&window), &mut out);
            black_box(out.len())
        })
    });

    group.bench_function("decode", |b| {
        let mut out = vec![0.0f32; window.len()];
        b.iter(|| {
            decode_samples(black_box(&bytes), &mut out).unwrap();
            black_box(out[0])
        })
    });

    group.finish();
}

#[cfg(unix)]
fn bench_loopback_frame(c: &mut Criterion) {
    use cortex::protocol::{recv_frame, send_frame};
    use cortex::transport::LoopbackTransport;
    use std::time::Duration;

    let (mut tx, mut rx) = LoopbackTransport::pair().expect("socket pair");
    let payload = vec![0x5Au8; CHUNK_SIZE];
    let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];

    let mut group = c.benchmark_group("loopback_frame");
    group.throughput(Throughput::Bytes(CHUNK_SIZE as u64));
    group.bench_function("send_recv_8k", |b| {
        b.iter(|| {
            send_frame(&mut tx, FrameType::WindowChunk, 0, black_box(&payload)).unwrap();
            let header = recv_frame(&mut rx, &mut buf, Duration::from_secs(1)).unwrap();
            black_box(header.crc32)
        })
    });
    group.finish();
}

#[cfg(not(unix))]
fn bench_loopback_frame(_c: &mut Criterion) {}

criterion_group!(benches, bench_header_encode, bench_samples, bench_loopback_frame);
criterion_main!(benches);
