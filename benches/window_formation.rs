//! Benchmarks for window formation and dispatch
//!
//! - Scheduler bookkeeping alone (copy in, dispatch, shift) with a no-op device
//! - One full window round trip through the protocol to an in-process adapter
//!
//! Shapes follow a 160 Hz, 64 channel EEG stream with 1 s windows and 50% overlap.

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use cortex::test_utils::ramp;
use cortex::{Device, DeviceTiming, NullSink, Scheduler, SchedulerConfig, WindowResult};
use std::hint::black_box;

const SAMPLE_RATE: u32 = 160;
const WINDOW: u32 = 160;
const HOP: u32 = 80;
const CHANNELS: u32 = 64;

fn config() -> SchedulerConfig {
    SchedulerConfig {
        sample_rate_hz: SAMPLE_RATE,
        window_length_samples: WINDOW,
        hop_samples: HOP,
        channels: CHANNELS,
        warmup_seconds: 0.0,
    }
}

/// Copies input to output and nothing else.
struct CopyDevice {
    output_len: usize,
}

impl Device for CopyDevice {
    fn name(&self) -> &str {
        "copy"
    }

    fn output_len(&self) -> usize {
        self.output_len
    }

    fn execute_window(&mut self, sequence: u32, input: &[f32], output: &mut [f32]) -> cortex::Result<WindowResult> {
        output.copy_from_slice(input);
        Ok(WindowResult {
            sequence,
            output_samples: WINDOW,
            output_channels: CHANNELS,
            timing: DeviceTiming::default(),
        })
    }

    fn teardown(&mut self) {}
}

fn bench_scheduler_hops(c: &mut Criterion) {
    let hop = ramp(HOP as usize, CHANNELS as usize, 0.0);
    let window_len = (WINDOW * CHANNELS) as usize;

    let mut group = c.benchmark_group("scheduler");
    group.throughput(Throughput::Bytes((hop.len() * 4) as u64));

    group.bench_function("feed_hop_no_devices", |b| {
        let mut scheduler = Scheduler::new(config(), Box::new(NullSink)).unwrap();
        b.iter(|| black_box(scheduler.feed_samples(black_box(&hop)).unwrap()))
    });

    group.bench_function("feed_hop_copy_device", |b| {
        let mut scheduler = Scheduler::new(config(), Box::new(NullSink)).unwrap();
        scheduler.register_device(Box::new(CopyDevice { output_len: window_len })).unwrap();
        b.iter(|| black_box(scheduler.feed_samples(black_box(&hop)).unwrap()))
    });

    group.finish();
}

#[cfg(unix)]
fn bench_protocol_round_trip(c: &mut Criterion) {
    use cortex::test_utils::in_process_device;
    use cortex::{DeviceTimeouts, SessionConfig};

    let session = SessionConfig {
        sample_rate_hz: SAMPLE_RATE,
        window_length_samples: WINDOW,
        hop_samples: HOP,
        channels: CHANNELS,
        kernel: "identity".to_string(),
        params: String::new(),
        calibration_state: Vec::new(),
    };
    let (mut device, adapter) =
        in_process_device("bench", &session, DeviceTimeouts::default()).expect("in-process adapter");

    let input = ramp(WINDOW as usize, CHANNELS as usize, 0.0);
    let mut output = vec![0.0f32; device.output_len()];
    let mut sequence = 0u32;

    let mut group = c.benchmark_group("device");
    group.throughput(Throughput::Bytes((input.len() * 4) as u64));
    group.bench_function("execute_window_160x64_identity", |b| {
        b.iter(|| {
            let result = device.execute_window(sequence, black_box(&input), &mut output).unwrap();
            sequence = sequence.wrapping_add(1);
            black_box(result.timing)
        })
    });
    group.finish();

    device.teardown();
    let _ = adapter.join();
}

#[cfg(not(unix))]
fn bench_protocol_round_trip(_c: &mut Criterion) {}

criterion_group!(benches, bench_scheduler_hops, bench_protocol_round_trip);
criterion_main!(benches);
