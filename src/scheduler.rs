//! Streaming window formation and dispatch.
//!
//! The [`Scheduler`] owns one sliding buffer sized to exactly one window. Hop-sized
//! chunks of interleaved samples are appended; every time the buffer fills, the
//! window is dispatched to each registered device in registration order and the
//! buffer is shifted left by one hop, keeping `window - hop` samples of overlap.
//!
//! ```text
//! window 16, hop 8, one channel
//! feed  0..8    buffer  0..8
//! feed  8..16   buffer  0..16  -> dispatch #0, shift: buffer 8..16
//! feed 16..24   buffer  8..24  -> dispatch #1, shift: buffer 16..24
//! ```
//!
//! Everything runs on the caller's thread. Devices are executed sequentially so the
//! buffer needs no locking and one device's timing never overlaps another's.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::monotonic_ns;
use crate::device::{DeviceComm, DeviceTiming, WindowResult};
use crate::error::checked_size;
use crate::protocol::SAMPLE_SIZE;
use crate::telemetry::{TelemetryRecord, TelemetrySink};
use crate::{CortexError, Result};

/// Anything the scheduler can send windows to.
pub trait Device: Send {
    fn name(&self) -> &str;

    /// Samples in one result.
    fn output_len(&self) -> usize;

    fn execute_window(&mut self, sequence: u32, input: &[f32], output: &mut [f32]) -> Result<WindowResult>;

    fn teardown(&mut self);
}

impl Device for DeviceComm {
    fn name(&self) -> &str {
        DeviceComm::name(self)
    }

    fn output_len(&self) -> usize {
        DeviceComm::output_len(self)
    }

    fn execute_window(&mut self, sequence: u32, input: &[f32], output: &mut [f32]) -> Result<WindowResult> {
        DeviceComm::execute_window(self, sequence, input, output)
    }

    fn teardown(&mut self) {
        DeviceComm::teardown(self)
    }
}

/// Stream shape and warmup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    pub sample_rate_hz: u32,
    pub window_length_samples: u32,
    pub hop_samples: u32,
    pub channels: u32,
    /// Leading seconds of windows that are executed but not reported.
    pub warmup_seconds: f64,
}

impl SchedulerConfig {
    /// Reject shapes that cannot form windows.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate_hz == 0 {
            return Err(CortexError::config("sample rate must be positive"));
        }
        if self.window_length_samples == 0 || self.hop_samples == 0 || self.channels == 0 {
            return Err(CortexError::config("window, hop and channels must all be positive"));
        }
        if self.hop_samples > self.window_length_samples {
            return Err(CortexError::config(format!(
                "hop {} exceeds window {}",
                self.hop_samples, self.window_length_samples
            )));
        }
        if !self.warmup_seconds.is_finite() || self.warmup_seconds < 0.0 {
            return Err(CortexError::config("warmup seconds must be a non-negative number"));
        }
        checked_size(
            "window bytes",
            &[self.window_length_samples as usize, self.channels as usize, SAMPLE_SIZE],
        )?;
        Ok(())
    }

    /// Windows whose telemetry is suppressed at the start of a run.
    pub fn warmup_windows(&self) -> u64 {
        let windows = self.warmup_seconds * f64::from(self.sample_rate_hz) / f64::from(self.hop_samples);
        windows.floor() as u64
    }

    /// Real-time budget of one window: the time it takes to acquire one hop.
    pub fn hop_period(&self) -> Duration {
        let nanos = u128::from(self.hop_samples) * 1_000_000_000 / u128::from(self.sample_rate_hz);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Running totals for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub name: String,
    pub windows_completed: u64,
    pub windows_failed: u64,
    /// Counted after warmup only.
    pub deadlines_missed: u64,
    pub last_error_code: Option<u32>,
}

struct DeviceSlot {
    device: Box<dyn Device>,
    output: Vec<f32>,
    stats: DeviceStats,
}

/// Sliding-window scheduler.
pub struct Scheduler {
    config: SchedulerConfig,
    window_len: usize,
    hop_len: usize,
    channels: usize,
    buffer: Vec<f32>,
    fill: usize,
    fresh: bool,
    sequence: u32,
    windows_dispatched: u64,
    warmup_windows: u64,
    hop_period_ns: u64,
    devices: Vec<DeviceSlot>,
    sink: Box<dyn TelemetrySink>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, sink: Box<dyn TelemetrySink>) -> Result<Self> {
        config.validate()?;
        let channels = config.channels as usize;
        let window_len = checked_size("window samples", &[config.window_length_samples as usize, channels])?;
        let hop_len = checked_size("hop samples", &[config.hop_samples as usize, channels])?;
        let hop_period_ns = u64::try_from(config.hop_period().as_nanos()).unwrap_or(u64::MAX);

        info!(
            sample_rate = config.sample_rate_hz,
            window = config.window_length_samples,
            hop = config.hop_samples,
            channels = config.channels,
            hop_period_us = hop_period_ns / 1000,
            warmup_windows = config.warmup_windows(),
            "Scheduler created"
        );

        Ok(Self {
            window_len,
            hop_len,
            channels,
            buffer: vec![0.0; window_len],
            fill: 0,
            fresh: false,
            sequence: 0,
            windows_dispatched: 0,
            warmup_windows: config.warmup_windows(),
            hop_period_ns,
            devices: Vec::new(),
            sink,
            config,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Add a device; windows go to devices in the order they were registered.
    pub fn register_device(&mut self, device: Box<dyn Device>) -> Result<usize> {
        let output_len = device.output_len();
        checked_size("device output bytes", &[output_len, SAMPLE_SIZE])?;
        if self.devices.len() == self.devices.capacity() {
            let grown = checked_size("device list", &[self.devices.capacity().max(1), 2])?;
            self.devices.reserve_exact(grown - self.devices.len());
        }
        info!(device = device.name(), index = self.devices.len(), output_len, "Device registered");
        let stats = DeviceStats { name: device.name().to_string(), ..Default::default() };
        self.devices.push(DeviceSlot { device, output: vec![0.0; output_len], stats });
        Ok(self.devices.len() - 1)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Append interleaved samples, dispatching every window that completes.
    ///
    /// `samples.len()` must be a whole number of frames (a multiple of the channel
    /// count). Returns the number of windows dispatched.
    pub fn feed_samples(&mut self, samples: &[f32]) -> Result<usize> {
        if samples.len() % self.channels != 0 {
            return Err(CortexError::config(format!(
                "chunk of {} samples is not a multiple of {} channels",
                samples.len(),
                self.channels
            )));
        }

        let mut dispatched = 0;
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.window_len - self.fill).min(rest.len());
            self.buffer[self.fill..self.fill + take].copy_from_slice(&rest[..take]);
            self.fill += take;
            self.fresh = true;
            rest = &rest[take..];

            if self.fill == self.window_len {
                self.dispatch();
                dispatched += 1;
                self.buffer.copy_within(self.hop_len.., 0);
                self.fill -= self.hop_len;
            }
        }
        Ok(dispatched)
    }

    /// Dispatch a trailing partial window, zero-padded, if samples arrived since the
    /// last dispatch. Returns whether a window was sent.
    pub fn flush(&mut self) -> bool {
        if !self.fresh || self.fill == 0 {
            return false;
        }
        debug!(fill = self.fill, window = self.window_len, "Flushing partial window");
        self.buffer[self.fill..].fill(0.0);
        self.dispatch();
        self.fill = 0;
        true
    }

    fn dispatch(&mut self) {
        let sequence = self.sequence;
        let window_index = self.windows_dispatched;
        let in_warmup = window_index < self.warmup_windows;
        let window = &self.buffer[..self.window_len];

        for slot in &mut self.devices {
            let release_ns = monotonic_ns();
            let deadline_ns = release_ns.saturating_add(self.hop_period_ns);
            let result = slot.device.execute_window(sequence, window, &mut slot.output);
            let end_ns = monotonic_ns();
            let deadline_missed = end_ns > deadline_ns;

            let (device_timing, failed, error_code) = match &result {
                Ok(r) => {
                    slot.stats.windows_completed += 1;
                    (r.timing, false, 0)
                }
                Err(e) => {
                    slot.stats.windows_failed += 1;
                    slot.stats.last_error_code = Some(e.code());
                    warn!(device = slot.device.name(), sequence, code = e.code(), error = %e, "Window failed");
                    (DeviceTiming::default(), true, e.code())
                }
            };

            if in_warmup {
                continue;
            }
            if deadline_missed {
                slot.stats.deadlines_missed += 1;
                debug!(
                    device = slot.device.name(),
                    sequence,
                    late_us = (end_ns - deadline_ns) / 1000,
                    "Deadline missed"
                );
            }
            self.sink.record(TelemetryRecord {
                device: slot.device.name().to_string(),
                sequence,
                window_index,
                release_ns,
                deadline_ns,
                start_ns: release_ns,
                end_ns,
                deadline_missed,
                device_timing,
                failed,
                error_code,
            });
        }

        self.sequence = self.sequence.wrapping_add(1);
        self.windows_dispatched += 1;
        self.fresh = false;
    }

    /// Windows dispatched so far, warmup included.
    pub fn windows_dispatched(&self) -> u64 {
        self.windows_dispatched
    }

    /// Samples currently buffered.
    pub fn fill(&self) -> usize {
        self.fill
    }

    pub fn device_stats(&self) -> Vec<DeviceStats> {
        self.devices.iter().map(|s| s.stats.clone()).collect()
    }

    /// Output buffer of device `index` after the most recent dispatch.
    pub fn last_output(&self, index: usize) -> Option<&[f32]> {
        self.devices.get(index).map(|s| s.output.as_slice())
    }

    /// Tear down every device in registration order.
    pub fn teardown(&mut self) {
        for slot in &mut self.devices {
            slot.device.teardown();
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("fill", &self.fill)
            .field("windows_dispatched", &self.windows_dispatched)
            .field("devices", &self.devices.iter().map(|s| s.device.name()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemorySink;
    use crate::test_utils::{FakeDevice, ramp};

    fn config(window: u32, hop: u32, channels: u32) -> SchedulerConfig {
        SchedulerConfig {
            sample_rate_hz: 1000,
            window_length_samples: window,
            hop_samples: hop,
            channels,
            warmup_seconds: 0.0,
        }
    }

    #[test]
    fn overlapping_windows_share_their_overlap() {
        let sink = MemorySink::new();
        let mut scheduler = Scheduler::new(config(16, 8, 1), Box::new(sink.clone())).unwrap();
        let device = FakeDevice::identity("fake", 16);
        let inputs = device.inputs();
        scheduler.register_device(Box::new(device)).unwrap();

        let data = ramp(24, 1, 0.0);
        let mut dispatched = 0;
        for hop in data.chunks(8) {
            dispatched += scheduler.feed_samples(hop).unwrap();
        }
        assert_eq!(dispatched, 2);

        let inputs = inputs.lock().unwrap();
        let expected_first: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let expected_second: Vec<f32> = (8..24).map(|i| i as f32).collect();
        assert_eq!(inputs[0], (0, expected_first));
        assert_eq!(inputs[1], (1, expected_second));
        assert_eq!(inputs[0].1[8..16], inputs[1].1[0..8]);
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn odd_sized_chunks_form_the_same_windows() {
        let mut scheduler = Scheduler::new(config(6, 2, 2), Box::new(MemorySink::new())).unwrap();
        let device = FakeDevice::identity("fake", 12);
        let inputs = device.inputs();
        scheduler.register_device(Box::new(device)).unwrap();

        let data = ramp(10, 2, 0.0);
        scheduler.feed_samples(&data[..6]).unwrap();
        scheduler.feed_samples(&data[6..14]).unwrap();
        scheduler.feed_samples(&data[14..]).unwrap();

        let inputs = inputs.lock().unwrap();
        assert_eq!(inputs.len(), 3);
        for (i, (sequence, window)) in inputs.iter().enumerate() {
            assert_eq!(*sequence as usize, i);
            assert_eq!(window[..], data[i * 4..i * 4 + 12]);
        }
        assert!(scheduler.feed_samples(&data[..3]).is_err());
    }

    #[test]
    fn deadline_detection() {
        // hop 8 at 1 kHz: 8 ms budget.
        let sink = MemorySink::new();
        let mut scheduler = Scheduler::new(config(8, 8, 1), Box::new(sink.clone())).unwrap();
        scheduler.register_device(Box::new(FakeDevice::identity("fast", 8))).unwrap();
        scheduler
            .register_device(Box::new(FakeDevice::identity("slow", 8).with_delay(Duration::from_millis(30))))
            .unwrap();

        scheduler.feed_samples(&ramp(8, 1, 0.0)).unwrap();
        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].device, "fast");
        assert!(!records[0].deadline_missed);
        assert_eq!(records[1].device, "slow");
        assert!(records[1].deadline_missed);
        assert_eq!(records[1].deadline_ns - records[1].release_ns, 8_000_000);
        assert_eq!(scheduler.device_stats()[1].deadlines_missed, 1);
    }

    #[test]
    fn warmup_suppresses_telemetry_only() {
        let sink = MemorySink::new();
        let cfg = SchedulerConfig { warmup_seconds: 0.02, ..config(8, 8, 1) };
        assert_eq!(cfg.warmup_windows(), 2);
        let mut scheduler = Scheduler::new(cfg, Box::new(sink.clone())).unwrap();
        let device = FakeDevice::identity("fake", 8);
        let inputs = device.inputs();
        scheduler.register_device(Box::new(device)).unwrap();

        scheduler.feed_samples(&ramp(40, 1, 0.0)).unwrap();
        assert_eq!(inputs.lock().unwrap().len(), 5);
        let records = sink.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].window_index, 2);
        assert_eq!(scheduler.device_stats()[0].windows_completed, 5);
    }

    #[test]
    fn failures_are_recorded_and_dispatch_continues() {
        let sink = MemorySink::new();
        let mut scheduler = Scheduler::new(config(4, 4, 1), Box::new(sink.clone())).unwrap();
        scheduler.register_device(Box::new(FakeDevice::identity("flaky", 4).failing_on(&[1]))).unwrap();
        scheduler.register_device(Box::new(FakeDevice::identity("steady", 4))).unwrap();

        assert_eq!(scheduler.feed_samples(&ramp(12, 1, 0.0)).unwrap(), 3);
        let records = sink.records();
        assert_eq!(records.len(), 6);
        let flaky: Vec<_> = records.iter().filter(|r| r.device == "flaky").collect();
        assert!(!flaky[0].failed);
        assert!(flaky[1].failed);
        assert_eq!(flaky[1].error_code, CortexError::Timeout { duration: Duration::ZERO }.code());
        assert!(!flaky[2].failed);
        assert!(records.iter().filter(|r| r.device == "steady").all(|r| !r.failed));

        let stats = scheduler.device_stats();
        assert_eq!((stats[0].windows_completed, stats[0].windows_failed), (2, 1));
        assert_eq!(stats[0].last_error_code, Some(1));
    }

    #[test]
    fn flush_pads_partial_window_once() {
        let mut scheduler = Scheduler::new(config(8, 4, 1), Box::new(MemorySink::new())).unwrap();
        let device = FakeDevice::identity("fake", 8);
        let inputs = device.inputs();
        scheduler.register_device(Box::new(device)).unwrap();

        assert!(!scheduler.flush());
        scheduler.feed_samples(&ramp(8, 1, 1.0)).unwrap();
        // Only retained overlap is buffered: nothing new to flush.
        assert!(!scheduler.flush());

        scheduler.feed_samples(&[100.0, 101.0]).unwrap();
        assert!(scheduler.flush());
        assert!(!scheduler.flush());
        assert_eq!(scheduler.fill(), 0);

        let inputs = inputs.lock().unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[1].1, [5.0, 6.0, 7.0, 8.0, 100.0, 101.0, 0.0, 0.0]);
    }

    #[test]
    fn rejects_invalid_and_overflowing_shapes() {
        assert!(Scheduler::new(config(4, 8, 1), Box::new(MemorySink::new())).is_err());
        assert!(Scheduler::new(config(0, 0, 1), Box::new(MemorySink::new())).is_err());
        let zero_rate = SchedulerConfig { sample_rate_hz: 0, ..config(4, 4, 1) };
        assert!(zero_rate.validate().is_err());
        let negative_warmup = SchedulerConfig { warmup_seconds: -1.0, ..config(4, 4, 1) };
        assert!(negative_warmup.validate().is_err());

        let huge = config(u32::MAX, 1, u32::MAX);
        if usize::BITS == 64 {
            assert!(matches!(huge.validate(), Err(CortexError::Config { .. })));
        }

        let mut scheduler = Scheduler::new(config(4, 4, 1), Box::new(MemorySink::new())).unwrap();
        let err = scheduler.register_device(Box::new(FakeDevice::identity("big", usize::MAX))).unwrap_err();
        assert!(matches!(err, CortexError::Config { .. }));
    }

    #[test]
    fn hop_period_from_rate() {
        assert_eq!(config(160, 80, 64).hop_period(), Duration::from_millis(80));
        let eeg = SchedulerConfig { sample_rate_hz: 160, ..config(160, 80, 64) };
        assert_eq!(eeg.hop_period(), Duration::from_millis(500));
    }
}
