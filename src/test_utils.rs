//! Test utilities shared by unit tests, integration tests and benches.
//!
//! Provides deterministic sample generators, an adapter served on a thread over a
//! loopback socket pair, and a scripted [`FakeDevice`] for scheduler tests.

#![cfg(any(test, feature = "benchmark"))]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::adapter::{AdapterOptions, SessionStats, serve};
use crate::device::{DeviceComm, DeviceTiming, DeviceTimeouts, SessionConfig, WindowResult};
use crate::kernel::KernelRegistry;
use crate::scheduler::Device;
use crate::{CortexError, Result};

/// Interleaved ramp: `frames * channels` consecutive values starting at `start`.
pub fn ramp(frames: usize, channels: usize, start: f32) -> Vec<f32> {
    (0..frames * channels).map(|i| start + i as f32).collect()
}

/// Handshaken [`DeviceComm`] whose adapter runs [`serve`] on a background thread.
///
/// The thread ends when the device is torn down.
pub fn in_process_device(
    name: &str,
    session: &SessionConfig,
    timeouts: DeviceTimeouts,
) -> Result<(DeviceComm, JoinHandle<Result<SessionStats>>)> {
    in_process_device_with(name, session, timeouts, KernelRegistry::builtin())
}

/// [`in_process_device`] with a custom kernel registry.
#[cfg(unix)]
pub fn in_process_device_with(
    name: &str,
    session: &SessionConfig,
    timeouts: DeviceTimeouts,
    registry: KernelRegistry,
) -> Result<(DeviceComm, JoinHandle<Result<SessionStats>>)> {
    let (near, mut far) = crate::transport::LoopbackTransport::pair()?;
    let adapter = thread::spawn(move || {
        let options = AdapterOptions { idle_poll: Duration::from_millis(50), ..Default::default() };
        serve(&mut far, &registry, &options)
    });
    let mut device = DeviceComm::from_transport(name, Box::new(near), None, timeouts);
    device.handshake(session)?;
    Ok((device, adapter))
}

#[cfg(not(unix))]
pub fn in_process_device_with(
    _name: &str,
    _session: &SessionConfig,
    _timeouts: DeviceTimeouts,
    _registry: KernelRegistry,
) -> Result<(DeviceComm, JoinHandle<Result<SessionStats>>)> {
    Err(CortexError::unsupported_platform("in-process adapters", "Unix"))
}

/// Inputs a [`FakeDevice`] has seen, as `(sequence, window)` pairs.
pub type SeenWindows = Arc<Mutex<Vec<(u32, Vec<f32>)>>>;

/// Scriptable [`Device`]: copies its input to its output, optionally after a delay,
/// and fails on chosen sequence numbers with a timeout error.
#[derive(Debug)]
pub struct FakeDevice {
    name: String,
    output_len: usize,
    delay: Duration,
    fail_on: HashSet<u32>,
    seen: SeenWindows,
    torn_down: Arc<AtomicBool>,
}

impl FakeDevice {
    pub fn identity(name: &str, output_len: usize) -> Self {
        Self {
            name: name.to_string(),
            output_len,
            delay: Duration::ZERO,
            fail_on: HashSet::new(),
            seen: Arc::default(),
            torn_down: Arc::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_on(mut self, sequences: &[u32]) -> Self {
        self.fail_on.extend(sequences);
        self
    }

    /// Shared handle to the windows this device receives.
    pub fn inputs(&self) -> SeenWindows {
        Arc::clone(&self.seen)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Flag that turns true once the device is torn down, readable after the device
    /// has been handed to a scheduler.
    pub fn teardown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.torn_down)
    }
}

impl Device for FakeDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_len(&self) -> usize {
        self.output_len
    }

    fn execute_window(&mut self, sequence: u32, input: &[f32], output: &mut [f32]) -> Result<WindowResult> {
        if self.is_torn_down() {
            return Err(CortexError::InvalidState { operation: "execute a window", state: "torn down" });
        }
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).push((sequence, input.to_vec()));
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.fail_on.contains(&sequence) {
            return Err(CortexError::Timeout { duration: self.delay });
        }
        let n = input.len().min(output.len());
        output[..n].copy_from_slice(&input[..n]);
        Ok(WindowResult {
            sequence,
            output_samples: n as u32,
            output_channels: 1,
            timing: DeviceTiming::default(),
        })
    }

    fn teardown(&mut self) {
        self.torn_down.store(true, Ordering::SeqCst);
    }
}
