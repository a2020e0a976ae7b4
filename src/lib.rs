//! Device communication and windowing pipeline for benchmarking streaming
//! signal-processing kernels.
//!
//! CORTEX streams multi-channel sample data through overlapping fixed-size windows,
//! ships every window to one or more device adapters over a CRC-protected wire
//! protocol, and measures whether each result arrives within its real-time budget.
//!
//! # Layers
//!
//! - [`transport`]: byte streams with one timeout contract (loopback, stdio, TCP,
//!   serial, shared memory), selected by URI.
//! - [`protocol`]: 16-byte framed messages with magic hunting and CRC32, plus the
//!   chunking sub-protocol for windows and results larger than one frame.
//! - [`device`]: the harness end of a device. Spawns or dials the adapter, runs the
//!   HELLO/CONFIG/ACK handshake and exchanges WINDOW/RESULT messages.
//! - [`scheduler`]: forms overlapping windows from hop-sized chunks and dispatches
//!   them, recording a [`TelemetryRecord`] per window and device.
//! - [`adapter`] and [`kernel`]: the far end, serving built-in kernels.
//! - [`harness`] and [`replay`]: the async run loop and its sample sources.
//!
//! # Example (in-process)
//!
//! ```rust,no_run
//! use cortex::{Harness, MemorySink, RunConfig, SyntheticSource};
//! use std::time::Duration;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> cortex::Result<()> {
//!     let config = RunConfig::from_file("run.yaml")?;
//!     let sink = MemorySink::new();
//!     let harness = Harness::from_config(&config, Box::new(sink.clone()))?;
//!
//!     let dataset = &config.dataset;
//!     let source = SyntheticSource::new(dataset.channels, dataset.sample_rate_hz, dataset.hop_samples)?
//!         .with_duration(Duration::from_secs(10));
//!     let summary = harness.run(source).await?;
//!
//!     println!("{} windows, {} records", summary.windows_dispatched, sink.len());
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod clock;
pub mod config;
mod error;
#[cfg_attr(any(test, feature = "benchmark"), path = "test_utils.rs")]
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;

// Wire layers
pub mod protocol;
pub mod transport;

// Harness side
pub mod device;
pub mod harness;
pub mod replay;
pub mod scheduler;
pub mod telemetry;

// Adapter side
pub mod adapter;
pub mod kernel;

// Core exports
pub use error::*;

pub use config::{DatasetConfig, DeviceConfig, RunConfig, TimeoutConfig};
pub use device::{DeviceComm, DeviceState, DeviceTimeouts, DeviceTiming, SessionConfig, WindowResult};
pub use harness::{Harness, LoadContext, RunSummary, SkippedDevice};
pub use kernel::{KernelConfig, KernelInstance, KernelPlugin, KernelRegistry, OutputShape};
pub use replay::{BufferSource, ChunkSource, SyntheticSource};
pub use scheduler::{Device, DeviceStats, Scheduler, SchedulerConfig};
pub use telemetry::{ChannelSink, MemorySink, NullSink, TelemetryRecord, TelemetrySink};
pub use transport::{Role, Transport, TransportUri};
