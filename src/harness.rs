//! Async run loop tying a [`ChunkSource`] to the [`Scheduler`].
//!
//! The scheduler and every device call are blocking, so the scheduler lives on one
//! blocking thread fed through a bounded channel. The async side owns the source and
//! a [`CancellationToken`]; cancellation is checked between chunks, never inside a
//! window.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DeviceConfig, RunConfig};
use crate::device::{DeviceComm, DeviceTimeouts};
use crate::device::process::ProcessHandle;
use crate::replay::ChunkSource;
use crate::scheduler::{DeviceStats, Scheduler};
use crate::telemetry::TelemetrySink;
use crate::{CortexError, Result};

/// Chunks buffered between the source and the scheduler thread.
const CHUNK_QUEUE: usize = 8;

/// How long a stopped load process gets to exit on its own.
const LOAD_EXIT_GRACE: Duration = Duration::from_millis(500);

/// Outcome of [`Harness::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub chunks_fed: u64,
    /// Windows dispatched, warmup and flushed window included.
    pub windows_dispatched: u64,
    /// The run was stopped through the cancellation token.
    pub cancelled: bool,
    pub devices: Vec<DeviceStats>,
    /// Configured devices that never came up.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedDevice>,
}

/// A configured device left out of the run because it could not be opened or
/// handshaken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedDevice {
    pub name: String,
    pub error_code: u32,
    pub reason: String,
}

impl RunSummary {
    pub fn windows_failed(&self) -> u64 {
        self.devices.iter().map(|d| d.windows_failed).sum()
    }
}

/// Background CPU load that runs alongside a benchmark.
///
/// The process belongs to whoever holds the context; only that holder can stop it.
/// Dropping the context stops it too.
#[derive(Debug, Default)]
pub struct LoadContext {
    process: Option<ProcessHandle>,
}

impl LoadContext {
    /// No background load.
    pub fn idle() -> Self {
        Self::default()
    }

    /// Launch `program` with `args` as the background load.
    pub fn start<I, S>(program: &Path, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let process = ProcessHandle::spawn(program, args, Stdio::null(), Stdio::null())?;
        info!(pid = process.id(), program = %program.display(), "Background load started");
        Ok(Self { process: Some(process) })
    }

    pub fn is_running(&mut self) -> bool {
        self.process.as_mut().is_some_and(ProcessHandle::is_alive)
    }

    /// Stop the load and reap it. Returns `Ok(None)` if none was running.
    pub fn stop(&mut self) -> Result<Option<ExitStatus>> {
        let Some(mut process) = self.process.take() else {
            return Ok(None);
        };
        let status = match process.join(Duration::ZERO)? {
            Some(status) => {
                warn!(%status, "Background load had already exited");
                status
            }
            None => {
                #[cfg(unix)]
                if let Some(pid) = process.id() {
                    // SIGTERM first so load generators can clean up.
                    // SAFETY: `pid` is our own unreaped child, so it cannot have been recycled.
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
                match process.join(LOAD_EXIT_GRACE)? {
                    Some(status) => status,
                    None => process.kill()?.ok_or_else(|| {
                        CortexError::config("background load vanished without an exit status")
                    })?,
                }
            }
        };
        info!(%status, "Background load stopped");
        Ok(Some(status))
    }
}

impl Drop for LoadContext {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop background load: {}", e);
        }
    }
}

/// Drives one benchmarking run.
#[derive(Debug)]
pub struct Harness {
    scheduler: Scheduler,
    cancel: CancellationToken,
    load: LoadContext,
    skipped: Vec<SkippedDevice>,
}

impl Harness {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler, cancel: CancellationToken::new(), load: LoadContext::idle(), skipped: Vec::new() }
    }

    /// Open and handshake every device in `config`, in order.
    ///
    /// Blocks while adapters start and answer. A device that fails to come up is
    /// logged, reported in [`RunSummary::skipped`] and left out; the run goes ahead
    /// with the others. Fails only if no device comes up at all.
    pub fn from_config(config: &RunConfig, sink: Box<dyn TelemetrySink>) -> Result<Self> {
        let mut scheduler = Scheduler::new(config.scheduler_config(), sink)?;
        let timeouts = config.device_timeouts();
        let mut skipped = Vec::new();
        for device_config in &config.devices {
            match Self::bring_up(config, device_config, timeouts) {
                Ok(device) => {
                    scheduler.register_device(Box::new(device))?;
                }
                Err(e) => {
                    error!(device = %device_config.name, code = e.code(), error = %e, "Device skipped");
                    skipped.push(SkippedDevice {
                        name: device_config.name.clone(),
                        error_code: e.code(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        if scheduler.device_count() == 0 {
            let reasons: Vec<_> = skipped.iter().map(|s| format!("{}: {}", s.name, s.reason)).collect();
            return Err(CortexError::config(format!("no device came up ({})", reasons.join("; "))));
        }
        Ok(Self { skipped, ..Self::new(scheduler) })
    }

    fn bring_up(config: &RunConfig, device_config: &DeviceConfig, timeouts: DeviceTimeouts) -> Result<DeviceComm> {
        let uri = device_config.uri()?;
        let session = config.session_config(device_config)?;
        let mut device =
            DeviceComm::open(device_config.name.as_str(), &uri, device_config.adapter.as_deref(), timeouts)?;
        device.handshake(&session)?;
        Ok(device)
    }

    /// Devices from the config that were left out.
    pub fn skipped(&self) -> &[SkippedDevice] {
        &self.skipped
    }

    /// Run `load` for the duration of the benchmark; it is stopped when the run ends.
    pub fn with_load(mut self, load: LoadContext) -> Self {
        self.load = load;
        self
    }

    /// Token that stops [`run`](Harness::run) before the next chunk.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Stream `source` through the scheduler until it ends or the run is cancelled,
    /// then flush, tear down every device and stop the background load.
    pub async fn run<S: ChunkSource>(self, mut source: S) -> Result<RunSummary> {
        let Harness { mut scheduler, cancel, mut load, skipped } = self;

        let expected = scheduler.config();
        if source.channels() != expected.channels || source.sample_rate_hz() != expected.sample_rate_hz {
            let reason = format!(
                "source delivers {} channels at {} Hz, scheduler expects {} channels at {} Hz",
                source.channels(),
                source.sample_rate_hz(),
                expected.channels,
                expected.sample_rate_hz
            );
            scheduler.teardown();
            return Err(CortexError::config(reason));
        }

        let (tx, mut rx) = mpsc::channel::<Vec<f32>>(CHUNK_QUEUE);
        let worker = tokio::task::spawn_blocking(move || {
            let mut chunks_fed = 0u64;
            let mut outcome = Ok(());
            while let Some(chunk) = rx.blocking_recv() {
                if let Err(e) = scheduler.feed_samples(&chunk) {
                    error!("Scheduler rejected chunk {}: {}", chunks_fed, e);
                    outcome = Err(e);
                    break;
                }
                chunks_fed += 1;
            }
            if outcome.is_ok() && scheduler.flush() {
                debug!("Flushed trailing partial window");
            }
            scheduler.teardown();
            outcome.map(|()| RunSummary {
                chunks_fed,
                windows_dispatched: scheduler.windows_dispatched(),
                cancelled: false,
                devices: scheduler.device_stats(),
                skipped: Vec::new(),
            })
        });

        info!("Harness run started");
        let mut cancelled = false;
        let mut source_error = None;
        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                next = source.next_chunk() => next,
            };
            match next {
                Ok(Some(chunk)) => {
                    if tx.send(chunk).await.is_err() {
                        debug!("Scheduler thread stopped, ending run");
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Source failed: {}", e);
                    source_error = Some(e);
                    break;
                }
            }
        }
        drop(tx);

        let summary = worker
            .await
            .map_err(|e| CortexError::from_io("scheduler thread", std::io::Error::other(e)))?;
        if let Err(e) = load.stop() {
            warn!("Failed to stop background load: {}", e);
        }
        if let Some(e) = source_error {
            return Err(e);
        }
        let summary = RunSummary { cancelled, skipped, ..summary? };
        info!(
            windows = summary.windows_dispatched,
            failed = summary.windows_failed(),
            cancelled = summary.cancelled,
            "Harness run finished"
        );
        Ok(summary)
    }
}
