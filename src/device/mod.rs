//! Device communication: one adapter session from spawn to teardown.
//!
//! ```text
//! Spawned ──handshake()──▶ Handshaking ──▶ Ready ◀──▶ Executing
//!    │                                       │
//!    └──────────────── teardown() ──────────┴──▶ TornDown
//! ```
//!
//! A [`DeviceComm`] exclusively owns its transport and, for locally launched adapters,
//! the child process. Failures inside [`execute_window`](DeviceComm::execute_window)
//! fail that window only; the device stays `Ready` and keeps honoring its timeouts, so
//! an unreachable adapter yields an error per window rather than a hang.

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::error::checked_size;
use crate::protocol::messages::{decode_samples, encode_samples};
use crate::protocol::{
    self, ACCEPT_TIMEOUT, Ack, CHUNK_TIMEOUT, ChunkHeader, Config, ErrorPayload, FrameType,
    HANDSHAKE_TIMEOUT, Hello, MAX_FRAME_PAYLOAD, MAX_WINDOW_BYTES, ResultHeader, SAMPLE_SIZE,
    WINDOW_TIMEOUT,
};
use crate::transport::{Role, Transport, TransportUri};
use crate::{CortexError, Result};

pub mod process;

pub use process::ProcessHandle;

/// How long teardown waits for an adapter to exit on its own before killing it.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle state of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Spawned,
    Handshaking,
    Ready,
    Executing,
    TornDown,
}

impl DeviceState {
    pub fn name(self) -> &'static str {
        match self {
            DeviceState::Spawned => "spawned",
            DeviceState::Handshaking => "handshaking",
            DeviceState::Ready => "ready",
            DeviceState::Executing => "executing",
            DeviceState::TornDown => "torn down",
        }
    }
}

/// Timeouts applied to one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTimeouts {
    pub handshake: Duration,
    pub window: Duration,
    pub chunk: Duration,
    pub accept: Duration,
}

impl Default for DeviceTimeouts {
    fn default() -> Self {
        Self {
            handshake: HANDSHAKE_TIMEOUT,
            window: WINDOW_TIMEOUT,
            chunk: CHUNK_TIMEOUT,
            accept: ACCEPT_TIMEOUT,
        }
    }
}

/// What the harness asks the adapter to run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionConfig {
    pub sample_rate_hz: u32,
    pub window_length_samples: u32,
    pub hop_samples: u32,
    pub channels: u32,
    pub kernel: String,
    pub params: String,
    pub calibration_state: Vec<u8>,
}

/// Adapter-side timestamps for one window, in adapter monotonic nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceTiming {
    pub input_complete_ns: u64,
    pub kernel_start_ns: u64,
    pub kernel_end_ns: u64,
    pub tx_start_ns: u64,
    pub tx_end_ns: u64,
}

impl From<&ResultHeader> for DeviceTiming {
    fn from(header: &ResultHeader) -> Self {
        Self {
            input_complete_ns: header.tin,
            kernel_start_ns: header.tstart,
            kernel_end_ns: header.tend,
            tx_start_ns: header.tfirst_tx,
            tx_end_ns: header.tlast_tx,
        }
    }
}

/// Outcome of one executed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowResult {
    pub sequence: u32,
    pub output_samples: u32,
    pub output_channels: u32,
    pub timing: DeviceTiming,
}

impl WindowResult {
    /// Samples written to the caller's output buffer.
    pub fn output_len(&self) -> usize {
        self.output_samples as usize * self.output_channels as usize
    }
}

/// One device session.
pub struct DeviceComm {
    name: String,
    transport: Box<dyn Transport>,
    process: Option<ProcessHandle>,
    state: DeviceState,
    timeouts: DeviceTimeouts,
    hello: Option<Hello>,
    session_id: u32,
    input_samples: usize,
    output_shape: (u32, u32),
    frame: Vec<u8>,
    tx_bytes: Vec<u8>,
    rx_bytes: Vec<u8>,
}

impl DeviceComm {
    /// Wrap an already connected transport, optionally owning the adapter process.
    pub fn from_transport(
        name: impl Into<String>,
        transport: Box<dyn Transport>,
        process: Option<ProcessHandle>,
        timeouts: DeviceTimeouts,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            process,
            state: DeviceState::Spawned,
            timeouts,
            hello: None,
            session_id: 0,
            input_samples: 0,
            output_shape: (0, 0),
            frame: vec![0u8; MAX_FRAME_PAYLOAD],
            tx_bytes: Vec::new(),
            rx_bytes: Vec::new(),
        }
    }

    /// Spawn a local adapter whose stdin/stdout is one end of a socket pair.
    #[cfg(unix)]
    pub fn spawn_local(name: impl Into<String>, adapter: &Path, timeouts: DeviceTimeouts) -> Result<Self> {
        let (near, far) = crate::transport::LoopbackTransport::with_far_end()?;
        let process = ProcessHandle::spawn_with_socket(adapter, ["local://"], far)?;
        Ok(Self::from_transport(name, Box::new(near), Some(process), timeouts))
    }

    #[cfg(not(unix))]
    pub fn spawn_local(_name: impl Into<String>, _adapter: &Path, _timeouts: DeviceTimeouts) -> Result<Self> {
        Err(CortexError::unsupported_platform("local:// adapters", "Unix"))
    }

    /// Open the device named by `uri`.
    ///
    /// `local://` and `shm://` launch `adapter` themselves; `tcp://` and `serial://`
    /// reach an adapter that is already running.
    pub fn open(
        name: impl Into<String>,
        uri: &TransportUri,
        adapter: Option<&Path>,
        timeouts: DeviceTimeouts,
    ) -> Result<Self> {
        let name = name.into();
        match (uri, adapter) {
            (TransportUri::Local, Some(adapter)) => Self::spawn_local(name, adapter, timeouts),
            (TransportUri::Local, None) => {
                Err(CortexError::config(format!("device '{}': local:// needs an adapter path", name)))
            }
            #[cfg(target_os = "linux")]
            (TransportUri::Shm { name: segment }, Some(adapter)) => {
                // The segment must exist before the adapter attaches.
                let transport: Box<dyn Transport> = Box::new(
                    crate::transport::ShmTransport::create(segment)?.with_send_timeout(timeouts.window),
                );
                let uri_arg = uri.to_string();
                let process = ProcessHandle::spawn(
                    adapter,
                    [uri_arg.as_str()],
                    std::process::Stdio::null(),
                    std::process::Stdio::null(),
                )?;
                Ok(Self::from_transport(name, transport, Some(process), timeouts))
            }
            #[cfg(not(target_os = "linux"))]
            (TransportUri::Shm { .. }, Some(_)) => {
                Err(CortexError::unsupported_platform("shm:// transport", "Linux"))
            }
            (_, Some(_)) => Err(CortexError::config(format!(
                "device '{}': {} adapters are started separately",
                name, uri
            ))),
            (_, None) => {
                let transport = crate::transport::uri::open(uri, Role::Harness, timeouts.accept)?;
                Ok(Self::from_transport(name, transport, None, timeouts))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Adapter announcement, available after a successful HELLO.
    pub fn metadata(&self) -> Option<&Hello> {
        self.hello.as_ref()
    }

    /// Session id sent in CONFIG.
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Negotiated `(samples, channels)` of every result.
    pub fn output_shape(&self) -> (u32, u32) {
        self.output_shape
    }

    /// Samples in one output window.
    pub fn output_len(&self) -> usize {
        self.output_shape.0 as usize * self.output_shape.1 as usize
    }

    /// HELLO → CONFIG → ACK.
    pub fn handshake(&mut self, session: &SessionConfig) -> Result<()> {
        self.require(DeviceState::Spawned, "handshake")?;
        self.state = DeviceState::Handshaking;

        let input_bytes = checked_size(
            "window bytes",
            &[session.window_length_samples as usize, session.channels as usize, SAMPLE_SIZE],
        )?;
        if input_bytes > MAX_WINDOW_BYTES {
            return Err(CortexError::config(format!(
                "window of {} bytes exceeds the {} byte message limit",
                input_bytes, MAX_WINDOW_BYTES
            )));
        }

        let deadline = Instant::now() + self.timeouts.handshake;
        let remaining = || deadline.saturating_duration_since(Instant::now());

        let len = protocol::recv_expected(&mut self.transport, FrameType::Hello, &mut self.frame, remaining())?;
        let hello = Hello::decode(&self.frame[..len])?;
        info!(
            device = %self.name,
            adapter = %hello.adapter_name,
            boot_id = format_args!("{:#010x}", hello.boot_id),
            host = %hello.hostname,
            cpu = %hello.cpu,
            os = %hello.os,
            "HELLO received"
        );

        let config = Config {
            session_id: rand::random(),
            sample_rate_hz: session.sample_rate_hz,
            window_length_samples: session.window_length_samples,
            hop_samples: session.hop_samples,
            channels: session.channels,
            plugin_name: session.kernel.clone(),
            plugin_params: session.params.clone(),
            calibration_state: session.calibration_state.clone(),
        };
        protocol::send_frame(&mut self.transport, FrameType::Config, 0, &config.encode()?)?;

        let len = protocol::recv_expected(&mut self.transport, FrameType::Ack, &mut self.frame, remaining())?;
        let ack = Ack::decode(&self.frame[..len])?;
        let (samples, channels) = ack.output_shape(&config);
        let output_bytes =
            checked_size("result bytes", &[samples as usize, channels as usize, SAMPLE_SIZE])?;
        if output_bytes > MAX_WINDOW_BYTES {
            return Err(CortexError::malformed(
                "ACK",
                format!("output shape {}x{} exceeds the message limit", samples, channels),
            ));
        }

        self.hello = Some(hello);
        self.session_id = config.session_id;
        self.input_samples = input_bytes / SAMPLE_SIZE;
        self.output_shape = (samples, channels);
        self.tx_bytes.reserve(input_bytes);
        self.rx_bytes.reserve(output_bytes);
        self.state = DeviceState::Ready;
        info!(
            device = %self.name,
            session_id = format_args!("{:#010x}", self.session_id),
            kernel = %session.kernel,
            output_samples = samples,
            output_channels = channels,
            "Device ready"
        );
        Ok(())
    }

    /// Send one window and wait for its result.
    ///
    /// On success the first [`WindowResult::output_len`] samples of `output` hold the
    /// result. On any failure `output` is left untouched.
    pub fn execute_window(&mut self, sequence: u32, input: &[f32], output: &mut [f32]) -> Result<WindowResult> {
        self.require(DeviceState::Ready, "execute a window")?;
        if input.len() != self.input_samples {
            return Err(CortexError::config(format!(
                "window has {} samples, session expects {}",
                input.len(),
                self.input_samples
            )));
        }
        self.state = DeviceState::Executing;
        let result = self.exchange(sequence, input, output);
        self.state = DeviceState::Ready;

        match &result {
            Ok(r) => debug!(device = %self.name, sequence, samples = r.output_len(), "Window complete"),
            Err(e) => warn!(device = %self.name, sequence, code = e.code(), error = %e, "Window failed"),
        }
        result
    }

    fn exchange(&mut self, sequence: u32, input: &[f32], output: &mut [f32]) -> Result<WindowResult> {
        let deadline = Instant::now() + self.timeouts.window;
        let remaining = || deadline.saturating_duration_since(Instant::now());

        self.tx_bytes.clear();
        encode_samples(input, &mut self.tx_bytes);
        protocol::send_chunked(&mut self.transport, sequence, &self.tx_bytes)?;

        let header = self.await_result_header(sequence, deadline)?;
        let needed = header.payload_bytes()?;
        let capacity = checked_size("output buffer", &[output.len(), SAMPLE_SIZE])?;
        if needed > capacity {
            return Err(CortexError::BufferTooSmall { needed, capacity });
        }

        self.rx_bytes.resize(needed, 0);
        let window_left = remaining();
        if window_left.is_zero() {
            return Err(CortexError::Timeout { duration: self.timeouts.window });
        }
        let n = protocol::recv_chunked(
            &mut self.transport,
            sequence,
            &mut self.rx_bytes,
            window_left,
            self.timeouts.chunk,
        )?;
        if n != needed {
            return Err(CortexError::malformed(
                "RESULT",
                format!("header announces {} bytes, chunks carried {}", needed, n),
            ));
        }
        decode_samples(&self.rx_bytes, &mut output[..needed / SAMPLE_SIZE])?;

        Ok(WindowResult {
            sequence,
            output_samples: header.output_length_samples,
            output_channels: header.output_channels,
            timing: DeviceTiming::from(&header),
        })
    }

    /// Read frames until the RESULT header for `sequence` arrives.
    ///
    /// Results and chunks left over from earlier windows that timed out are read
    /// and dropped so one slow window does not desynchronise the stream. A header
    /// from another session or a later sequence fails the window after its
    /// payload has been drained.
    fn await_result_header(&mut self, sequence: u32, deadline: Instant) -> Result<ResultHeader> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CortexError::Timeout { duration: self.timeouts.window });
            }
            let frame = protocol::recv_frame(&mut self.transport, &mut self.frame, remaining)?;
            let payload = &self.frame[..frame.payload_length as usize];

            match frame.frame_type {
                FrameType::Result => {}
                FrameType::WindowChunk => {
                    let chunk = ChunkHeader::decode(payload)?;
                    if is_stale(chunk.sequence, sequence) {
                        trace!(device = %self.name, stale = chunk.sequence, "Dropping chunk of an abandoned result");
                        continue;
                    }
                    return Err(CortexError::UnexpectedFrame {
                        expected: FrameType::Result.name(),
                        found: frame.frame_type.name(),
                    });
                }
                FrameType::Error => {
                    let err = ErrorPayload::decode(payload)?;
                    return Err(CortexError::Adapter { code: err.code, message: err.message });
                }
                other => {
                    return Err(CortexError::UnexpectedFrame {
                        expected: FrameType::Result.name(),
                        found: other.name(),
                    });
                }
            }

            let header = ResultHeader::decode(payload)?;
            let rejected = if header.session_id != self.session_id {
                CortexError::SessionMismatch { expected: self.session_id, found: header.session_id }
            } else if header.sequence == sequence {
                return Ok(header);
            } else if is_stale(header.sequence, sequence) {
                warn!(device = %self.name, sequence, stale = header.sequence, "Discarding late result");
                self.discard_payload(&header, deadline)?;
                continue;
            } else {
                CortexError::SequenceMismatch { expected: sequence, found: header.sequence }
            };
            if let Err(e) = self.discard_payload(&header, deadline) {
                debug!(device = %self.name, error = %e, "Could not drain rejected result");
            }
            return Err(rejected);
        }
    }

    /// Read and drop the chunked samples that follow a rejected RESULT header.
    fn discard_payload(&mut self, header: &ResultHeader, deadline: Instant) -> Result<()> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CortexError::Timeout { duration: self.timeouts.window });
        }
        let bytes = header.payload_bytes()?.min(MAX_WINDOW_BYTES);
        self.rx_bytes.resize(bytes, 0);
        protocol::recv_chunked(&mut self.transport, header.sequence, &mut self.rx_bytes, remaining, self.timeouts.chunk)?;
        Ok(())
    }

    /// Close the transport and reap the adapter. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        if self.state == DeviceState::TornDown {
            return;
        }
        self.transport.close();
        if let Some(process) = self.process.as_mut() {
            match process.join(EXIT_GRACE) {
                Ok(Some(status)) => debug!(device = %self.name, %status, "Adapter exited"),
                Ok(None) | Err(_) => {
                    if let Err(e) = process.kill() {
                        warn!(device = %self.name, error = %e, "Failed to kill adapter");
                    }
                }
            }
        }
        self.state = DeviceState::TornDown;
        info!(device = %self.name, "Device torn down");
    }

    fn require(&self, expected: DeviceState, operation: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(CortexError::InvalidState { operation, state: self.state.name() });
        }
        Ok(())
    }
}

/// True if `found` was issued before `current` (sequence numbers wrap).
fn is_stale(found: u32, current: u32) -> bool {
    let behind = current.wrapping_sub(found);
    behind != 0 && behind <= u32::MAX / 2
}

impl Drop for DeviceComm {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for DeviceComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceComm")
            .field("name", &self.name)
            .field("transport", &self.transport.kind())
            .field("state", &self.state)
            .field("session_id", &self.session_id)
            .field("output_shape", &self.output_shape)
            .finish()
    }
}
