//! Adapter runtime: the device end of a session.
//!
//! [`serve`] announces the adapter with HELLO, validates CONFIG, instantiates the
//! requested kernel and answers with ACK (or ERROR), then turns every WINDOW into a
//! RESULT until the harness closes the transport.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::monotonic_ns;
use crate::kernel::{KernelConfig, KernelInstance, KernelRegistry};
use crate::protocol::messages::{ACK_CONFIG, decode_samples, encode_samples};
use crate::protocol::{
    self, Ack, CHUNK_TIMEOUT, Config, ErrorPayload, FrameType, HANDSHAKE_TIMEOUT, Hello,
    MAX_FRAME_PAYLOAD, MAX_WINDOW_BYTES, PROTOCOL_VERSION, ResultHeader, SAMPLE_SIZE,
};
use crate::transport::Transport;
use crate::{CortexError, Result};

/// Tunables for [`serve`].
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    /// Name reported in HELLO.
    pub name: String,
    /// How long to wait for CONFIG after HELLO.
    pub handshake_timeout: Duration,
    /// Wait between chunks of one window.
    pub chunk_timeout: Duration,
    /// Wait for the first chunk of the next window before checking again.
    pub idle_poll: Duration,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            name: "cortex-adapter".to_string(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            chunk_timeout: CHUNK_TIMEOUT,
            idle_poll: Duration::from_millis(500),
        }
    }
}

/// What happened during one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub session_id: u32,
    pub kernel: String,
    pub windows_processed: u64,
    pub windows_failed: u64,
}

/// Run one complete session over `transport`.
///
/// Returns once the harness closes the transport. Handshake failures are reported to
/// the harness as ERROR frames before being returned.
pub fn serve<T: Transport + ?Sized>(
    transport: &mut T,
    registry: &KernelRegistry,
    options: &AdapterOptions,
) -> Result<SessionStats> {
    let boot_id: u32 = rand::random();
    let hello = Hello {
        boot_id,
        adapter_name: options.name.clone(),
        abi_version: PROTOCOL_VERSION,
        num_kernels: u8::try_from(registry.len()).unwrap_or(u8::MAX),
        max_window_samples: (MAX_WINDOW_BYTES / SAMPLE_SIZE) as u32,
        max_channels: (MAX_WINDOW_BYTES / SAMPLE_SIZE) as u32,
        hostname: hostname(),
        cpu: std::env::consts::ARCH.to_string(),
        os: std::env::consts::OS.to_string(),
    };
    protocol::send_frame(transport, FrameType::Hello, 0, &hello.encode())?;
    info!(boot_id = format_args!("{:#010x}", boot_id), transport = transport.kind(), "HELLO sent");

    let mut frame = vec![0u8; MAX_FRAME_PAYLOAD];
    let len = protocol::recv_expected(transport, FrameType::Config, &mut frame, options.handshake_timeout)?;
    let config = Config::decode(&frame[..len])?;

    let mut session = match Session::open(&config, registry) {
        Ok(session) => session,
        Err(e) => {
            warn!(kernel = %config.plugin_name, error = %e, "Rejecting CONFIG");
            send_error(transport, &e)?;
            return Err(e);
        }
    };

    let shape = session.kernel.output_shape();
    let ack = Ack {
        ack_type: ACK_CONFIG,
        output_length_samples: if shape.samples == config.window_length_samples { 0 } else { shape.samples },
        output_channels: if shape.channels == config.channels { 0 } else { shape.channels },
    };
    protocol::send_frame(transport, FrameType::Ack, 0, &ack.encode())?;
    info!(
        session_id = format_args!("{:#010x}", config.session_id),
        kernel = %config.plugin_name,
        window = config.window_length_samples,
        hop = config.hop_samples,
        channels = config.channels,
        output_samples = shape.samples,
        output_channels = shape.channels,
        "Session configured"
    );

    let mut stats = SessionStats {
        session_id: config.session_id,
        kernel: config.plugin_name.clone(),
        ..Default::default()
    };
    let result = session.run(transport, options, &mut stats);
    session.kernel.teardown();
    info!(processed = stats.windows_processed, failed = stats.windows_failed, "Session ended");
    result.map(|()| stats)
}

struct Session {
    session_id: u32,
    kernel: Box<dyn KernelInstance>,
    input: Vec<f32>,
    output: Vec<f32>,
    rx_bytes: Vec<u8>,
    tx_bytes: Vec<u8>,
}

impl Session {
    fn open(config: &Config, registry: &KernelRegistry) -> Result<Self> {
        if config.window_length_samples == 0 || config.hop_samples == 0 || config.channels == 0 {
            return Err(CortexError::config("window, hop and channels must all be positive"));
        }
        if config.hop_samples > config.window_length_samples {
            return Err(CortexError::config(format!(
                "hop {} exceeds window {}",
                config.hop_samples, config.window_length_samples
            )));
        }
        let input_bytes = window_bytes(config.window_length_samples, config.channels)?;
        let kernel = registry.instantiate(&config.plugin_name, &KernelConfig::from(config))?;
        let shape = kernel.output_shape();
        let output_bytes = window_bytes(shape.samples, shape.channels)?;

        Ok(Self {
            session_id: config.session_id,
            kernel,
            input: vec![0.0; input_bytes / SAMPLE_SIZE],
            output: vec![0.0; output_bytes / SAMPLE_SIZE],
            rx_bytes: vec![0u8; input_bytes],
            tx_bytes: Vec::with_capacity(output_bytes),
        })
    }

    fn run<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        options: &AdapterOptions,
        stats: &mut SessionStats,
    ) -> Result<()> {
        loop {
            let (sequence, len) = match protocol::recv_any_chunked(
                transport,
                &mut self.rx_bytes,
                options.idle_poll,
                options.chunk_timeout,
            ) {
                Ok(received) => received,
                Err(CortexError::Timeout { .. }) => continue,
                Err(CortexError::ConnectionReset { .. }) => {
                    debug!("Harness closed the transport");
                    return Ok(());
                }
                Err(e) if e.category() == crate::ErrorCategory::Transport => return Err(e),
                Err(e) => {
                    warn!(error = %e, code = e.code(), "Discarding malformed window");
                    stats.windows_failed += 1;
                    send_error(transport, &e)?;
                    continue;
                }
            };
            let tin = monotonic_ns();

            match self.execute(sequence, len, tin) {
                Ok(header) => {
                    protocol::send_frame(transport, FrameType::Result, 0, &header.encode())?;
                    protocol::send_chunked(transport, sequence, &self.tx_bytes)?;
                    stats.windows_processed += 1;
                    debug!(sequence, kernel_ns = header.tend - header.tstart, "Window processed");
                }
                Err(e) => {
                    warn!(sequence, error = %e, code = e.code(), "Window failed");
                    stats.windows_failed += 1;
                    send_error(transport, &e)?;
                }
            }
        }
    }

    fn execute(&mut self, sequence: u32, len: usize, tin: u64) -> Result<ResultHeader> {
        if len != self.rx_bytes.len() {
            return Err(CortexError::malformed(
                "WINDOW",
                format!("window carries {} bytes, session expects {}", len, self.rx_bytes.len()),
            ));
        }
        decode_samples(&self.rx_bytes[..len], &mut self.input)?;

        let tstart = monotonic_ns();
        self.kernel.process(&self.input, &mut self.output)?;
        let tend = monotonic_ns();

        self.tx_bytes.clear();
        encode_samples(&self.output, &mut self.tx_bytes);
        let shape = self.kernel.output_shape();
        let tfirst_tx = monotonic_ns();
        Ok(ResultHeader {
            session_id: self.session_id,
            sequence,
            tin,
            tstart,
            tend,
            tfirst_tx,
            tlast_tx: tfirst_tx,
            output_length_samples: shape.samples,
            output_channels: shape.channels,
        })
    }
}

fn window_bytes(samples: u32, channels: u32) -> Result<usize> {
    let bytes = crate::error::checked_size(
        "window bytes",
        &[samples as usize, channels as usize, SAMPLE_SIZE],
    )?;
    if bytes > MAX_WINDOW_BYTES {
        return Err(CortexError::config(format!(
            "{}x{} window is {} bytes, limit is {}",
            samples, channels, bytes, MAX_WINDOW_BYTES
        )));
    }
    Ok(bytes)
}

fn send_error<T: Transport + ?Sized>(transport: &mut T, err: &CortexError) -> Result<()> {
    protocol::send_frame(transport, FrameType::Error, 0, &ErrorPayload::from(err).encode())
}

#[cfg(unix)]
fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is writable for its full length; gethostname NUL-terminates on success.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "unknown".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
}
