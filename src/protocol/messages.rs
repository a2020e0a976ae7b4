//! Typed payloads for each frame kind.
//!
//! Every struct serializes to and from an explicit little-endian byte layout. Buffers
//! are never reinterpreted as structs.

use crate::error::checked_size;
use crate::protocol::{MAX_FRAME_PAYLOAD, SAMPLE_SIZE};
use crate::{CortexError, Result};

/// Width of the fixed string fields in HELLO.
pub const NAME_FIELD_SIZE: usize = 32;
/// Width of CONFIG's kernel name field.
pub const PLUGIN_NAME_SIZE: usize = 64;
/// Width of CONFIG's kernel parameter field.
pub const PLUGIN_PARAMS_SIZE: usize = 256;
/// Width of ERROR's message field.
pub const ERROR_MESSAGE_SIZE: usize = 256;

/// ACK type sent in response to an accepted CONFIG.
pub const ACK_CONFIG: u32 = 0;

/// Adapter capability and identity announcement, sent first on every session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hello {
    /// Random value chosen once per adapter process start.
    pub boot_id: u32,
    pub adapter_name: String,
    pub abi_version: u8,
    pub num_kernels: u8,
    pub max_window_samples: u32,
    pub max_channels: u32,
    pub hostname: String,
    pub cpu: String,
    pub os: String,
}

impl Hello {
    pub const SIZE: usize = 144;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.boot_id.to_le_bytes());
        write_fixed_str(&mut out[4..36], &self.adapter_name);
        out[36] = self.abi_version;
        out[37] = self.num_kernels;
        out[40..44].copy_from_slice(&self.max_window_samples.to_le_bytes());
        out[44..48].copy_from_slice(&self.max_channels.to_le_bytes());
        write_fixed_str(&mut out[48..80], &self.hostname);
        write_fixed_str(&mut out[80..112], &self.cpu);
        write_fixed_str(&mut out[112..144], &self.os);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        expect_len("HELLO", data, Self::SIZE)?;
        Ok(Self {
            boot_id: parse_u32_le(data, 0)?,
            adapter_name: extract_null_terminated_string(&data[4..36]),
            abi_version: data[36],
            num_kernels: data[37],
            max_window_samples: parse_u32_le(data, 40)?,
            max_channels: parse_u32_le(data, 44)?,
            hostname: extract_null_terminated_string(&data[48..80]),
            cpu: extract_null_terminated_string(&data[80..112]),
            os: extract_null_terminated_string(&data[112..144]),
        })
    }
}

/// Session parameters sent by the harness after HELLO.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Config {
    pub session_id: u32,
    pub sample_rate_hz: u32,
    pub window_length_samples: u32,
    pub hop_samples: u32,
    pub channels: u32,
    pub plugin_name: String,
    pub plugin_params: String,
    /// Trained kernel state; empty when the kernel needs none.
    pub calibration_state: Vec<u8>,
}

impl Config {
    /// Bytes before the optional calibration section.
    pub const FIXED_SIZE: usize = 20 + PLUGIN_NAME_SIZE + PLUGIN_PARAMS_SIZE;

    /// Largest calibration blob that still fits in one frame.
    pub const MAX_CALIBRATION_STATE: usize = MAX_FRAME_PAYLOAD - Self::FIXED_SIZE - 4;

    /// Serialize, rejecting strings that do not fit their fields and oversized blobs.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.plugin_name.len() >= PLUGIN_NAME_SIZE {
            return Err(CortexError::config(format!(
                "kernel name '{}' exceeds {} bytes",
                self.plugin_name,
                PLUGIN_NAME_SIZE - 1
            )));
        }
        if self.plugin_params.len() >= PLUGIN_PARAMS_SIZE {
            return Err(CortexError::config(format!(
                "kernel parameters exceed {} bytes",
                PLUGIN_PARAMS_SIZE - 1
            )));
        }
        if self.calibration_state.len() > Self::MAX_CALIBRATION_STATE {
            return Err(CortexError::FrameTooLarge {
                length: self.calibration_state.len(),
                max: Self::MAX_CALIBRATION_STATE,
            });
        }

        let mut out = Vec::with_capacity(Self::FIXED_SIZE + 4 + self.calibration_state.len());
        out.extend_from_slice(&self.session_id.to_le_bytes());
        out.extend_from_slice(&self.sample_rate_hz.to_le_bytes());
        out.extend_from_slice(&self.window_length_samples.to_le_bytes());
        out.extend_from_slice(&self.hop_samples.to_le_bytes());
        out.extend_from_slice(&self.channels.to_le_bytes());
        out.resize(Self::FIXED_SIZE, 0);
        write_fixed_str(&mut out[20..20 + PLUGIN_NAME_SIZE], &self.plugin_name);
        write_fixed_str(&mut out[20 + PLUGIN_NAME_SIZE..Self::FIXED_SIZE], &self.plugin_params);
        if !self.calibration_state.is_empty() {
            out.extend_from_slice(&(self.calibration_state.len() as u32).to_le_bytes());
            out.extend_from_slice(&self.calibration_state);
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::FIXED_SIZE {
            return Err(short("CONFIG", Self::FIXED_SIZE, data.len()));
        }
        let calibration_state = if data.len() == Self::FIXED_SIZE {
            Vec::new()
        } else {
            let size = parse_u32_le(data, Self::FIXED_SIZE)? as usize;
            if size > Self::MAX_CALIBRATION_STATE {
                return Err(CortexError::FrameTooLarge {
                    length: size,
                    max: Self::MAX_CALIBRATION_STATE,
                });
            }
            let start = Self::FIXED_SIZE + 4;
            if data.len() != start + size {
                return Err(CortexError::malformed(
                    "CONFIG",
                    format!(
                        "calibration state declares {} bytes but {} follow",
                        size,
                        data.len().saturating_sub(start)
                    ),
                ));
            }
            data[start..].to_vec()
        };

        Ok(Self {
            session_id: parse_u32_le(data, 0)?,
            sample_rate_hz: parse_u32_le(data, 4)?,
            window_length_samples: parse_u32_le(data, 8)?,
            hop_samples: parse_u32_le(data, 12)?,
            channels: parse_u32_le(data, 16)?,
            plugin_name: extract_null_terminated_string(&data[20..20 + PLUGIN_NAME_SIZE]),
            plugin_params: extract_null_terminated_string(
                &data[20 + PLUGIN_NAME_SIZE..Self::FIXED_SIZE],
            ),
            calibration_state,
        })
    }
}

/// Adapter acceptance of a CONFIG, optionally overriding the output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ack {
    pub ack_type: u32,
    /// Output samples per channel; 0 keeps CONFIG's window length.
    pub output_length_samples: u32,
    /// Output channel count; 0 keeps CONFIG's channel count.
    pub output_channels: u32,
}

impl Ack {
    pub const SIZE: usize = 12;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.ack_type.to_le_bytes());
        out.extend_from_slice(&self.output_length_samples.to_le_bytes());
        out.extend_from_slice(&self.output_channels.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        expect_len("ACK", data, Self::SIZE)?;
        Ok(Self {
            ack_type: parse_u32_le(data, 0)?,
            output_length_samples: parse_u32_le(data, 4)?,
            output_channels: parse_u32_le(data, 8)?,
        })
    }

    /// Effective `(samples, channels)` of each result after applying the zero defaults.
    pub fn output_shape(&self, config: &Config) -> (u32, u32) {
        let samples = match self.output_length_samples {
            0 => config.window_length_samples,
            n => n,
        };
        let channels = match self.output_channels {
            0 => config.channels,
            n => n,
        };
        (samples, channels)
    }
}

/// Metadata frame that precedes each chunked result payload.
///
/// Timestamps are nanoseconds on the adapter's monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResultHeader {
    pub session_id: u32,
    pub sequence: u32,
    /// Last input byte received.
    pub tin: u64,
    /// Kernel started.
    pub tstart: u64,
    /// Kernel finished.
    pub tend: u64,
    /// First result byte handed to the transport.
    pub tfirst_tx: u64,
    /// Written equal to `tfirst_tx`: this header is sent before the samples it describes.
    pub tlast_tx: u64,
    pub output_length_samples: u32,
    pub output_channels: u32,
}

impl ResultHeader {
    pub const SIZE: usize = 56;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.session_id.to_le_bytes());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        for t in [self.tin, self.tstart, self.tend, self.tfirst_tx, self.tlast_tx] {
            out.extend_from_slice(&t.to_le_bytes());
        }
        out.extend_from_slice(&self.output_length_samples.to_le_bytes());
        out.extend_from_slice(&self.output_channels.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        expect_len("RESULT", data, Self::SIZE)?;
        Ok(Self {
            session_id: parse_u32_le(data, 0)?,
            sequence: parse_u32_le(data, 4)?,
            tin: parse_u64_le(data, 8)?,
            tstart: parse_u64_le(data, 16)?,
            tend: parse_u64_le(data, 24)?,
            tfirst_tx: parse_u64_le(data, 32)?,
            tlast_tx: parse_u64_le(data, 40)?,
            output_length_samples: parse_u32_le(data, 48)?,
            output_channels: parse_u32_le(data, 52)?,
        })
    }

    /// Size in bytes of the sample payload this header announces.
    pub fn payload_bytes(&self) -> Result<usize> {
        checked_size(
            "result payload",
            &[self.output_length_samples as usize, self.output_channels as usize, SAMPLE_SIZE],
        )
    }
}

/// Adapter-reported failure.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorPayload {
    pub code: u32,
    pub message: String,
}

impl ErrorPayload {
    pub const SIZE: usize = 4 + ERROR_MESSAGE_SIZE;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.code.to_le_bytes());
        write_fixed_str(&mut out[4..], &self.message);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        expect_len("ERROR", data, Self::SIZE)?;
        Ok(Self {
            code: parse_u32_le(data, 0)?,
            message: extract_null_terminated_string(&data[4..]),
        })
    }
}

impl From<&CortexError> for ErrorPayload {
    fn from(err: &CortexError) -> Self {
        Self { code: err.code(), message: err.to_string() }
    }
}

/// Append `samples` to `out` as little-endian f32.
pub fn encode_samples(samples: &[f32], out: &mut Vec<u8>) {
    out.reserve(samples.len() * SAMPLE_SIZE);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
}

/// Convert little-endian f32 bytes into `out`, which must hold exactly `bytes.len() / 4` samples.
pub fn decode_samples(bytes: &[u8], out: &mut [f32]) -> Result<()> {
    if bytes.len() % SAMPLE_SIZE != 0 || bytes.len() / SAMPLE_SIZE != out.len() {
        return Err(CortexError::malformed(
            "sample payload",
            format!("{} bytes do not fill {} samples", bytes.len(), out.len()),
        ));
    }
    for (dst, src) in out.iter_mut().zip(bytes.chunks_exact(SAMPLE_SIZE)) {
        *dst = f32::from_le_bytes([src[0], src[1], src[2], src[3]]);
    }
    Ok(())
}

pub(crate) fn parse_u32_le(data: &[u8], offset: usize) -> Result<u32> {
    match data.get(offset..offset + 4) {
        Some(b) => Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(CortexError::malformed(
            "integer field",
            format!("need 4 bytes at offset {}, have {}", offset, data.len().saturating_sub(offset)),
        )),
    }
}

fn parse_u64_le(data: &[u8], offset: usize) -> Result<u64> {
    match data.get(offset..offset + 8) {
        Some(b) => Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])),
        None => Err(CortexError::malformed(
            "timestamp field",
            format!("need 8 bytes at offset {}, have {}", offset, data.len().saturating_sub(offset)),
        )),
    }
}

fn expect_len(what: &str, data: &[u8], size: usize) -> Result<()> {
    if data.len() != size {
        return Err(short(what, size, data.len()));
    }
    Ok(())
}

fn short(what: &str, size: usize, actual: usize) -> CortexError {
    CortexError::malformed(what, format!("payload is {} bytes, expected {}", actual, size))
}

/// Copy `s` into a zeroed fixed field, truncating on a char boundary to keep a trailing NUL.
fn write_fixed_str(field: &mut [u8], s: &str) {
    let mut end = s.len().min(field.len().saturating_sub(1));
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    field[..end].copy_from_slice(&s.as_bytes()[..end]);
    field[end..].fill(0);
}

fn extract_null_terminated_string(bytes: &[u8]) -> String {
    let null_pos = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..null_pos]).to_string()
}
