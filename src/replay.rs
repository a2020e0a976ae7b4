//! Sample sources that feed the harness.
//!
//! A [`ChunkSource`] yields hop-sized chunks of interleaved samples and handles its
//! own pacing, the way an acquisition device would: one chunk per hop period,
//! optionally sped up, or as fast as the consumer takes them.

use std::f64::consts::TAU;
use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::{debug, info, trace};

use crate::{CortexError, Result};

/// Producer of interleaved sample chunks.
#[async_trait::async_trait]
pub trait ChunkSource: Send + 'static {
    /// Next chunk of interleaved samples.
    ///
    /// Returns:
    /// - `Ok(Some(chunk))` - one hop of frames (the final chunk may be shorter, but
    ///   always holds whole frames)
    /// - `Ok(None)` - stream ended
    /// - `Err(e)` - the source failed
    async fn next_chunk(&mut self) -> Result<Option<Vec<f32>>>;

    fn channels(&self) -> u32;

    fn sample_rate_hz(&self) -> u32;
}

/// Releases one chunk per hop period divided by the speed multiplier.
#[derive(Debug)]
struct Pacer {
    period: Option<Duration>,
    interval: Option<Interval>,
}

impl Pacer {
    /// `speed == 0.0` disables pacing.
    fn new(hop_samples: u32, sample_rate_hz: u32, speed: f64) -> Result<Self> {
        if !speed.is_finite() || speed < 0.0 {
            return Err(CortexError::config(format!("playback speed must be finite and >= 0, got {}", speed)));
        }
        if speed == 0.0 {
            return Ok(Self { period: None, interval: None });
        }
        let secs = f64::from(hop_samples) / (f64::from(sample_rate_hz) * speed);
        let period = Duration::try_from_secs_f64(secs)
            .map_err(|_| CortexError::config(format!("playback speed {} gives no usable hop period", speed)))?;
        Ok(Self { period: (!period.is_zero()).then_some(period), interval: None })
    }

    async fn tick(&mut self) {
        let Some(period) = self.period else {
            return;
        };
        // Created lazily: an Interval needs a running runtime.
        let interval = self.interval.get_or_insert_with(|| {
            let mut interval = interval(period);
            // Acquisition keeps running while the consumer lags.
            interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
            interval
        });
        interval.tick().await;
    }
}

fn validate_shape(channels: u32, sample_rate_hz: u32, hop_samples: u32) -> Result<usize> {
    if channels == 0 || sample_rate_hz == 0 || hop_samples == 0 {
        return Err(CortexError::config(format!(
            "source shape must be positive (channels {}, sample rate {}, hop {})",
            channels, sample_rate_hz, hop_samples
        )));
    }
    crate::error::checked_size("source chunk", &[hop_samples as usize, channels as usize])
}

/// Replays an in-memory interleaved recording.
#[derive(Debug)]
pub struct BufferSource {
    samples: Vec<f32>,
    position: usize,
    chunk_len: usize,
    channels: u32,
    sample_rate_hz: u32,
    hop_samples: u32,
    pacer: Pacer,
}

impl BufferSource {
    /// Source releasing `hop_samples` frames per hop period at normal speed.
    pub fn new(samples: Vec<f32>, channels: u32, sample_rate_hz: u32, hop_samples: u32) -> Result<Self> {
        let chunk_len = validate_shape(channels, sample_rate_hz, hop_samples)?;
        if samples.len() % channels as usize != 0 {
            return Err(CortexError::config(format!(
                "recording of {} samples is not a whole number of {}-channel frames",
                samples.len(),
                channels
            )));
        }
        info!(frames = samples.len() / channels as usize, channels, sample_rate_hz, "Opened sample buffer");
        Ok(Self {
            samples,
            position: 0,
            chunk_len,
            channels,
            sample_rate_hz,
            hop_samples,
            pacer: Pacer::new(hop_samples, sample_rate_hz, 1.0)?,
        })
    }

    /// Playback speed multiplier; `0.0` releases chunks as fast as they are taken.
    pub fn with_speed(mut self, speed: f64) -> Result<Self> {
        self.pacer = Pacer::new(self.hop_samples, self.sample_rate_hz, speed)?;
        debug!(speed, "Playback speed set");
        Ok(self)
    }

    /// Total frames in the recording.
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn remaining_frames(&self) -> usize {
        (self.samples.len() - self.position) / self.channels as usize
    }
}

#[async_trait::async_trait]
impl ChunkSource for BufferSource {
    async fn next_chunk(&mut self) -> Result<Option<Vec<f32>>> {
        if self.position >= self.samples.len() {
            debug!("Reached end of recording");
            return Ok(None);
        }
        self.pacer.tick().await;

        let end = (self.position + self.chunk_len).min(self.samples.len());
        let chunk = self.samples[self.position..end].to_vec();
        self.position = end;
        trace!(remaining = self.remaining_frames(), "Buffer chunk");
        Ok(Some(chunk))
    }

    fn channels(&self) -> u32 {
        self.channels
    }

    fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }
}

/// Deterministic multi-channel sine generator.
///
/// Channel `c` carries a sine of `8 + c` Hz scaled to [`SyntheticSource::AMPLITUDE`].
/// Two sources built with the same shape produce identical streams.
#[derive(Debug)]
pub struct SyntheticSource {
    channels: u32,
    sample_rate_hz: u32,
    hop_samples: u32,
    frame: u64,
    total_frames: Option<u64>,
    pacer: Pacer,
}

impl SyntheticSource {
    pub const AMPLITUDE: f32 = 50.0;

    /// Endless generator paced at normal speed.
    pub fn new(channels: u32, sample_rate_hz: u32, hop_samples: u32) -> Result<Self> {
        validate_shape(channels, sample_rate_hz, hop_samples)?;
        Ok(Self {
            channels,
            sample_rate_hz,
            hop_samples,
            frame: 0,
            total_frames: None,
            pacer: Pacer::new(hop_samples, sample_rate_hz, 1.0)?,
        })
    }

    /// Stop after `duration` of signal (rounded up to whole frames).
    pub fn with_duration(mut self, duration: Duration) -> Self {
        let frames = (duration.as_secs_f64() * f64::from(self.sample_rate_hz)).ceil();
        self.total_frames = Some(frames as u64);
        self
    }

    /// Playback speed multiplier; `0.0` generates as fast as chunks are taken.
    pub fn with_speed(mut self, speed: f64) -> Result<Self> {
        self.pacer = Pacer::new(self.hop_samples, self.sample_rate_hz, speed)?;
        Ok(self)
    }

    /// Frames generated so far.
    pub fn frames_emitted(&self) -> u64 {
        self.frame
    }

    fn sample(&self, frame: u64, channel: u32) -> f32 {
        let freq = 8.0 + f64::from(channel);
        let phase = (frame as f64 * freq / f64::from(self.sample_rate_hz)).fract();
        Self::AMPLITUDE * (TAU * phase).sin() as f32
    }
}

#[async_trait::async_trait]
impl ChunkSource for SyntheticSource {
    async fn next_chunk(&mut self) -> Result<Option<Vec<f32>>> {
        let frames = match self.total_frames {
            Some(total) if self.frame >= total => {
                info!(frames = self.frame, "Synthetic stream ended");
                return Ok(None);
            }
            Some(total) => u64::from(self.hop_samples).min(total - self.frame),
            None => u64::from(self.hop_samples),
        };
        self.pacer.tick().await;

        let mut chunk = Vec::with_capacity(frames as usize * self.channels as usize);
        for t in self.frame..self.frame + frames {
            for c in 0..self.channels {
                chunk.push(self.sample(t, c));
            }
        }
        self.frame += frames;
        Ok(Some(chunk))
    }

    fn channels(&self) -> u32 {
        self.channels
    }

    fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }
}
