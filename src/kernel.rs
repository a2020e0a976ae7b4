//! Kernel plugin interface and the built-in kernels.
//!
//! A [`KernelPlugin`] is resolved by name through a [`KernelRegistry`] and turns a
//! [`KernelConfig`] into a running [`KernelInstance`]. Trainable kernels also
//! implement [`KernelPlugin::calibrate`], producing the state blob that CONFIG carries
//! to the adapter.
//!
//! Windows are interleaved: sample `t` of channel `c` lives at `t * channels + c`.
//! Outputs use the same layout with the instance's [`OutputShape`].

use std::fmt;
use std::sync::Arc;

use crate::protocol::Config;
use crate::{CortexError, Result};

/// Parameters a kernel is initialized with.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KernelConfig {
    pub sample_rate_hz: u32,
    pub window_length_samples: u32,
    pub hop_samples: u32,
    pub channels: u32,
    /// Free-form `key=value` pairs separated by `,` or `;`.
    pub params: String,
    pub calibration_state: Vec<u8>,
}

impl KernelConfig {
    /// Samples in one interleaved input window.
    pub fn window_samples(&self) -> usize {
        self.window_length_samples as usize * self.channels as usize
    }

    /// Look up one parameter by key.
    pub fn param(&self, key: &str) -> Result<Option<&str>> {
        for pair in self.params.split([',', ';']).map(str::trim).filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').ok_or_else(|| {
                CortexError::config(format!("kernel parameter '{}' is not KEY=VALUE", pair))
            })?;
            if k.trim() == key {
                return Ok(Some(v.trim()));
            }
        }
        Ok(None)
    }
}

impl From<&Config> for KernelConfig {
    fn from(config: &Config) -> Self {
        Self {
            sample_rate_hz: config.sample_rate_hz,
            window_length_samples: config.window_length_samples,
            hop_samples: config.hop_samples,
            channels: config.channels,
            params: config.plugin_params.clone(),
            calibration_state: config.calibration_state.clone(),
        }
    }
}

/// Output dimensions of a kernel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputShape {
    pub samples: u32,
    pub channels: u32,
}

impl OutputShape {
    pub fn len(&self) -> usize {
        self.samples as usize * self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A named kernel implementation.
pub trait KernelPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create an instance for one session.
    fn init(&self, config: &KernelConfig) -> Result<Box<dyn KernelInstance>>;

    /// Whether [`calibrate`](KernelPlugin::calibrate) is supported.
    fn is_trainable(&self) -> bool {
        false
    }

    /// Fit state from `windows` consecutive interleaved windows in `data`.
    fn calibrate(&self, _config: &KernelConfig, _data: &[f32], _windows: usize) -> Result<Vec<u8>> {
        Err(CortexError::kernel(self.name(), "kernel is not trainable"))
    }
}

/// A kernel bound to one session's configuration.
pub trait KernelInstance: Send {
    fn output_shape(&self) -> OutputShape;

    /// Process one input window into `output` (exactly `output_shape().len()` samples).
    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<()>;

    /// Release resources. Called once when the session ends.
    fn teardown(&mut self) {}
}

/// Name-indexed set of kernel plugins.
#[derive(Clone)]
pub struct KernelRegistry {
    plugins: Vec<Arc<dyn KernelPlugin>>,
}

impl KernelRegistry {
    pub fn empty() -> Self {
        Self { plugins: Vec::new() }
    }

    /// Registry holding every built-in kernel.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(Identity));
        registry.register(Arc::new(Gain));
        registry.register(Arc::new(CommonAverageReference));
        registry.register(Arc::new(ChannelMean));
        registry.register(Arc::new(ZScore));
        registry
    }

    /// Add a plugin, replacing any existing plugin with the same name.
    pub fn register(&mut self, plugin: Arc<dyn KernelPlugin>) {
        self.plugins.retain(|p| p.name() != plugin.name());
        self.plugins.push(plugin);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn KernelPlugin>> {
        self.plugins.iter().find(|p| p.name() == name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.plugins.iter().map(|p| p.name())
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Resolve `name` and initialize it.
    pub fn instantiate(&self, name: &str, config: &KernelConfig) -> Result<Box<dyn KernelInstance>> {
        let plugin = self
            .get(name)
            .ok_or_else(|| CortexError::kernel(name, "no kernel registered under this name"))?;
        plugin.init(config)
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

fn same_shape(config: &KernelConfig) -> OutputShape {
    OutputShape { samples: config.window_length_samples, channels: config.channels }
}

fn check_len(kernel: &str, what: &str, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(CortexError::kernel(
            kernel,
            format!("{} has {} samples, expected {}", what, actual, expected),
        ));
    }
    Ok(())
}

/// Output equals input.
#[derive(Debug)]
pub struct Identity;

struct IdentityInstance {
    shape: OutputShape,
}

impl KernelPlugin for Identity {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn init(&self, config: &KernelConfig) -> Result<Box<dyn KernelInstance>> {
        Ok(Box::new(IdentityInstance { shape: same_shape(config) }))
    }
}

impl KernelInstance for IdentityInstance {
    fn output_shape(&self) -> OutputShape {
        self.shape
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<()> {
        check_len("identity", "input", input.len(), self.shape.len())?;
        check_len("identity", "output", output.len(), self.shape.len())?;
        output.copy_from_slice(input);
        Ok(())
    }
}

/// Multiplies every sample by the `gain` parameter (default 1.0).
#[derive(Debug)]
pub struct Gain;

struct GainInstance {
    shape: OutputShape,
    gain: f32,
}

impl KernelPlugin for Gain {
    fn name(&self) -> &'static str {
        "gain"
    }

    fn init(&self, config: &KernelConfig) -> Result<Box<dyn KernelInstance>> {
        let gain = match config.param("gain")? {
            Some(v) => v
                .parse::<f32>()
                .ok()
                .filter(|g| g.is_finite())
                .ok_or_else(|| CortexError::kernel("gain", format!("invalid gain '{}'", v)))?,
            None => 1.0,
        };
        Ok(Box::new(GainInstance { shape: same_shape(config), gain }))
    }
}

impl KernelInstance for GainInstance {
    fn output_shape(&self) -> OutputShape {
        self.shape
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<()> {
        check_len("gain", "input", input.len(), self.shape.len())?;
        for (o, i) in output.iter_mut().zip(input) {
            *o = i * self.gain;
        }
        Ok(())
    }
}

/// Common average reference: subtracts the cross-channel mean at every sample.
#[derive(Debug)]
pub struct CommonAverageReference;

struct CarInstance {
    shape: OutputShape,
}

impl KernelPlugin for CommonAverageReference {
    fn name(&self) -> &'static str {
        "car"
    }

    fn init(&self, config: &KernelConfig) -> Result<Box<dyn KernelInstance>> {
        Ok(Box::new(CarInstance { shape: same_shape(config) }))
    }
}

impl KernelInstance for CarInstance {
    fn output_shape(&self) -> OutputShape {
        self.shape
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<()> {
        check_len("car", "input", input.len(), self.shape.len())?;
        let channels = self.shape.channels as usize;
        for (row_in, row_out) in input.chunks_exact(channels).zip(output.chunks_exact_mut(channels)) {
            let mean = row_in.iter().sum::<f32>() / channels as f32;
            for (o, i) in row_out.iter_mut().zip(row_in) {
                *o = i - mean;
            }
        }
        Ok(())
    }
}

/// Per-channel mean over the window; one output sample per channel.
#[derive(Debug)]
pub struct ChannelMean;

struct MeanInstance {
    samples: usize,
    channels: usize,
}

impl KernelPlugin for ChannelMean {
    fn name(&self) -> &'static str {
        "mean"
    }

    fn init(&self, config: &KernelConfig) -> Result<Box<dyn KernelInstance>> {
        Ok(Box::new(MeanInstance {
            samples: config.window_length_samples as usize,
            channels: config.channels as usize,
        }))
    }
}

impl KernelInstance for MeanInstance {
    fn output_shape(&self) -> OutputShape {
        OutputShape { samples: 1, channels: self.channels as u32 }
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<()> {
        check_len("mean", "input", input.len(), self.samples * self.channels)?;
        check_len("mean", "output", output.len(), self.channels)?;
        output.fill(0.0);
        for row in input.chunks_exact(self.channels) {
            for (acc, x) in output.iter_mut().zip(row) {
                *acc += x;
            }
        }
        let n = self.samples as f32;
        output.iter_mut().for_each(|acc| *acc /= n);
        Ok(())
    }
}

/// Per-channel standardization with a calibrated mean and standard deviation.
///
/// State layout: `channels: u32` followed by `channels` pairs of `(mean: f32, std: f32)`,
/// all little-endian.
#[derive(Debug)]
pub struct ZScore;

const MIN_STD: f32 = 1e-6;

struct ZScoreInstance {
    shape: OutputShape,
    stats: Vec<(f32, f32)>,
}

impl ZScore {
    fn encode_state(stats: &[(f32, f32)]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + stats.len() * 8);
        out.extend_from_slice(&(stats.len() as u32).to_le_bytes());
        for (mean, std) in stats {
            out.extend_from_slice(&mean.to_le_bytes());
            out.extend_from_slice(&std.to_le_bytes());
        }
        out
    }

    fn decode_state(state: &[u8], channels: usize) -> Result<Vec<(f32, f32)>> {
        let Some((count, rest)) = state.split_first_chunk::<4>() else {
            return Err(CortexError::kernel("zscore", "missing calibration state"));
        };
        let count = u32::from_le_bytes(*count) as usize;
        if count != channels || rest.len() != count * 8 {
            return Err(CortexError::kernel(
                "zscore",
                format!("calibration state is for {} channels, session has {}", count, channels),
            ));
        }
        Ok(rest
            .chunks_exact(8)
            .map(|c| {
                let mean = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                let std = f32::from_le_bytes([c[4], c[5], c[6], c[7]]);
                (mean, std)
            })
            .collect())
    }
}

impl KernelPlugin for ZScore {
    fn name(&self) -> &'static str {
        "zscore"
    }

    fn init(&self, config: &KernelConfig) -> Result<Box<dyn KernelInstance>> {
        let stats = Self::decode_state(&config.calibration_state, config.channels as usize)?;
        Ok(Box::new(ZScoreInstance { shape: same_shape(config), stats }))
    }

    fn is_trainable(&self) -> bool {
        true
    }

    fn calibrate(&self, config: &KernelConfig, data: &[f32], windows: usize) -> Result<Vec<u8>> {
        let channels = config.channels as usize;
        if windows == 0 || channels == 0 {
            return Err(CortexError::kernel("zscore", "calibration needs at least one window"));
        }
        check_len("zscore", "calibration data", data.len(), windows * config.window_samples())?;

        let rows = (data.len() / channels) as f64;
        let mut sum = vec![0f64; channels];
        let mut sum_sq = vec![0f64; channels];
        for row in data.chunks_exact(channels) {
            for (c, &x) in row.iter().enumerate() {
                sum[c] += f64::from(x);
                sum_sq[c] += f64::from(x) * f64::from(x);
            }
        }
        let stats: Vec<(f32, f32)> = sum
            .iter()
            .zip(&sum_sq)
            .map(|(s, sq)| {
                let mean = s / rows;
                let var = (sq / rows - mean * mean).max(0.0);
                (mean as f32, var.sqrt() as f32)
            })
            .collect();
        Ok(Self::encode_state(&stats))
    }
}

impl KernelInstance for ZScoreInstance {
    fn output_shape(&self) -> OutputShape {
        self.shape
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<()> {
        check_len("zscore", "input", input.len(), self.shape.len())?;
        let channels = self.stats.len();
        for (row_in, row_out) in input.chunks_exact(channels).zip(output.chunks_exact_mut(channels)) {
            for ((o, i), (mean, std)) in row_out.iter_mut().zip(row_in).zip(&self.stats) {
                *o = (i - mean) / std.max(MIN_STD);
            }
        }
        Ok(())
    }
}
