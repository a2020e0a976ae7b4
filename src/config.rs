//! Run configuration loaded from YAML.
//!
//! ```yaml
//! dataset:
//!   sample_rate_hz: 160
//!   channels: 64
//!   window_length_samples: 160
//!   hop_samples: 80
//!   warmup_seconds: 1.0
//! devices:
//!   - name: host-car
//!     kernel: car
//!     transport: "local://"
//!     adapter: target/release/cortex-adapter
//!   - name: jetson-zscore
//!     kernel: zscore
//!     transport: "tcp://10.0.0.7:9000?timeout_ms=2000"
//!     calibration_state: states/zscore.bin
//! timeouts:
//!   window_ms: 2000
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::{DeviceTimeouts, SessionConfig};
use crate::protocol::{self, Config};
use crate::protocol::messages::{PLUGIN_NAME_SIZE, PLUGIN_PARAMS_SIZE};
use crate::scheduler::SchedulerConfig;
use crate::transport::TransportUri;
use crate::{CortexError, Result};

/// Shape of the replayed stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub sample_rate_hz: u32,
    pub channels: u32,
    pub window_length_samples: u32,
    pub hop_samples: u32,
    #[serde(default)]
    pub warmup_seconds: f64,
}

/// One device under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub kernel: String,
    #[serde(default)]
    pub params: String,
    pub transport: String,
    /// Adapter executable for transports the harness launches itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<PathBuf>,
    /// File holding a calibration blob sent with CONFIG.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_state: Option<PathBuf>,
}

impl DeviceConfig {
    pub fn uri(&self) -> Result<TransportUri> {
        TransportUri::parse(&self.transport)
    }
}

/// Timeouts in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub handshake_ms: u64,
    pub window_ms: u64,
    pub chunk_ms: u64,
    pub accept_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let millis = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        Self {
            handshake_ms: millis(protocol::HANDSHAKE_TIMEOUT),
            window_ms: millis(protocol::WINDOW_TIMEOUT),
            chunk_ms: millis(protocol::CHUNK_TIMEOUT),
            accept_ms: millis(protocol::ACCEPT_TIMEOUT),
        }
    }
}

impl From<TimeoutConfig> for DeviceTimeouts {
    fn from(t: TimeoutConfig) -> Self {
        Self {
            handshake: Duration::from_millis(t.handshake_ms),
            window: Duration::from_millis(t.window_ms),
            chunk: Duration::from_millis(t.chunk_ms),
            accept: Duration::from_millis(t.accept_ms),
        }
    }
}

/// Complete description of one benchmarking run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub dataset: DatasetConfig,
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl RunConfig {
    /// Load and validate a YAML file.
    ///
    /// Relative `adapter` and `calibration_state` paths are resolved against the
    /// directory containing the file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| CortexError::config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config = Self::from_yaml_str(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        debug!(path = %path.display(), devices = config.devices.len(), "Loaded run config");
        Ok(config)
    }

    /// Parse and validate YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)
            .map_err(|e| CortexError::config(format!("invalid run config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml_ng::to_string(self).map_err(|e| CortexError::config(e.to_string()))
    }

    /// Check everything that can be checked without touching devices.
    pub fn validate(&self) -> Result<()> {
        self.scheduler_config().validate()?;

        if self.devices.is_empty() {
            return Err(CortexError::config("at least one device is required"));
        }
        let t = &self.timeouts;
        if [t.handshake_ms, t.window_ms, t.chunk_ms, t.accept_ms].contains(&0) {
            return Err(CortexError::config("timeouts must be positive"));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name.is_empty() {
                return Err(CortexError::config("device name must not be empty"));
            }
            if !names.insert(device.name.as_str()) {
                return Err(CortexError::config(format!("duplicate device name '{}'", device.name)));
            }
            if device.kernel.is_empty() || device.kernel.len() >= PLUGIN_NAME_SIZE {
                return Err(CortexError::config(format!(
                    "device '{}': kernel name must be 1 to {} bytes",
                    device.name,
                    PLUGIN_NAME_SIZE - 1
                )));
            }
            if device.params.len() >= PLUGIN_PARAMS_SIZE {
                return Err(CortexError::config(format!(
                    "device '{}': params exceed {} bytes",
                    device.name,
                    PLUGIN_PARAMS_SIZE - 1
                )));
            }
            let uri = device.uri()?;
            match (&uri, &device.adapter) {
                (TransportUri::TcpListen { .. }, _) => {
                    return Err(CortexError::config(format!(
                        "device '{}': the harness dials adapters; use tcp://HOST:PORT",
                        device.name
                    )));
                }
                (TransportUri::Local, None) => {
                    return Err(CortexError::config(format!(
                        "device '{}': local:// needs an adapter path",
                        device.name
                    )));
                }
                (TransportUri::Local | TransportUri::Shm { .. }, _) | (_, None) => {}
                (_, Some(_)) => {
                    return Err(CortexError::config(format!(
                        "device '{}': {} adapters are started separately; remove 'adapter'",
                        device.name, uri
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            sample_rate_hz: self.dataset.sample_rate_hz,
            window_length_samples: self.dataset.window_length_samples,
            hop_samples: self.dataset.hop_samples,
            channels: self.dataset.channels,
            warmup_seconds: self.dataset.warmup_seconds,
        }
    }

    pub fn device_timeouts(&self) -> DeviceTimeouts {
        self.timeouts.into()
    }

    /// Session parameters for `device`, reading its calibration file if it has one.
    pub fn session_config(&self, device: &DeviceConfig) -> Result<SessionConfig> {
        let calibration_state = match &device.calibration_state {
            Some(path) => {
                let blob = fs::read(path).map_err(|e| {
                    CortexError::config(format!(
                        "device '{}': cannot read calibration state {}: {}",
                        device.name,
                        path.display(),
                        e
                    ))
                })?;
                if blob.len() > Config::MAX_CALIBRATION_STATE {
                    return Err(CortexError::config(format!(
                        "device '{}': calibration state is {} bytes, limit is {}",
                        device.name,
                        blob.len(),
                        Config::MAX_CALIBRATION_STATE
                    )));
                }
                blob
            }
            None => Vec::new(),
        };
        Ok(SessionConfig {
            sample_rate_hz: self.dataset.sample_rate_hz,
            window_length_samples: self.dataset.window_length_samples,
            hop_samples: self.dataset.hop_samples,
            channels: self.dataset.channels,
            kernel: device.kernel.clone(),
            params: device.params.clone(),
            calibration_state,
        })
    }

    fn resolve_paths(&mut self, base: &Path) {
        for device in &mut self.devices {
            for path in [&mut device.adapter, &mut device.calibration_state].into_iter().flatten() {
                if path.is_relative() {
                    *path = base.join(&*path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
dataset:
  sample_rate_hz: 160
  channels: 64
  window_length_samples: 160
  hop_samples: 80
  warmup_seconds: 1.5
devices:
  - name: local
    kernel: identity
    transport: "local://"
    adapter: bin/cortex-adapter
  - name: remote
    kernel: gain
    params: "gain=2"
    transport: "tcp://10.0.0.7:9000"
timeouts:
  window_ms: 2000
"#;

    #[test]
    fn parses_and_fills_defaults() {
        let config = RunConfig::from_yaml_str(YAML).unwrap();
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[1].params, "gain=2");
        assert_eq!(config.devices[0].params, "");
        assert_eq!(config.timeouts.window_ms, 2000);
        assert_eq!(config.timeouts.handshake_ms, 5000);
        assert_eq!(config.timeouts.chunk_ms, 1000);
        assert_eq!(config.timeouts.accept_ms, 30_000);
        assert_eq!(config.scheduler_config().warmup_windows(), 3);
        assert_eq!(config.device_timeouts().window, Duration::from_secs(2));

        let session = config.session_config(&config.devices[1]).unwrap();
        assert_eq!(session.kernel, "gain");
        assert_eq!(session.channels, 64);
        assert!(session.calibration_state.is_empty());
    }

    #[test]
    fn yaml_round_trip() {
        let config = RunConfig::from_yaml_str(YAML).unwrap();
        let again = RunConfig::from_yaml_str(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn rejects_invalid_configs() {
        let cases = [
            YAML.replace("hop_samples: 80", "hop_samples: 200"),
            YAML.replace("channels: 64", "channels: 0"),
            YAML.replace("name: remote", "name: local"),
            YAML.replace("tcp://10.0.0.7:9000", "tcp://:9000"),
            YAML.replace("    adapter: bin/cortex-adapter\n", ""),
            YAML.replace("kernel: gain", "kernel: \"\""),
            YAML.replace("window_ms: 2000", "window_ms: 0"),
            YAML.replace("warmup_seconds: 1.5", "warmup_seconds: -1"),
            YAML.replace("transport: \"tcp://10.0.0.7:9000\"", "transport: \"tcp://10.0.0.7:9000\"\n    adapter: x"),
            "dataset: {}".to_string(),
        ];
        for yaml in cases {
            let result = RunConfig::from_yaml_str(&yaml);
            assert!(
                matches!(result, Err(CortexError::Config { .. } | CortexError::InvalidUri { .. })),
                "accepted:\n{}",
                yaml
            );
        }
    }

    #[test]
    fn from_file_resolves_relative_paths_and_reads_calibration() {
        let dir = std::env::temp_dir().join(format!("cortex-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("state.bin"), [1u8, 2, 3]).unwrap();
        let yaml = YAML.replace(
            "transport: \"tcp://10.0.0.7:9000\"",
            "transport: \"tcp://10.0.0.7:9000\"\n    calibration_state: state.bin",
        );
        fs::write(dir.join("run.yaml"), yaml).unwrap();

        let config = RunConfig::from_file(dir.join("run.yaml")).unwrap();
        assert_eq!(config.devices[0].adapter.as_deref(), Some(dir.join("bin/cortex-adapter").as_path()));
        let session = config.session_config(&config.devices[1]).unwrap();
        assert_eq!(session.calibration_state, [1, 2, 3]);

        fs::remove_dir_all(&dir).unwrap();
        assert!(RunConfig::from_file(dir.join("run.yaml")).is_err());
    }
}
