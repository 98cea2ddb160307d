//! Configuration types for the heartbeat host.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the pixel-pulse host process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    /// Heartbeat timer and engine settings.
    pub scheduler: SchedulerConfig,
    /// Host bridge settings.
    pub host: HostConfig,
    /// Store locations.
    pub storage: StorageConfig,
    /// Log output settings.
    pub logging: LoggingConfig,
}

/// Heartbeat timer and engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Period of the primary heartbeat timer in seconds.
    pub tick_interval_secs: u64,
    /// Delay before the primary timer first fires after being armed.
    pub first_tick_delay_secs: u64,
    /// Period of the fallback re-check loop in seconds (0 disables it).
    pub fallback_interval_secs: u64,
    /// Seconds without input before the user counts as idle.
    pub idle_threshold_secs: u32,
    /// How long the badge acknowledgment stays visible after a pulse.
    pub ack_duration_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            first_tick_delay_secs: 6,
            fallback_interval_secs: 30,
            idle_threshold_secs: 60,
            ack_duration_ms: 2_500,
        }
    }
}

impl SchedulerConfig {
    /// Primary timer period, never shorter than one second.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    #[must_use]
    pub fn first_tick_delay(&self) -> Duration {
        Duration::from_secs(self.first_tick_delay_secs)
    }

    /// Fallback loop period, `None` when disabled.
    #[must_use]
    pub fn fallback_interval(&self) -> Option<Duration> {
        (self.fallback_interval_secs > 0).then(|| Duration::from_secs(self.fallback_interval_secs))
    }

    #[must_use]
    pub fn ack_duration(&self) -> Duration {
        Duration::from_millis(self.ack_duration_ms)
    }
}

/// Host bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Timeout for a single call into the browser (tabs, scripting, idle).
    pub call_timeout_ms: u64,
    /// Inbound command queue capacity.
    pub request_capacity: usize,
    /// Outbound event broadcast capacity.
    pub event_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 10_000,
            request_capacity: 64,
            event_capacity: 128,
        }
    }
}

impl HostConfig {
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms.max(1))
    }
}

/// Store location configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for `settings.json` and `local_state.json`.
    /// Defaults to [`crate::pulse_dirs::data_dir`].
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolved data directory.
    #[must_use]
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(crate::pulse_dirs::data_dir)
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Also write a daily rolling log file under the logs directory.
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            file: false,
        }
    }
}

impl PulseConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::PulseError::Config(e.to_string()))
    }

    /// Load from `path` when it exists, otherwise return defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> crate::error::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::PulseError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
