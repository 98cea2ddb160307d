//! Centralized application directory paths for Pixel Pulse.
//!
//! Uses the [`dirs`] crate for platform-appropriate directory resolution.
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | Data | `~/Library/Application Support/pixel-pulse/` | `~/.local/share/pixel-pulse/` |
//! | Config | `~/Library/Application Support/pixel-pulse/` | `~/.config/pixel-pulse/` |
//!
//! # Environment Overrides
//!
//! - `PIXEL_PULSE_DATA_DIR` overrides [`data_dir`]
//! - `PIXEL_PULSE_CONFIG_DIR` overrides [`config_dir`]

use std::path::PathBuf;

const APP_DIR: &str = "pixel-pulse";

/// Application data root directory.
///
/// Holds the settings store, the local state store and logs.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("PIXEL_PULSE_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("/tmp/pixel-pulse-data"))
}

/// Application config directory, home of `config.toml`.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("PIXEL_PULSE_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("/tmp/pixel-pulse-config"))
}

/// Log file directory (`data_dir()/logs/`).
#[must_use]
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Main config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Settings store file name (rules, global toggle, theme).
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Local state file name (execution records, last status).
pub const LOCAL_STATE_FILE_NAME: &str = "local_state.json";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_is_inside_config_dir() {
        let file = config_file();
        assert!(file.starts_with(config_dir()));
        assert!(file.ends_with("config.toml"));
    }

    #[test]
    fn logs_dir_is_inside_data_dir() {
        assert!(logs_dir().starts_with(data_dir()));
    }
}
