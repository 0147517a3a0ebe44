//! Acquisition defaults: TOML-based, platform-aware paths.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::device::RetryPolicy;
use crate::protocol::{
    ByteOrder, DEFAULT_INTEGRATION_TIME_MS, MAX_INTEGRATION_TIME_MS, MIN_INTEGRATION_TIME_MS,
    TriggerMode,
};

/// Header comment prepended to saved config files.
const CONFIG_HEADER: &str = "# usb2000 configuration: acquisition defaults for usb2000-cli.\n\n";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Integration time in milliseconds (3–65535). Default: 100.
    #[serde(default = "default_integration_time")]
    pub integration_time_ms: u32,

    /// Trigger mode code: 0 = normal, 2 = software, 3 = hardware.
    #[serde(default)]
    pub trigger_mode: i64,

    /// Preferred device serial number. Empty = first device found.
    #[serde(default)]
    pub device_serial: String,

    /// Which packet of each pair carries the low byte. Default: "low-first".
    #[serde(default)]
    pub byte_order: ByteOrder,

    /// Multiply normalised spectra by the linearity-correction table.
    #[serde(default)]
    pub linearity_correction: bool,

    /// Extra reads of a short spectrum packet before giving up.
    #[serde(default = "default_packet_retries")]
    pub packet_retries: u32,
}

fn default_integration_time() -> u32 {
    DEFAULT_INTEGRATION_TIME_MS
}

fn default_packet_retries() -> u32 {
    RetryPolicy::default().packet_retries
}

impl Default for Config {
    fn default() -> Self {
        Self {
            integration_time_ms: default_integration_time(),
            trigger_mode: 0,
            device_serial: String::new(),
            byte_order: ByteOrder::default(),
            linearity_correction: false,
            packet_retries: default_packet_retries(),
        }
    }
}

/// Validation errors that [`Config::validate`] can return.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// `integration_time_ms` is outside the device range.
    IntegrationTime(u32),
    /// `trigger_mode` is not a valid code.
    TriggerMode(i64),
    /// `packet_retries` is zero.
    ZeroPacketRetries,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::IntegrationTime(ms) => write!(
                f,
                "Invalid integration_time_ms: {ms} (allowed {MIN_INTEGRATION_TIME_MS}..={MAX_INTEGRATION_TIME_MS})"
            ),
            ValidationError::TriggerMode(code) => {
                write!(f, "Invalid trigger_mode: {code} (allowed 0, 2, 3)")
            }
            ValidationError::ZeroPacketRetries => {
                write!(f, "Invalid packet_retries: must be at least 1")
            }
        }
    }
}

impl Config {
    /// Platform-specific config directory.
    pub fn dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("usb2000"))
    }

    /// Full path to config file.
    pub fn path() -> Option<PathBuf> {
        Self::dir().map(|d| d.join("config.toml"))
    }

    /// Write the config to `path`, creating parent directories.
    ///
    /// The file is staged next to its destination and renamed into place,
    /// starting with a header comment.
    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        let body = toml::to_string_pretty(self).map_err(io::Error::other)?;
        let contents = [CONFIG_HEADER, body.as_str()].concat();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let staging = path.with_extension("toml.tmp");
        fs::write(&staging, &contents)?;
        if fs::rename(&staging, path).is_err() {
            // Cross-device rename: write in place.
            let _ = fs::remove_file(&staging);
            return fs::write(path, &contents);
        }
        Ok(())
    }

    /// Read the config at `path`.
    ///
    /// A missing or unreadable file gives the defaults silently; a file that
    /// does not parse gives the defaults and one warning.
    pub fn load_from(path: &Path) -> (Self, Vec<String>) {
        let Ok(contents) = fs::read_to_string(path) else {
            return (Self::default(), Vec::new());
        };
        match toml::from_str(&contents) {
            Ok(config) => (config, Vec::new()),
            Err(e) => {
                let warning = format!("invalid config {}, using defaults: {e}", path.display());
                (Self::default(), vec![warning])
            }
        }
    }

    /// Load config from the default path, returning the config and any parse warnings.
    pub fn load_with_warnings() -> (Self, Vec<String>) {
        let Some(path) = Self::path() else {
            return (Self::default(), vec![]);
        };
        Self::load_from(&path)
    }

    /// Returns `Ok(())` if valid, or `Err(Vec<ValidationError>)` with all problems found.
    pub fn validate(&self) -> std::result::Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if !(MIN_INTEGRATION_TIME_MS..=MAX_INTEGRATION_TIME_MS).contains(&self.integration_time_ms)
        {
            errors.push(ValidationError::IntegrationTime(self.integration_time_ms));
        }

        if TriggerMode::from_code(self.trigger_mode).is_err() {
            errors.push(ValidationError::TriggerMode(self.trigger_mode));
        }

        if self.packet_retries == 0 {
            errors.push(ValidationError::ZeroPacketRetries);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Trigger mode from its configured code.
    pub fn trigger(&self) -> crate::device::Result<TriggerMode> {
        TriggerMode::from_code(self.trigger_mode)
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            packet_retries: self.packet_retries,
        }
    }
}
