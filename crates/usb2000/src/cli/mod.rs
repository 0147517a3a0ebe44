//! CLI subcommands: discovery, calibration report, acquisition, reset.

mod config_cmd;
mod devices;
mod info;
mod reset;
mod spectrum;

use std::path::Path;

use clap::Subcommand;
use serde::Serialize;

pub(super) use usb2000_lib::acquisition::Completeness;
pub(super) use usb2000_lib::calibration::Calibration;
pub(super) use usb2000_lib::config::Config;
pub(super) use usb2000_lib::device::DeviceError;
pub(super) use usb2000_lib::error::{Result, Usb2000Error};
pub(super) use usb2000_lib::registry::Registry;
pub(super) use usb2000_lib::transport::{NusbBackend, UsbBackend};

/// Minimum gap between a key and its value.
const PADDING: usize = 2;

/// Prefix width of nested keys.
const INDENT: usize = 2;

/// Value column shared by top-level and nested keys: the widest key (nested
/// keys counted with their prefix) plus [`PADDING`].
pub(super) fn kv_width(top: &[&str], indent: &[&str]) -> usize {
    let widest = |keys: &[&str], prefix: usize| {
        keys.iter()
            .map(|k| prefix + k.len() + PADDING)
            .max()
            .unwrap_or(0)
    };
    widest(top, 0).max(widest(indent, INDENT))
}

pub(super) fn format_kv(key: &str, value: impl std::fmt::Display, w: usize) -> String {
    format!("{key:<width$}{value}", width = w)
}

pub(super) fn kv(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("{}", format_kv(key, value, w));
}

pub(super) fn kv_indent(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("{:indent$}{}", "", format_kv(key, value, w - INDENT), indent = INDENT);
}

pub(super) fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ── JSON output structs ──

#[derive(Serialize)]
pub(super) struct DeviceJson {
    pub model: String,
    pub location: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub usb_serial: Option<String>,
}

#[derive(Serialize)]
pub(super) struct DevicesOutput {
    pub count: usize,
    pub devices: Vec<DeviceJson>,
}

#[derive(Serialize)]
pub(super) struct InfoOutput {
    pub device: DeviceJson,
    pub calibration: Calibration,
}

#[derive(Serialize)]
pub(super) struct SpectrumOutput {
    pub serial_number: String,
    pub integration_time_ms: u32,
    pub units: &'static str,
    pub completeness: Completeness,
    pub wavelengths: Vec<f64>,
    pub values: Vec<f64>,
}

#[derive(Serialize)]
pub(super) struct ConfigOutput {
    pub config_file: Option<String>,
    pub config_file_exists: bool,
    pub settings: Config,
    pub problems: Vec<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// List connected USB2000-family spectrometers
    Devices,

    /// Open a spectrometer and print its calibration
    Info {
        /// Serial number of the spectrometer to use (default: first found)
        #[arg(long)]
        serial: Option<String>,
    },

    /// Acquire one spectrum and print `wavelength value` lines
    Spectrum {
        /// Serial number of the spectrometer to use (default: first found)
        #[arg(long)]
        serial: Option<String>,
        /// Integration time in milliseconds (3-65535)
        #[arg(long, value_name = "MS")]
        integration_time: Option<u32>,
        /// Trigger mode code (0 normal, 2 software, 3 hardware)
        #[arg(long, value_name = "MODE")]
        trigger: Option<i64>,
        /// Print raw ADC counts instead of normalised intensity
        #[arg(long)]
        raw: bool,
        /// Apply the device's linearity correction
        #[arg(long)]
        linearize: bool,
    },

    /// USB-reset a spectrometer
    Reset {
        /// Serial number of the spectrometer to reset (default: first found)
        #[arg(long)]
        serial: Option<String>,
    },

    /// Show current configuration and file path
    Config,
}

/// Warn if `--json` was passed to a command that doesn't support it.
fn warn_json_unsupported(cmd_name: &str) {
    log::warn!("--json is not supported for `{cmd_name}` (ignored)");
}

pub fn run(cmd: Command, json: bool, config_path: Option<&Path>) -> Result<()> {
    match cmd {
        Command::Devices => devices::cmd_devices(json),
        Command::Info { serial } => {
            let config = device_config(config_path, serial)?;
            info::cmd_info(&config, json)
        }
        Command::Spectrum {
            serial,
            integration_time,
            trigger,
            raw,
            linearize,
        } => {
            let mut config = load_config(config_path);
            if let Some(serial) = serial {
                config.device_serial = serial;
            }
            if let Some(ms) = integration_time {
                config.integration_time_ms = ms;
            }
            if let Some(code) = trigger {
                config.trigger_mode = code;
            }
            config.linearity_correction |= linearize;
            validate(&config)?;
            spectrum::cmd_spectrum(&config, raw, json)
        }
        Command::Reset { serial } => {
            if json {
                warn_json_unsupported("reset");
            }
            let config = device_config(config_path, serial)?;
            reset::cmd_reset(&config)
        }
        Command::Config => config_cmd::cmd_config(json, config_path),
    }
}

// ── Shared helpers ──

/// Load config from `custom_path` or the default location, logging parse warnings.
pub(super) fn load_config(custom_path: Option<&Path>) -> Config {
    let (config, warnings) = match custom_path {
        Some(path) => Config::load_from(path),
        None => Config::load_with_warnings(),
    };
    for w in &warnings {
        log::warn!("{w}");
    }
    config
}

fn validate(config: &Config) -> Result<()> {
    config.validate().map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        Usb2000Error::Config(messages.join("; "))
    })
}

fn device_config(config_path: Option<&Path>, serial: Option<String>) -> Result<Config> {
    let mut config = load_config(config_path);
    if let Some(serial) = serial {
        config.device_serial = serial;
    }
    validate(&config)?;
    Ok(config)
}

pub(super) fn device_json<B: UsbBackend>(dev: &usb2000_lib::Spectrometer<B>) -> DeviceJson {
    let info = dev.info();
    DeviceJson {
        model: dev.model().to_string(),
        location: info.location.clone(),
        vendor_id: info.vendor_id,
        product_id: info.product_id,
        usb_serial: info.serial.clone(),
    }
}

/// Open the configured spectrometer, returning its id.
///
/// With an empty `device_serial` the first device that opens is used.
/// Otherwise each device is opened in turn until one reports that serial
/// number in its calibration; the others are closed again.
pub(super) fn open_selected<B: UsbBackend>(
    registry: &mut Registry<B>,
    config: &Config,
) -> Result<B::Id> {
    let ids: Vec<B::Id> = registry
        .discover()?
        .iter()
        .map(|d| d.id().clone())
        .collect();
    if ids.is_empty() {
        return Err(DeviceError::Unavailable("no supported spectrometer found".into()).into());
    }

    let wanted = config.device_serial.trim();
    let mut last_error = None;
    for id in ids {
        if let Some(dev) = registry.find_mut(&id) {
            dev.set_byte_order(config.byte_order());
            dev.set_retry_policy(config.retry_policy());
        }
        let dev = match registry.open(&id) {
            Ok(dev) => dev,
            Err(e) => {
                log::warn!("{id:?}: {e}");
                last_error = Some(e);
                continue;
            }
        };
        let serial = dev
            .calibration()
            .map(|c| c.serial_number.trim().to_string())
            .unwrap_or_default();
        if wanted.is_empty() || serial == wanted {
            return Ok(id);
        }
        log::debug!("skipping spectrometer {serial}");
        dev.close()?;
    }

    Err(match last_error {
        Some(e) if wanted.is_empty() => e.into(),
        _ => DeviceError::Unavailable(format!("no spectrometer with serial number {wanted}")).into(),
    })
}

/// The registered device for `id`.
pub(super) fn selected<'a, B: UsbBackend>(
    registry: &'a mut Registry<B>,
    id: &B::Id,
) -> Result<&'a mut usb2000_lib::Spectrometer<B>> {
    registry
        .find_mut(id)
        .ok_or_else(|| DeviceError::Unavailable(format!("{id:?}: not registered")).into())
}
