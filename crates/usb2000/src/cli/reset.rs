//! `reset` subcommand: USB port reset of a spectrometer.

use super::{Config, DeviceError, NusbBackend, Registry, Result, open_selected};

pub(super) fn cmd_reset(config: &Config) -> Result<()> {
    let mut registry = Registry::new(NusbBackend::new());

    // Without a serial number there is no need to open the device first.
    let id = if config.device_serial.trim().is_empty() {
        registry
            .discover()?
            .first()
            .map(|d| d.id().clone())
            .ok_or_else(|| DeviceError::Unavailable("no supported spectrometer found".into()))?
    } else {
        open_selected(&mut registry, config)?
    };

    registry.reset(&id)?;
    println!("Spectrometer reset; it will re-enumerate shortly.");
    Ok(())
}
