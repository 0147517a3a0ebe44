//! `info` subcommand: open a spectrometer and report its calibration.

use super::{
    Config, DeviceError, InfoOutput, NusbBackend, Registry, Result, device_json, kv, kv_width,
    open_selected, print_json, selected,
};

pub(super) fn cmd_info(config: &Config, json: bool) -> Result<()> {
    let mut registry = Registry::new(NusbBackend::new());
    let id = open_selected(&mut registry, config)?;
    let dev = selected(&mut registry, &id)?;
    let calibration = dev
        .calibration()
        .cloned()
        .ok_or_else(|| DeviceError::Unavailable("no calibration loaded".into()))?;

    if json {
        return print_json(&InfoOutput {
            device: device_json(dev),
            calibration,
        });
    }

    let w = kv_width(&["Model:", "Location:"], &[]);
    kv("Model:", dev.model(), w);
    kv("Location:", &dev.info().location, w);
    println!();
    println!("{calibration}");

    // Registry drop closes the device.
    Ok(())
}
