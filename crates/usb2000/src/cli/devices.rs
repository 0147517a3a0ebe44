//! `devices` subcommand: list connected spectrometers without opening them.

use super::{DevicesOutput, NusbBackend, Registry, Result, device_json, print_json};

pub(super) fn cmd_devices(json: bool) -> Result<()> {
    let mut registry = Registry::new(NusbBackend::new());
    if let Err(e) = registry.discover() {
        log::warn!("{e}");
    }
    let devices: Vec<_> = registry.devices().iter().map(device_json).collect();

    if json {
        return print_json(&DevicesOutput {
            count: devices.len(),
            devices,
        });
    }

    if devices.is_empty() {
        println!("No supported spectrometers found.");
        return Ok(());
    }

    println!(
        "Found {} spectrometer{}:",
        devices.len(),
        if devices.len() == 1 { "" } else { "s" }
    );
    println!();

    for (i, dev) in devices.iter().enumerate() {
        println!(
            "  [{}] {} at {} ({:04x}:{:04x})",
            i + 1,
            dev.model,
            dev.location,
            dev.vendor_id,
            dev.product_id
        );
        if let Some(ref serial) = dev.usb_serial {
            println!("      Serial: {serial}");
        }
    }

    Ok(())
}
