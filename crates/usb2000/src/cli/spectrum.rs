//! `spectrum` subcommand: acquire one spectrum and print it against wavelength.

use std::io::{BufWriter, Write};

use usb2000_lib::protocol::{SPECTRUM_PACKETS, SYNC_MARKER};

use super::{
    Completeness, Config, NusbBackend, Registry, Result, SpectrumOutput, open_selected,
    print_json, selected,
};

fn describe(completeness: Completeness) -> String {
    match completeness {
        Completeness::Complete => "complete".to_string(),
        Completeness::Truncated { packets } => {
            format!("device sent only {packets} of {SPECTRUM_PACKETS} packets")
        }
        Completeness::MissingSync {
            received: Some(byte),
        } => format!("sync byte 0x{byte:02x} instead of 0x{SYNC_MARKER:02x}"),
        Completeness::MissingSync { received: None } => "no sync packet".to_string(),
    }
}

pub(super) fn cmd_spectrum(config: &Config, raw: bool, json: bool) -> Result<()> {
    let mut registry = Registry::new(NusbBackend::new());
    let id = open_selected(&mut registry, config)?;
    let dev = selected(&mut registry, &id)?;

    dev.set_integration_time(config.integration_time_ms)?;
    dev.set_trigger_mode(config.trigger()?)?;
    let wavelengths = dev.wavelength_table()?;

    let (values, completeness, units) = if raw {
        if config.linearity_correction {
            log::warn!("linearity correction applies to normalised output only (ignored)");
        }
        let spectrum = dev.acquire_raw()?;
        let counts: Vec<f64> = spectrum.samples.iter().map(|&s| f64::from(s)).collect();
        (counts, spectrum.completeness, "counts")
    } else {
        let table = if config.linearity_correction {
            Some(dev.linearity_correction_table()?)
        } else {
            None
        };
        let spectrum = dev.spectrum(table.as_deref())?;
        (spectrum.values, spectrum.completeness, "normalized")
    };

    if !completeness.is_complete() {
        log::warn!("spectrum incomplete: {}", describe(completeness));
    }

    if json {
        let serial_number = dev
            .calibration()
            .map(|c| c.serial_number.clone())
            .unwrap_or_default();
        return print_json(&SpectrumOutput {
            serial_number,
            integration_time_ms: config.integration_time_ms,
            units,
            completeness,
            wavelengths,
            values,
        });
    }

    let mut out = BufWriter::new(std::io::stdout().lock());
    for (wavelength, value) in wavelengths.iter().zip(&values) {
        if raw {
            writeln!(out, "{wavelength:.3} {value}")?;
        } else {
            writeln!(out, "{wavelength:.3} {value:.6}")?;
        }
    }
    out.flush()?;
    Ok(())
}
