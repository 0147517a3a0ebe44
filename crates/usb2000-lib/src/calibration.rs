//! Calibration data stored in the spectrometer's EEPROM.
//!
//! Read at open through 17 query-info exchanges. Each response payload is
//! ASCII text (NUL-terminated) except the device configuration, whose four
//! fields are raw bytes.

use std::fmt;
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;

use crate::codec::Channel;
use crate::device::{DeviceError, Result, context};
use crate::protocol::*;
use crate::transforms;
use crate::transport::UsbSession;

/// Most nonlinearity coefficients a device stores.
pub const MAX_NONLINEARITY_ORDER: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OpticalBench {
    pub grating: i64,
    pub filter: i64,
    pub slit: i64,
}

/// Raw device configuration bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceConfiguration {
    pub coating: u8,
    pub wavelength_range: u8,
    pub lens: u8,
    pub firmware_version: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Calibration {
    pub serial_number: String,
    /// Cubic pixel → wavelength polynomial, constant term first.
    pub wavelength: [f64; 4],
    pub stray_light: f64,
    /// Linearity-correction polynomial, constant term first.
    pub nonlinearity: [f64; MAX_NONLINEARITY_ORDER],
    /// Number of `nonlinearity` terms in use (0–8).
    pub nonlinearity_order: usize,
    pub optical_bench: OpticalBench,
    pub configuration: DeviceConfiguration,
}

impl Calibration {
    /// Store one query-info payload in the field its index names.
    pub fn apply(&mut self, index: u8, payload: &[u8]) -> Result<()> {
        match index {
            INFO_SERIAL => self.serial_number = parse_serial(payload),
            i @ INFO_WAVELENGTH_COEFF_0..INFO_STRAY_LIGHT => {
                self.wavelength[usize::from(i - INFO_WAVELENGTH_COEFF_0)] = parse_float(payload)?;
            }
            INFO_STRAY_LIGHT => self.stray_light = parse_float(payload)?,
            i @ INFO_NONLINEAR_COEFF_0..INFO_NONLINEAR_ORDER => {
                self.nonlinearity[usize::from(i - INFO_NONLINEAR_COEFF_0)] = parse_float(payload)?;
            }
            INFO_NONLINEAR_ORDER => self.nonlinearity_order = parse_order(payload)?,
            INFO_OPTICAL_BENCH => self.optical_bench = parse_optical_bench(payload)?,
            INFO_CONFIGURATION => self.configuration = parse_configuration(payload),
            other => {
                return Err(DeviceError::InvalidArgument(format!(
                    "query info index {other} out of range"
                )));
            }
        }
        Ok(())
    }

    /// Nonlinearity coefficients in use.
    pub fn active_nonlinearity(&self) -> &[f64] {
        &self.nonlinearity[..self.nonlinearity_order.min(MAX_NONLINEARITY_ORDER)]
    }

    pub fn wavelength_table(&self) -> Vec<f64> {
        transforms::wavelength_table(&self.wavelength)
    }

    pub fn linearity_correction_table(&self) -> Vec<f64> {
        transforms::linearity_correction_table(&self.nonlinearity, self.nonlinearity_order)
    }

    /// Human-readable calibration summary.
    pub fn report(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Calibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Serial number: {}", self.serial_number)?;
        writeln!(f, "Wavelength coefficients:")?;
        for (i, c) in self.wavelength.iter().enumerate() {
            writeln!(f, "    [{i}] {c:e}")?;
        }
        writeln!(f, "Linearity correction coefficients:")?;
        for (i, c) in self.active_nonlinearity().iter().enumerate() {
            writeln!(f, "    [{i}] {c:e}")?;
        }
        writeln!(f, "Stray light: {}", self.stray_light)?;
        let bench = &self.optical_bench;
        writeln!(
            f,
            "Optical bench: grating {}, filter {}, slit {}",
            bench.grating, bench.filter, bench.slit
        )?;
        let config = &self.configuration;
        write!(
            f,
            "Configuration: coating 0x{:02x}, wavelength 0x{:02x}, lens 0x{:02x}, firmware 0x{:02x}",
            config.coating, config.wavelength_range, config.lens, config.firmware_version
        )
    }
}

// ── Loader ──

/// Query every calibration index in order.
pub fn load<S: UsbSession>(channel: &mut Channel<S>) -> Result<Calibration> {
    let mut calibration = Calibration::default();
    for index in 0..INFO_COUNT {
        let step = format!("query info {index}");
        let payload = query_info(channel, index).map_err(context(&step))?;
        debug!(
            "{step}: {:?}",
            String::from_utf8_lossy(text(&payload))
        );
        calibration.apply(index, &payload).map_err(context(&step))?;
    }
    Ok(calibration)
}

/// Send one query and read its 17-byte response, returning the payload.
///
/// A wrong-length response is read again (without resending the query) up
/// to [`INFO_RETRIES`] times, pausing between attempts.
fn query_info<S: UsbSession>(channel: &mut Channel<S>, index: u8) -> Result<[u8; QUERY_PAYLOAD_SIZE]> {
    channel.send(Command::QueryInfo(index))?;
    let mut retries = 0;
    loop {
        let frame = channel.recv(QUERY_SIZE)?;
        if frame.len() == QUERY_SIZE {
            let mut payload = [0u8; QUERY_PAYLOAD_SIZE];
            payload.copy_from_slice(&frame[QUERY_HEADER_SIZE..]);
            return Ok(payload);
        }
        let received = frame.len();
        if retries >= INFO_RETRIES {
            return Err(DeviceError::Protocol(format!(
                "received {received} of {QUERY_SIZE} bytes after {retries} retries"
            )));
        }
        retries += 1;
        warn!("query info {index}: received {received} of {QUERY_SIZE} bytes, retrying");
        thread::sleep(Duration::from_millis(INFO_RETRY_DELAY_MS));
    }
}

// ── Field parsers ──

/// Payload text up to the first NUL.
fn text(payload: &[u8]) -> &[u8] {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    &payload[..end]
}

fn skip_whitespace(s: &[u8]) -> &[u8] {
    let start = s
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(s.len());
    &s[start..]
}

/// Length of the decimal number (sign, digits, fraction, exponent) at the
/// start of `s`, or `None` if no digit is present.
fn float_prefix_len(s: &[u8]) -> Option<usize> {
    let digits = |from: usize| s[from..].iter().take_while(|b| b.is_ascii_digit()).count();
    let mut i = 0;
    if matches!(s.first(), Some(b'+' | b'-')) {
        i += 1;
    }
    let int_digits = digits(i);
    i += int_digits;
    let mut frac_digits = 0;
    if s.get(i) == Some(&b'.') {
        frac_digits = digits(i + 1);
        if int_digits + frac_digits > 0 {
            i += 1 + frac_digits;
        }
    }
    if int_digits + frac_digits == 0 {
        return None;
    }
    if matches!(s.get(i), Some(b'e' | b'E')) {
        let mut j = i + 1;
        if matches!(s.get(j), Some(b'+' | b'-')) {
            j += 1;
        }
        let exp_digits = digits(j);
        if exp_digits > 0 {
            i = j + exp_digits;
        }
    }
    Some(i)
}

fn invalid_text(kind: &str, payload: &[u8]) -> DeviceError {
    DeviceError::Protocol(format!(
        "expected {kind}, got {:?}",
        String::from_utf8_lossy(text(payload))
    ))
}

/// Serial number text, truncated to [`SERIAL_LEN`] characters.
pub fn parse_serial(payload: &[u8]) -> String {
    String::from_utf8_lossy(text(payload))
        .chars()
        .take(SERIAL_LEN)
        .collect()
}

/// Leading decimal floating-point number; trailing text is ignored.
pub fn parse_float(payload: &[u8]) -> Result<f64> {
    let s = skip_whitespace(text(payload));
    let len = float_prefix_len(s).ok_or_else(|| invalid_text("a number", payload))?;
    std::str::from_utf8(&s[..len])
        .ok()
        .and_then(|n| n.parse::<f64>().ok())
        .ok_or_else(|| invalid_text("a number", payload))
}

/// Leading base-10 integer; trailing text is ignored.
pub fn parse_int(payload: &[u8]) -> Result<i64> {
    let s = skip_whitespace(text(payload));
    let sign = usize::from(matches!(s.first(), Some(b'+' | b'-')));
    let digits = s[sign..].iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return Err(invalid_text("an integer", payload));
    }
    std::str::from_utf8(&s[..sign + digits])
        .ok()
        .and_then(|n| n.parse::<i64>().ok())
        .ok_or_else(|| invalid_text("an integer", payload))
}

/// Nonlinearity order: a decimal number truncated to an integer in 0..=8.
pub fn parse_order(payload: &[u8]) -> Result<usize> {
    let value = parse_float(payload)?.trunc();
    if !(0.0..=MAX_NONLINEARITY_ORDER as f64).contains(&value) {
        return Err(DeviceError::Protocol(format!(
            "nonlinearity order {value} outside 0..={MAX_NONLINEARITY_ORDER}"
        )));
    }
    Ok(value as usize)
}

/// Grating at offset 0, filter at offset 3, slit after any `'0'` characters
/// found from offset 7 (up to offset 14). Once zeros were skipped, a slit
/// field with no digits left reads as 0.
pub fn parse_optical_bench(payload: &[u8]) -> Result<OpticalBench> {
    let field = |offset: usize| payload.get(offset..).unwrap_or_default();
    let grating = parse_int(field(0))?;
    let filter = parse_int(field(3))?;
    let mut slit_start = 7;
    while slit_start < 14 && payload.get(slit_start) == Some(&b'0') {
        slit_start += 1;
    }
    let slit_field = field(slit_start);
    let slit = if slit_start > 7 {
        parse_int(slit_field).unwrap_or(0)
    } else {
        parse_int(slit_field)?
    };
    Ok(OpticalBench {
        grating,
        filter,
        slit,
    })
}

/// Raw configuration bytes at payload positions 0, 1, 2 and 4.
pub fn parse_configuration(payload: &[u8]) -> DeviceConfiguration {
    let byte = |i: usize| payload.get(i).copied().unwrap_or(0);
    DeviceConfiguration {
        coating: byte(0),
        wavelength_range: byte(1),
        lens: byte(2),
        firmware_version: byte(4),
    }
}
