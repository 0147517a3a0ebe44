//! Protocol constants for USB2000-family spectrometers.
//!
//! All values follow the vendor's interface draft for the USB2000 command
//! set. Commands go out on one bulk endpoint; query-info responses come back
//! on a second endpoint and spectral data on a third.
//!
//! ## Framing
//!
//! - Commands are 1–3 byte frames: `[opcode, arg...]`.
//! - A query-info response is 17 bytes: 2 framing bytes followed by an
//!   ASCII payload.
//! - A spectrum is 64 data packets of 64 bytes followed by a 1-byte sync
//!   packet carrying [`SYNC_MARKER`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::{DeviceError, Result};

// ── Acquisition format ──

/// ADC resolution in bits.
pub const ADC_BITS: u32 = 12;

/// Largest raw ADC reading (`2^12 - 1`).
pub const MAX_ADC: u16 = (1 << ADC_BITS) - 1;

/// Number of distinct ADC levels; size of the linearity-correction table.
pub const ADC_LEVELS: usize = 1 << ADC_BITS;

/// Pixels per spectrum.
pub const PIXEL_COUNT: usize = 2048;

// ── Transfer sizes ──

/// Size of a spectral data packet.
pub const PACKET_SIZE: usize = 64;

/// Data packets per spectrum (excluding the trailing sync packet).
pub const SPECTRUM_PACKETS: usize = 64;

/// Size of the sync packet.
pub const SYNC_SIZE: usize = 1;

/// Sync marker byte terminating a spectrum transfer.
pub const SYNC_MARKER: u8 = 0x69;

/// Size of a query-info response frame.
pub const QUERY_SIZE: usize = 17;

/// Framing bytes preceding the query-info payload.
pub const QUERY_HEADER_SIZE: usize = 2;

/// Payload bytes of a query-info response.
pub const QUERY_PAYLOAD_SIZE: usize = QUERY_SIZE - QUERY_HEADER_SIZE;

/// Re-reads of a wrong-length query-info response before giving up.
pub const INFO_RETRIES: u32 = 8;

/// Pause between query-info read attempts.
pub const INFO_RETRY_DELAY_MS: u64 = 10;

/// Longest serial number, in characters.
pub const SERIAL_LEN: usize = 17;

// ── Endpoints ──

/// Command endpoint (host → device).
pub const EP_COMMAND_OUT: u8 = 0x02;

/// Query-info response endpoint (device → host).
pub const EP_INFO_IN: u8 = 0x87;

/// Spectral data endpoint (device → host).
pub const EP_SPECTRUM_IN: u8 = 0x82;

/// Interface carrying all three endpoints.
pub const INTERFACE: u8 = 0;

// ── Timeouts ──

/// Timeout for command writes and query-info reads.
pub const COMMAND_TIMEOUT_MS: u64 = 1000;

/// Timeout for each packet drained after INIT. The INIT command does not
/// abort an acquisition already in progress, so this must cover the longest
/// integration time.
pub const DRAIN_TIMEOUT_MS: u64 = 65535;

/// Reads attempted while draining after INIT (64 data packets + sync).
pub const DRAIN_READS: usize = SPECTRUM_PACKETS + 1;

/// Slack added to the integration time for each data packet read.
pub const PACKET_TIMEOUT_SLACK_MS: u64 = 500;

/// Slack added to the integration time for the sync packet read.
pub const SYNC_TIMEOUT_SLACK_MS: u64 = 100;

// ── Opcodes ──

pub const CMD_INIT: u8 = 0x01;
pub const CMD_INTEGRATION_TIME: u8 = 0x02;
pub const CMD_STROBE_ENABLE: u8 = 0x03;
pub const CMD_QUERY_INFO: u8 = 0x05;
pub const CMD_WRITE_INFO: u8 = 0x06;
pub const CMD_WRITE_SERIAL: u8 = 0x07;
pub const CMD_GET_SERIAL: u8 = 0x08;
pub const CMD_GET_SPECTRA: u8 = 0x09;
pub const CMD_TRIGGER_MODE: u8 = 0x0A;

// ── Query-info indices ──

pub const INFO_SERIAL: u8 = 0;
pub const INFO_WAVELENGTH_COEFF_0: u8 = 1;
pub const INFO_STRAY_LIGHT: u8 = 5;
pub const INFO_NONLINEAR_COEFF_0: u8 = 6;
pub const INFO_NONLINEAR_ORDER: u8 = 14;
pub const INFO_OPTICAL_BENCH: u8 = 15;
pub const INFO_CONFIGURATION: u8 = 16;

/// Number of query-info indices read at open.
pub const INFO_COUNT: u8 = 17;

// ── Integration time ──

/// Shortest integration time accepted by the device.
pub const MIN_INTEGRATION_TIME_MS: u32 = 3;

/// Longest integration time accepted by the device.
pub const MAX_INTEGRATION_TIME_MS: u32 = 65535;

/// Integration time assumed after open (the device does not report it).
pub const DEFAULT_INTEGRATION_TIME_MS: u32 = 100;

/// Check an integration time against the device limits.
pub fn validate_integration_time(ms: u32) -> Result<u16> {
    if !(MIN_INTEGRATION_TIME_MS..=MAX_INTEGRATION_TIME_MS).contains(&ms) {
        return Err(DeviceError::InvalidArgument(format!(
            "integration time: {ms} ms outside {MIN_INTEGRATION_TIME_MS}..={MAX_INTEGRATION_TIME_MS}"
        )));
    }
    Ok(ms as u16)
}

// ── Byte order ──

/// Position of the low byte in 16-bit quantities exchanged with the device.
///
/// Applies to spectrum reassembly (which of an even/odd packet pair carries
/// the low byte) and to the integration-time argument bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ByteOrder {
    /// Low byte first: even packets carry the low byte.
    #[default]
    LowFirst,
    /// High byte first: even packets carry the high byte.
    HighFirst,
}

impl ByteOrder {
    /// Split a 16-bit value into its two wire bytes.
    pub fn split(self, value: u16) -> [u8; 2] {
        match self {
            ByteOrder::LowFirst => value.to_le_bytes(),
            ByteOrder::HighFirst => value.to_be_bytes(),
        }
    }

    /// Bit shift applied to the byte carried by a data packet.
    pub fn packet_shift(self, packet_index: usize) -> u32 {
        let odd = packet_index & 1 == 1;
        match (self, odd) {
            (ByteOrder::LowFirst, false) | (ByteOrder::HighFirst, true) => 0,
            (ByteOrder::LowFirst, true) | (ByteOrder::HighFirst, false) => 8,
        }
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteOrder::LowFirst => write!(f, "low-first"),
            ByteOrder::HighFirst => write!(f, "high-first"),
        }
    }
}

// ── Trigger mode ──

/// Acquisition trigger mode. Code 1 is reserved by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Acquire a spectrum on each read request.
    #[default]
    Normal,
    /// Software trigger.
    Software,
    /// External hardware trigger.
    Hardware,
}

impl TriggerMode {
    /// Decode a wire code. Only 0, 2 and 3 are valid.
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(TriggerMode::Normal),
            2 => Ok(TriggerMode::Software),
            3 => Ok(TriggerMode::Hardware),
            _ => Err(DeviceError::InvalidArgument(format!(
                "trigger mode: {code} is not one of 0, 2, 3"
            ))),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            TriggerMode::Normal => 0,
            TriggerMode::Software => 2,
            TriggerMode::Hardware => 3,
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerMode::Normal => write!(f, "normal"),
            TriggerMode::Software => write!(f, "software"),
            TriggerMode::Hardware => write!(f, "hardware"),
        }
    }
}

// ── Commands ──

/// A command frame sent on [`EP_COMMAND_OUT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Reset the device to its power-on state.
    Init,
    /// Set the integration time; carries the 16-bit time in milliseconds.
    SetIntegrationTime { ms: u16, order: ByteOrder },
    /// Read a calibration field by index.
    QueryInfo(u8),
    /// Start a spectrum acquisition.
    GetSpectrum,
    /// Select the trigger mode.
    SetTriggerMode(TriggerMode),
}

impl Command {
    /// Encode into `buf`, returning the frame length (1–3 bytes).
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        match *self {
            Command::Init => {
                buf[0] = CMD_INIT;
                1
            }
            Command::SetIntegrationTime { ms, order } => {
                let [b1, b2] = order.split(ms);
                buf[..3].copy_from_slice(&[CMD_INTEGRATION_TIME, b1, b2]);
                3
            }
            Command::QueryInfo(index) => {
                buf[..2].copy_from_slice(&[CMD_QUERY_INFO, index]);
                2
            }
            Command::GetSpectrum => {
                buf[0] = CMD_GET_SPECTRA;
                1
            }
            Command::SetTriggerMode(mode) => {
                buf[..2].copy_from_slice(&[CMD_TRIGGER_MODE, mode.code()]);
                2
            }
        }
    }

    /// Opcode byte of this command.
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Init => CMD_INIT,
            Command::SetIntegrationTime { .. } => CMD_INTEGRATION_TIME,
            Command::QueryInfo(_) => CMD_QUERY_INFO,
            Command::GetSpectrum => CMD_GET_SPECTRA,
            Command::SetTriggerMode(_) => CMD_TRIGGER_MODE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(cmd: Command) -> Vec<u8> {
        let mut buf = [0u8; 3];
        let n = cmd.encode(&mut buf);
        buf[..n].to_vec()
    }

    #[test]
    fn max_adc_is_twelve_bits() {
        assert_eq!(MAX_ADC, 4095);
        assert_eq!(ADC_LEVELS, 4096);
    }

    #[test]
    fn spectrum_packets_cover_all_pixels() {
        // Each even/odd packet pair carries one byte of 64 samples.
        assert_eq!(SPECTRUM_PACKETS / 2 * PACKET_SIZE, PIXEL_COUNT);
    }

    #[test]
    fn encode_single_byte_commands() {
        assert_eq!(encoded(Command::Init), vec![0x01]);
        assert_eq!(encoded(Command::GetSpectrum), vec![0x09]);
    }

    #[test]
    fn encode_query_info() {
        assert_eq!(encoded(Command::QueryInfo(15)), vec![0x05, 15]);
    }

    #[test]
    fn encode_integration_time_low_first() {
        let cmd = Command::SetIntegrationTime {
            ms: 0x1234,
            order: ByteOrder::LowFirst,
        };
        assert_eq!(encoded(cmd), vec![0x02, 0x34, 0x12]);
    }

    #[test]
    fn encode_integration_time_high_first() {
        let cmd = Command::SetIntegrationTime {
            ms: 0x1234,
            order: ByteOrder::HighFirst,
        };
        assert_eq!(encoded(cmd), vec![0x02, 0x12, 0x34]);
    }

    #[test]
    fn encode_trigger_mode() {
        assert_eq!(
            encoded(Command::SetTriggerMode(TriggerMode::Hardware)),
            vec![0x0A, 3]
        );
    }

    #[test]
    fn opcode_matches_first_encoded_byte() {
        for cmd in [
            Command::Init,
            Command::QueryInfo(3),
            Command::GetSpectrum,
            Command::SetTriggerMode(TriggerMode::Software),
        ] {
            assert_eq!(encoded(cmd)[0], cmd.opcode());
        }
    }

    #[test]
    fn trigger_mode_valid_codes_roundtrip() {
        for code in [0, 2, 3] {
            let mode = TriggerMode::from_code(code).unwrap();
            assert_eq!(i64::from(mode.code()), code);
        }
    }

    #[test]
    fn trigger_mode_rejects_reserved_and_out_of_range() {
        for code in [1, -1, 4, 255] {
            assert!(matches!(
                TriggerMode::from_code(code),
                Err(DeviceError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn integration_time_bounds() {
        assert_eq!(validate_integration_time(3).unwrap(), 3);
        assert_eq!(validate_integration_time(65535).unwrap(), 65535);
        assert!(validate_integration_time(2).is_err());
        assert!(validate_integration_time(65536).is_err());
    }

    #[test]
    fn packet_shift_low_first() {
        assert_eq!(ByteOrder::LowFirst.packet_shift(0), 0);
        assert_eq!(ByteOrder::LowFirst.packet_shift(1), 8);
        assert_eq!(ByteOrder::LowFirst.packet_shift(62), 0);
    }

    #[test]
    fn packet_shift_high_first() {
        assert_eq!(ByteOrder::HighFirst.packet_shift(0), 8);
        assert_eq!(ByteOrder::HighFirst.packet_shift(1), 0);
    }

    #[test]
    fn byte_order_display_matches_serde_name() {
        let json = serde_json::to_string(&ByteOrder::HighFirst).unwrap();
        assert_eq!(json, format!("\"{}\"", ByteOrder::HighFirst));
    }
}
