//! Spectrum acquisition: GET_SPECTRA, 64 data packets, one sync packet.
//!
//! Packets come in even/odd pairs covering 64 pixels: one packet of the
//! pair carries the low byte of each sample and the other the high byte.
//! Which one is which depends on the configured [`ByteOrder`].

use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;

use crate::device::{DeviceError, Result, Spectrometer, context};
use crate::protocol::*;
use crate::transforms;
use crate::transport::UsbBackend;

/// How much of an acquisition arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Completeness {
    /// All 64 packets and the sync byte.
    Complete,
    /// The device sent the sync byte after only `packets` data packets;
    /// the remaining samples are zero.
    Truncated { packets: usize },
    /// All data packets arrived but the trailing sync packet was missing or
    /// wrong. `received` is the byte read in its place, if any.
    MissingSync { received: Option<u8> },
}

impl Completeness {
    pub fn is_complete(self) -> bool {
        self == Completeness::Complete
    }
}

/// Raw 12-bit samples of one acquisition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawSpectrum {
    pub samples: Vec<u16>,
    pub completeness: Completeness,
}

/// Samples scaled to 0.0–1.0 of full ADC range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Spectrum {
    pub values: Vec<f64>,
    pub completeness: Completeness,
}

/// OR one data packet into its byte lane of `samples`.
///
/// Packet `index` fills pixels `(index / 2) * 64 ..` with the byte shifted
/// into the position `order` assigns to even or odd packets.
pub fn reassemble_packet(samples: &mut [u16], index: usize, packet: &[u8], order: ByteOrder) {
    let base = (index & !1) * PACKET_SIZE / 2;
    let shift = order.packet_shift(index);
    let Some(block) = samples.get_mut(base..) else {
        return;
    };
    for (sample, &byte) in block.iter_mut().zip(packet) {
        *sample |= u16::from(byte) << shift;
    }
}

impl<B: UsbBackend> Spectrometer<B> {
    /// Acquire one raw spectrum.
    ///
    /// A short packet is read again up to the packet retry bound; a sync byte
    /// in place of a data packet ends the acquisition early. Both cases keep
    /// the device open.
    pub fn acquire_raw(&mut self) -> Result<RawSpectrum> {
        let itime = u64::from(self.settings().integration_time_ms);
        let order = self.byte_order();
        let retries = self.retry_policy().packet_retries;
        let channel = self.channel_mut()?;

        channel
            .send(Command::GetSpectrum)
            .map_err(context("get spectrum"))?;

        let packet_timeout = Duration::from_millis(itime + PACKET_TIMEOUT_SLACK_MS);
        let mut samples = vec![0u16; PIXEL_COUNT];
        for index in 0..SPECTRUM_PACKETS {
            let mut failures = 0;
            loop {
                let packet = channel
                    .read_data(PACKET_SIZE, packet_timeout)
                    .map_err(context("spectrum"))?;
                if packet.len() == PACKET_SIZE {
                    reassemble_packet(&mut samples, index, packet, order);
                    break;
                }
                if packet.len() == SYNC_SIZE && packet[0] == SYNC_MARKER {
                    warn!("spectrum: premature sync after {index} packets");
                    return Ok(RawSpectrum {
                        samples,
                        completeness: Completeness::Truncated { packets: index },
                    });
                }
                let len = packet.len();
                if failures >= retries {
                    return Err(DeviceError::Protocol(format!(
                        "spectrum: packet {index} still {len} bytes after {retries} retries"
                    )));
                }
                failures += 1;
                warn!("spectrum: packet {index} has {len} bytes, retrying");
            }
        }

        let sync_timeout = Duration::from_millis(itime + SYNC_TIMEOUT_SLACK_MS);
        let sync = channel
            .read_data(SYNC_SIZE, sync_timeout)
            .map_err(context("spectrum sync"))?;
        let completeness = match sync {
            [SYNC_MARKER] => Completeness::Complete,
            [byte, ..] => Completeness::MissingSync {
                received: Some(*byte),
            },
            [] => Completeness::MissingSync { received: None },
        };
        if completeness.is_complete() {
            debug!("spectrum: {SPECTRUM_PACKETS} packets + sync");
        } else {
            warn!("spectrum: sync packet missing ({completeness:?})");
        }
        Ok(RawSpectrum {
            samples,
            completeness,
        })
    }

    /// Acquire one spectrum normalised to full ADC range.
    ///
    /// `correction` is a linearity-correction table with one factor per ADC
    /// level; each sample is multiplied by the factor for its raw level.
    pub fn spectrum(&mut self, correction: Option<&[f64]>) -> Result<Spectrum> {
        if let Some(table) = correction {
            if table.len() != ADC_LEVELS {
                return Err(DeviceError::InvalidArgument(format!(
                    "linearity correction table: {} entries, expected {ADC_LEVELS}",
                    table.len()
                )));
            }
        }
        let raw = self.acquire_raw()?;
        Ok(Spectrum {
            values: transforms::normalize(&raw.samples, correction),
            completeness: raw.completeness,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_first_pair_builds_samples() {
        let mut samples = vec![0u16; PIXEL_COUNT];
        reassemble_packet(&mut samples, 0, &[0x01; PACKET_SIZE], ByteOrder::LowFirst);
        reassemble_packet(&mut samples, 1, &[0x02; PACKET_SIZE], ByteOrder::LowFirst);
        assert!(samples[..64].iter().all(|&s| s == 0x0201));
        assert!(samples[64..].iter().all(|&s| s == 0));
    }

    #[test]
    fn high_first_pair_swaps_lanes() {
        let mut samples = vec![0u16; PIXEL_COUNT];
        reassemble_packet(&mut samples, 0, &[0x01; PACKET_SIZE], ByteOrder::HighFirst);
        reassemble_packet(&mut samples, 1, &[0x02; PACKET_SIZE], ByteOrder::HighFirst);
        assert!(samples[..64].iter().all(|&s| s == 0x0102));
    }

    #[test]
    fn packet_pairs_fill_consecutive_blocks() {
        let mut samples = vec![0u16; PIXEL_COUNT];
        reassemble_packet(&mut samples, 2, &[0xAA; PACKET_SIZE], ByteOrder::LowFirst);
        reassemble_packet(&mut samples, 63, &[0x0F; PACKET_SIZE], ByteOrder::LowFirst);
        assert!(samples[64..128].iter().all(|&s| s == 0x00AA));
        assert!(samples[PIXEL_COUNT - 64..].iter().all(|&s| s == 0x0F00));
        assert!(samples[..64].iter().all(|&s| s == 0));
    }

    #[test]
    fn completeness_serializes_with_status_tag() {
        let json = serde_json::to_value(Completeness::Truncated { packets: 12 }).unwrap();
        assert_eq!(json["status"], "truncated");
        assert_eq!(json["packets"], 12);
    }
}
