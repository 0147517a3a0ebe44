//! Integration tests: spectrum acquisition and the derived tables through
//! the mock transport.

use std::time::Duration;

use usb2000_lib::acquisition::Completeness;
use usb2000_lib::device::{DeviceError, Spectrometer};
use usb2000_lib::models::Model;
use usb2000_lib::protocol::*;
use usb2000_lib::transport::mock::{MockBackend, MockDevice, MockRead, spectrum_packets};

/// Helper: an open USB2000 with the mock calibration loaded.
fn open() -> (MockBackend, MockDevice, Spectrometer<MockBackend>) {
    let backend = MockBackend::new();
    let dev = backend.attach_default();
    dev.script_open();
    let mut meter = Spectrometer::new(backend.info(dev.id()).unwrap(), Model::Usb2000Eeprom);
    meter.open(&backend).unwrap();
    (backend, dev, meter)
}

/// A ramp covering the full 12-bit range.
fn ramp() -> Vec<u16> {
    (0..PIXEL_COUNT).map(|i| (i * 2) as u16 & MAX_ADC).collect()
}

// ── Test: complete acquisitions ──

#[test]
fn acquire_reassembles_full_spectrum() {
    let (_backend, dev, mut meter) = open();
    let samples = ramp();
    dev.queue_spectrum(&samples, ByteOrder::LowFirst);

    let raw = meter.acquire_raw().unwrap();
    assert_eq!(raw.completeness, Completeness::Complete);
    assert_eq!(raw.samples, samples);
    assert_eq!(dev.writes().last().unwrap(), &vec![CMD_GET_SPECTRA]);
}

#[test]
fn acquire_honours_high_first_order() {
    let (_backend, dev, mut meter) = open();
    meter.set_byte_order(ByteOrder::HighFirst);
    let samples = ramp();
    dev.queue_spectrum(&samples, ByteOrder::HighFirst);
    assert_eq!(meter.acquire_raw().unwrap().samples, samples);
}

#[test]
fn first_block_interleaving() {
    let (_backend, dev, mut meter) = open();
    dev.queue_data(EP_SPECTRUM_IN, vec![0x01; PACKET_SIZE]);
    dev.queue_data(EP_SPECTRUM_IN, vec![0x02; PACKET_SIZE]);
    for _ in 2..SPECTRUM_PACKETS {
        dev.queue_data(EP_SPECTRUM_IN, vec![0; PACKET_SIZE]);
    }
    dev.queue_data(EP_SPECTRUM_IN, vec![SYNC_MARKER]);

    let raw = meter.acquire_raw().unwrap();
    assert!(raw.samples[..64].iter().all(|&s| s == 0x0201));
    assert!(raw.samples[64..].iter().all(|&s| s == 0));
}

#[test]
fn timeouts_follow_integration_time() {
    let (_backend, dev, mut meter) = open();
    meter.set_integration_time(250).unwrap();
    dev.queue_spectrum(&[], ByteOrder::LowFirst);
    let before = dev.read_timeouts().len();
    meter.acquire_raw().unwrap();

    let timeouts: Vec<Duration> = dev.read_timeouts()[before..].iter().map(|(_, t)| *t).collect();
    assert_eq!(timeouts.len(), SPECTRUM_PACKETS + 1);
    assert!(timeouts[..SPECTRUM_PACKETS]
        .iter()
        .all(|t| *t == Duration::from_millis(750)));
    assert_eq!(timeouts[SPECTRUM_PACKETS], Duration::from_millis(350));
}

// ── Test: incomplete acquisitions ──

#[test]
fn premature_sync_truncates_and_keeps_device_open() {
    let (_backend, dev, mut meter) = open();
    let packets = spectrum_packets(&[0x0FFF; PIXEL_COUNT], ByteOrder::LowFirst);
    for packet in packets.into_iter().take(10) {
        dev.queue_data(EP_SPECTRUM_IN, packet);
    }
    dev.queue_data(EP_SPECTRUM_IN, vec![SYNC_MARKER]);

    let raw = meter.acquire_raw().unwrap();
    assert_eq!(raw.completeness, Completeness::Truncated { packets: 10 });
    assert!(raw.samples[..5 * 64].iter().all(|&s| s == 0x0FFF));
    assert!(raw.samples[5 * 64..].iter().all(|&s| s == 0));
    assert!(meter.is_open());

    dev.queue_spectrum(&ramp(), ByteOrder::LowFirst);
    assert!(meter.acquire_raw().unwrap().completeness.is_complete());
}

#[test]
fn wrong_sync_byte_is_reported() {
    let (_backend, dev, mut meter) = open();
    for packet in spectrum_packets(&[], ByteOrder::LowFirst) {
        dev.queue_data(EP_SPECTRUM_IN, packet);
    }
    dev.queue_data(EP_SPECTRUM_IN, vec![0x42]);
    let raw = meter.acquire_raw().unwrap();
    assert_eq!(
        raw.completeness,
        Completeness::MissingSync {
            received: Some(0x42)
        }
    );
}

#[test]
fn missing_sync_packet_is_reported() {
    let (_backend, dev, mut meter) = open();
    for packet in spectrum_packets(&[], ByteOrder::LowFirst) {
        dev.queue_data(EP_SPECTRUM_IN, packet);
    }
    let raw = meter.acquire_raw().unwrap();
    assert_eq!(raw.completeness, Completeness::MissingSync { received: None });
}

#[test]
fn short_packets_are_retried() {
    let (_backend, dev, mut meter) = open();
    let samples = ramp();
    let packets = spectrum_packets(&samples, ByteOrder::LowFirst);
    for (i, packet) in packets.into_iter().enumerate() {
        if i == 5 {
            dev.queue_data(EP_SPECTRUM_IN, vec![0; 12]);
            dev.queue_read(EP_SPECTRUM_IN, MockRead::Timeout);
        }
        dev.queue_data(EP_SPECTRUM_IN, packet);
    }
    dev.queue_data(EP_SPECTRUM_IN, vec![SYNC_MARKER]);

    let raw = meter.acquire_raw().unwrap();
    assert_eq!(raw.completeness, Completeness::Complete);
    assert_eq!(raw.samples, samples);
}

#[test]
fn packet_retry_bound_is_a_protocol_error() {
    let (_backend, dev, mut meter) = open();
    for _ in 0..17 {
        dev.queue_data(EP_SPECTRUM_IN, vec![0; 3]);
    }
    assert!(matches!(meter.acquire_raw(), Err(DeviceError::Protocol(_))));
    assert!(meter.is_open());
}

#[test]
fn transport_error_is_io_and_keeps_device_open() {
    let (_backend, dev, mut meter) = open();
    dev.queue_data(EP_SPECTRUM_IN, vec![0; PACKET_SIZE]);
    dev.queue_read(EP_SPECTRUM_IN, MockRead::Error("pipe".into()));
    assert!(matches!(meter.acquire_raw(), Err(DeviceError::Io(_))));
    assert!(meter.is_open());
}

#[test]
fn acquire_on_closed_device_is_unavailable() {
    let (_backend, dev, mut meter) = open();
    meter.close().unwrap();
    let writes = dev.writes().len();
    assert!(matches!(
        meter.acquire_raw(),
        Err(DeviceError::Unavailable(_))
    ));
    assert_eq!(dev.writes().len(), writes);
}

// ── Test: normalised spectrum and tables ──

#[test]
fn spectrum_is_normalised() {
    let (_backend, dev, mut meter) = open();
    let mut samples = vec![0u16; PIXEL_COUNT];
    samples[0] = MAX_ADC;
    samples[1] = 2048;
    dev.queue_spectrum(&samples, ByteOrder::LowFirst);
    let spectrum = meter.spectrum(None).unwrap();
    assert_eq!(spectrum.values.len(), PIXEL_COUNT);
    assert_eq!(spectrum.values[0], 1.0);
    assert_eq!(spectrum.values[1], 2048.0 / 4095.0);
    assert_eq!(spectrum.values[2], 0.0);
}

#[test]
fn spectrum_applies_device_correction_table() {
    let (_backend, dev, mut meter) = open();
    let table = meter.linearity_correction_table().unwrap();
    let mut samples = vec![0u16; PIXEL_COUNT];
    samples[7] = 1000;
    dev.queue_spectrum(&samples, ByteOrder::LowFirst);
    let spectrum = meter.spectrum(Some(&table)).unwrap();
    assert_eq!(spectrum.values[7], 1000.0 / 4095.0 * table[1000]);
}

#[test]
fn spectrum_rejects_wrong_table_size_before_io() {
    let (_backend, dev, mut meter) = open();
    let writes = dev.writes().len();
    assert!(matches!(
        meter.spectrum(Some(&[1.0; 16])),
        Err(DeviceError::InvalidArgument(_))
    ));
    assert_eq!(dev.writes().len(), writes);
}

#[test]
fn wavelength_table_from_calibration() {
    let (_backend, _dev, meter) = open();
    let table = meter.wavelength_table().unwrap();
    let c = meter.calibration().unwrap().wavelength;
    assert_eq!(table.len(), PIXEL_COUNT);
    assert_eq!(table[0], c[0]);
    let p = 1024.0_f64;
    let expected = c[0] + c[1] * p + c[2] * p * p + c[3] * p * p * p;
    assert!((table[1024] - expected).abs() < 1e-9);
    // The mock calibration is monotonic over the detector.
    assert!(table.windows(2).all(|w| w[1] > w[0]));
}

#[test]
fn linearity_table_uses_device_order() {
    let (_backend, _dev, meter) = open();
    let cal = meter.calibration().unwrap().clone();
    let table = meter.linearity_correction_table().unwrap();
    assert_eq!(table.len(), ADC_LEVELS);
    assert_eq!(table[0], cal.nonlinearity[0]);
    let a = 2000.0_f64;
    let expected: f64 = (0..cal.nonlinearity_order)
        .map(|j| cal.nonlinearity[j] * a.powi(j as i32))
        .sum();
    assert!((table[2000] - expected).abs() < 1e-9);
}

#[test]
fn tables_survive_close() {
    let (_backend, _dev, mut meter) = open();
    meter.close().unwrap();
    assert!(meter.wavelength_table().is_ok());
}
