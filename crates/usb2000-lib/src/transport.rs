//! USB transport: the narrow set of USB operations the driver needs.
//!
//! [`UsbBackend`] enumerates attached devices and opens sessions;
//! [`UsbSession`] is one open handle. Dropping a session closes it.
//!
//! A bulk read that times out returns `Ok(0)`: the protocol treats a
//! timeout as a zero-length read, not as a distinct failure.

use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use serde::Serialize;

use crate::device::Result;
use crate::models::Model;

pub use nusb_backend::{NusbBackend, NusbSession};

/// One attached USB device as seen during enumeration.
#[derive(Debug, Clone, Serialize)]
pub struct UsbDeviceInfo<Id> {
    /// Backend-specific stable identity.
    #[serde(skip)]
    pub id: Id,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Bus location, e.g. `"usb:1/004"`.
    pub location: String,
    /// Serial number string descriptor, if the device reports one.
    pub serial: Option<String>,
}

impl<Id> UsbDeviceInfo<Id> {
    /// Recognised model for this device's ids.
    pub fn model(&self) -> Option<Model> {
        Model::from_ids(self.vendor_id, self.product_id)
    }
}

/// Source of USB devices.
pub trait UsbBackend {
    /// Stable identity of an attached device.
    type Id: Clone + Eq + Hash + fmt::Debug;
    type Session: UsbSession;

    /// List every attached USB device.
    fn enumerate(&self) -> Result<Vec<UsbDeviceInfo<Self::Id>>>;

    /// Open a session on a device. Fails with `Unavailable` if the device is
    /// gone or cannot be opened.
    fn open_session(&self, id: &Self::Id) -> Result<Self::Session>;
}

/// An open USB handle.
pub trait UsbSession {
    /// Whether the device has an active configuration.
    fn has_configuration(&self) -> bool;

    fn claim_interface(&mut self, interface: u8) -> Result<()>;

    /// Release a claimed interface. Releasing an unclaimed interface is a no-op.
    fn release_interface(&mut self, interface: u8);

    /// Write `data` to an OUT endpoint, returning the bytes transferred.
    fn bulk_write(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Read up to `buf.len()` bytes from an IN endpoint, returning the bytes
    /// received. A timeout returns `Ok(0)`.
    fn bulk_read(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Clear a halt condition and reset the endpoint's data toggle. Best effort.
    fn reset_endpoint(&mut self, endpoint: u8);

    /// Issue a USB port reset. The device may re-enumerate afterwards.
    fn reset(&mut self) -> Result<()>;
}

// ── nusb backend ──

mod nusb_backend {
    use std::collections::HashMap;
    use std::collections::hash_map::Entry;
    use std::time::Duration;

    use log::{debug, trace, warn};
    use nusb::MaybeFuture;
    use nusb::transfer::{Buffer, Bulk, Completion, In, Out, TransferError};

    use super::{UsbBackend, UsbDeviceInfo, UsbSession};
    use crate::device::{DeviceError, Result};

    /// Time allowed for a cancelled transfer to be handed back.
    const CANCEL_REAP_TIMEOUT: Duration = Duration::from_millis(100);

    /// Backend over the host's USB stack.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NusbBackend;

    impl NusbBackend {
        pub fn new() -> Self {
            NusbBackend
        }
    }

    impl UsbBackend for NusbBackend {
        type Id = nusb::DeviceId;
        type Session = NusbSession;

        fn enumerate(&self) -> Result<Vec<UsbDeviceInfo<nusb::DeviceId>>> {
            let devices = nusb::list_devices()
                .wait()
                .map_err(|e| DeviceError::Io(format!("USB enumeration: {e}")))?;
            Ok(devices
                .map(|dev| UsbDeviceInfo {
                    id: dev.id(),
                    vendor_id: dev.vendor_id(),
                    product_id: dev.product_id(),
                    location: format!("usb:{}/{:03}", dev.bus_id(), dev.device_address()),
                    serial: dev.serial_number().map(str::to_string),
                })
                .collect())
        }

        fn open_session(&self, id: &nusb::DeviceId) -> Result<NusbSession> {
            let info = nusb::list_devices()
                .wait()
                .map_err(|e| DeviceError::Unavailable(format!("USB enumeration: {e}")))?
                .find(|dev| dev.id() == *id)
                .ok_or_else(|| DeviceError::Unavailable("USB open: device not attached".into()))?;
            let device = info
                .open()
                .wait()
                .map_err(|e| DeviceError::Unavailable(format!("USB open: {e}")))?;
            debug!(
                "opened {:04x}:{:04x} on bus {}",
                info.vendor_id(),
                info.product_id(),
                info.bus_id()
            );
            Ok(NusbSession {
                device,
                interface: None,
                bulk_out: HashMap::new(),
                bulk_in: HashMap::new(),
            })
        }
    }

    /// Open nusb device handle with lazily opened bulk endpoints.
    pub struct NusbSession {
        device: nusb::Device,
        interface: Option<nusb::Interface>,
        bulk_out: HashMap<u8, nusb::Endpoint<Bulk, Out>>,
        bulk_in: HashMap<u8, nusb::Endpoint<Bulk, In>>,
    }

    fn not_claimed() -> DeviceError {
        DeviceError::Io("interface not claimed".into())
    }

    fn transfer_error(endpoint: u8, e: TransferError) -> DeviceError {
        DeviceError::Io(format!("endpoint 0x{endpoint:02x}: {e}"))
    }

    impl NusbSession {
        fn out_endpoint(&mut self, address: u8) -> Result<&mut nusb::Endpoint<Bulk, Out>> {
            match self.bulk_out.entry(address) {
                Entry::Occupied(e) => Ok(e.into_mut()),
                Entry::Vacant(v) => {
                    let interface = self.interface.as_ref().ok_or_else(not_claimed)?;
                    let ep = interface.endpoint::<Bulk, Out>(address).map_err(|e| {
                        DeviceError::Io(format!("endpoint 0x{address:02x}: {e}"))
                    })?;
                    Ok(v.insert(ep))
                }
            }
        }

        fn in_endpoint(&mut self, address: u8) -> Result<&mut nusb::Endpoint<Bulk, In>> {
            match self.bulk_in.entry(address) {
                Entry::Occupied(e) => Ok(e.into_mut()),
                Entry::Vacant(v) => {
                    let interface = self.interface.as_ref().ok_or_else(not_claimed)?;
                    let ep = interface.endpoint::<Bulk, In>(address).map_err(|e| {
                        DeviceError::Io(format!("endpoint 0x{address:02x}: {e}"))
                    })?;
                    Ok(v.insert(ep))
                }
            }
        }
    }

    /// Wait for the submitted transfer, cancelling it on timeout.
    fn complete_out(ep: &mut nusb::Endpoint<Bulk, Out>, timeout: Duration) -> Option<Completion> {
        if let Some(c) = ep.wait_next_complete(timeout) {
            return Some(c);
        }
        ep.cancel_all();
        // Reap the cancelled transfer so it is not returned by the next wait.
        let _ = ep.wait_next_complete(CANCEL_REAP_TIMEOUT);
        None
    }

    fn complete_in(ep: &mut nusb::Endpoint<Bulk, In>, timeout: Duration) -> Option<Completion> {
        if let Some(c) = ep.wait_next_complete(timeout) {
            return Some(c);
        }
        ep.cancel_all();
        let _ = ep.wait_next_complete(CANCEL_REAP_TIMEOUT);
        None
    }

    impl UsbSession for NusbSession {
        fn has_configuration(&self) -> bool {
            self.device.active_configuration().is_ok()
        }

        fn claim_interface(&mut self, interface: u8) -> Result<()> {
            let claimed = self
                .device
                .claim_interface(interface)
                .wait()
                .map_err(|e| DeviceError::Io(e.to_string()))?;
            self.interface = Some(claimed);
            Ok(())
        }

        fn release_interface(&mut self, _interface: u8) {
            // Endpoints hold a reference to the interface; drop them first.
            self.bulk_out.clear();
            self.bulk_in.clear();
            self.interface = None;
        }

        fn bulk_write(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
            trace!("OUT 0x{endpoint:02x}: {data:02x?}");
            let ep = self.out_endpoint(endpoint)?;
            ep.submit(Buffer::from(data.to_vec()));
            match complete_out(ep, timeout) {
                Some(c) => {
                    c.status.map_err(|e| transfer_error(endpoint, e))?;
                    Ok(c.actual_len)
                }
                None => Ok(0),
            }
        }

        fn bulk_read(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
            let ep = self.in_endpoint(endpoint)?;
            // IN requests must be whole packets; short packets end the transfer.
            let mps = ep.max_packet_size().max(1);
            let request = buf.len().div_ceil(mps).max(1) * mps;
            let mut buffer = Buffer::new(request);
            buffer.set_requested_len(request);
            ep.submit(buffer);
            let Some(c) = complete_in(ep, timeout) else {
                return Ok(0);
            };
            match c.status {
                Ok(()) => {}
                Err(TransferError::Cancelled) => return Ok(0),
                Err(e) => return Err(transfer_error(endpoint, e)),
            }
            let data: &[u8] = &c.buffer;
            let n = data.len().min(buf.len());
            if data.len() > buf.len() {
                warn!(
                    "IN 0x{endpoint:02x}: {} bytes received, {} kept",
                    data.len(),
                    buf.len()
                );
            }
            buf[..n].copy_from_slice(&data[..n]);
            trace!("IN 0x{endpoint:02x}: {:02x?}", &buf[..n]);
            Ok(n)
        }

        fn reset_endpoint(&mut self, endpoint: u8) {
            let result = if endpoint & 0x80 != 0 {
                self.in_endpoint(endpoint)
                    .and_then(|ep| ep.clear_halt().wait().map_err(|e| DeviceError::Io(e.to_string())))
            } else {
                self.out_endpoint(endpoint)
                    .and_then(|ep| ep.clear_halt().wait().map_err(|e| DeviceError::Io(e.to_string())))
            };
            if let Err(e) = result {
                debug!("reset endpoint 0x{endpoint:02x}: {e}");
            }
        }

        fn reset(&mut self) -> Result<()> {
            self.release_interface(0);
            self.device
                .reset()
                .wait()
                .map_err(|e| DeviceError::Io(e.to_string()))
        }
    }
}

// ── Mock backend ──

/// In-memory backend for tests: scripted reads per endpoint, recorded
/// session activity, and failure injection.
#[doc(hidden)]
pub mod mock {
    use std::cell::{Cell, RefCell};
    use std::collections::{HashMap, VecDeque};
    use std::rc::Rc;
    use std::time::Duration;

    use super::{UsbBackend, UsbDeviceInfo, UsbSession};
    use crate::device::{DeviceError, Result};
    use crate::models::{PRODUCT_ID_USB2000_EEPROM, VENDOR_ID};
    use crate::protocol::*;

    /// Session activity, in order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum MockEvent {
        Open,
        Claim(u8),
        Release(u8),
        Write(u8, Vec<u8>),
        ResetEndpoint(u8),
        Reset,
        Close,
    }

    /// One scripted result of `bulk_read`.
    #[derive(Debug, Clone)]
    pub enum MockRead {
        Data(Vec<u8>),
        Timeout,
        Error(String),
    }

    #[derive(Debug, Default)]
    struct MockState {
        events: Vec<MockEvent>,
        reads: HashMap<u8, VecDeque<MockRead>>,
        timeouts: Vec<(u8, Duration)>,
        fail_open: bool,
        no_configuration: bool,
        fail_claim: bool,
        fail_reset: bool,
        failing_opcodes: Vec<u8>,
    }

    // ── Calibration fixture ──

    pub const SERIAL: &str = "USB2+H01234";
    pub const WAVELENGTH: [&str; 4] = ["339.1024", "0.3789256", "-1.54e-05", "-2.59e-09"];
    pub const WAVELENGTH_VALUES: [f64; 4] = [339.1024, 0.3789256, -1.54e-05, -2.59e-09];
    pub const STRAY_LIGHT: &str = "0.05";
    pub const NONLINEARITY: [&str; 8] = [
        "0.9371", "2.1e-05", "-3.2e-09", "1.1e-13", "0", "0", "0", "0",
    ];
    pub const NONLINEARITY_VALUES: [f64; 8] = [0.9371, 2.1e-05, -3.2e-09, 1.1e-13, 0.0, 0.0, 0.0, 0.0];
    pub const NONLINEARITY_ORDER: &str = "4";
    pub const OPTICAL_BENCH: &str = "600 002  00008";
    pub const CONFIGURATION: [u8; 5] = [b'1', b'2', b'3', b' ', b'7'];

    /// A 17-byte query-info response carrying `payload`, NUL-padded.
    pub fn info_frame(index: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; QUERY_SIZE];
        frame[0] = CMD_QUERY_INFO;
        frame[1] = index;
        let n = payload.len().min(QUERY_PAYLOAD_SIZE);
        frame[QUERY_HEADER_SIZE..QUERY_HEADER_SIZE + n].copy_from_slice(&payload[..n]);
        frame
    }

    /// Responses for all 17 query-info indices, in order.
    pub fn calibration_frames() -> Vec<Vec<u8>> {
        let mut frames = Vec::with_capacity(INFO_COUNT as usize);
        frames.push(info_frame(INFO_SERIAL, SERIAL.as_bytes()));
        for (i, c) in WAVELENGTH.iter().enumerate() {
            frames.push(info_frame(INFO_WAVELENGTH_COEFF_0 + i as u8, c.as_bytes()));
        }
        frames.push(info_frame(INFO_STRAY_LIGHT, STRAY_LIGHT.as_bytes()));
        for (i, c) in NONLINEARITY.iter().enumerate() {
            frames.push(info_frame(INFO_NONLINEAR_COEFF_0 + i as u8, c.as_bytes()));
        }
        frames.push(info_frame(INFO_NONLINEAR_ORDER, NONLINEARITY_ORDER.as_bytes()));
        frames.push(info_frame(INFO_OPTICAL_BENCH, OPTICAL_BENCH.as_bytes()));
        frames.push(info_frame(INFO_CONFIGURATION, &CONFIGURATION));
        frames
    }

    /// Split samples into the 64 interleaved data packets of one spectrum.
    pub fn spectrum_packets(samples: &[u16], order: ByteOrder) -> Vec<Vec<u8>> {
        (0..SPECTRUM_PACKETS)
            .map(|index| {
                let base = (index & !1) * PACKET_SIZE / 2;
                let shift = order.packet_shift(index);
                (0..PACKET_SIZE)
                    .map(|n| {
                        let sample = samples.get(base + n).copied().unwrap_or(0);
                        (sample >> shift) as u8
                    })
                    .collect()
            })
            .collect()
    }

    /// Handle on one mock device; clones share state.
    #[derive(Debug, Clone, Default)]
    pub struct MockDevice {
        id: u32,
        state: Rc<RefCell<MockState>>,
    }

    impl MockDevice {
        pub fn id(&self) -> u32 {
            self.id
        }

        pub fn queue_read(&self, endpoint: u8, read: MockRead) {
            self.state
                .borrow_mut()
                .reads
                .entry(endpoint)
                .or_default()
                .push_back(read);
        }

        pub fn queue_data(&self, endpoint: u8, data: Vec<u8>) {
            self.queue_read(endpoint, MockRead::Data(data));
        }

        /// Queue the 17 calibration responses.
        pub fn queue_calibration(&self) {
            for frame in calibration_frames() {
                self.queue_data(EP_INFO_IN, frame);
            }
        }

        /// Queue a complete acquisition: 64 data packets and the sync byte.
        pub fn queue_spectrum(&self, samples: &[u16], order: ByteOrder) {
            for packet in spectrum_packets(samples, order) {
                self.queue_data(EP_SPECTRUM_IN, packet);
            }
            self.queue_data(EP_SPECTRUM_IN, vec![SYNC_MARKER]);
        }

        /// Script a healthy open: an idle drain followed by calibration.
        pub fn script_open(&self) {
            self.queue_spectrum(&[], ByteOrder::LowFirst);
            self.queue_calibration();
        }

        pub fn pending_reads(&self, endpoint: u8) -> usize {
            self.state
                .borrow()
                .reads
                .get(&endpoint)
                .map_or(0, VecDeque::len)
        }

        pub fn events(&self) -> Vec<MockEvent> {
            self.state.borrow().events.clone()
        }

        /// Payloads written to the command endpoint.
        pub fn writes(&self) -> Vec<Vec<u8>> {
            self.state
                .borrow()
                .events
                .iter()
                .filter_map(|e| match e {
                    MockEvent::Write(_, data) => Some(data.clone()),
                    _ => None,
                })
                .collect()
        }

        /// Timeouts passed to `bulk_read`, per endpoint.
        pub fn read_timeouts(&self) -> Vec<(u8, Duration)> {
            self.state.borrow().timeouts.clone()
        }

        pub fn clear_events(&self) {
            self.state.borrow_mut().events.clear();
        }

        pub fn fail_open(&self) {
            self.state.borrow_mut().fail_open = true;
        }

        pub fn remove_configuration(&self) {
            self.state.borrow_mut().no_configuration = true;
        }

        pub fn fail_claim(&self) {
            self.state.borrow_mut().fail_claim = true;
        }

        pub fn fail_reset(&self) {
            self.state.borrow_mut().fail_reset = true;
        }

        /// Make writes of frames starting with `opcode` transfer zero bytes.
        pub fn fail_writes_with_opcode(&self, opcode: u8) {
            self.state.borrow_mut().failing_opcodes.push(opcode);
        }

        fn record(&self, event: MockEvent) {
            self.state.borrow_mut().events.push(event);
        }
    }

    /// Backend over a shared list of mock devices; clones share the list.
    #[derive(Debug, Clone, Default)]
    pub struct MockBackend {
        devices: Rc<RefCell<Vec<(UsbDeviceInfo<u32>, MockDevice)>>>,
        next_id: Rc<Cell<u32>>,
        fail_enumerate: Rc<Cell<bool>>,
    }

    impl MockBackend {
        pub fn new() -> Self {
            MockBackend::default()
        }

        /// Attach a device with the given ids.
        pub fn attach(&self, vendor_id: u16, product_id: u16) -> MockDevice {
            let id = self.next_id.get() + 1;
            self.next_id.set(id);
            let device = MockDevice {
                id,
                state: Rc::default(),
            };
            let info = UsbDeviceInfo {
                id,
                vendor_id,
                product_id,
                location: format!("usb:1/{id:03}"),
                serial: None,
            };
            self.devices.borrow_mut().push((info, device.clone()));
            device
        }

        /// Attach a USB2000 with calibration EEPROM.
        pub fn attach_default(&self) -> MockDevice {
            self.attach(VENDOR_ID, PRODUCT_ID_USB2000_EEPROM)
        }

        pub fn detach(&self, id: u32) {
            self.devices.borrow_mut().retain(|(info, _)| info.id != id);
        }

        pub fn info(&self, id: u32) -> Option<UsbDeviceInfo<u32>> {
            self.devices
                .borrow()
                .iter()
                .find(|(info, _)| info.id == id)
                .map(|(info, _)| info.clone())
        }

        pub fn set_fail_enumerate(&self, fail: bool) {
            self.fail_enumerate.set(fail);
        }
    }

    impl UsbBackend for MockBackend {
        type Id = u32;
        type Session = MockSession;

        fn enumerate(&self) -> Result<Vec<UsbDeviceInfo<u32>>> {
            if self.fail_enumerate.get() {
                return Err(DeviceError::Io("USB enumeration: mock failure".into()));
            }
            Ok(self
                .devices
                .borrow()
                .iter()
                .map(|(info, _)| info.clone())
                .collect())
        }

        fn open_session(&self, id: &u32) -> Result<MockSession> {
            let device = self
                .devices
                .borrow()
                .iter()
                .find(|(info, _)| info.id == *id)
                .map(|(_, dev)| dev.clone())
                .ok_or_else(|| DeviceError::Unavailable("USB open: device not attached".into()))?;
            if device.state.borrow().fail_open {
                return Err(DeviceError::Unavailable("USB open: mock failure".into()));
            }
            device.record(MockEvent::Open);
            Ok(MockSession {
                device,
                claimed: None,
            })
        }
    }

    /// Open mock session. Records `Close` when dropped.
    #[derive(Debug)]
    pub struct MockSession {
        device: MockDevice,
        claimed: Option<u8>,
    }

    impl UsbSession for MockSession {
        fn has_configuration(&self) -> bool {
            !self.device.state.borrow().no_configuration
        }

        fn claim_interface(&mut self, interface: u8) -> Result<()> {
            if self.device.state.borrow().fail_claim {
                return Err(DeviceError::Io("interface busy".into()));
            }
            self.device.record(MockEvent::Claim(interface));
            self.claimed = Some(interface);
            Ok(())
        }

        fn release_interface(&mut self, interface: u8) {
            if self.claimed.take().is_some() {
                self.device.record(MockEvent::Release(interface));
            }
        }

        fn bulk_write(&mut self, endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize> {
            if self.claimed.is_none() {
                return Err(DeviceError::Io("interface not claimed".into()));
            }
            self.device.record(MockEvent::Write(endpoint, data.to_vec()));
            let failing = data
                .first()
                .is_some_and(|op| self.device.state.borrow().failing_opcodes.contains(op));
            Ok(if failing { 0 } else { data.len() })
        }

        fn bulk_read(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
            if self.claimed.is_none() {
                return Err(DeviceError::Io("interface not claimed".into()));
            }
            let mut state = self.device.state.borrow_mut();
            state.timeouts.push((endpoint, timeout));
            let next = state.reads.get_mut(&endpoint).and_then(VecDeque::pop_front);
            match next {
                Some(MockRead::Data(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Some(MockRead::Timeout) | None => Ok(0),
                Some(MockRead::Error(e)) => Err(DeviceError::Io(e)),
            }
        }

        fn reset_endpoint(&mut self, endpoint: u8) {
            self.device.record(MockEvent::ResetEndpoint(endpoint));
        }

        fn reset(&mut self) -> Result<()> {
            self.claimed = None;
            if self.device.state.borrow().fail_reset {
                return Err(DeviceError::Io("mock reset failure".into()));
            }
            self.device.record(MockEvent::Reset);
            Ok(())
        }
    }

    impl Drop for MockSession {
        fn drop(&mut self) {
            self.device.record(MockEvent::Close);
        }
    }
}
