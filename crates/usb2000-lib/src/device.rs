//! Spectrometer entity: open/close lifecycle and runtime settings.
//!
//! A [`Spectrometer`] wraps one attached device. It starts `Closed`; [`open`]
//! claims the interface, runs the INIT handshake, drains any acquisition left
//! in flight and loads the calibration. Either every step succeeds and the
//! device becomes `Open`, or the interface and session are released and the
//! device stays `Closed`.
//!
//! [`open`]: Spectrometer::open

use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;

use crate::calibration::{self, Calibration};
use crate::codec::Channel;
use crate::models::Model;
use crate::protocol::*;
use crate::transforms;
use crate::transport::{UsbBackend, UsbDeviceInfo, UsbSession};

// ── Error type ──

/// Device communication errors.
///
/// String payloads follow the convention **"context: details"** where *context*
/// identifies the operation or step (e.g. `"INIT"`, `"query info 15"`) and
/// *details* describes what went wrong.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// No session could be obtained, the device has no valid configuration,
    /// or the operation needs an open device.
    Unavailable(String),
    /// A transfer failed or moved fewer bytes than required.
    Io(String),
    /// Received data violates the expected framing or cannot be parsed.
    Protocol(String),
    /// An argument is outside its allowed range; no I/O was attempted.
    InvalidArgument(String),
    /// The operation is not implemented for this device family.
    Unsupported(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Unavailable(e) => write!(f, "Device unavailable: {e}"),
            DeviceError::Io(e) => write!(f, "I/O error: {e}"),
            DeviceError::Protocol(e) => write!(f, "Protocol error: {e}"),
            DeviceError::InvalidArgument(e) => write!(f, "Invalid argument: {e}"),
            DeviceError::Unsupported(e) => write!(f, "Unsupported operation: {e}"),
        }
    }
}

impl std::error::Error for DeviceError {}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Prefix an error's message with the step that produced it.
pub(crate) fn context(step: &str) -> impl FnOnce(DeviceError) -> DeviceError + '_ {
    move |e| match e {
        DeviceError::Unavailable(m) => DeviceError::Unavailable(format!("{step}: {m}")),
        DeviceError::Io(m) => DeviceError::Io(format!("{step}: {m}")),
        DeviceError::Protocol(m) => DeviceError::Protocol(format!("{step}: {m}")),
        DeviceError::InvalidArgument(m) => DeviceError::InvalidArgument(format!("{step}: {m}")),
        DeviceError::Unsupported(m) => DeviceError::Unsupported(format!("{step}: {m}")),
    }
}

// ── Lifecycle ──

/// Connection state of a [`Spectrometer`].
///
/// Between calls a device is only ever `Closed` or `Open`; the other states
/// are passed through inside [`Spectrometer::open`] and
/// [`Spectrometer::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    Closed,
    Opening,
    CalibratingInit,
    CalibratingInfo,
    Open,
    Closing,
}

/// Runtime settings. The device cannot report these, so they are defaulted
/// at open and tracked on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Settings {
    pub integration_time_ms: u32,
    pub strobe_enabled: bool,
    pub trigger_mode: TriggerMode,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            integration_time_ms: DEFAULT_INTEGRATION_TIME_MS,
            strobe_enabled: false,
            trigger_mode: TriggerMode::Normal,
        }
    }
}

/// Tunable bound for the acquisition retry loop.
///
/// The calibration read bound is fixed by the protocol
/// ([`INFO_RETRIES`](crate::protocol::INFO_RETRIES)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra reads of one spectrum packet after a short read.
    pub packet_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { packet_retries: 16 }
    }
}

/// One USB2000-family spectrometer.
pub struct Spectrometer<B: UsbBackend> {
    info: UsbDeviceInfo<B::Id>,
    model: Model,
    state: LinkState,
    channel: Option<Channel<B::Session>>,
    calibration: Option<Calibration>,
    settings: Settings,
    byte_order: ByteOrder,
    retry: RetryPolicy,
}

impl<B: UsbBackend> Spectrometer<B> {
    /// Wrap a discovered device. The device starts `Closed` with no calibration.
    pub fn new(info: UsbDeviceInfo<B::Id>, model: Model) -> Self {
        Spectrometer {
            info,
            model,
            state: LinkState::Closed,
            channel: None,
            calibration: None,
            settings: Settings::default(),
            byte_order: ByteOrder::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn info(&self) -> &UsbDeviceInfo<B::Id> {
        &self.info
    }

    pub fn id(&self) -> &B::Id {
        &self.info.id
    }

    pub fn model(&self) -> Model {
        self.model
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    /// Calibration from the most recent successful open.
    ///
    /// Retained after [`close`](Self::close) until the next successful open
    /// replaces it; `None` if the device was never opened.
    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Byte order used for spectrum reassembly and integration-time frames.
    pub fn set_byte_order(&mut self, order: ByteOrder) {
        self.byte_order = order;
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn set_retry_policy(&mut self, policy: RetryPolicy) {
        self.retry = policy;
    }

    /// Open the device and load its calibration.
    ///
    /// Opening an already open device is a no-op.
    pub fn open(&mut self, backend: &B) -> Result<()> {
        if self.is_open() {
            debug!("{}: already open", self.info.location);
            return Ok(());
        }
        self.state = LinkState::Opening;
        match self.open_link(backend) {
            Ok((channel, calibration)) => {
                self.channel = Some(channel);
                self.calibration = Some(calibration);
                self.settings = Settings::default();
                self.state = LinkState::Open;
                info!("{}: {} open", self.info.location, self.model);
                Ok(())
            }
            Err(e) => {
                self.state = LinkState::Closed;
                Err(e)
            }
        }
    }

    /// Acquire the session and claim the interface, then run the handshake.
    ///
    /// Every failure path releases what was acquired: dropping the session
    /// closes it, and a claimed interface is released before that.
    fn open_link(&mut self, backend: &B) -> Result<(Channel<B::Session>, Calibration)> {
        let mut session = backend
            .open_session(&self.info.id)
            .map_err(|e| match e {
                DeviceError::Unavailable(m) => DeviceError::Unavailable(m),
                other => DeviceError::Unavailable(other.to_string()),
            })?;

        if !session.has_configuration() {
            return Err(DeviceError::Unavailable(
                "USB open: no valid configuration descriptor".into(),
            ));
        }

        session
            .claim_interface(INTERFACE)
            .map_err(context("claim interface 0"))?;

        let mut channel = Channel::new(session);
        match self.handshake(&mut channel) {
            Ok(calibration) => Ok((channel, calibration)),
            Err(e) => {
                warn!("{}: open failed: {e}", self.info.location);
                channel.session_mut().release_interface(INTERFACE);
                Err(e)
            }
        }
    }

    fn handshake(&mut self, channel: &mut Channel<B::Session>) -> Result<Calibration> {
        self.state = LinkState::CalibratingInit;
        debug!("{}: INIT", self.info.location);
        channel.send(Command::Init).map_err(context("INIT"))?;
        drain_after_init(channel)?;

        self.state = LinkState::CalibratingInfo;
        calibration::load(channel)
    }

    /// Close the device: reset both data endpoints, release the interface and
    /// close the session. Closing a closed device is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut channel) = self.channel.take() else {
            return Ok(());
        };
        self.state = LinkState::Closing;
        let session = channel.session_mut();
        for endpoint in [EP_INFO_IN, EP_SPECTRUM_IN] {
            session.reset_endpoint(endpoint);
        }
        session.release_interface(INTERFACE);
        drop(channel);
        self.state = LinkState::Closed;
        debug!("{}: closed", self.info.location);
        Ok(())
    }

    /// Issue a USB port reset and leave the device `Closed`.
    ///
    /// Uses the open session if there is one, otherwise opens a session just
    /// for the reset. The device may re-enumerate afterwards, so callers
    /// should run discovery again before reopening.
    pub fn reset(&mut self, backend: &B) -> Result<()> {
        let mut session = match self.channel.take() {
            Some(channel) => {
                let mut session = channel.into_session();
                session.release_interface(INTERFACE);
                session
            }
            None => backend.open_session(&self.info.id)?,
        };
        self.state = LinkState::Closed;
        info!("{}: resetting", self.info.location);
        session.reset().map_err(context("USB reset"))
    }

    pub(crate) fn channel_mut(&mut self) -> Result<&mut Channel<B::Session>> {
        self.channel
            .as_mut()
            .ok_or_else(|| DeviceError::Unavailable("device is not open".into()))
    }

    fn require_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(DeviceError::Unavailable("device is not open".into()))
        }
    }

    fn require_calibration(&self) -> Result<&Calibration> {
        self.calibration
            .as_ref()
            .ok_or_else(|| DeviceError::Unavailable("no calibration loaded".into()))
    }

    // ── Settings ──

    pub fn integration_time_ms(&self) -> Result<u32> {
        self.require_open()?;
        Ok(self.settings.integration_time_ms)
    }

    /// Set the integration time (3–65535 ms).
    ///
    /// The stored value changes only once the command has been written.
    pub fn set_integration_time(&mut self, ms: u32) -> Result<()> {
        let value = validate_integration_time(ms)?;
        let order = self.byte_order;
        self.channel_mut()?
            .send(Command::SetIntegrationTime { ms: value, order })
            .map_err(context("set integration time"))?;
        self.settings.integration_time_ms = ms;
        debug!("{}: integration time {ms} ms", self.info.location);
        Ok(())
    }

    pub fn trigger_mode(&self) -> Result<TriggerMode> {
        self.require_open()?;
        Ok(self.settings.trigger_mode)
    }

    pub fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<()> {
        self.channel_mut()?
            .send(Command::SetTriggerMode(mode))
            .map_err(context("set trigger mode"))?;
        self.settings.trigger_mode = mode;
        debug!("{}: trigger mode {mode}", self.info.location);
        Ok(())
    }

    /// Set the trigger mode from its wire code (0, 2 or 3).
    pub fn set_trigger_mode_code(&mut self, code: i64) -> Result<()> {
        let mode = TriggerMode::from_code(code)?;
        self.set_trigger_mode(mode)
    }

    pub fn strobe_enabled(&self) -> Result<bool> {
        self.require_open()?;
        Ok(self.settings.strobe_enabled)
    }

    /// Strobe/lamp control is not implemented for this device family.
    pub fn set_strobe_enable(&mut self, _enabled: bool) -> Result<()> {
        Err(DeviceError::Unsupported(
            "strobe enable: not implemented for USB2000-family devices".into(),
        ))
    }

    // ── Calibration-derived tables ──

    /// Wavelength in nanometres for each pixel.
    pub fn wavelength_table(&self) -> Result<Vec<f64>> {
        Ok(transforms::wavelength_table(
            &self.require_calibration()?.wavelength,
        ))
    }

    /// Linearity-correction factor for each ADC level.
    pub fn linearity_correction_table(&self) -> Result<Vec<f64>> {
        let cal = self.require_calibration()?;
        Ok(transforms::linearity_correction_table(
            &cal.nonlinearity,
            cal.nonlinearity_order,
        ))
    }
}

impl<B: UsbBackend> Drop for Spectrometer<B> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("{}: close on drop failed: {e}", self.info.location);
        }
    }
}

/// Absorb an acquisition the device may still be running after INIT.
///
/// Up to 64 data packets and a sync byte can arrive. A sync byte before the
/// last read ends the drain early; any other short read is a framing error.
fn drain_after_init<S: UsbSession>(channel: &mut Channel<S>) -> Result<()> {
    let timeout = Duration::from_millis(DRAIN_TIMEOUT_MS);
    for count in 0..DRAIN_READS {
        let packet = channel.read_data(PACKET_SIZE, timeout)?;
        match packet.len() {
            PACKET_SIZE => debug!("drain: packet {count} ({PACKET_SIZE} bytes)"),
            SYNC_SIZE if packet[0] != SYNC_MARKER => {
                return Err(DeviceError::Protocol(format!(
                    "drain: expected sync 0x{SYNC_MARKER:02X}, got 0x{:02X}",
                    packet[0]
                )));
            }
            SYNC_SIZE => {
                if count != DRAIN_READS - 1 {
                    warn!("drain: premature sync packet after {count} packets");
                    break;
                }
                debug!("drain: sync");
            }
            len => {
                return Err(DeviceError::Protocol(format!(
                    "drain: packet {count} has {len} bytes"
                )));
            }
        }
    }
    Ok(())
}
