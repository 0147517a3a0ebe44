//! Command channel: command frames out, fixed-size responses in.
//!
//! A [`Channel`] owns the session and one packet-sized scratch buffer.
//! Responses are returned as slices borrowing that buffer, so a response
//! must be consumed before the next transfer can start.

use std::time::Duration;

use log::trace;

use crate::device::{DeviceError, Result};
use crate::protocol::*;
use crate::transport::UsbSession;

const COMMAND_TIMEOUT: Duration = Duration::from_millis(COMMAND_TIMEOUT_MS);

pub struct Channel<S: UsbSession> {
    session: S,
    buf: [u8; PACKET_SIZE],
}

impl<S: UsbSession> Channel<S> {
    pub fn new(session: S) -> Self {
        Channel {
            session,
            buf: [0; PACKET_SIZE],
        }
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn into_session(self) -> S {
        self.session
    }

    /// Write a command frame. Anything short of the full frame is an I/O error.
    pub fn send(&mut self, command: Command) -> Result<()> {
        let len = command.encode(&mut self.buf);
        trace!("command {:02x?}", &self.buf[..len]);
        let written = self
            .session
            .bulk_write(EP_COMMAND_OUT, &self.buf[..len], COMMAND_TIMEOUT)?;
        if written != len {
            return Err(DeviceError::Io(format!(
                "command 0x{:02x}: wrote {written} of {len} bytes",
                command.opcode()
            )));
        }
        Ok(())
    }

    /// Read a query-info response of up to `len` bytes.
    pub fn recv(&mut self, len: usize) -> Result<&[u8]> {
        self.read(EP_INFO_IN, len, COMMAND_TIMEOUT)
    }

    /// Read one spectral data or sync packet of up to `len` bytes.
    pub fn read_data(&mut self, len: usize, timeout: Duration) -> Result<&[u8]> {
        self.read(EP_SPECTRUM_IN, len, timeout)
    }

    fn read(&mut self, endpoint: u8, len: usize, timeout: Duration) -> Result<&[u8]> {
        let len = len.min(PACKET_SIZE);
        let n = self
            .session
            .bulk_read(endpoint, &mut self.buf[..len], timeout)?;
        Ok(&self.buf[..n.min(len)])
    }
}
