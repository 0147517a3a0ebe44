//! Unified error type for the usb2000-lib crate.
//!
//! [`Usb2000Error`] wraps [`DeviceError`] and the file and format errors of
//! configuration handling. `From` impls allow `?` to propagate across module
//! boundaries.

use std::fmt;

use crate::device::DeviceError;

/// Unified error type for usb2000-lib operations.
#[derive(Debug)]
pub enum Usb2000Error {
    /// Device communication error (open, calibration, acquisition).
    Device(DeviceError),
    /// Standard I/O error (file read/write, config persistence).
    Io(std::io::Error),
    /// Configuration parse or validation error.
    Config(String),
    /// Serialization error (JSON or TOML output).
    Serialization(String),
}

impl fmt::Display for Usb2000Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Usb2000Error::Device(e) => write!(f, "{e}"),
            Usb2000Error::Io(e) => write!(f, "I/O error: {e}"),
            Usb2000Error::Config(e) => write!(f, "Config error: {e}"),
            Usb2000Error::Serialization(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for Usb2000Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Usb2000Error::Device(e) => Some(e),
            Usb2000Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DeviceError> for Usb2000Error {
    fn from(e: DeviceError) -> Self {
        Usb2000Error::Device(e)
    }
}

impl From<std::io::Error> for Usb2000Error {
    fn from(e: std::io::Error) -> Self {
        Usb2000Error::Io(e)
    }
}

impl From<serde_json::Error> for Usb2000Error {
    fn from(e: serde_json::Error) -> Self {
        Usb2000Error::Serialization(e.to_string())
    }
}

impl From<toml::ser::Error> for Usb2000Error {
    fn from(e: toml::ser::Error) -> Self {
        Usb2000Error::Serialization(e.to_string())
    }
}

/// Crate-level Result alias using [`Usb2000Error`].
pub type Result<T> = std::result::Result<T, Usb2000Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_device_error() {
        let e: Usb2000Error = DeviceError::Unavailable("gone".into()).into();
        assert!(matches!(e, Usb2000Error::Device(DeviceError::Unavailable(_))));
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let e: Usb2000Error = io_err.into();
        assert!(matches!(e, Usb2000Error::Io(_)));
    }

    #[test]
    fn display_device_error_is_transparent() {
        let e = Usb2000Error::Device(DeviceError::Io("INIT: wrote 0 of 1 bytes".into()));
        assert_eq!(e.to_string(), "I/O error: INIT: wrote 0 of 1 bytes");
    }

    #[test]
    fn display_config_error() {
        let e = Usb2000Error::Config("invalid input".into());
        assert_eq!(e.to_string(), "Config error: invalid input");
    }

    #[test]
    fn source_chains_device_error() {
        let e = Usb2000Error::Device(DeviceError::Protocol("bad sync".into()));
        let source = std::error::Error::source(&e).unwrap();
        assert!(source.to_string().contains("bad sync"));
    }

    #[test]
    fn source_none_for_string_variants() {
        let e = Usb2000Error::Serialization("test".into());
        assert!(std::error::Error::source(&e).is_none());
    }

    #[test]
    fn question_mark_propagation_device_to_unified() {
        fn inner() -> crate::device::Result<()> {
            Err(DeviceError::Unsupported("strobe".into()))
        }
        fn outer() -> Result<()> {
            inner()?;
            Ok(())
        }
        let err = outer().unwrap_err();
        assert!(matches!(err, Usb2000Error::Device(DeviceError::Unsupported(_))));
    }
}
