//! usb2000: driver for Ocean Optics USB2000-family grating spectrometers.

pub mod acquisition;
pub mod calibration;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod models;
pub mod protocol;
pub mod registry;
pub mod transforms;
pub mod transport;

pub use acquisition::{Completeness, RawSpectrum, Spectrum};
pub use calibration::Calibration;
pub use device::{DeviceError, LinkState, RetryPolicy, Settings, Spectrometer};
pub use error::Usb2000Error;
pub use models::Model;
pub use protocol::{ByteOrder, TriggerMode};
pub use registry::Registry;
pub use transport::{NusbBackend, UsbBackend, UsbDeviceInfo, UsbSession};
