//! Model identities: USB vendor/product ids of the supported hardware.
//!
//! Every variant shares the same command set. Only variants carrying their
//! calibration in onboard EEPROM are activated during discovery; the plain
//! USB2000 has no calibration source this driver can read.

use serde::Serialize;

/// Ocean Optics vendor ID.
pub const VENDOR_ID: u16 = 0x2457;

/// USB2000 without calibration EEPROM.
pub const PRODUCT_ID_USB2000: u16 = 0x1001;

/// USB2000 with calibration EEPROM.
pub const PRODUCT_ID_USB2000_EEPROM: u16 = 0x1002;

/// HR2000 high-resolution variant.
pub const PRODUCT_ID_HR2000: u16 = 0x100A;

/// A recognised spectrometer variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Model {
    /// USB2000 without EEPROM calibration.
    Usb2000,
    /// USB2000 with EEPROM calibration.
    Usb2000Eeprom,
    /// HR2000.
    Hr2000,
}

impl Model {
    /// Identify a model from its USB ids.
    pub fn from_ids(vendor_id: u16, product_id: u16) -> Option<Model> {
        if vendor_id != VENDOR_ID {
            return None;
        }
        match product_id {
            PRODUCT_ID_USB2000 => Some(Model::Usb2000),
            PRODUCT_ID_USB2000_EEPROM => Some(Model::Usb2000Eeprom),
            PRODUCT_ID_HR2000 => Some(Model::Hr2000),
            _ => None,
        }
    }

    pub fn product_id(self) -> u16 {
        match self {
            Model::Usb2000 => PRODUCT_ID_USB2000,
            Model::Usb2000Eeprom => PRODUCT_ID_USB2000_EEPROM,
            Model::Hr2000 => PRODUCT_ID_HR2000,
        }
    }

    /// Whether discovery registers this model.
    ///
    /// Models without onboard calibration are recognised but skipped: open
    /// would have nothing to load.
    pub fn is_activated(self) -> bool {
        self.has_eeprom()
    }

    pub fn has_eeprom(self) -> bool {
        !matches!(self, Model::Usb2000)
    }

    pub fn name(self) -> &'static str {
        match self {
            Model::Usb2000 => "USB2000 (no EEPROM)",
            Model::Usb2000Eeprom => "USB2000",
            Model::Hr2000 => "HR2000",
        }
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
