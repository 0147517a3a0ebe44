//! Device registry: discovery and teardown of attached spectrometers.
//!
//! The registry owns the backend and every [`Spectrometer`] it has found.
//! Devices keep their discovery order. Dropping the registry closes every
//! device that is still open.

use std::collections::HashSet;

use log::{debug, info, warn};

use crate::device::{DeviceError, Result, Spectrometer};
use crate::transport::UsbBackend;

pub struct Registry<B: UsbBackend> {
    backend: B,
    devices: Vec<Spectrometer<B>>,
    known: HashSet<B::Id>,
}

impl<B: UsbBackend> Registry<B> {
    pub fn new(backend: B) -> Self {
        Registry {
            backend,
            devices: Vec::new(),
            known: HashSet::new(),
        }
    }

    /// Enumerate the bus and register every supported device not already known.
    ///
    /// New devices start `Closed`. Returns all registered devices.
    pub fn discover(&mut self) -> Result<&mut [Spectrometer<B>]> {
        for info in self.backend.enumerate()? {
            let Some(model) = info.model() else {
                continue;
            };
            if !model.is_activated() {
                debug!("{}: {model} has no calibration EEPROM, skipped", info.location);
                continue;
            }
            if !self.known.insert(info.id.clone()) {
                continue;
            }
            info!("{}: found {model}", info.location);
            self.devices.push(Spectrometer::new(info, model));
        }
        Ok(&mut self.devices)
    }

    pub fn devices(&self) -> &[Spectrometer<B>] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn find(&self, id: &B::Id) -> Option<&Spectrometer<B>> {
        self.devices.iter().find(|d| d.id() == id)
    }

    pub fn find_mut(&mut self, id: &B::Id) -> Option<&mut Spectrometer<B>> {
        self.devices.iter_mut().find(|d| d.id() == id)
    }

    /// Take a device out of the registry. A later discovery registers it anew.
    pub fn remove(&mut self, id: &B::Id) -> Option<Spectrometer<B>> {
        let index = self.devices.iter().position(|d| d.id() == id)?;
        self.known.remove(id);
        Some(self.devices.remove(index))
    }

    /// Open a registered device.
    pub fn open(&mut self, id: &B::Id) -> Result<&mut Spectrometer<B>> {
        let device = self
            .devices
            .iter_mut()
            .find(|d| d.id() == id)
            .ok_or_else(|| DeviceError::Unavailable(format!("{id:?}: not registered")))?;
        device.open(&self.backend)?;
        Ok(device)
    }

    /// Reset a registered device and drop it from the registry, since it
    /// re-enumerates after the reset.
    pub fn reset(&mut self, id: &B::Id) -> Result<()> {
        let mut device = self
            .remove(id)
            .ok_or_else(|| DeviceError::Unavailable(format!("{id:?}: not registered")))?;
        device.reset(&self.backend)
    }

    /// Close every open device, then forget all of them.
    pub fn shutdown(&mut self) {
        for device in &mut self.devices {
            if device.is_open() {
                if let Err(e) = device.close() {
                    warn!("{}: close failed: {e}", device.info().location);
                }
            }
        }
        self.devices.clear();
        self.known.clear();
    }
}

impl<B: UsbBackend> Drop for Registry<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PRODUCT_ID_HR2000, PRODUCT_ID_USB2000, VENDOR_ID};
    use crate::transport::mock::{MockBackend, MockEvent};

    #[test]
    fn discover_filters_unsupported_devices() {
        let backend = MockBackend::new();
        backend.attach(0x1235, 0x8218);
        backend.attach(VENDOR_ID, PRODUCT_ID_USB2000);
        let hr = backend.attach(VENDOR_ID, PRODUCT_ID_HR2000);
        let mut registry = Registry::new(backend);
        let ids: Vec<u32> = registry.discover().unwrap().iter().map(|d| *d.id()).collect();
        assert_eq!(ids, vec![hr.id()]);
    }

    #[test]
    fn discover_is_idempotent_and_keeps_order() {
        let backend = MockBackend::new();
        let a = backend.attach_default();
        let mut registry = Registry::new(backend.clone());
        registry.discover().unwrap();
        let b = backend.attach(VENDOR_ID, PRODUCT_ID_HR2000);
        let ids: Vec<u32> = registry.discover().unwrap().iter().map(|d| *d.id()).collect();
        assert_eq!(ids, vec![a.id(), b.id()]);
        registry.discover().unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn find_and_remove() {
        let backend = MockBackend::new();
        let a = backend.attach_default();
        let mut registry = Registry::new(backend);
        registry.discover().unwrap();
        assert!(registry.find(&a.id()).is_some());
        assert!(registry.find(&999).is_none());
        let removed = registry.remove(&a.id()).unwrap();
        assert_eq!(*removed.id(), a.id());
        assert!(registry.is_empty());
        // Removed devices are registered again by the next discovery.
        registry.discover().unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn open_unknown_device_is_unavailable() {
        let mut registry = Registry::new(MockBackend::new());
        assert!(matches!(
            registry.open(&7),
            Err(DeviceError::Unavailable(_))
        ));
    }

    #[test]
    fn drop_closes_open_devices() {
        let backend = MockBackend::new();
        let a = backend.attach_default();
        a.script_open();
        let mut registry = Registry::new(backend);
        registry.discover().unwrap();
        registry.open(&a.id()).unwrap();
        drop(registry);
        let events = a.events();
        assert!(events.contains(&MockEvent::Release(0)));
        assert_eq!(events.last(), Some(&MockEvent::Close));
    }

    #[test]
    fn reset_device_is_found_again_after_reenumeration() {
        let backend = MockBackend::new();
        let a = backend.attach_default();
        let mut registry = Registry::new(backend.clone());
        registry.discover().unwrap();
        registry.reset(&a.id()).unwrap();
        assert!(a.events().contains(&MockEvent::Reset));
        assert!(registry.is_empty());

        // The port reset drops the device off the bus; it comes back under a new id.
        backend.detach(a.id());
        let b = backend.attach_default();
        let ids: Vec<u32> = registry.discover().unwrap().iter().map(|d| *d.id()).collect();
        assert_eq!(ids, vec![b.id()]);
        assert!(registry.find(&a.id()).is_none());
    }

    #[test]
    fn unplugged_device_stays_registered_until_removed() {
        let backend = MockBackend::new();
        let a = backend.attach_default();
        let mut registry = Registry::new(backend.clone());
        registry.discover().unwrap();
        backend.detach(a.id());
        registry.discover().unwrap();
        assert_eq!(registry.len(), 1);
        assert!(matches!(
            registry.open(&a.id()),
            Err(DeviceError::Unavailable(_))
        ));
        registry.remove(&a.id());
        registry.discover().unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn enumeration_failure_propagates() {
        let backend = MockBackend::new();
        backend.set_fail_enumerate(true);
        let mut registry = Registry::new(backend);
        assert!(matches!(registry.discover(), Err(DeviceError::Io(_))));
    }
}
