//! Receiver device handles
//!
//! Opening, claiming and closing a receiver. Claiming detaches the kernel's
//! HID driver from the selected interface; closing gives it back.

use super::transfers::map_rusb_error;
use common::{InterfaceInfo, InterfaceSelector, TransportError};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::fmt;
use tracing::{debug, warn};

/// Bus position of a device, stable for as long as it stays plugged in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress {
    pub bus: u8,
    pub address: u8,
}

impl DeviceAddress {
    pub fn of<T: UsbContext>(device: &Device<T>) -> Self {
        Self {
            bus: device.bus_number(),
            address: device.address(),
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// An open receiver
pub struct ReceiverHandle {
    handle: DeviceHandle<Context>,
    address: DeviceAddress,
    /// Interface we took away from a kernel driver
    detached: Option<u8>,
}

impl ReceiverHandle {
    pub fn open(device: &Device<Context>) -> Result<Self, TransportError> {
        let address = DeviceAddress::of(device);
        let handle = device.open().map_err(|e| {
            warn!("Failed to open receiver {}: {}", address, e);
            map_rusb_error(e)
        })?;

        debug!("Opened receiver {}", address);
        Ok(Self {
            handle,
            address,
            detached: None,
        })
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn raw(&self) -> &DeviceHandle<Context> {
        &self.handle
    }

    /// Claim the selected interface and find its interrupt IN endpoint
    pub fn claim(&mut self, selector: &InterfaceSelector) -> Result<InterfaceInfo, TransportError> {
        let in_endpoint = self.find_endpoint(selector)?;
        let number = selector.interface;

        match self.handle.kernel_driver_active(number) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {} on {}",
                    number, self.address
                );
                match self.handle.detach_kernel_driver(number) {
                    Ok(()) => self.detached = Some(number),
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        number, e
                    ),
                }
            }
            Ok(false) => {
                debug!("No kernel driver active on interface {}", number);
            }
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    number, e
                );
            }
        }

        if let Err(e) = self.handle.claim_interface(number) {
            warn!("Failed to claim interface {}: {}", number, e);
            self.reattach();
            return Err(map_rusb_error(e));
        }

        if selector.alt_setting != 0
            && let Err(e) = self
                .handle
                .set_alternate_setting(number, selector.alt_setting)
        {
            warn!(
                "Failed to select alternate setting {} of interface {}: {}",
                selector.alt_setting, number, e
            );
            if let Err(e) = self.handle.release_interface(number) {
                debug!("Failed to release interface {}: {}", number, e);
            }
            self.reattach();
            return Err(map_rusb_error(e));
        }

        debug!("Claimed interface {} on {}", number, self.address);
        Ok(InterfaceInfo {
            number,
            in_endpoint,
        })
    }

    fn find_endpoint(&self, selector: &InterfaceSelector) -> Result<u8, TransportError> {
        let config = self
            .handle
            .device()
            .config_descriptor(selector.config_index)
            .map_err(map_rusb_error)?;

        let setting = config
            .interfaces()
            .filter(|interface| interface.number() == selector.interface)
            .flat_map(|interface| interface.descriptors())
            .find(|setting| setting.setting_number() == selector.alt_setting)
            .ok_or_else(|| {
                TransportError::Other(format!(
                    "Interface {} alternate setting {} not found",
                    selector.interface, selector.alt_setting
                ))
            })?;

        let endpoint = setting
            .endpoint_descriptors()
            .nth(selector.endpoint_index)
            .ok_or_else(|| {
                TransportError::Other(format!(
                    "Interface {} has no endpoint {}",
                    selector.interface, selector.endpoint_index
                ))
            })?;

        if endpoint.direction() != rusb::Direction::In {
            return Err(TransportError::Other(format!(
                "Endpoint {:#04x} is not an IN endpoint",
                endpoint.address()
            )));
        }
        Ok(endpoint.address())
    }

    /// Release `interface` and hand it back to the kernel
    pub fn close(mut self, interface: u8) {
        if let Err(e) = self.handle.release_interface(interface) {
            debug!("Failed to release interface {}: {}", interface, e);
        }
        self.reattach();
        debug!("Closed receiver {}", self.address);
    }

    fn reattach(&mut self) {
        let Some(interface) = self.detached.take() else {
            return;
        };
        match self.handle.attach_kernel_driver(interface) {
            Ok(()) => debug!(
                "Reattached kernel driver to interface {} on {}",
                interface, self.address
            ),
            Err(e) => debug!(
                "Could not reattach kernel driver to interface {}: {}",
                interface, e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        let address = DeviceAddress { bus: 1, address: 7 };
        assert_eq!(address.to_string(), "001:007");
    }

    #[test]
    fn test_address_equality() {
        let a = DeviceAddress { bus: 2, address: 5 };
        let b = a;
        assert_eq!(a, b);
        assert_ne!(a, DeviceAddress { bus: 2, address: 6 });
    }
}
