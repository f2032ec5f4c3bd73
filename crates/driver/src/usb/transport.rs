//! libusb-backed [`Transport`]

use super::device::{DeviceAddress, ReceiverHandle};
use super::hotplug::{self, HotplugNotice, NoticeQueue};
use super::transfers::{Transfers, map_rusb_error};
use common::{
    ControlSetup, InterfaceInfo, InterfaceSelector, TransferId, Transport, TransportError,
    TransportEvent,
};
use nix::poll::PollFlags;
use rusb::{Context, Device, Registration, UsbContext, ffi};
use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Rounds of event handling granted to outstanding transfers on drop
const DRAIN_ROUNDS: usize = 10;
const DRAIN_INTERVAL: Duration = Duration::from_millis(100);

/// The system USB stack, through one libusb context
pub struct UsbTransport {
    context: Context,
    notices: NoticeQueue,
    registration: Option<Registration<Context>>,
    /// Devices reported by hot-plug, kept until they leave
    arrived: HashMap<DeviceAddress, Device<Context>>,
    transfers: Transfers,
}

impl UsbTransport {
    pub fn new() -> Result<Self, TransportError> {
        let context = Context::new().map_err(map_rusb_error)?;
        debug!("libusb context created");

        Ok(Self {
            context,
            notices: Arc::new(Mutex::new(VecDeque::new())),
            registration: None,
            arrived: HashMap::new(),
            transfers: Transfers::new(),
        })
    }

    fn find_device(&self, address: &DeviceAddress) -> Result<Device<Context>, TransportError> {
        if let Some(device) = self.arrived.get(address) {
            return Ok(device.clone());
        }
        self.context
            .devices()
            .map_err(map_rusb_error)?
            .iter()
            .find(|device| DeviceAddress::of(device) == *address)
            .ok_or(TransportError::NotFound)
    }
}

impl Transport for UsbTransport {
    type Device = DeviceAddress;
    type Handle = ReceiverHandle;

    fn register_hotplug(&mut self, vendor_id: u16, product_id: u16) -> common::transport::Result<()> {
        let registration =
            hotplug::register(&self.context, vendor_id, product_id, Arc::clone(&self.notices))
                .map_err(map_rusb_error)?;
        self.registration = Some(registration);
        Ok(())
    }

    fn open_by_id(
        &mut self,
        vendor_id: u16,
        product_id: u16,
    ) -> common::transport::Result<ReceiverHandle> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        let device = devices
            .iter()
            .find(|device| {
                device.device_descriptor().is_ok_and(|descriptor| {
                    descriptor.vendor_id() == vendor_id && descriptor.product_id() == product_id
                })
            })
            .ok_or(TransportError::NotFound)?;
        ReceiverHandle::open(&device)
    }

    fn open_device(&mut self, device: &DeviceAddress) -> common::transport::Result<ReceiverHandle> {
        let device = self.find_device(device)?;
        ReceiverHandle::open(&device)
    }

    fn device_of(&self, handle: &ReceiverHandle) -> DeviceAddress {
        handle.address()
    }

    fn claim_interface(
        &mut self,
        handle: &mut ReceiverHandle,
        selector: &InterfaceSelector,
    ) -> common::transport::Result<InterfaceInfo> {
        handle.claim(selector)
    }

    fn close(&mut self, handle: ReceiverHandle, interface: u8) {
        handle.close(interface);
    }

    fn submit_interrupt_in(
        &mut self,
        handle: &ReceiverHandle,
        endpoint: u8,
        length: usize,
        timeout: Duration,
    ) -> common::transport::Result<TransferId> {
        self.transfers
            .submit_interrupt_in(handle.raw(), endpoint, length, timeout)
    }

    fn cancel_transfer(&mut self, id: TransferId) {
        self.transfers.cancel(id);
    }

    fn write_control(
        &mut self,
        handle: &ReceiverHandle,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> common::transport::Result<usize> {
        handle
            .raw()
            .write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                timeout,
            )
            .map_err(map_rusb_error)
    }

    fn handle_events(
        &mut self,
        timeout: Duration,
    ) -> common::transport::Result<Vec<TransportEvent<DeviceAddress>>> {
        match self.context.handle_events(Some(timeout)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => return Err(map_rusb_error(e)),
        }

        let mut events: Vec<_> = self
            .transfers
            .take_completions()
            .into_iter()
            .map(TransportEvent::Transfer)
            .collect();

        for notice in hotplug::drain(&self.notices) {
            match notice {
                HotplugNotice::Arrived(device) => {
                    let address = DeviceAddress::of(&device);
                    info!("Receiver arrived at {}", address);
                    self.arrived.insert(address, device);
                    events.push(TransportEvent::Arrived(address));
                }
                HotplugNotice::Left(device) => {
                    let address = DeviceAddress::of(&device);
                    info!("Receiver left {}", address);
                    self.arrived.remove(&address);
                    events.push(TransportEvent::Left(address));
                }
            }
        }

        Ok(events)
    }

    fn poll_fds(&self) -> Vec<(RawFd, PollFlags)> {
        // SAFETY: the list is owned by libusb until freed below and its
        // entries are plain data
        unsafe {
            let context = self.context.as_raw();
            if ffi::libusb_pollfds_handle_timeouts(context) == 0 {
                warn!("libusb needs timer handling that descriptor polling cannot provide");
            }

            let list = ffi::libusb_get_pollfds(context);
            if list.is_null() {
                return Vec::new();
            }

            let mut fds = Vec::new();
            let mut entry = list;
            while !(*entry).is_null() {
                let pollfd = &**entry;
                fds.push((pollfd.fd, PollFlags::from_bits_truncate(pollfd.events)));
                entry = entry.add(1);
            }
            ffi::libusb_free_pollfds(list);
            fds
        }
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        if self.transfers.is_empty() {
            return;
        }

        // Transfers must not be freed while libusb may still call back
        self.transfers.cancel_all();
        for _ in 0..DRAIN_ROUNDS {
            if let Err(e) = self.context.handle_events(Some(DRAIN_INTERVAL)) {
                debug!("Error handling USB events during shutdown: {}", e);
            }
            self.transfers.take_completions();
            if self.transfers.is_empty() {
                return;
            }
        }
        warn!("Outstanding USB transfers did not finish, leaking them");
        std::mem::forget(std::mem::take(&mut self.transfers));
    }
}
