//! Hot-plug notifications
//!
//! libusb invokes the callback from inside `handle_events`. The callback only
//! queues the device; the transport turns queued notices into events after
//! the pump returns.

use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug)]
pub enum HotplugNotice {
    Arrived(Device<Context>),
    Left(Device<Context>),
}

/// Notices not yet collected by the transport
pub type NoticeQueue = Arc<Mutex<VecDeque<HotplugNotice>>>;

/// Hot-plug callback handler
///
/// rusb requires callbacks to be `Send`, hence the mutex even though
/// everything runs on one thread.
struct HotplugCallback {
    queue: NoticeQueue,
}

impl HotplugCallback {
    fn push(&self, notice: HotplugNotice) {
        match self.queue.lock() {
            Ok(mut queue) => queue.push_back(notice),
            Err(poisoned) => poisoned.into_inner().push_back(notice),
        }
    }
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.push(HotplugNotice::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.push(HotplugNotice::Left(device));
    }
}

/// Register for arrival and departure of devices with these ids
///
/// Devices already present are not reported.
pub fn register(
    context: &Context,
    vendor_id: u16,
    product_id: u16,
    queue: NoticeQueue,
) -> Result<Registration<Context>, rusb::Error> {
    if !rusb::has_hotplug() {
        return Err(rusb::Error::NotSupported);
    }

    let registration = HotplugBuilder::new()
        .vendor_id(vendor_id)
        .product_id(product_id)
        .enumerate(false)
        .register(context, Box::new(HotplugCallback { queue }))?;

    debug!(
        "Hot-plug callbacks registered for {:04x}:{:04x}",
        vendor_id, product_id
    );
    Ok(registration)
}

/// Take every queued notice
pub fn drain(queue: &NoticeQueue) -> Vec<HotplugNotice> {
    match queue.lock() {
        Ok(mut queue) => queue.drain(..).collect(),
        Err(poisoned) => poisoned.into_inner().drain(..).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_empty_queue() {
        let queue: NoticeQueue = Arc::new(Mutex::new(VecDeque::new()));
        assert!(drain(&queue).is_empty());
    }
}
