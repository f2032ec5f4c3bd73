//! USB subsystem
//!
//! [`UsbTransport`] implements [`common::Transport`] on top of rusb:
//! - device lookup by vendor and product id
//! - interface claiming with kernel driver detach and reattach
//! - asynchronous interrupt reads with cancellation
//! - hot-plug detection
//!
//! Everything runs on the caller's thread. libusb's descriptors are exposed
//! through `poll_fds` so a reactor can wait on them.

mod device;
mod hotplug;
mod transfers;
mod transport;

pub use device::{DeviceAddress, ReceiverHandle};
pub use transfers::{map_libusb_code, map_rusb_error};
pub use transport::UsbTransport;
