//! Userspace driver for a Harmony remote behind a Unifying receiver
//!
//! - [`config`]: receiver selection and protocol timings
//! - [`remote`]: the session and protocol engine
//! - [`usb`]: the libusb transport

pub mod config;
pub mod remote;
pub mod usb;
