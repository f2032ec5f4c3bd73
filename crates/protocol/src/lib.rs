//! Wire protocol of the wireless remote's USB receiver
//!
//! This crate describes the fixed-length reports exchanged with the receiver:
//! the report-id length table, decoding of received frames into key events,
//! link notifications and HID++ responses, builders for the HID++ requests the
//! driver issues, and the key-code table of the remote.
//!
//! # Example
//!
//! ```
//! use protocol::{Frame, KeyCode, Report};
//!
//! let mut buf = [0u8; 15];
//! buf[..5].copy_from_slice(&[0x20, 0x01, 0x03, 0xEC, 0x01]);
//!
//! let frame = Frame::parse(&buf).unwrap();
//! assert_eq!(frame.report(), Report::KeyDown(KeyCode::OFF));
//! assert_eq!(KeyCode::OFF.long().to_string(), "LONG OFF");
//! ```

pub mod error;
pub mod keys;
pub mod report;
pub mod request;

pub use error::{ProtocolError, Result};
pub use keys::KeyCode;
pub use report::{Frame, Report, ReportId, TRANSFER_SIZE, hex_dump, report_length, sub_id};
pub use request::{
    FirmwarePart, FirmwareVersion, MAX_PAIRED_DEVICES, RECEIVER_INDEX, device_name_query,
    enable_dj_mode, enable_notifications, firmware_query, parse_device_name,
};
