//! HID++ requests understood by the receiver
//!
//! Builders for the fixed requests the driver issues, plus decoders for the
//! answers worth interpreting. All requests address the receiver itself
//! (device index `0xFF`) and use register access sub ids.

use crate::error::{ProtocolError, Result};
use crate::report::{DEVICE_IDX, ReportId, SUB_ID_IDX};
use byteorder::{BigEndian, ByteOrder};
use std::fmt;

/// Device index addressing the receiver rather than a paired device
pub const RECEIVER_INDEX: u8 = 0xFF;

/// Register access sub ids
pub mod access {
    pub const SET_SHORT_REGISTER: u8 = 0x80;
    pub const GET_SHORT_REGISTER: u8 = 0x81;
    pub const SET_LONG_REGISTER: u8 = 0x82;
    pub const GET_LONG_REGISTER: u8 = 0x83;
}

/// Receiver registers
pub mod register {
    /// Notification flags
    pub const NOTIFICATIONS: u8 = 0x00;
    /// Pairing information (long register)
    pub const PAIRING_INFO: u8 = 0xB5;
    /// Firmware information
    pub const FIRMWARE: u8 = 0xF1;
}

/// First parameter of a pairing-info query for the name of a paired device
const PAIRING_INFO_NAME: u8 = 0x40;

/// Index of the length byte in a device name response
const NAME_LENGTH_IDX: usize = 5;

/// Maximum number of paired devices on a receiver
pub const MAX_PAIRED_DEVICES: u8 = 6;

fn short_request(sub_id: u8, params: [u8; 4]) -> [u8; 7] {
    let mut buf = [0u8; 7];
    buf[0] = ReportId::HidppShort.as_byte();
    buf[DEVICE_IDX] = RECEIVER_INDEX;
    buf[SUB_ID_IDX] = sub_id;
    buf[3..].copy_from_slice(&params);
    buf
}

/// DJ report switching the receiver into DJ mode with all device types enabled
pub fn enable_dj_mode() -> [u8; 15] {
    let mut buf = [0u8; 15];
    buf[0] = ReportId::DjShort.as_byte();
    buf[DEVICE_IDX] = RECEIVER_INDEX;
    buf[SUB_ID_IDX] = 0x80;
    buf[3] = 0x3F;
    buf
}

/// Enable wireless and software-present notifications
pub fn enable_notifications() -> [u8; 7] {
    short_request(
        access::SET_SHORT_REGISTER,
        [register::NOTIFICATIONS, 0x00, 0x09, 0x00],
    )
}

/// Which half of the firmware version to query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwarePart {
    /// Major and minor release numbers
    Release = 0x01,
    /// Build number
    Build = 0x02,
}

/// Query one half of the receiver firmware version
pub fn firmware_query(part: FirmwarePart) -> [u8; 7] {
    short_request(
        access::GET_SHORT_REGISTER,
        [register::FIRMWARE, part as u8, 0x00, 0x00],
    )
}

/// Query the name of the paired device at `index` (0-based)
pub fn device_name_query(index: u8) -> [u8; 7] {
    short_request(
        access::GET_LONG_REGISTER,
        [register::PAIRING_INFO, PAIRING_INFO_NAME + index, 0x00, 0x00],
    )
}

/// Extract the device name from a pairing-info response
pub fn parse_device_name(frame: &[u8]) -> Result<String> {
    let declared = *frame.get(NAME_LENGTH_IDX).ok_or(ProtocolError::Truncated)? as usize;
    let text = &frame[NAME_LENGTH_IDX + 1..];
    let len = declared.min(text.len());
    Ok(String::from_utf8_lossy(&text[..len]).into_owned())
}

/// Receiver firmware version, packed as `major << 24 | minor << 16 | build`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion(pub u32);

impl FirmwareVersion {
    /// Newest firmware known to still forward every key of the remote
    pub const NEWEST_FULLY_SUPPORTED: FirmwareVersion = FirmwareVersion(0x1203_0025);

    /// Decode the answer to a [`FirmwarePart::Release`] query
    pub fn from_release(frame: &[u8]) -> Result<Self> {
        let bytes = frame.get(5..7).ok_or(ProtocolError::Truncated)?;
        Ok(FirmwareVersion(u32::from(BigEndian::read_u16(bytes)) << 16))
    }

    /// Merge the answer to a [`FirmwarePart::Build`] query
    pub fn with_build(self, frame: &[u8]) -> Result<Self> {
        let bytes = frame.get(5..7).ok_or(ProtocolError::Truncated)?;
        Ok(FirmwareVersion(
            (self.0 & 0xFFFF_0000) | u32::from(BigEndian::read_u16(bytes)),
        ))
    }

    pub fn major(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn minor(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn build(self) -> u16 {
        self.0 as u16
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}.{:02x}.B{:04x}",
            self.major(),
            self.minor(),
            self.build()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::report_length;

    #[test]
    fn test_request_lengths_match_table() {
        assert_eq!(Some(enable_dj_mode().len()), report_length(0x20));
        assert_eq!(Some(enable_notifications().len()), report_length(0x10));
        assert_eq!(
            Some(firmware_query(FirmwarePart::Build).len()),
            report_length(0x10)
        );
        assert_eq!(Some(device_name_query(0).len()), report_length(0x10));
    }

    #[test]
    fn test_request_bytes() {
        assert_eq!(
            enable_notifications(),
            [0x10, 0xFF, 0x80, 0x00, 0x00, 0x09, 0x00]
        );
        assert_eq!(
            firmware_query(FirmwarePart::Release),
            [0x10, 0xFF, 0x81, 0xF1, 0x01, 0x00, 0x00]
        );
        assert_eq!(
            device_name_query(3),
            [0x10, 0xFF, 0x83, 0xB5, 0x43, 0x00, 0x00]
        );
        assert_eq!(&enable_dj_mode()[..4], &[0x20, 0xFF, 0x80, 0x3F]);
    }

    #[test]
    fn test_firmware_decoding() {
        let release = [0x10, 0xFF, 0x81, 0xF1, 0x01, 0x12, 0x03];
        let build = [0x10, 0xFF, 0x81, 0xF1, 0x02, 0x00, 0x25];

        let fw = FirmwareVersion::from_release(&release).unwrap();
        assert_eq!(fw.0, 0x1203_0000);

        let fw = fw.with_build(&build).unwrap();
        assert_eq!(fw, FirmwareVersion::NEWEST_FULLY_SUPPORTED);
        assert_eq!(fw.major(), 0x12);
        assert_eq!(fw.minor(), 0x03);
        assert_eq!(fw.build(), 0x25);
        assert_eq!(fw.to_string(), "12.03.B0025");
    }

    #[test]
    fn test_firmware_truncated() {
        assert_eq!(
            FirmwareVersion::from_release(&[0x10, 0xFF, 0x81]),
            Err(ProtocolError::Truncated)
        );
    }

    #[test]
    fn test_parse_device_name() {
        let mut frame = [0u8; 20];
        frame[..6].copy_from_slice(&[0x11, 0xFF, 0x83, 0xB5, 0x40, 0x0B]);
        frame[6..17].copy_from_slice(b"Harmony 20+");
        assert_eq!(parse_device_name(&frame).unwrap(), "Harmony 20+");

        // Declared length longer than the frame is clamped
        frame[5] = 0xFF;
        assert_eq!(parse_device_name(&frame).unwrap().len(), 14);
    }
}
