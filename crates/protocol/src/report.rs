//! Receiver report framing
//!
//! Every report exchanged with the receiver is a fixed-length frame. The
//! first byte (report id) selects both the total length and the meaning of
//! the remaining fields:
//!
//! ```text
//! [report id: u8][device index: u8][sub id: u8][payload ...]
//! ```
//!
//! | Report id | Kind        | Length |
//! |-----------|-------------|--------|
//! | `0x10`    | HID++ short | 7      |
//! | `0x11`    | HID++ long  | 20     |
//! | `0x20`    | DJ short    | 15     |
//! | `0x21`    | DJ long     | 32     |
//!
//! DJ reports carry the remote's key events and link notifications. HID++
//! reports carry the request/response sub-protocol used to configure the
//! receiver.

use crate::error::{ProtocolError, Result};
use crate::keys::KeyCode;

/// Size of the buffer used for every interrupt IN transfer
pub const TRANSFER_SIZE: usize = 32;

/// Byte offsets shared by all report kinds
pub const REPORT_ID_IDX: usize = 0;
pub const DEVICE_IDX: usize = 1;
pub const SUB_ID_IDX: usize = 2;
pub const KEY_MSB_IDX: usize = 3;
pub const KEY_LSB_IDX: usize = 4;
pub const ERROR_CODE_IDX: usize = 5;

/// Sub ids with a fixed meaning
pub mod sub_id {
    /// DJ keyboard report
    pub const KEYBOARD: u8 = 0x01;
    /// DJ consumer control report (media keys)
    pub const CONSUMER_CONTROL: u8 = 0x03;
    /// DJ wireless link notification
    pub const CONNECTION_NOTIFICATION: u8 = 0x42;
    /// HID++ 1.0 error
    pub const ERROR: u8 = 0x8F;
    /// HID++ 2.0 error
    pub const ERROR_V2: u8 = 0xFF;
}

/// Report ids understood by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReportId {
    HidppShort = 0x10,
    HidppLong = 0x11,
    DjShort = 0x20,
    DjLong = 0x21,
}

impl ReportId {
    /// Look up a report id byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x10 => Some(Self::HidppShort),
            0x11 => Some(Self::HidppLong),
            0x20 => Some(Self::DjShort),
            0x21 => Some(Self::DjLong),
            _ => None,
        }
    }

    /// Total frame length, including the report id byte
    pub const fn length(self) -> usize {
        match self {
            Self::HidppShort => 7,
            Self::HidppLong => 20,
            Self::DjShort => 15,
            Self::DjLong => 32,
        }
    }

    /// Whether this report belongs to the HID++ request/response sub-protocol
    pub const fn is_hidpp(self) -> bool {
        matches!(self, Self::HidppShort | Self::HidppLong)
    }

    /// Whether this report is a DJ (device juggling) report
    pub const fn is_dj(self) -> bool {
        matches!(self, Self::DjShort | Self::DjLong)
    }

    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ReportId {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self> {
        Self::from_byte(byte).ok_or(ProtocolError::UnknownReportId(byte))
    }
}

/// Expected frame length for a report id byte, if the id is known
pub fn report_length(report_id: u8) -> Option<usize> {
    ReportId::from_byte(report_id).map(ReportId::length)
}

/// Decoded meaning of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    /// A key went down on the remote
    KeyDown(KeyCode),
    /// All keys were released
    KeyUp,
    /// The remote dropped off the wireless link
    LinkLost,
    /// The remote (re)established the wireless link
    LinkEstablished,
    /// HID++ frame that may answer an outstanding request
    Response { device_index: u8, sub_id: u8 },
    /// HID++ error frame naming the sub id of the failed request
    Error {
        device_index: u8,
        request_sub_id: u8,
        error_code: u8,
    },
    /// Anything else (mouse reports, pairing notices, ...)
    Other { report_id: ReportId, sub_id: u8 },
}

/// A length-validated view over one received or outgoing report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    report_id: ReportId,
    bytes: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Validate `bytes` against the report length table
    ///
    /// Frames of unexpected length for their declared report id are rejected.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let first = *bytes.first().ok_or(ProtocolError::Empty)?;
        let report_id = ReportId::try_from(first)?;

        if bytes.len() != report_id.length() {
            return Err(ProtocolError::LengthMismatch {
                report_id: first,
                expected: report_id.length(),
                actual: bytes.len(),
            });
        }

        Ok(Self { report_id, bytes })
    }

    pub fn report_id(&self) -> ReportId {
        self.report_id
    }

    pub fn device_index(&self) -> u8 {
        self.bytes[DEVICE_IDX]
    }

    pub fn sub_id(&self) -> u8 {
        self.bytes[SUB_ID_IDX]
    }

    /// The whole frame, report id included
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Bytes following the sub id
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[SUB_ID_IDX + 1..]
    }

    /// Classify the frame
    pub fn report(&self) -> Report {
        let sub_id = self.sub_id();
        let b = self.bytes;

        match self.report_id {
            ReportId::DjShort => match sub_id {
                sub_id::KEYBOARD | sub_id::CONSUMER_CONTROL => {
                    match KeyCode::from_report(sub_id, b[KEY_MSB_IDX], b[KEY_LSB_IDX]) {
                        Some(code) => Report::KeyDown(code),
                        None => Report::KeyUp,
                    }
                }
                // Bit 0 of the link status byte is set while the link is down
                sub_id::CONNECTION_NOTIFICATION if b[KEY_MSB_IDX] != 0 => Report::LinkLost,
                sub_id::CONNECTION_NOTIFICATION => Report::LinkEstablished,
                _ => Report::Other {
                    report_id: self.report_id,
                    sub_id,
                },
            },
            ReportId::HidppShort | ReportId::HidppLong => match sub_id {
                sub_id::ERROR | sub_id::ERROR_V2 => Report::Error {
                    device_index: self.device_index(),
                    request_sub_id: b[SUB_ID_IDX + 1],
                    error_code: b[ERROR_CODE_IDX],
                },
                _ => Report::Response {
                    device_index: self.device_index(),
                    sub_id,
                },
            },
            ReportId::DjLong => Report::Other {
                report_id: self.report_id,
                sub_id,
            },
        }
    }
}

/// Format a frame as `[ 10, ff, 81, ... ]` for trace logging
pub fn hex_dump(bytes: &[u8]) -> String {
    let body: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("[ {} ]", body.join(", "))
}
