//! Protocol error types

use thiserror::Error;

/// Errors raised while decoding or building receiver reports
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Zero-length buffer
    #[error("Empty report")]
    Empty,

    /// First byte is not a report id of the receiver
    #[error("Unknown report id: {0:#04x}")]
    UnknownReportId(u8),

    /// Buffer length does not match the length fixed by the report id
    #[error("Report {report_id:#04x} must be {expected} bytes, got {actual}")]
    LengthMismatch {
        report_id: u8,
        expected: usize,
        actual: usize,
    },

    /// Payload shorter than the field being read
    #[error("Truncated report payload")]
    Truncated,
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
