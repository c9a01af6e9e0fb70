//! Frame codec error types.

use thiserror::Error;

/// Errors produced while encoding or decoding frame headers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Buffer is smaller than the fixed header size.
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    TooShort {
        /// Bytes required by the header.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// Message type byte is not part of the dialect.
    #[error("unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),

    /// Header announces a payload longer than the protocol allows.
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge {
        /// Announced payload length.
        len: usize,
        /// Maximum allowed payload length.
        max: usize,
    },

    /// Roster payload is not valid JSON.
    #[error("malformed roster payload: {0}")]
    MalformedRoster(String),
}
