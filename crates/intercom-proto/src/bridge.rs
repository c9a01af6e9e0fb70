//! Point-to-point frame header encoding and decoding (4 bytes).
//!
//! The bridge dialect is spoken between a browser client and a single
//! device, with no relay in between:
//!
//! ```text
//!  Offset  Size  Field
//!  0       1     Message Type
//!  1       1     Flags
//!  2       2     Payload Length (little-endian)
//! ```
//!
//! There is no call id and no sequence number; the stream itself is the
//! session.

use crate::{FrameError, MAX_PAYLOAD_LEN};

/// Bridge frame header size in bytes.
pub const BRIDGE_HEADER_LEN: usize = 4;

/// Connect timeout for a bridge session, seconds.
pub const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Keepalive interval on a bridge session, seconds.
pub const PING_INTERVAL_SECS: u64 = 5;

/// A bridge peer silent for longer than this is considered gone, seconds.
pub const PING_TIMEOUT_SECS: u64 = 10;

/// Outbound audio queue depth on the bridge side, frames.
pub const TX_QUEUE_FRAMES: usize = 8;

/// No flags set.
pub const FLAG_NONE: u8 = 0x00;

/// Marks the final AUDIO frame of a stream.
pub const FLAG_END: u8 = 0x01;

/// START flag: bypass any local ring UI and stream immediately if the
/// device permits.
pub const FLAG_NO_RING: u8 = 0x02;

/// Bridge message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BridgeMessageType {
    /// PCM audio, either direction.
    Audio = 0x01,
    /// Client asks the device to begin a session.
    Start = 0x02,
    /// Client ends the session.
    Stop = 0x03,
    /// Liveness probe.
    Ping = 0x04,
    /// Liveness reply.
    Pong = 0x05,
    /// Error report (payload byte 0: code).
    Error = 0x06,
    /// Device is ringing, awaiting a local answer.
    Ring = 0x07,
    /// Local user answered; streaming may begin.
    Answer = 0x08,
}

impl TryFrom<u8> for BridgeMessageType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0x01 => Ok(Self::Audio),
            0x02 => Ok(Self::Start),
            0x03 => Ok(Self::Stop),
            0x04 => Ok(Self::Ping),
            0x05 => Ok(Self::Pong),
            0x06 => Ok(Self::Error),
            0x07 => Ok(Self::Ring),
            0x08 => Ok(Self::Answer),
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }
}

impl From<BridgeMessageType> for u8 {
    fn from(t: BridgeMessageType) -> Self {
        t as Self
    }
}

/// Error codes carried in the payload of a bridge `Error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgeErrorCode {
    /// No error.
    Ok = 0x00,
    /// Device is already in a session.
    Busy = 0x01,
    /// Request was not valid in the current state.
    Invalid = 0x02,
    /// Device is not ready to stream.
    NotReady = 0x03,
    /// Device-side failure.
    Internal = 0xFF,
}

impl From<u8> for BridgeErrorCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Ok,
            0x01 => Self::Busy,
            0x02 => Self::Invalid,
            0x03 => Self::NotReady,
            _ => Self::Internal,
        }
    }
}

/// Bridge frame header (4 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeHeader {
    /// Message type.
    pub msg_type: BridgeMessageType,
    /// Flags ([`FLAG_END`], [`FLAG_NO_RING`]).
    pub flags: u8,
    /// Payload length in bytes.
    pub length: u16,
}

impl BridgeHeader {
    /// Create a header with no payload and no flags.
    #[must_use]
    pub fn control(msg_type: BridgeMessageType) -> Self {
        Self {
            msg_type,
            flags: FLAG_NONE,
            length: 0,
        }
    }

    /// Encode the header into a 4-byte buffer.
    #[must_use]
    pub fn encode(&self) -> [u8; BRIDGE_HEADER_LEN] {
        let mut buf = [0u8; BRIDGE_HEADER_LEN];
        buf[0] = self.msg_type.into();
        buf[1] = self.flags;
        buf[2..4].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    /// Decode a header from a byte buffer.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::TooShort` if the buffer is smaller than 4
    /// bytes, `FrameError::UnknownMessageType` for a type byte outside the
    /// dialect, and `FrameError::PayloadTooLarge` when the announced length
    /// exceeds [`MAX_PAYLOAD_LEN`].
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < BRIDGE_HEADER_LEN {
            return Err(FrameError::TooShort {
                expected: BRIDGE_HEADER_LEN,
                actual: buf.len(),
            });
        }

        let msg_type = BridgeMessageType::try_from(buf[0])?;
        let flags = buf[1];
        let length = u16::from_le_bytes([buf[2], buf[3]]);
        if length as usize > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge {
                len: length as usize,
                max: MAX_PAYLOAD_LEN,
            });
        }

        Ok(Self {
            msg_type,
            flags,
            length,
        })
    }

    /// Check whether a flag bit is set.
    #[must_use]
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}
