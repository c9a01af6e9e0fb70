//! Broker frame header encoding and decoding (12 bytes).
//!
//! The broker header is a fixed 12-byte structure:
//!
//! ```text
//!  Offset  Size  Field
//!  0       1     Message Type
//!  1       1     Flags
//!  2       2     Payload Length (little-endian)
//!  4       4     Call ID (little-endian)
//!  8       4     Sequence Number (little-endian)
//! ```
//!
//! Control messages carry `seq = 0`; AUDIO carries the sender's monotonic
//! per-call sequence, which the relay preserves verbatim.

use crate::{FrameError, MAX_PAYLOAD_LEN};

/// Broker frame header size in bytes.
pub const BROKER_HEADER_LEN: usize = 12;

/// Ring timeout for unanswered calls, seconds.
pub const CALL_TIMEOUT_SECS: u64 = 30;

/// Keepalive interval on idle broker connections, seconds.
pub const PING_INTERVAL_SECS: u64 = 10;

/// A peer silent for longer than this is considered gone, seconds.
pub const PING_TIMEOUT_SECS: u64 = 30;

/// Per-device audio queue capacity in frames (~160 ms of audio).
pub const AUDIO_QUEUE_FRAMES: usize = 10;

/// The audio TX pump flushes at least every this many frames.
pub const FLUSH_EVERY_FRAMES: u32 = 10;

/// Broker message types.
///
/// Ranges:
/// - Signalling (0x10-0x16): registration and call control
/// - Media (0x17): relayed PCM audio
/// - Roster and liveness (0x18-0x1A)
/// - Errors (0x1B)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BrokerMessageType {
    /// Device announces its identifier (payload: UTF-8 id, NUL-trimmed).
    Register = 0x10,
    /// Start a call (payload: target id).
    Invite = 0x11,
    /// Relay to callee: incoming call (payload: caller id, NUL-terminated).
    Ring = 0x12,
    /// Callee accepts; relay forwards to caller.
    Answer = 0x13,
    /// Callee rejects (payload byte 0: reason).
    Decline = 0x14,
    /// Either party ends the call.
    Hangup = 0x15,
    /// Relay to the remaining peer: call is over.
    Bye = 0x16,
    /// PCM audio (payload: samples; seq per-sender monotonic).
    Audio = 0x17,
    /// Roster snapshot (payload: JSON array of contacts).
    Contacts = 0x18,
    /// Liveness probe.
    Ping = 0x19,
    /// Liveness reply.
    Pong = 0x1A,
    /// Error report (payload byte 0: code).
    Error = 0x1B,
}

/// Lookup table for broker message type validation.
/// Maps byte value to validity: 0 = invalid, non-zero = valid.
static BROKER_TYPE_TABLE: [u8; 256] = {
    let mut table = [0u8; 256];
    table[0x10] = 1; // Register
    table[0x11] = 1; // Invite
    table[0x12] = 1; // Ring
    table[0x13] = 1; // Answer
    table[0x14] = 1; // Decline
    table[0x15] = 1; // Hangup
    table[0x16] = 1; // Bye
    table[0x17] = 1; // Audio
    table[0x18] = 1; // Contacts
    table[0x19] = 1; // Ping
    table[0x1A] = 1; // Pong
    table[0x1B] = 1; // Error
    table
};

impl BrokerMessageType {
    /// Check if this is a call-signalling message (0x10-0x16).
    #[must_use]
    pub fn is_signalling(self) -> bool {
        (self as u8) < 0x17
    }

    /// Check if this is relayed media.
    #[must_use]
    pub fn is_audio(self) -> bool {
        self == Self::Audio
    }
}

impl TryFrom<u8> for BrokerMessageType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        if BROKER_TYPE_TABLE[value as usize] == 0 {
            return Err(FrameError::UnknownMessageType(value));
        }
        // SAFETY: the table above only marks discriminants of this
        // repr(u8) enum as valid.
        Ok(unsafe { std::mem::transmute::<u8, Self>(value) })
    }
}

impl From<BrokerMessageType> for u8 {
    fn from(t: BrokerMessageType) -> Self {
        t as Self
    }
}

/// Error codes carried in the payload of an `Error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BrokerErrorCode {
    /// INVITE target is not registered.
    NotFound = 0x01,
    /// Caller or target is already in a call.
    Busy = 0x02,
    /// Ring timed out without an answer.
    Timeout = 0x03,
    /// Command violated the protocol (e.g. unregistered caller).
    Protocol = 0x04,
}

impl TryFrom<u8> for BrokerErrorCode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0x01 => Ok(Self::NotFound),
            0x02 => Ok(Self::Busy),
            0x03 => Ok(Self::Timeout),
            0x04 => Ok(Self::Protocol),
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }
}

/// Reason byte carried by DECLINE.
///
/// Any byte other than `0x00` decodes as [`DeclineReason::Rejected`]; an
/// empty DECLINE payload is read as [`DeclineReason::Busy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DeclineReason {
    /// Callee is occupied.
    #[default]
    Busy = 0x00,
    /// Callee refused the call.
    Rejected = 0x01,
}

impl DeclineReason {
    /// Decode the reason from a DECLINE payload.
    #[must_use]
    pub fn from_payload(payload: &[u8]) -> Self {
        match payload.first() {
            None | Some(0x00) => Self::Busy,
            Some(_) => Self::Rejected,
        }
    }
}

/// Broker frame header (12 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerHeader {
    /// Message type.
    pub msg_type: BrokerMessageType,
    /// Flags (reserved, currently always 0).
    pub flags: u8,
    /// Payload length in bytes.
    pub length: u16,
    /// Call id (0 outside of calls).
    pub call_id: u32,
    /// Per-sender sequence number (audio only; 0 on control frames).
    pub seq: u32,
}

impl BrokerHeader {
    /// Create a control header with no payload.
    #[must_use]
    pub fn control(msg_type: BrokerMessageType, call_id: u32) -> Self {
        Self {
            msg_type,
            flags: 0,
            length: 0,
            call_id,
            seq: 0,
        }
    }

    /// Encode the header into a 12-byte buffer.
    #[must_use]
    pub fn encode(&self) -> [u8; BROKER_HEADER_LEN] {
        let mut buf = [0u8; BROKER_HEADER_LEN];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode the header into a pre-allocated buffer.
    ///
    /// # Panics
    ///
    /// Panics if `buf.len() < 12`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0] = self.msg_type.into();
        buf[1] = self.flags;
        buf[2..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.call_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.seq.to_le_bytes());
    }

    /// Decode a header from a byte buffer.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::TooShort` if the buffer is smaller than 12
    /// bytes, `FrameError::UnknownMessageType` for a type byte outside the
    /// dialect, and `FrameError::PayloadTooLarge` when the announced length
    /// exceeds [`MAX_PAYLOAD_LEN`].
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < BROKER_HEADER_LEN {
            return Err(FrameError::TooShort {
                expected: BROKER_HEADER_LEN,
                actual: buf.len(),
            });
        }

        let msg_type = BrokerMessageType::try_from(buf[0])?;
        let flags = buf[1];
        let length = u16::from_le_bytes([buf[2], buf[3]]);
        if length as usize > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge {
                len: length as usize,
                max: MAX_PAYLOAD_LEN,
            });
        }
        let call_id = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let seq = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);

        Ok(Self {
            msg_type,
            flags,
            length,
            call_id,
            seq,
        })
    }
}

/// Trim trailing NULs from an id payload and decode it as UTF-8.
///
/// Device ids travel as NUL-padded UTF-8; invalid UTF-8 yields `None`.
#[must_use]
pub fn decode_id(payload: &[u8]) -> Option<&str> {
    let end = payload
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |pos| pos + 1);
    std::str::from_utf8(&payload[..end]).ok()
}
