//! # Intercom wire format
//!
//! Frame encoding and decoding for the intercom relay. Two framing dialects
//! coexist on different ports:
//!
//! - **Broker framing** ([`broker`]): the 12-byte header spoken between
//!   devices and the relay on port 6060. Carries a call id and a per-sender
//!   sequence number so audio can be routed between call endpoints.
//! - **Point-to-point framing** ([`bridge`]): the 4-byte header spoken by a
//!   browser bridge talking directly to a single device on port 6054. No
//!   call id, no sequence number.
//!
//! All multi-byte header fields are little-endian. Payloads are capped at
//! [`MAX_PAYLOAD_LEN`] bytes; a header announcing more is a protocol error
//! and the connection carrying it must be closed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod broker;
pub mod error;
pub mod roster;

pub use error::FrameError;

/// Maximum payload length accepted on either dialect.
pub const MAX_PAYLOAD_LEN: usize = 4096;

/// Default TCP port for broker framing (device <-> relay).
pub const BROKER_PORT: u16 = 6060;

/// Default TCP port for point-to-point framing (bridge <-> device).
pub const BRIDGE_PORT: u16 = 6054;

/// Audio sample rate in Hz.
pub const SAMPLE_RATE: u32 = 16_000;

/// Bits per PCM sample (signed little-endian).
pub const BITS_PER_SAMPLE: u32 = 16;

/// Channel count (mono).
pub const CHANNELS: u32 = 1;

/// Samples per audio frame.
pub const SAMPLES_PER_FRAME: usize = 256;

/// Bytes per audio frame (256 samples x 16 bits).
pub const FRAME_BYTES: usize = SAMPLES_PER_FRAME * 2;

/// Approximate duration of one audio frame in milliseconds.
pub const FRAME_DURATION_MS: u64 = 16;
