//! Error types for bridge sessions.

use intercom_proto::bridge::BridgeErrorCode;
use thiserror::Error;

/// Errors that can occur on a point-to-point session.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// TCP connect did not complete within the connect timeout.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The device did not respond to START in time.
    #[error("start handshake timed out")]
    HandshakeTimeout,

    /// The device refused the session.
    #[error("device rejected session: {0:?}")]
    Rejected(BridgeErrorCode),

    /// `start` was called on a session that is already running.
    #[error("session already started")]
    AlreadyStarted,

    /// The session is closed.
    #[error("session closed")]
    Closed,

    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device sent a malformed frame.
    #[error("frame error: {0}")]
    Frame(#[from] intercom_proto::FrameError),
}

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
