//! Error types for the broker service.

use thiserror::Error;

/// Errors that can occur while running the broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Failed to bind the listening socket.
    #[error("failed to bind broker listener: {0}")]
    Bind(std::io::Error),

    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A peer sent a malformed frame.
    #[error("frame error: {0}")]
    Frame(#[from] intercom_proto::FrameError),

    /// `start` was called on a broker that is already running.
    #[error("broker already started")]
    AlreadyStarted,
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
