use thiserror::Error;

use crate::protocol::ResponseCode;

/// Errors that can occur when talking to a DIRCON device
#[derive(Error, Debug)]
pub enum DirconError {
    /// Socket level failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TCP connection could not be established
    #[error("Failed to connect to {address}: {reason}")]
    ConnectionFailed {
        /// `host:port` that was dialed
        address: String,
        /// Underlying failure description
        reason: String,
    },

    /// Connection was closed by the peer or locally
    #[error("Device disconnected")]
    Disconnected,

    /// Operation requires an established session
    #[error("Session is not connected")]
    NotConnected,

    /// No data arrived in time
    #[error("Timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Malformed or unexpected traffic
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Device answered with a non-success response code
    #[error("Device error: {code}")]
    Device {
        /// Response code reported by the device
        code: ResponseCode,
    },

    /// Characteristic payload could not be decoded
    #[error("Failed to parse payload: {0}")]
    ParseError(String),

    /// Discovery produced no usable read or notify command
    #[error("Configuration failed: {0}")]
    Configuration(String),

    /// Requested write is not supported for this metric or device
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Caller supplied a value that cannot be encoded
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

/// Result type for DIRCON operations
pub type Result<T> = std::result::Result<T, DirconError>;

impl DirconError {
    /// Check if this error indicates a transport issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::ConnectionFailed { .. }
                | Self::Disconnected
                | Self::NotConnected
                | Self::Timeout { .. }
        )
    }

    /// Check if this error was raised by the device or by malformed traffic
    #[must_use]
    pub const fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::Device { .. } | Self::ParseError(_)
        )
    }

    /// Check if retrying the session could plausibly succeed
    ///
    /// Local caller mistakes never go away by reconnecting.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::UnsupportedOperation(_) | Self::InvalidParameters(_)
        )
    }
}
