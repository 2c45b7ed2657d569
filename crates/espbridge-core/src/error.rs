//! Common error types for bridge operations

use thiserror::Error;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that can occur while serving bridge commands
///
/// The `Display` text of a variant is what clients receive after the
/// `ERROR:` prefix, so the wording here is part of the wire contract.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Command names a device or button that is not configured
    #[error("Target {0} not found")]
    TargetNotFound(String),

    /// Button token has no device mapping
    #[error("Target for {0} not found")]
    ButtonNotFound(String),

    /// Serial port absent at startup or closed after a failed reopen
    #[error("Port unavailable for {device}: {reason}")]
    PortUnavailable {
        /// Logical device name
        device: String,
        /// What the serial layer reported
        reason: String,
    },

    /// Device is mid-flash; uploads are serialized per device
    #[error("Device {0} is busy flashing")]
    Busy(String),

    /// Transfer size header was not a non-negative ASCII decimal
    #[error("Malformed size header: {0}")]
    Framing(String),

    /// Staged artifact length differs from the declared size
    #[error("Size mismatch: declared {declared}, staged {actual}")]
    SizeMismatch {
        /// Byte count announced in the 16-byte header
        declared: u64,
        /// Byte count actually staged
        actual: u64,
    },

    /// Local disk trouble while staging artifacts; the reason carries no
    /// server-side paths
    #[error("Staging failed: {0}")]
    Staging(String),

    /// Peer disconnected mid-operation
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Flashing tool exited with a non-zero code
    #[error("Flash tool exited with code {0}")]
    FlashToolFailed(i32),

    /// Flashing tool binary missing, not executable or misconfigured
    #[error("Flash tool could not start: {0}")]
    FlashToolUnavailable(String),

    /// Device could not be reopened after a flash
    #[error("Failed to reopen {device} after flash: {reason}")]
    ReopenFailed {
        /// Logical device name
        device: String,
        /// What the serial layer reported
        reason: String,
    },

    /// No capture command configured, or the capture produced nothing
    #[error("Camera not available")]
    CameraUnavailable,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// True when the error ends the client session rather than just the
    /// current command (transport-level failures)
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::ConnectionClosed | BridgeError::Io(_))
    }
}
