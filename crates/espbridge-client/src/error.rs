//! Error types for bridge client operations

use thiserror::Error;

/// Result type alias for bridge client operations
pub type Result<T> = std::result::Result<T, BridgeClientError>;

/// Errors that can occur while talking to the bridge
#[derive(Error, Debug)]
pub enum BridgeClientError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The bridge closed the connection
    #[error("Connection closed by the bridge")]
    Closed,

    /// The bridge answered with an `ERROR:` frame
    #[error("Bridge rejected the request: {0}")]
    Rejected(String),

    /// An unexpected frame arrived where a status reply was required
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No reply arrived in time
    #[error("Timed out waiting for the bridge")]
    Timeout,
}
