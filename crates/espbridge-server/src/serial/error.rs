//! Serial layer error type

use thiserror::Error;

/// Errors from the serial link layer
#[derive(Debug, Error)]
pub enum SerialError {
    /// Port could not be opened or a control line could not be driven
    #[error("Serial port error: {0}")]
    Port(#[from] tokio_serial::Error),

    /// IO error on an open link
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The link's relay task is gone; the device is effectively closed
    #[error("Serial link closed")]
    Closed,
}
