//! espbridge-core - Shared wire-protocol types for the ESP bridge
//!
//! This crate defines the vocabulary spoken between the bridge daemon and its
//! control clients: inbound commands, outbound status/log messages, the
//! stop-and-wait file-transfer framing, and the error taxonomy. It carries no
//! I/O; both the server and the client crates build on it.

pub mod command;
pub mod error;
pub mod event;
pub mod framing;
pub mod message;

pub use command::Command;
pub use error::{BridgeError, BridgeResult};
pub use event::{EventSource, LogEvent};
pub use framing::{FileRole, SIZE_ACK, SIZE_HEADER_LEN};
pub use message::ServerMessage;
