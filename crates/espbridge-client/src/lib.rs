//! espbridge-client - Typed client for the bridge control protocol
//!
//! Connects to a running bridge, drives firmware uploads, issues resets
//! and button clicks, and consumes the relayed device log stream.
//!
//! # Example
//!
//! ```rust,no_run
//! use espbridge_client::BridgeClient;
//! use espbridge_core::ServerMessage;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut client = BridgeClient::connect("192.168.1.10:5000").await?;
//!
//!     // Flash a board and watch the tool's progress
//!     let bootloader = std::fs::read("bootloader.bin")?;
//!     let partitions = std::fs::read("partition-table.bin")?;
//!     let image = std::fs::read("firmware.bin")?;
//!     let progress = client
//!         .upload("MainPCB", &bootloader, &partitions, &image)
//!         .await?;
//!     println!("flashed in {} steps", progress.len());
//!
//!     // Tail the relayed serial output
//!     loop {
//!         if let ServerMessage::Log { device, text } = client.next_message().await? {
//!             println!("[{}] {}", device, text);
//!         }
//!     }
//! }
//! ```

mod client;
mod error;

pub use client::BridgeClient;
pub use error::{BridgeClientError, Result};

// Re-export the protocol vocabulary for convenience
pub use espbridge_core::{Command, ServerMessage};
