//! espbridge-server - Provisioning bridge runtime
//!
//! This crate provides the bridge server that owns the bench's serial
//! devices, relays their log output to every connected TCP client, and
//! orchestrates firmware uploads through an external flash tool.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     BridgeServer                        │
//! │                                                         │
//! │  accept loop ──► ControlSession (one per client)        │
//! │                      │        ▲                         │
//! │              commands│        │replies + broadcasts     │
//! │                      ▼        │                         │
//! │  ┌──────────────┐  ┌──────────┴───┐  ┌──────────────┐  │
//! │  │DeviceRegistry│  │ BroadcastHub │  │ flash / xfer │  │
//! │  └──────┬───────┘  └──────▲───────┘  └──────────────┘  │
//! │         │ owns            │ LOG lines                  │
//! │         ▼                 │                            │
//! │   relay task per open device ──► serial port           │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod camera;
pub mod config;
pub mod flash;
pub mod hub;
pub mod registry;
pub mod relay;
pub mod serial;
pub mod server;
pub mod session;
pub mod transfer;

pub use config::{BridgeConfig, ConfigError};
pub use hub::BroadcastHub;
pub use registry::DeviceRegistry;
pub use serial::{NativeSerialOpener, SerialOpener};
pub use server::BridgeServer;
