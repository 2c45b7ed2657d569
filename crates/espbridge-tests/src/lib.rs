//! Integration tests for the provisioning bridge
//!
//! This crate contains end-to-end tests that exercise the full stack:
//! - TCP control protocol (commands, replies, broadcasts)
//! - Stop-and-wait file transfers
//! - Flash orchestration with a scripted tool
//! - Serial relay lifecycle around flashing
//!
//! # Running Tests
//!
//! The tests run entirely in-process against mock serial ports and use
//! `sh` as a stand-in flash tool, so no hardware or setup is needed:
//!
//! ```bash
//! cargo test -p espbridge-tests
//! ```
//!
//! # Test Structure
//!
//! - `bridge_e2e_test.rs` - Full stack tests driven through BridgeClient
//! - `protocol_edge_test.rs` - Wire-level framing and disconnect edge cases

// This crate only contains tests, no library code
