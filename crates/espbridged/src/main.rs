//! espbridged - Provisioning bridge daemon
//!
//! Bridges bench clients on TCP to the serial devices of a provisioning
//! rig: relays device logs, receives firmware uploads and drives the
//! flash tool.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default config search path
//! ./espbridged
//!
//! # Run with an explicit config file
//! ./espbridged --config config/espbridge.toml
//!
//! # Override the listen address
//! ./espbridged --listen 127.0.0.1:6000
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use espbridge_server::{BridgeConfig, BridgeServer, NativeSerialOpener};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Config path tried when --config is not given
const DEFAULT_CONFIG_PATH: &str = "config/espbridge.toml";

#[derive(Parser, Debug)]
#[command(name = "espbridged")]
#[command(about = "Provisioning bridge daemon for firmware benches")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        "espbridged=debug,espbridge_server=debug"
    } else {
        "espbridged=info,espbridge_server=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting espbridged (provisioning bridge daemon)");

    let mut config = load_config(&args)?;
    if let Some(listen) = &args.listen {
        apply_listen_override(&mut config, listen)?;
    }
    warn_on_dangling_buttons(&config);

    let server = BridgeServer::bind(config, Arc::new(NativeSerialOpener)).await?;
    let running = server.running_flag();
    let server_handle = tokio::spawn(server.run());

    // Wait for Ctrl+C
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    running.store(false, Ordering::SeqCst);
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    Ok(())
}

fn load_config(args: &Args) -> Result<BridgeConfig> {
    if let Some(path) = &args.config {
        info!(path = %path.display(), "Loading configuration");
        return BridgeConfig::load(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", path.display(), e));
    }

    if Path::new(DEFAULT_CONFIG_PATH).exists() {
        info!(path = %DEFAULT_CONFIG_PATH, "Loading configuration");
        return BridgeConfig::load(DEFAULT_CONFIG_PATH)
            .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", DEFAULT_CONFIG_PATH, e));
    }

    warn!("No configuration file found, starting with defaults (no devices)");
    Ok(BridgeConfig::default())
}

fn apply_listen_override(config: &mut BridgeConfig, listen: &str) -> Result<()> {
    let (host, port) = listen
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("Invalid listen address '{}', expected host:port", listen))?;
    config.server.host = host.to_string();
    config.server.port = port
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen port '{}': {}", port, e))?;
    Ok(())
}

/// A button pointing at a device that is not configured will fail every
/// click; surface that at startup instead of at first use.
fn warn_on_dangling_buttons(config: &BridgeConfig) {
    for (button, device) in &config.buttons {
        if !config.devices.contains_key(device) {
            warn!(button = %button, device = %device, "Button maps to an unknown device");
        }
    }
}
