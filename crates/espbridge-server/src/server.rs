//! TCP listener and runtime
//!
//! Binds the control port, opens the configured devices and spawns one
//! session task per accepted client. The accept loop polls a shared
//! running flag so shutdown latency is bounded.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::hub::BroadcastHub;
use crate::registry::DeviceRegistry;
use crate::serial::SerialOpener;
use crate::session;

/// Accept poll period; bounds how long shutdown can lag the flag
const ACCEPT_POLL: Duration = Duration::from_millis(500);

/// The provisioning bridge server
pub struct BridgeServer {
    config: Arc<BridgeConfig>,
    registry: Arc<DeviceRegistry>,
    hub: Arc<BroadcastHub>,
    running: Arc<AtomicBool>,
    listener: TcpListener,
}

impl BridgeServer {
    /// Bind the listener and open every configured device
    ///
    /// Devices that fail to open stay closed; the server still starts so
    /// the remaining boards are usable.
    pub async fn bind(
        config: BridgeConfig,
        opener: Arc<dyn SerialOpener>,
    ) -> std::io::Result<BridgeServer> {
        let config = Arc::new(config);
        let running = Arc::new(AtomicBool::new(true));
        let hub = Arc::new(BroadcastHub::new());
        let registry = Arc::new(DeviceRegistry::new(
            config.devices.clone(),
            config.serial.baud,
            Duration::from_millis(config.serial.read_timeout_ms),
            opener,
            hub.clone(),
            running.clone(),
        ));
        registry.open_all();

        let listener = TcpListener::bind(config.server.listen_addr()).await?;
        info!(addr = %listener.local_addr()?, "Bridge listening");

        Ok(BridgeServer {
            config,
            registry,
            hub,
            running,
            listener,
        })
    }

    /// The address the listener actually bound
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Flag that stops the accept loop and every relay when cleared
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Serve until the running flag is cleared, then close all devices
    pub async fn run(self) {
        while self.running.load(Ordering::SeqCst) {
            match timeout(ACCEPT_POLL, self.listener.accept()).await {
                // Idle tick, re-check the flag
                Err(_) => continue,
                Ok(Ok((stream, peer))) => {
                    tokio::spawn(session::run(
                        stream,
                        peer,
                        self.registry.clone(),
                        self.hub.clone(),
                        self.config.clone(),
                        self.running.clone(),
                    ));
                }
                Ok(Err(error)) => {
                    warn!(error = %error, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        info!("Accept loop stopped, closing devices");
        self.registry.close_all().await;
    }
}
