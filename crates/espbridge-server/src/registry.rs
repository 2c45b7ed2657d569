//! Device registry
//!
//! Owns the lifecycle of every configured device. State transitions all go
//! through the registry's lock; the serial handles themselves live inside
//! relay tasks, so the registry coordinates rather than performs I/O. Exactly
//! one of {relay loop, flash tool} can hold a device's port at any instant,
//! enforced by the begin/finish flash handoff.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use espbridge_core::{BridgeError, BridgeResult};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::hub::BroadcastHub;
use crate::relay::{spawn_relay, RelayClient, RelayHandle};
use crate::serial::{SerialError, SerialOpener};

enum DeviceState {
    Closed,
    Open(RelayHandle),
    Flashing,
}

struct DeviceEntry {
    path: String,
    state: DeviceState,
}

/// Tracks configured serial devices and their open/closed/flashing state
pub struct DeviceRegistry {
    devices: Mutex<BTreeMap<String, DeviceEntry>>,
    opener: Arc<dyn SerialOpener>,
    hub: Arc<BroadcastHub>,
    baud: u32,
    read_timeout: Duration,
    running: Arc<AtomicBool>,
}

impl DeviceRegistry {
    pub fn new(
        device_map: BTreeMap<String, String>,
        baud: u32,
        read_timeout: Duration,
        opener: Arc<dyn SerialOpener>,
        hub: Arc<BroadcastHub>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let devices = device_map
            .into_iter()
            .map(|(name, path)| {
                (
                    name,
                    DeviceEntry {
                        path,
                        state: DeviceState::Closed,
                    },
                )
            })
            .collect();
        Self {
            devices: Mutex::new(devices),
            opener,
            hub,
            baud,
            read_timeout,
            running,
        }
    }

    /// Attempt to open every configured device
    ///
    /// Failures are logged and leave that device closed; the rest of the
    /// system runs with whatever subset is available.
    pub fn open_all(&self) {
        for name in self.device_names() {
            if let Err(error) = self.open(&name) {
                warn!(device = %name, error = %error, "Device unavailable at startup");
            }
        }
    }

    /// Configured device names, in stable order
    pub fn device_names(&self) -> Vec<String> {
        self.devices.lock().keys().cloned().collect()
    }

    /// Whether `name` appears in the configuration at all
    pub fn is_known(&self, name: &str) -> bool {
        self.devices.lock().contains_key(name)
    }

    /// Whether `name` currently has a running relay
    pub fn is_open(&self, name: &str) -> bool {
        matches!(
            self.devices.lock().get(name).map(|e| &e.state),
            Some(DeviceState::Open(_))
        )
    }

    /// Open a device and start its relay loop
    ///
    /// Opening an already open device is a no-op; a device mid-flash cannot
    /// be opened.
    pub fn open(&self, name: &str) -> BridgeResult<()> {
        let mut devices = self.devices.lock();
        let entry = devices
            .get_mut(name)
            .ok_or_else(|| BridgeError::TargetNotFound(name.to_string()))?;
        match entry.state {
            DeviceState::Open(_) => Ok(()),
            DeviceState::Flashing => Err(BridgeError::Busy(name.to_string())),
            DeviceState::Closed => {
                let link = self
                    .opener
                    .open(&entry.path, self.baud)
                    .map_err(|e| self.port_error(name, e))?;
                let handle = spawn_relay(
                    name.to_string(),
                    link,
                    self.hub.clone(),
                    self.read_timeout,
                    self.running.clone(),
                );
                entry.state = DeviceState::Open(handle);
                info!(device = %name, path = %entry.path, baud = self.baud, "Serial device opened");
                Ok(())
            }
        }
    }

    /// Close a device, stopping its relay loop first
    pub async fn close(&self, name: &str) -> BridgeResult<()> {
        let handle = {
            let mut devices = self.devices.lock();
            let entry = devices
                .get_mut(name)
                .ok_or_else(|| BridgeError::TargetNotFound(name.to_string()))?;
            if matches!(entry.state, DeviceState::Flashing) {
                return Err(BridgeError::Busy(name.to_string()));
            }
            match std::mem::replace(&mut entry.state, DeviceState::Closed) {
                DeviceState::Open(handle) => Some(handle),
                _ => None,
            }
        };
        if let Some(handle) = handle {
            handle.shutdown().await;
            info!(device = %name, "Serial device closed");
        }
        Ok(())
    }

    /// Close every device that can be closed (process shutdown path)
    pub async fn close_all(&self) {
        for name in self.device_names() {
            let _ = self.close(&name).await;
        }
    }

    /// Route raw bytes onto a device's serial link
    pub async fn write(&self, name: &str, bytes: Vec<u8>) -> BridgeResult<()> {
        let client = self.relay_client(name)?;
        client
            .write(bytes)
            .await
            .map_err(|e| self.port_error(name, e))
    }

    /// Pulse a device's reset lines
    pub async fn pulse_reset(&self, name: &str) -> BridgeResult<()> {
        let client = self.relay_client(name)?;
        client
            .pulse_reset()
            .await
            .map_err(|e| self.port_error(name, e))
    }

    /// Check that an upload may start against this device right now
    pub fn ensure_uploadable(&self, name: &str) -> BridgeResult<()> {
        let devices = self.devices.lock();
        let entry = devices
            .get(name)
            .ok_or_else(|| BridgeError::TargetNotFound(name.to_string()))?;
        match entry.state {
            DeviceState::Open(_) => Ok(()),
            DeviceState::Flashing => Err(BridgeError::Busy(name.to_string())),
            DeviceState::Closed => Err(BridgeError::PortUnavailable {
                device: name.to_string(),
                reason: "device is closed".to_string(),
            }),
        }
    }

    /// Transition a device to flashing: stop its relay, release the port
    ///
    /// Waits for the relay to acknowledge before returning, so the caller may
    /// hand the returned serial address straight to the flash tool.
    pub async fn begin_flash(&self, name: &str) -> BridgeResult<String> {
        let (path, handle) = {
            let mut devices = self.devices.lock();
            let entry = devices
                .get_mut(name)
                .ok_or_else(|| BridgeError::TargetNotFound(name.to_string()))?;
            match std::mem::replace(&mut entry.state, DeviceState::Flashing) {
                DeviceState::Open(handle) => (entry.path.clone(), handle),
                DeviceState::Flashing => return Err(BridgeError::Busy(name.to_string())),
                DeviceState::Closed => {
                    entry.state = DeviceState::Closed;
                    return Err(BridgeError::PortUnavailable {
                        device: name.to_string(),
                        reason: "device is closed".to_string(),
                    });
                }
            }
        };
        handle.shutdown().await;
        info!(device = %name, "Relay stopped, port released for flashing");
        Ok(path)
    }

    /// Reopen a device after a flash, whatever the flash outcome was
    ///
    /// On reopen failure the device is left closed and the error is loud;
    /// later commands against it fail with the port error.
    pub fn finish_flash(&self, name: &str) -> BridgeResult<()> {
        let mut devices = self.devices.lock();
        let entry = devices
            .get_mut(name)
            .ok_or_else(|| BridgeError::TargetNotFound(name.to_string()))?;
        match self.opener.open(&entry.path, self.baud) {
            Ok(link) => {
                let handle = spawn_relay(
                    name.to_string(),
                    link,
                    self.hub.clone(),
                    self.read_timeout,
                    self.running.clone(),
                );
                entry.state = DeviceState::Open(handle);
                info!(device = %name, "Serial device reopened after flash");
                Ok(())
            }
            Err(e) => {
                entry.state = DeviceState::Closed;
                error!(
                    device = %name,
                    path = %entry.path,
                    error = %e,
                    "Could not reopen device after flash, leaving it closed"
                );
                Err(BridgeError::ReopenFailed {
                    device: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn relay_client(&self, name: &str) -> BridgeResult<RelayClient> {
        let devices = self.devices.lock();
        let entry = devices
            .get(name)
            .ok_or_else(|| BridgeError::TargetNotFound(name.to_string()))?;
        match &entry.state {
            DeviceState::Open(handle) => Ok(handle.client()),
            DeviceState::Flashing => Err(BridgeError::Busy(name.to_string())),
            DeviceState::Closed => Err(BridgeError::PortUnavailable {
                device: name.to_string(),
                reason: "device is closed".to_string(),
            }),
        }
    }

    fn port_error(&self, name: &str, e: SerialError) -> BridgeError {
        BridgeError::PortUnavailable {
            device: name.to_string(),
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::mock::MockSerialOpener;
    use espbridge_core::ServerMessage;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const TEST_READ_TIMEOUT: Duration = Duration::from_millis(50);

    fn test_addr() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    fn build_registry(
        devices: &[(&str, &str)],
    ) -> (Arc<DeviceRegistry>, Arc<MockSerialOpener>, Arc<BroadcastHub>) {
        let opener = Arc::new(MockSerialOpener::new());
        let hub = Arc::new(BroadcastHub::new());
        let map: BTreeMap<String, String> = devices
            .iter()
            .map(|(n, p)| (n.to_string(), p.to_string()))
            .collect();
        let registry = Arc::new(DeviceRegistry::new(
            map,
            115_200,
            TEST_READ_TIMEOUT,
            opener.clone(),
            hub.clone(),
            Arc::new(AtomicBool::new(true)),
        ));
        (registry, opener, hub)
    }

    #[tokio::test]
    async fn open_all_tolerates_missing_ports() {
        let (registry, opener, _hub) =
            build_registry(&[("MainPCB", "/dev/mock0"), ("SlavePCB", "/dev/mock1")]);
        opener.set_failing("/dev/mock1", true);

        registry.open_all();

        assert!(registry.is_open("MainPCB"));
        assert!(!registry.is_open("SlavePCB"));
        // The failed device is still commandable-by-name, just unavailable
        let err = registry.write("SlavePCB", b"x\n".to_vec()).await.unwrap_err();
        assert!(matches!(err, BridgeError::PortUnavailable { .. }));
    }

    #[tokio::test]
    async fn unknown_devices_are_rejected() {
        let (registry, _opener, _hub) = build_registry(&[("MainPCB", "/dev/mock0")]);
        assert!(matches!(
            registry.open("Board9"),
            Err(BridgeError::TargetNotFound(_))
        ));
        assert!(matches!(
            registry.pulse_reset("Board9").await,
            Err(BridgeError::TargetNotFound(_))
        ));
    }

    #[tokio::test]
    async fn writes_reach_the_device_link() {
        let (registry, opener, _hub) = build_registry(&[("MainPCB", "/dev/mock0")]);
        registry.open_all();

        registry
            .write("MainPCB", b"SW_CLICK\n".to_vec())
            .await
            .unwrap();

        let serial = opener.handle("/dev/mock0").unwrap();
        assert_eq!(serial.written(), b"SW_CLICK\n");
    }

    #[tokio::test]
    async fn begin_flash_releases_the_port_and_marks_busy() {
        let (registry, _opener, _hub) = build_registry(&[("MainPCB", "/dev/mock0")]);
        registry.open_all();

        let path = registry.begin_flash("MainPCB").await.unwrap();
        assert_eq!(path, "/dev/mock0");
        assert!(!registry.is_open("MainPCB"));
        assert!(matches!(
            registry.ensure_uploadable("MainPCB"),
            Err(BridgeError::Busy(_))
        ));
        assert!(matches!(
            registry.write("MainPCB", b"x".to_vec()).await,
            Err(BridgeError::Busy(_))
        ));
        // A second flash attempt against the same device is rejected
        assert!(matches!(
            registry.begin_flash("MainPCB").await,
            Err(BridgeError::Busy(_))
        ));
    }

    #[tokio::test]
    async fn finish_flash_restarts_the_relay() {
        let (registry, opener, hub) = build_registry(&[("MainPCB", "/dev/mock0")]);
        registry.open_all();
        assert_eq!(opener.open_count("/dev/mock0"), 1);

        registry.begin_flash("MainPCB").await.unwrap();
        registry.finish_flash("MainPCB").unwrap();

        assert!(registry.is_open("MainPCB"));
        assert_eq!(opener.open_count("/dev/mock0"), 2);

        // The fresh relay delivers lines again
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register(test_addr(), tx);
        let serial = opener.handle("/dev/mock0").unwrap();
        serial.inject_line("back alive");
        let msg = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(
            msg.unwrap(),
            ServerMessage::Log {
                device: "MainPCB".to_string(),
                text: "back alive".to_string()
            }
        );
    }

    #[tokio::test]
    async fn failed_reopen_leaves_device_closed() {
        let (registry, opener, _hub) = build_registry(&[("MainPCB", "/dev/mock0")]);
        registry.open_all();

        registry.begin_flash("MainPCB").await.unwrap();
        opener.set_failing("/dev/mock0", true);

        let err = registry.finish_flash("MainPCB").unwrap_err();
        assert!(matches!(err, BridgeError::ReopenFailed { .. }));
        assert!(!registry.is_open("MainPCB"));
        assert!(matches!(
            registry.write("MainPCB", b"x".to_vec()).await,
            Err(BridgeError::PortUnavailable { .. })
        ));

        // Once the port is back, open succeeds again
        opener.set_failing("/dev/mock0", false);
        registry.open("MainPCB").unwrap();
        assert!(registry.is_open("MainPCB"));
    }

    #[tokio::test]
    async fn close_stops_the_relay() {
        let (registry, opener, _hub) = build_registry(&[("MainPCB", "/dev/mock0")]);
        registry.open_all();

        registry.close("MainPCB").await.unwrap();
        assert!(!registry.is_open("MainPCB"));
        assert!(matches!(
            registry.write("MainPCB", b"x".to_vec()).await,
            Err(BridgeError::PortUnavailable { .. })
        ));
        // Reopening works after a close
        registry.open("MainPCB").unwrap();
        assert_eq!(opener.open_count("/dev/mock0"), 2);
    }
}
