//! Serial relay loops
//!
//! One relay task per open device. The task owns the serial link outright: it
//! pumps complete device lines to the broadcast hub and services write/reset
//! requests arriving on its command channel. Shutdown is acknowledged through
//! a oneshot after the link has been dropped, which is what lets the flash
//! handoff treat the port as released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use espbridge_core::LogEvent;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::hub::BroadcastHub;
use crate::serial::{SerialError, SerialLink};

/// Settle time between asserting and releasing RTS during a reset pulse
const RESET_PULSE: Duration = Duration::from_millis(100);
/// Backoff after a serial read error before retrying
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Bound on waiting for a relay to acknowledge shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
/// A line this long without a newline is flushed as-is
const MAX_LINE_LEN: usize = 4096;
/// Command queue depth per relay
const COMMAND_QUEUE: usize = 16;

/// Requests a session can route to a device's relay
pub enum RelayCommand {
    /// Write raw bytes to the device
    Write(Vec<u8>, oneshot::Sender<Result<(), SerialError>>),
    /// Pulse the reset lines (DTR low, RTS high, settle, RTS low)
    PulseReset(oneshot::Sender<Result<(), SerialError>>),
    /// Drop the link, acknowledge, exit
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable sender half for routing device actions to a relay
#[derive(Clone)]
pub struct RelayClient {
    tx: mpsc::Sender<RelayCommand>,
}

impl RelayClient {
    /// Write bytes to the device and wait for the outcome
    pub async fn write(&self, bytes: Vec<u8>) -> Result<(), SerialError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(RelayCommand::Write(bytes, ack_tx))
            .await
            .map_err(|_| SerialError::Closed)?;
        ack_rx.await.map_err(|_| SerialError::Closed)?
    }

    /// Pulse the device's reset lines and wait for the outcome
    pub async fn pulse_reset(&self) -> Result<(), SerialError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(RelayCommand::PulseReset(ack_tx))
            .await
            .map_err(|_| SerialError::Closed)?;
        ack_rx.await.map_err(|_| SerialError::Closed)?
    }
}

/// Owning handle for one relay task
pub struct RelayHandle {
    client: RelayClient,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// A sender for device actions, usable while the relay runs
    pub fn client(&self) -> RelayClient {
        self.client.clone()
    }

    /// Stop the relay and wait until it has released the link
    ///
    /// Returns once the relay acknowledged (or after a bounded wait if the
    /// task is wedged); afterwards the serial port is closed.
    pub async fn shutdown(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .client
            .tx
            .send(RelayCommand::Shutdown(ack_tx))
            .await
            .is_ok()
        {
            let _ = timeout(SHUTDOWN_TIMEOUT, ack_rx).await;
        }
        let _ = timeout(SHUTDOWN_TIMEOUT, self.task).await;
    }
}

/// Spawn the relay loop for an open device link
pub fn spawn_relay(
    device: String,
    link: Box<dyn SerialLink>,
    hub: Arc<BroadcastHub>,
    read_timeout: Duration,
    running: Arc<AtomicBool>,
) -> RelayHandle {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let task = tokio::spawn(relay_loop(device, link, rx, hub, read_timeout, running));
    RelayHandle {
        client: RelayClient { tx },
        task,
    }
}

async fn relay_loop(
    device: String,
    mut link: Box<dyn SerialLink>,
    mut commands: mpsc::Receiver<RelayCommand>,
    hub: Arc<BroadcastHub>,
    read_timeout: Duration,
    running: Arc<AtomicBool>,
) {
    debug!(device = %device, "Relay loop started");
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 512];

    enum Step {
        Command(Option<RelayCommand>),
        Read(Result<Result<usize, SerialError>, tokio::time::error::Elapsed>),
    }

    loop {
        if !running.load(Ordering::SeqCst) {
            debug!(device = %device, "Relay loop exiting on shutdown flag");
            return;
        }

        let step = tokio::select! {
            cmd = commands.recv() => Step::Command(cmd),
            res = timeout(read_timeout, link.read(&mut buf)) => Step::Read(res),
        };

        match step {
            Step::Command(Some(RelayCommand::Write(bytes, ack))) => {
                let result = link.write_all(&bytes).await;
                if let Err(error) = &result {
                    warn!(device = %device, error = %error, "Serial write failed");
                }
                let _ = ack.send(result);
            }
            Step::Command(Some(RelayCommand::PulseReset(ack))) => {
                let result = pulse_reset(link.as_mut()).await;
                if let Err(error) = &result {
                    warn!(device = %device, error = %error, "Reset pulse failed");
                }
                let _ = ack.send(result);
            }
            Step::Command(Some(RelayCommand::Shutdown(ack))) => {
                drop(link);
                let _ = ack.send(());
                debug!(device = %device, "Relay loop released serial link");
                return;
            }
            Step::Command(None) => {
                debug!(device = %device, "Relay command channel dropped, exiting");
                return;
            }
            // Read timeout: loop around and re-check the shutdown flag
            Step::Read(Err(_)) => {}
            Step::Read(Ok(Ok(0))) => {
                tokio::time::sleep(READ_RETRY_DELAY).await;
            }
            Step::Read(Ok(Ok(n))) => {
                pending.extend_from_slice(&buf[..n]);
                drain_lines(&device, &mut pending, &hub);
            }
            Step::Read(Ok(Err(error))) => {
                debug!(device = %device, error = %error, "Serial read error, retrying");
                tokio::time::sleep(READ_RETRY_DELAY).await;
            }
        }
    }
}

async fn pulse_reset(link: &mut dyn SerialLink) -> Result<(), SerialError> {
    link.set_dtr(false)?;
    link.set_rts(true)?;
    tokio::time::sleep(RESET_PULSE).await;
    link.set_rts(false)
}

fn drain_lines(device: &str, pending: &mut Vec<u8>, hub: &BroadcastHub) {
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = pending.drain(..=pos).collect();
        emit_line(device, &line[..line.len() - 1], hub);
    }
    // Devices that never send a newline still get their output through
    if pending.len() > MAX_LINE_LEN {
        let line: Vec<u8> = pending.drain(..).collect();
        emit_line(device, &line, hub);
    }
}

fn emit_line(device: &str, raw: &[u8], hub: &BroadcastHub) {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    hub.broadcast(&LogEvent::device_line(device, text));
}
