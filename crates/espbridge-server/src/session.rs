//! Per-client control sessions
//!
//! Each accepted connection gets one session task. The session owns the
//! socket's read half and drives the command loop; everything written back,
//! whether a direct reply, a broadcast line or flash progress, goes through
//! a single writer task so frames never interleave mid-line.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use espbridge_core::{BridgeError, Command, ServerMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::camera;
use crate::config::BridgeConfig;
use crate::flash;
use crate::hub::BroadcastHub;
use crate::registry::DeviceRegistry;
use crate::transfer;

/// How often the command loop wakes to check the shutdown flag
const IDLE_POLL: Duration = Duration::from_millis(500);
/// Socket read chunk size for command frames
const COMMAND_CHUNK: usize = 1024;
/// Unterminated input longer than this is discarded as stray bytes
const MAX_COMMAND_LEN: usize = 4096;

/// Run one client session to completion
pub async fn run(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<DeviceRegistry>,
    hub: Arc<BroadcastHub>,
    config: Arc<BridgeConfig>,
    running: Arc<AtomicBool>,
) {
    let (read_half, write_half) = stream.into_split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(writer_loop(write_half, outbound_rx));

    let client_id = hub.register(peer, outbound.clone());
    info!(client = %peer, "Control client connected");

    let mut session = ControlSession {
        peer,
        reader: BufReader::new(read_half),
        outbound,
        registry,
        config,
        running,
    };
    session.command_loop().await;

    hub.unregister(client_id);
    // Dropping the session drops the last sender, letting the writer drain
    drop(session);
    let _ = timeout(Duration::from_secs(2), writer).await;
    info!(client = %peer, "Control client disconnected");
}

/// Forwards queued frames onto the socket until the queue closes
async fn writer_loop(
    mut socket: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<ServerMessage>,
) {
    while let Some(frame) = frames.recv().await {
        if socket.write_all(&frame.encode()).await.is_err() {
            // Peer is gone; senders notice via the hub or on their next reply
            break;
        }
    }
}

struct ControlSession {
    peer: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    registry: Arc<DeviceRegistry>,
    config: Arc<BridgeConfig>,
    running: Arc<AtomicBool>,
}

impl ControlSession {
    async fn command_loop(&mut self) {
        let mut pending: Vec<u8> = Vec::new();
        let mut chunk = [0u8; COMMAND_CHUNK];
        while self.running.load(Ordering::SeqCst) {
            let n = match timeout(IDLE_POLL, self.reader.read(&mut chunk)).await {
                // Idle tick, re-check the shutdown flag
                Err(_) => continue,
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(error)) => {
                    debug!(client = %self.peer, error = %error, "Socket read failed");
                    break;
                }
            };
            pending.extend_from_slice(&chunk[..n]);

            // A command line may arrive split across reads; dispatch only
            // complete lines and keep the tail for the next read
            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line);
                let token = text.trim();
                if token.is_empty() {
                    continue;
                }
                if !self.dispatch(token).await {
                    return;
                }
            }
            if pending.len() > MAX_COMMAND_LEN {
                debug!(client = %self.peer, bytes = pending.len(), "Dropping unterminated input");
                pending.clear();
            }
        }
    }

    /// Handle one command token; returns false when the session must end
    async fn dispatch(&mut self, token: &str) -> bool {
        let command = Command::parse(token);
        debug!(client = %self.peer, command = %token, "Command received");

        let result = match &command {
            Command::Upload { target } => self.handle_upload(target).await,
            Command::Reset { target } => self.handle_reset(target).await,
            Command::ButtonClick { button } => self.handle_click(button).await,
            Command::GetCam => self.handle_camera().await,
            Command::Unknown(frame) => {
                debug!(client = %self.peer, frame = %frame, "Ignoring unknown frame");
                Ok(())
            }
        };

        match result {
            Ok(()) => true,
            Err(error) => {
                warn!(client = %self.peer, command = %token, error = %error, "Command failed");
                let fatal = error.is_fatal();
                let _ = self.outbound.send(ServerMessage::error(&error));
                !fatal
            }
        }
    }

    /// Receive three artifacts, flash them, restore the device
    async fn handle_upload(&mut self, target: &str) -> Result<(), BridgeError> {
        // Validate and prepare before READY so a doomed upload costs no
        // transfer and leaves nothing of the client's in flight
        self.registry.ensure_uploadable(target)?;
        let staging = tempfile::tempdir().map_err(|error| {
            warn!(client = %self.peer, error = %error, "Could not create a staging directory");
            BridgeError::Staging("could not create a staging directory".to_string())
        })?;
        self.send(ServerMessage::Ready)?;
        info!(client = %self.peer, device = %target, "Upload accepted");

        let artifacts =
            transfer::receive_artifacts(&mut self.reader, &self.outbound, staging.path()).await?;

        info!(client = %self.peer, device = %target, "Artifacts staged, handing over to the flash tool");
        flash::run_flash(
            &self.registry,
            &self.config.flash,
            target,
            &artifacts,
            &self.outbound,
        )
        .await?;

        self.send(ServerMessage::ok(format!("UPLOAD_{}", target)))
        // Dropping `staging` removes the artifacts
    }

    async fn handle_reset(&mut self, target: &str) -> Result<(), BridgeError> {
        self.registry.pulse_reset(target).await?;
        info!(client = %self.peer, device = %target, "Device reset");
        self.send(ServerMessage::ok(format!("RESET_{}", target)))
    }

    /// Forward a button click token to its mapped device
    async fn handle_click(&mut self, button: &str) -> Result<(), BridgeError> {
        let token = format!("{}_CLICK", button);
        let device = self
            .config
            .buttons
            .get(button)
            .ok_or_else(|| BridgeError::ButtonNotFound(token.clone()))?;

        self.registry
            .write(device, format!("{}\n", token).into_bytes())
            .await?;
        debug!(client = %self.peer, device = %device, button = %button, "Button click forwarded");
        self.send(ServerMessage::ok(token))
    }

    async fn handle_camera(&mut self) -> Result<(), BridgeError> {
        let frame = camera::capture(&self.config.camera).await?;
        self.send(ServerMessage::CamImage(frame))
    }

    fn send(&self, message: ServerMessage) -> Result<(), BridgeError> {
        self.outbound
            .send(message)
            .map_err(|_| BridgeError::ConnectionClosed)
    }
}
