//! Bridge TCP client implementation

use std::collections::VecDeque;
use std::time::Duration;

use espbridge_core::framing::{encode_size_header, FileRole};
use espbridge_core::{Command, ServerMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{BridgeClientError, Result};

/// Default wait for a direct command reply
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);
/// Wait for a whole flash run; large images over slow links take minutes
const FLASH_TIMEOUT: Duration = Duration::from_secs(600);
/// Upload body chunk size
const UPLOAD_CHUNK: usize = 4096;

/// Line-oriented client for the bridge control protocol
///
/// Broadcast `LOG:` lines arrive interleaved with command replies; the
/// client stashes them while waiting for a status frame, so nothing is
/// lost when a command and device output race each other.
pub struct BridgeClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Frames read past while waiting for a specific reply
    pending: VecDeque<ServerMessage>,
}

impl BridgeClient {
    /// Connect to a bridge at `addr` (e.g. "192.168.1.10:5000")
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            pending: VecDeque::new(),
        })
    }

    /// Send one command token, newline-terminated
    pub async fn send_command(&mut self, command: &Command) -> Result<()> {
        let mut frame = command.wire_token().into_bytes();
        frame.push(b'\n');
        self.writer.write_all(&frame).await?;
        Ok(())
    }

    /// Send a raw line, bypassing the command vocabulary
    pub async fn send_raw(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    /// Next protocol frame, in arrival order
    pub async fn next_message(&mut self) -> Result<ServerMessage> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(frame);
        }
        self.read_frame().await
    }

    /// Upload three artifacts to `target` and flash them
    ///
    /// Returns the flash tool output segments streamed during the run.
    pub async fn upload(
        &mut self,
        target: &str,
        bootloader: &[u8],
        partition_table: &[u8],
        image: &[u8],
    ) -> Result<Vec<String>> {
        self.send_command(&Command::Upload {
            target: target.to_string(),
        })
        .await?;
        match self.wait_for_status(REPLY_TIMEOUT).await? {
            ServerMessage::Ready => {}
            other => return Err(unexpected("READY", other)),
        }

        let artifacts = [
            (FileRole::Bootloader, bootloader),
            (FileRole::PartitionTable, partition_table),
            (FileRole::Image, image),
        ];
        for (role, data) in artifacts {
            self.send_file(role, data).await?;
        }

        match self.wait_for_status(REPLY_TIMEOUT).await? {
            ServerMessage::Flashing { .. } => {}
            other => return Err(unexpected("FLASHING", other)),
        }

        let mut progress = Vec::new();
        loop {
            match self.wait_for_status(FLASH_TIMEOUT).await? {
                ServerMessage::FlashLog { text, .. } => progress.push(text),
                ServerMessage::Ok { .. } => return Ok(progress),
                other => return Err(unexpected("FLASH_LOG or OK", other)),
            }
        }
    }

    /// Pulse the reset lines of `target`
    pub async fn reset(&mut self, target: &str) -> Result<()> {
        self.send_command(&Command::Reset {
            target: target.to_string(),
        })
        .await?;
        self.expect_ok().await
    }

    /// Forward a button click to the device it is mapped to
    pub async fn click(&mut self, button: &str) -> Result<()> {
        self.send_command(&Command::ButtonClick {
            button: button.to_string(),
        })
        .await?;
        self.expect_ok().await
    }

    async fn send_file(&mut self, role: FileRole, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(&encode_size_header(data.len() as u64))
            .await?;
        match self.wait_for_status(REPLY_TIMEOUT).await? {
            ServerMessage::SizeAck => {}
            other => return Err(unexpected("SIZE_OK", other)),
        }
        for chunk in data.chunks(UPLOAD_CHUNK) {
            self.writer.write_all(chunk).await?;
        }
        debug!(role = %role, bytes = data.len(), "Artifact sent");
        Ok(())
    }

    async fn expect_ok(&mut self) -> Result<()> {
        match self.wait_for_status(REPLY_TIMEOUT).await? {
            ServerMessage::Ok { .. } => Ok(()),
            other => Err(unexpected("OK", other)),
        }
    }

    /// Wait for a status frame, stashing broadcast lines as they pass
    async fn wait_for_status(&mut self, wait: Duration) -> Result<ServerMessage> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(BridgeClientError::Timeout);
            }
            let frame = timeout(remaining, self.read_frame())
                .await
                .map_err(|_| BridgeClientError::Timeout)??;
            match frame {
                ServerMessage::Log { .. } => self.pending.push_back(frame),
                ServerMessage::Error { reason } => {
                    return Err(BridgeClientError::Rejected(reason))
                }
                other => return Ok(other),
            }
        }
    }

    async fn read_frame(&mut self) -> Result<ServerMessage> {
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(BridgeClientError::Closed);
            }
            let line = line.trim_end_matches(['\n', '\r']);
            match ServerMessage::parse_line(line) {
                Some(frame) => return Ok(frame),
                None => debug!(line = %line, "Skipping unrecognized frame"),
            }
        }
    }
}

fn unexpected(wanted: &str, got: ServerMessage) -> BridgeClientError {
    BridgeClientError::Protocol(format!("expected {}, got {:?}", wanted, got))
}
