//! Flash orchestration
//!
//! Runs the external flash tool against a device whose serial link has been
//! handed over, streaming the tool's merged stdout and stderr to the
//! originating client as `FLASH_LOG` frames. The link is reopened before
//! this module returns, whatever the tool's outcome.

use std::process::Stdio;
use std::time::Duration;

use espbridge_core::framing::FileRole;
use espbridge_core::{BridgeError, LogEvent, ServerMessage};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::FlashConfig;
use crate::registry::DeviceRegistry;
use crate::transfer::StagedArtifacts;

/// Bound on joining the pipe pump tasks after the tool exits
const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Pipe read chunk size
const PIPE_CHUNK: usize = 1024;

/// Flash `target` with the staged artifacts, streaming progress to `outbound`
///
/// Announces `FLASHING` first, takes the device's serial port from the
/// registry, runs the tool, and restores the port unconditionally. The
/// result reflects the first failure: tool exit before reopen trouble.
pub async fn run_flash(
    registry: &DeviceRegistry,
    config: &FlashConfig,
    target: &str,
    artifacts: &StagedArtifacts,
    outbound: &mpsc::UnboundedSender<ServerMessage>,
) -> Result<(), BridgeError> {
    outbound
        .send(ServerMessage::Flashing {
            target: target.to_string(),
        })
        .map_err(|_| BridgeError::ConnectionClosed)?;

    let port = registry.begin_flash(target).await?;
    info!(device = %target, port = %port, "Flash tool starting");

    let tool_result = stream_flash_tool(config, target, &port, artifacts, outbound).await;
    let reopen_result = registry.finish_flash(target);

    match (tool_result, reopen_result) {
        (Ok(()), Ok(())) => Ok(()),
        (Ok(()), Err(reopen_error)) => Err(reopen_error),
        // A reopen failure after a failed flash is already logged loudly
        (Err(tool_error), _) => Err(tool_error),
    }
}

async fn stream_flash_tool(
    config: &FlashConfig,
    target: &str,
    port: &str,
    artifacts: &StagedArtifacts,
    outbound: &mpsc::UnboundedSender<ServerMessage>,
) -> Result<(), BridgeError> {
    let program = config
        .tool
        .first()
        .ok_or_else(|| BridgeError::FlashToolUnavailable("empty command".to_string()))?;

    let mut child = Command::new(program)
        .args(&config.tool[1..])
        .args(tool_args(config, port, artifacts))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| {
            warn!(device = %target, tool = %program, error = %error, "Flash tool did not start");
            BridgeError::FlashToolUnavailable(error.to_string())
        })?;

    // Both pipes feed one channel so output arrives in the order it appears
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(32);
    let mut pumps = Vec::new();
    if let Some(pipe) = child.stdout.take() {
        pumps.push(tokio::spawn(pump_pipe(pipe, chunk_tx.clone())));
    }
    if let Some(pipe) = child.stderr.take() {
        pumps.push(tokio::spawn(pump_pipe(pipe, chunk_tx.clone())));
    }
    drop(chunk_tx);

    let mut splitter = SegmentSplitter::new();
    while let Some(chunk) = chunk_rx.recv().await {
        for segment in splitter.push(&chunk) {
            forward_segment(target, &segment, outbound);
        }
    }
    if let Some(tail) = splitter.flush() {
        forward_segment(target, &tail, outbound);
    }

    let status = child.wait().await?;
    for pump in pumps {
        let _ = timeout(PUMP_JOIN_TIMEOUT, pump).await;
    }

    match status.code() {
        Some(0) => {
            info!(device = %target, "Flash tool finished");
            Ok(())
        }
        Some(code) => Err(BridgeError::FlashToolFailed(code)),
        // Killed by a signal
        None => Err(BridgeError::FlashToolFailed(-1)),
    }
}

/// Arguments appended after the configured tool invocation
fn tool_args(config: &FlashConfig, port: &str, artifacts: &StagedArtifacts) -> Vec<String> {
    let mut args = vec![
        "--chip".to_string(),
        config.chip.clone(),
        "--port".to_string(),
        port.to_string(),
        "-b".to_string(),
        config.baud.to_string(),
        "--before".to_string(),
        config.before.clone(),
        "--after".to_string(),
        config.after.clone(),
        "write_flash".to_string(),
        "--flash_mode".to_string(),
        config.mode.clone(),
        "--flash_freq".to_string(),
        config.freq.clone(),
        "--flash_size".to_string(),
        config.size.clone(),
    ];
    for role in FileRole::UPLOAD_ORDER {
        args.push(format!("{:#x}", role.flash_offset()));
        args.push(artifacts.path_for(role).display().to_string());
    }
    args
}

fn forward_segment(target: &str, segment: &str, outbound: &mpsc::UnboundedSender<ServerMessage>) {
    // Echo on the bridge console and mirror to the client
    info!(device = %target, "{}", segment);
    let event = LogEvent::flash_output(target, segment);
    let _ = outbound.send(event.to_message());
}

async fn pump_pipe<R>(mut pipe: R, chunks: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; PIPE_CHUNK];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if chunks.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Flash tool pipe drained");
}

/// Splits pipe chunks into displayable segments
///
/// esptool redraws its progress line with bare carriage returns, so both
/// `\n` and `\r` end a segment. Partial segments carry across chunks.
struct SegmentSplitter {
    partial: Vec<u8>,
}

impl SegmentSplitter {
    fn new() -> Self {
        Self {
            partial: Vec::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut segments = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if !self.partial.is_empty() {
                    segments.push(String::from_utf8_lossy(&self.partial).into_owned());
                    self.partial.clear();
                }
            } else {
                self.partial.push(byte);
            }
        }
        segments
    }

    fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let tail = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        Some(tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::BroadcastHub;
    use crate::serial::mock::MockSerialOpener;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn artifacts_in(dir: &std::path::Path) -> StagedArtifacts {
        let make = |name: &str| {
            let path = dir.join(name);
            std::fs::write(&path, b"bin").unwrap();
            path
        };
        StagedArtifacts {
            bootloader: make("bootloader.bin"),
            partition_table: make("partition_table.bin"),
            image: make("firmware.bin"),
        }
    }

    fn registry_with(
        name: &str,
        path: &str,
    ) -> (Arc<DeviceRegistry>, Arc<MockSerialOpener>) {
        let opener = Arc::new(MockSerialOpener::new());
        let hub = Arc::new(BroadcastHub::new());
        let mut devices = BTreeMap::new();
        devices.insert(name.to_string(), path.to_string());
        let registry = Arc::new(DeviceRegistry::new(
            devices,
            115_200,
            Duration::from_millis(50),
            opener.clone(),
            hub,
            Arc::new(AtomicBool::new(true)),
        ));
        registry.open(name).unwrap();
        (registry, opener)
    }

    fn sh_tool(script: &str) -> FlashConfig {
        FlashConfig {
            tool: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            ..FlashConfig::default()
        }
    }

    #[test]
    fn tool_args_follow_the_esptool_contract() {
        let config = FlashConfig::default();
        let artifacts = StagedArtifacts {
            bootloader: PathBuf::from("/tmp/stage/bootloader.bin"),
            partition_table: PathBuf::from("/tmp/stage/partition_table.bin"),
            image: PathBuf::from("/tmp/stage/firmware.bin"),
        };

        let args = tool_args(&config, "/dev/ttyUSB0", &artifacts);
        assert_eq!(
            args,
            vec![
                "--chip",
                "esp32s3",
                "--port",
                "/dev/ttyUSB0",
                "-b",
                "460800",
                "--before",
                "default_reset",
                "--after",
                "hard_reset",
                "write_flash",
                "--flash_mode",
                "dio",
                "--flash_freq",
                "80m",
                "--flash_size",
                "8MB",
                "0x0",
                "/tmp/stage/bootloader.bin",
                "0x8000",
                "/tmp/stage/partition_table.bin",
                "0x10000",
                "/tmp/stage/firmware.bin",
            ]
        );
    }

    #[test]
    fn splitter_treats_cr_and_lf_as_boundaries() {
        let mut splitter = SegmentSplitter::new();
        assert_eq!(
            splitter.push(b"Connecting....\rWriting at 0x0... (5 %)\n"),
            vec!["Connecting....", "Writing at 0x0... (5 %)"]
        );
        assert!(splitter.flush().is_none());
    }

    #[test]
    fn splitter_carries_partial_segments_across_chunks() {
        let mut splitter = SegmentSplitter::new();
        assert!(splitter.push(b"Writing at").is_empty());
        assert_eq!(splitter.push(b" 0x10000\r\r\n"), vec!["Writing at 0x10000"]);
        assert!(splitter.push(b"Hash of data verified").is_empty());
        assert_eq!(splitter.flush(), Some("Hash of data verified".to_string()));
    }

    #[tokio::test]
    async fn successful_flash_streams_output_and_reopens_the_port() {
        let staging = tempfile::tempdir().unwrap();
        let artifacts = artifacts_in(staging.path());
        let (registry, opener) = registry_with("MainPCB", "/dev/ttyMOCK");
        let (tx, mut frames) = mpsc::unbounded_channel();

        let config = sh_tool("printf 'Connecting....\\rWriting (100 %%)\\n'; exit 0");
        run_flash(&registry, &config, "MainPCB", &artifacts, &tx)
            .await
            .unwrap();

        assert_eq!(
            frames.recv().await,
            Some(ServerMessage::Flashing {
                target: "MainPCB".to_string()
            })
        );
        assert_eq!(
            frames.recv().await,
            Some(ServerMessage::FlashLog {
                target: "MainPCB".to_string(),
                text: "Connecting....".to_string()
            })
        );
        assert_eq!(
            frames.recv().await,
            Some(ServerMessage::FlashLog {
                target: "MainPCB".to_string(),
                text: "Writing (100 %)".to_string()
            })
        );
        // The port was handed over and reopened
        assert_eq!(opener.open_count("/dev/ttyMOCK"), 2);
        assert!(registry.is_open("MainPCB"));
    }

    #[tokio::test]
    async fn failed_flash_reports_the_exit_code_and_still_reopens() {
        let staging = tempfile::tempdir().unwrap();
        let artifacts = artifacts_in(staging.path());
        let (registry, opener) = registry_with("SlavePCB", "/dev/ttyMOCK1");
        let (tx, _frames) = mpsc::unbounded_channel();

        let config = sh_tool("exit 7");
        let error = run_flash(&registry, &config, "SlavePCB", &artifacts, &tx)
            .await
            .unwrap_err();

        assert!(matches!(error, BridgeError::FlashToolFailed(7)));
        assert_eq!(opener.open_count("/dev/ttyMOCK1"), 2);
        assert!(registry.is_open("SlavePCB"));
    }

    #[tokio::test]
    async fn missing_tool_binary_is_not_fatal_and_still_reopens() {
        let staging = tempfile::tempdir().unwrap();
        let artifacts = artifacts_in(staging.path());
        let (registry, opener) = registry_with("MainPCB", "/dev/ttyMOCK3");
        let (tx, _frames) = mpsc::unbounded_channel();

        let config = FlashConfig {
            tool: vec!["/nonexistent/esptool".to_string()],
            ..FlashConfig::default()
        };
        let error = run_flash(&registry, &config, "MainPCB", &artifacts, &tx)
            .await
            .unwrap_err();

        assert!(matches!(error, BridgeError::FlashToolUnavailable(_)));
        assert!(!error.is_fatal());
        assert_eq!(opener.open_count("/dev/ttyMOCK3"), 2);
        assert!(registry.is_open("MainPCB"));
    }

    #[tokio::test]
    async fn closed_device_cannot_be_flashed() {
        let staging = tempfile::tempdir().unwrap();
        let artifacts = artifacts_in(staging.path());
        let (registry, _opener) = registry_with("MainPCB", "/dev/ttyMOCK2");
        registry.close("MainPCB").await.unwrap();
        let (tx, mut frames) = mpsc::unbounded_channel();

        let config = sh_tool("exit 0");
        let error = run_flash(&registry, &config, "MainPCB", &artifacts, &tx)
            .await
            .unwrap_err();

        assert!(matches!(error, BridgeError::PortUnavailable { .. }));
        // FLASHING was already announced when the handoff failed
        assert_eq!(
            frames.recv().await,
            Some(ServerMessage::Flashing {
                target: "MainPCB".to_string()
            })
        );
    }
}
