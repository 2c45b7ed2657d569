//! Optional camera capture
//!
//! The camera is not a serial device and never appears in the registry.
//! When a capture command is configured, `GET_CAM` runs it on demand and
//! forwards its stdout as the frame.

use espbridge_core::BridgeError;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::CameraConfig;

/// Capture one frame, or fail with [`BridgeError::CameraUnavailable`]
pub async fn capture(config: &CameraConfig) -> Result<Vec<u8>, BridgeError> {
    let (program, args) = match config.capture_command.split_first() {
        Some(split) => split,
        None => return Err(BridgeError::CameraUnavailable),
    };

    let output = match Command::new(program).args(args).output().await {
        Ok(output) => output,
        Err(error) => {
            warn!(error = %error, "Capture command could not run");
            return Err(BridgeError::CameraUnavailable);
        }
    };
    if !output.status.success() {
        warn!(status = %output.status, "Capture command failed");
        return Err(BridgeError::CameraUnavailable);
    }
    if output.stdout.is_empty() {
        warn!("Capture command produced no frame");
        return Err(BridgeError::CameraUnavailable);
    }

    debug!(bytes = output.stdout.len(), "Camera frame captured");
    Ok(output.stdout)
}
