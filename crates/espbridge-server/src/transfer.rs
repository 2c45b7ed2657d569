//! Stop-and-wait artifact reception
//!
//! Each artifact arrives as a fixed 16-byte ASCII size header, acknowledged
//! with `SIZE_OK`, followed by exactly that many body bytes. The body is
//! staged to disk only once it has arrived in full, so an aborted transfer
//! never leaves a partial file behind.

use std::path::{Path, PathBuf};

use espbridge_core::framing::{parse_size_header, FileRole, SIZE_HEADER_LEN};
use espbridge_core::{BridgeError, ServerMessage};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Largest declared size accepted for a single artifact
const MAX_TRANSFER_BYTES: u64 = 256 * 1024 * 1024;

/// The three staged artifacts of one upload
#[derive(Debug)]
pub struct StagedArtifacts {
    pub bootloader: PathBuf,
    pub partition_table: PathBuf,
    pub image: PathBuf,
}

impl StagedArtifacts {
    pub(crate) fn path_for(&self, role: FileRole) -> &PathBuf {
        match role {
            FileRole::Bootloader => &self.bootloader,
            FileRole::PartitionTable => &self.partition_table,
            FileRole::Image => &self.image,
        }
    }
}

/// Receive the three artifacts of one upload in their fixed order
///
/// Disk trouble while staging does not interrupt the exchange: the remaining
/// transfers are still acknowledged and received, and the first staging error
/// surfaces only once the peer is back at a command boundary. Anything else
/// aborts on the spot.
pub async fn receive_artifacts<R>(
    reader: &mut R,
    outbound: &mpsc::UnboundedSender<ServerMessage>,
    staging_dir: &Path,
) -> Result<StagedArtifacts, BridgeError>
where
    R: AsyncRead + Unpin,
{
    let mut staged = [PathBuf::new(), PathBuf::new(), PathBuf::new()];
    let mut deferred: Option<BridgeError> = None;
    for (slot, role) in staged.iter_mut().zip(FileRole::UPLOAD_ORDER) {
        match receive_file(reader, outbound, staging_dir, role).await {
            Ok(path) => *slot = path,
            Err(error @ (BridgeError::Staging(_) | BridgeError::SizeMismatch { .. })) => {
                deferred.get_or_insert(error);
            }
            Err(error) => return Err(error),
        }
    }
    if let Some(error) = deferred {
        return Err(error);
    }
    let [bootloader, partition_table, image] = staged;
    Ok(StagedArtifacts {
        bootloader,
        partition_table,
        image,
    })
}

/// Receive one artifact and stage it under `staging_dir`
///
/// The acknowledgement travels through `outbound` so it cannot interleave
/// with concurrently broadcast frames. Returns the staged file's path.
pub async fn receive_file<R>(
    reader: &mut R,
    outbound: &mpsc::UnboundedSender<ServerMessage>,
    staging_dir: &Path,
    role: FileRole,
) -> Result<PathBuf, BridgeError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; SIZE_HEADER_LEN];
    read_exact_or_closed(reader, &mut header).await?;
    let declared = parse_size_header(&header)?;
    if declared > MAX_TRANSFER_BYTES {
        return Err(BridgeError::Framing(format!(
            "declared size {} exceeds the {} byte limit",
            declared, MAX_TRANSFER_BYTES
        )));
    }
    debug!(role = %role, bytes = declared, "Transfer size announced");

    outbound
        .send(ServerMessage::SizeAck)
        .map_err(|_| BridgeError::ConnectionClosed)?;

    let mut body = vec![0u8; declared as usize];
    read_exact_or_closed(reader, &mut body).await?;

    let path = staging_dir.join(role.file_name());
    tokio::fs::write(&path, &body)
        .await
        .map_err(|error| stage_failure(role, error))?;
    verify_staged(&path, role, declared).await?;

    info!(role = %role, bytes = declared, "Artifact staged");
    Ok(path)
}

/// Compare the staged file's on-disk length against the declared size
async fn verify_staged(path: &Path, role: FileRole, declared: u64) -> Result<(), BridgeError> {
    let actual = tokio::fs::metadata(path)
        .await
        .map_err(|error| stage_failure(role, error))?
        .len();
    if actual != declared {
        return Err(BridgeError::SizeMismatch { declared, actual });
    }
    Ok(())
}

/// Log the disk error in full; the wire reason names only the role
fn stage_failure(role: FileRole, error: std::io::Error) -> BridgeError {
    warn!(role = %role, error = %error, "Could not stage artifact");
    BridgeError::Staging(format!("could not stage the {}", role))
}

async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(BridgeError::ConnectionClosed)
        }
        Err(error) => Err(error.into()),
    }
}
