//! Data model shared by discovery and transfer: peer records,
//! file bundles, and transfer-progress events.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::config::Identity;
use crate::error::{GlError, Result};

/// A peer discovered during one round of `discover()`. Identity
/// within a round is `network_address`; the caller-facing type carries no
/// notion of discovery-round timing, that bookkeeping stays inside the
/// discovery module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub unique_peer_id: [u8; 8],
    pub device_type: [u8; 3],
    pub hostname: String,
    pub network_address: SocketAddr,
}

impl Peer {
    pub(crate) fn from_identity(identity: Identity, network_address: SocketAddr) -> Peer {
        Peer {
            unique_peer_id: identity.unique_peer_id,
            device_type: identity.device_type,
            hostname: identity.hostname,
            network_address,
        }
    }
}

/// Metadata describing a file in flight.
#[derive(Debug, Clone)]
pub struct FileBundle {
    /// Source-side path; `None` on the receiving side, where only the
    /// wire-carried name and size are known until the stream completes.
    pub original_path: Option<PathBuf>,
    /// The leaf name sent over the wire. Sanitized by the receiver before
    /// it's ever used as part of a filesystem path (see
    /// `transfer::server::sanitize_base_name`).
    pub base_name: String,
    pub size: u64,
}

impl FileBundle {
    /// Builds a bundle from a local path for sending. Fails with
    /// `ProtocolInvalid` if the path doesn't exist or isn't a regular
    /// file; a dedicated error variant for this single call site isn't
    /// worth it, so it folds into the existing protocol-error kind.
    pub fn from_path(path: impl AsRef<Path>) -> Result<FileBundle> {
        let path = path.as_ref();
        let metadata = fs::metadata(path).map_err(|_| {
            GlError::ProtocolInvalid(format!("{} does not exist", path.display()))
        })?;
        if !metadata.is_file() {
            return Err(GlError::ProtocolInvalid(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let base_name = path
            .file_name()
            .ok_or_else(|| GlError::ProtocolInvalid("path has no file name".to_string()))?
            .to_string_lossy()
            .into_owned();

        Ok(FileBundle {
            original_path: Some(path.to_path_buf()),
            base_name,
            size: metadata.len(),
        })
    }
}

/// Progress event emitted by both the sending and receiving sides during
/// streaming. `bytes_transferred` strictly increases within one transfer.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub bundle: FileBundle,
    pub bytes_transferred: u64,
    pub chunk_index: u32,
    pub chunks_total: u32,
    pub chunk_size: u32,
}

/// Default chunk size for both directions.
pub const DEFAULT_CHUNK_SIZE: u32 = 4096;

pub(crate) fn chunks_total(file_size: u64, chunk_size: u32) -> u32 {
    if file_size == 0 {
        return 0;
    }
    ((file_size + chunk_size as u64 - 1) / chunk_size as u64) as u32
}
