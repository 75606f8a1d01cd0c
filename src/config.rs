//! The local identity snapshot every other module reads from.
//!
//! Populated once at process start (see `Config::new`) and immutable
//! thereafter; cheap to clone so worker threads can own a copy instead of
//! reaching back into a shared handle.

use std::path::{Path, PathBuf};

use crate::error::{GlError, Result};

/// Default device type used when a hosting application doesn't ask the
/// user to pick one.
pub const DEFAULT_DEVICE_TYPE: [u8; 3] = *b"DSK";

/// The four identity fields every control message carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub unique_peer_id: [u8; 8],
    pub device_type: [u8; 3],
    pub hostname: String,
}

impl Identity {
    fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() || self.hostname.len() > 255 {
            return Err(GlError::Config(format!(
                "hostname must be 1..=255 bytes, got {}",
                self.hostname.len()
            )));
        }
        if !self.device_type.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            return Err(GlError::Config(
                "device_type must be 3 printable bytes".into(),
            ));
        }
        Ok(())
    }
}

/// Local identity plus the one field the transfer server reads: where
/// downloads land.
#[derive(Debug, Clone)]
pub struct Config {
    identity: Identity,
    download_directory: PathBuf,
}

impl Config {
    /// Validates the identity fields before accepting them; this is the
    /// only source of the `GlError::Config` kind.
    pub fn new(
        unique_peer_id: [u8; 8],
        device_type: [u8; 3],
        hostname: impl Into<String>,
        download_directory: impl Into<PathBuf>,
    ) -> Result<Config> {
        let identity = Identity {
            unique_peer_id,
            device_type,
            hostname: hostname.into(),
        };
        identity.validate()?;

        let download_directory = download_directory.into();
        if !download_directory.is_absolute() {
            return Err(GlError::Config(format!(
                "download_directory must be absolute, got {}",
                download_directory.display()
            )));
        }

        Ok(Config {
            identity,
            download_directory,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn unique_peer_id(&self) -> [u8; 8] {
        self.identity.unique_peer_id
    }

    pub fn download_directory(&self) -> &Path {
        &self.download_directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_hostname() {
        let err = Config::new([1; 8], DEFAULT_DEVICE_TYPE, "", "/tmp").unwrap_err();
        assert!(matches!(err, GlError::Config(_)));
    }

    #[test]
    fn rejects_relative_download_dir() {
        let err = Config::new([1; 8], DEFAULT_DEVICE_TYPE, "alpha", "downloads").unwrap_err();
        assert!(matches!(err, GlError::Config(_)));
    }

    #[test]
    fn accepts_sane_identity() {
        let cfg = Config::new([1; 8], DEFAULT_DEVICE_TYPE, "alpha", "/tmp").unwrap();
        assert_eq!(cfg.identity().hostname, "alpha");
        assert_eq!(cfg.identity().device_type, DEFAULT_DEVICE_TYPE);
    }
}
