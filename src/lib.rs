//! GroundLift core: the transport layer behind a LAN peer-to-peer file
//! transfer tool.
//!
//! This crate covers UDP
//! peer discovery (`discovery`), the framed control-message codec
//! (`message`), the TCP bulk-transfer client and server (`transfer`), and
//! the lifecycle coordinator that ties a running daemon's threads
//! together (`lifecycle`). GUI surfaces, CLI front-ends, config-file I/O,
//! and OS path/hostname helpers are external collaborators reached only
//! through the callback and `Config` surfaces below — see `src/main.rs`
//! for the thin CLI front-end built on top of them.

pub mod config;
pub mod discovery;
pub mod error;
pub mod lifecycle;
pub mod message;
pub mod peer;
pub mod socket;
pub mod transfer;

/// Well-known UDP port the discovery responder listens on.
pub const GL_DISCOVERY_PORT: u16 = 1650;
/// Well-known TCP port the transfer listener listens on.
pub const GL_TRANSFER_PORT: u16 = 1650;

pub use config::Config;
pub use error::{GlError, Result};
pub use peer::{FileBundle, Peer, TransferProgress};
