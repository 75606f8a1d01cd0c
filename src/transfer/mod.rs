//! Client and server halves of the TCP side of a transfer, sharing one
//! connection for request, accept/decline byte, and data.

pub mod client;
pub mod server;

use crate::peer::{FileBundle, TransferProgress};

/// The single accept/decline byte sent on the wire.
pub(crate) const ACCEPT_BYTE: u8 = 0x00;
pub(crate) const DECLINE_BYTE: u8 = 0x01;

/// Events the client side emits.
#[derive(Debug)]
pub enum ClientEvent {
    RequestResponse { bundle: FileBundle, accepted: bool },
    Progress(TransferProgress),
    Success(FileBundle),
    Disconnected,
}

/// Events the server side emits, minus `on_started`/`on_stopped`/
/// `on_transfer_requested`, which live on the lifecycle coordinator since
/// they aren't per-connection.
#[derive(Debug)]
pub enum ServerEvent {
    ConnectionAccepted,
    ConnectionClosed,
    DownloadProgress(TransferProgress),
    DownloadSuccess(FileBundle),
    DownloadFailed { bytes_received: u64 },
}
