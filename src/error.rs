//! Library-wide error type.

use std::io;

use thiserror::Error;

/// Everything that can go wrong in the core, minus the "not really an
/// error" outcomes (`Timeout`, `ShutdownLocally`) which live on the
/// relevant result enums instead (see `socket::RecvOutcome`).
#[derive(Debug, Error)]
pub enum GlError {
    /// Identity fields missing or malformed. Fatal.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// bind/listen/connect/send/recv failed.
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    /// Magic mismatch, length out of range, bad hostname length, or a
    /// rejected (not repaired) file name. Per-datagram/request non-fatal.
    #[error("protocol violation: {0}")]
    ProtocolInvalid(String),

    /// Stream closed before `file_size` bytes were seen.
    #[error("transfer interrupted after {bytes_sent} bytes")]
    TransferInterrupted { bytes_sent: u64 },

    /// User declined, or the policy-decision timeout elapsed.
    #[error("transfer declined")]
    PolicyDeclined,

    /// Invariant violation that should be unreachable in correct code.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GlError {
    /// Logs `message` and aborts the process. This is the `Internal` kind's
    /// actual contract (spec.md's error design calls for "log and abort",
    /// not an ordinary `Result::Err`) — call sites that would otherwise
    /// construct `GlError::Internal` and return it call this instead, since
    /// an invariant violation that's "unreachable in correct code" should
    /// never be handed back to a caller to quietly propagate.
    pub fn abort_internal(message: impl std::fmt::Display) -> ! {
        log::error!("internal invariant violated: {message}");
        std::process::abort()
    }
}

pub type Result<T> = std::result::Result<T, GlError>;
