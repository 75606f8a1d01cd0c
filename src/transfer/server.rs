//! The transfer server: one accept-loop thread plus one worker
//! thread per accepted connection.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel;

use crate::config::Config;
use crate::error::{GlError, Result};
use crate::message::{self, ControlMessage};
use crate::peer::{FileBundle, Peer, TransferProgress};
use crate::socket::tcp::{RecvOutcome, TcpConnHandle, TcpListenerHandle};
use crate::GL_TRANSFER_PORT;

use super::{ServerEvent, ACCEPT_BYTE, DECLINE_BYTE};

/// How long the worker waits on the policy callback before
/// treating silence as a decline.
pub const DEFAULT_POLICY_TIMEOUT: Duration = Duration::from_secs(30);

/// The transfer listener's accept backlog.
pub const LISTEN_BACKLOG: i32 = 10;

/// Per-process lock serializing the destination-path-choose-and-open
/// sequence against a TOCTOU race between two workers picking the same
/// name. A single mutex is
/// enough: the critical section is a handful of `stat`/`open` calls, not
/// the data transfer itself.
static DESTINATION_LOCK: Mutex<()> = Mutex::new(());

/// The accept/decline decision handed back by a policy callback. Held as
/// an `Arc` (not a borrow) so a worker can hand a clone to a detached
/// thread and stop waiting on it once the policy timeout elapses,
/// without that thread's lifetime tying up the worker.
pub type PolicyFn = dyn Fn(&Peer, &FileBundle) -> bool + Send + Sync;

/// Binds the well-known transfer listener. Kept separate from the accept
/// loop itself so the lifecycle coordinator can register the handle under its
/// mutex before spawning the thread that drives it.
pub fn bind_transfer_listener() -> io::Result<TcpListenerHandle> {
    let addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), GL_TRANSFER_PORT);
    TcpListenerHandle::bind_listen(addr, LISTEN_BACKLOG)
}

/// Runs the accept loop until the listener is shut down. `spawn_worker`
/// is how the coordinator hooks each accepted connection into its own
/// worker-thread bookkeeping (join handles, live-worker count).
pub fn run_accept_loop(listener: &TcpListenerHandle, mut spawn_worker: impl FnMut(TcpConnHandle)) {
    log::info!("transfer listener accepting on {}", listener.local_addr());
    loop {
        match listener.accept() {
            Ok(crate::socket::AcceptOutcome::Connected(conn)) => {
                log::debug!("accepted transfer connection from {}", conn.peer_addr());
                spawn_worker(conn);
            }
            Ok(crate::socket::AcceptOutcome::ShutdownLocally) => break,
            Err(e) => {
                log::error!("transfer accept loop error: {e}");
                break;
            }
        }
    }
    log::info!("transfer accept loop stopped");
}

/// One accepted connection's lifetime:
/// read request → ask policy → accept/decline → stream → done/failed.
pub fn handle_connection(
    mut conn: TcpConnHandle,
    config: &Config,
    policy: Arc<PolicyFn>,
    policy_timeout: Duration,
    chunk_size: u32,
    mut on_event: impl FnMut(ServerEvent),
) {
    on_event(ServerEvent::ConnectionAccepted);
    let peer_addr = conn.peer_addr();

    let outcome = read_file_request(&mut conn).and_then(|request| {
        respond_to_request(&mut conn, config, &policy, policy_timeout, chunk_size, request, peer_addr, &mut on_event)
    });

    if let Err(e) = outcome {
        log::debug!("transfer connection from {peer_addr} ended: {e}");
    }
    on_event(ServerEvent::ConnectionClosed);
}

struct IncomingRequest {
    identity: crate::config::Identity,
    file_name: String,
    file_size: u64,
}

fn read_file_request(conn: &mut TcpConnHandle) -> Result<IncomingRequest> {
    let mut header = [0u8; message::HEADER_PEEK_LEN];
    match conn.read_exact_framed(&mut header)? {
        RecvOutcome::Ok(_) => {}
        RecvOutcome::Closed | RecvOutcome::ShutdownLocally => {
            return Err(GlError::ProtocolInvalid("connection closed before a request arrived".into()));
        }
    }
    let total_len = message::peek_len(&header).unwrap_or(0) as usize;
    if total_len < message::HEADER_PEEK_LEN {
        return Err(GlError::ProtocolInvalid("declared length shorter than the header".into()));
    }

    let mut full = Vec::with_capacity(total_len);
    full.extend_from_slice(&header);
    let mut rest = vec![0u8; total_len - header.len()];
    if !rest.is_empty() {
        match conn.read_exact_framed(&mut rest)? {
            RecvOutcome::Ok(_) => {}
            RecvOutcome::Closed | RecvOutcome::ShutdownLocally => {
                return Err(GlError::ProtocolInvalid("connection closed mid-request".into()));
            }
        }
    }
    full.extend(rest);

    match message::parse(&full) {
        Ok(ControlMessage::FileRequest {
            identity,
            file_name,
            file_size,
            ..
        }) => Ok(IncomingRequest {
            identity,
            file_name,
            file_size,
        }),
        _ => {
            let _ = conn.write_all(&[DECLINE_BYTE]);
            Err(GlError::ProtocolInvalid("expected a file request".into()))
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn respond_to_request(
    conn: &mut TcpConnHandle,
    config: &Config,
    policy: &Arc<PolicyFn>,
    policy_timeout: Duration,
    chunk_size: u32,
    request: IncomingRequest,
    peer_addr: SocketAddr,
    on_event: &mut impl FnMut(ServerEvent),
) -> Result<()> {
    let base_name = match sanitize_base_name(&request.file_name) {
        Some(name) => name,
        None => {
            conn.write_all(&[DECLINE_BYTE])?;
            return Err(GlError::ProtocolInvalid(format!(
                "rejected unsafe file name {:?}",
                request.file_name
            )));
        }
    };

    let bundle = FileBundle {
        original_path: None,
        base_name,
        size: request.file_size,
    };
    let peer = Peer::from_identity(request.identity, peer_addr);

    if !ask_policy(policy.clone(), peer.clone(), bundle.clone(), policy_timeout) {
        conn.write_all(&[DECLINE_BYTE])?;
        return Err(GlError::PolicyDeclined);
    }

    let (destination, mut file) = make_unique_destination(config.download_directory(), &bundle.base_name)
        .map_err(GlError::Socket)?;
    conn.write_all(&[ACCEPT_BYTE])?;

    match stream_to_file(conn, &mut file, bundle.size, chunk_size, &bundle, on_event) {
        Ok(()) => {
            on_event(ServerEvent::DownloadSuccess(bundle));
            Ok(())
        }
        Err(bytes_received) => {
            drop(file);
            let _ = fs::remove_file(&destination);
            on_event(ServerEvent::DownloadFailed { bytes_received });
            Err(GlError::TransferInterrupted { bytes_sent: bytes_received })
        }
    }
}

/// Blocks the calling (worker) thread on the policy callback, bounded by
/// `timeout`. The callback itself runs on a detached thread — deliberately
/// not joined — so a caller that never returns (the user walked away)
/// can't wedge the worker past the deadline. `policy` is an `Arc`, not a
/// borrow, precisely so the detached thread can keep it alive on its own
/// after this function (and the worker's stack frame) returns.
fn ask_policy(policy: Arc<PolicyFn>, peer: Peer, bundle: FileBundle, timeout: Duration) -> bool {
    let (tx, rx) = channel::bounded(1);
    thread::spawn(move || {
        let decision = policy(&peer, &bundle);
        let _ = tx.send(decision);
    });
    match rx.recv_timeout(timeout) {
        Ok(decision) => decision,
        Err(_) => {
            log::info!("policy decision timed out after {timeout:?}; declining");
            false
        }
    }
}

/// Rejects (never repairs) a `base_name` that contains a path separator,
/// `..`, or a non-printable byte. `message::parse` already
/// refuses `/`/`\`; this is a second, independent check directly on the
/// decoded name, since a sanitizer bug anywhere upstream should never be
/// the only thing standing between a crafted name and the filesystem.
fn sanitize_base_name(name: &str) -> Option<String> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || !name.chars().all(|c| c.is_ascii_graphic() || c == ' ')
    {
        return None;
    }
    Some(name.to_string())
}

/// Builds `download_directory/base_name`, appending ` (1)`, ` (2)`, …
/// before the extension until an unused path is found, then opens it
/// with `create_new` so the choose-and-open sequence is atomic under
/// [`DESTINATION_LOCK`].
fn make_unique_destination(download_directory: &Path, base_name: &str) -> io::Result<(PathBuf, File)> {
    let _guard = DESTINATION_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let (stem, ext) = split_stem_extension(base_name);
    let mut candidate = download_directory.join(base_name);
    let mut suffix = 0u32;

    loop {
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                suffix += 1;
                let name = if ext.is_empty() {
                    format!("{stem} ({suffix})")
                } else {
                    format!("{stem} ({suffix}).{ext}")
                };
                candidate = download_directory.join(name);
            }
            Err(e) => return Err(e),
        }
    }
}

fn split_stem_extension(base_name: &str) -> (&str, &str) {
    match base_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (base_name, ""),
    }
}

/// Reads exactly `file_size` bytes from `conn` into `file`, emitting a
/// `DownloadProgress` event per chunk. Returns the bytes received so far
/// as the error payload on any short read.
fn stream_to_file(
    conn: &mut TcpConnHandle,
    file: &mut File,
    file_size: u64,
    chunk_size: u32,
    bundle: &FileBundle,
    on_event: &mut impl FnMut(ServerEvent),
) -> std::result::Result<(), u64> {
    let chunks_total = crate::peer::chunks_total(file_size, chunk_size);
    let mut buf = vec![0u8; chunk_size as usize];
    let mut received: u64 = 0;
    let mut chunk_index: u32 = 0;

    while received < file_size {
        let remaining = (file_size - received).min(chunk_size as u64) as usize;
        match conn.read_some(&mut buf[..remaining]) {
            Ok(RecvOutcome::Ok(0)) => return Err(received),
            Ok(RecvOutcome::Ok(n)) => {
                if file.write_all(&buf[..n]).is_err() {
                    return Err(received);
                }
                received += n as u64;
                chunk_index += 1;
                on_event(ServerEvent::DownloadProgress(TransferProgress {
                    bundle: bundle.clone(),
                    bytes_transferred: received,
                    chunk_index,
                    chunks_total,
                    chunk_size,
                }));
            }
            Ok(RecvOutcome::Closed) | Ok(RecvOutcome::ShutdownLocally) => return Err(received),
            Err(_) => return Err(received),
        }
    }

    Ok(())
}
