//! The lifecycle coordinator: owns the discovery responder and
//! transfer accept-loop threads, the sockets they block on, and the
//! per-connection worker threads they spawn, and the cyclic ownership
//! between threads and handle that this design has to break.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config::Config;
use crate::discovery;
use crate::error::{GlError, Result};
use crate::peer::{FileBundle, Peer, TransferProgress};
use crate::socket::tcp::TcpListenerHandle;
use crate::socket::udp::UdpHandle;
use crate::transfer::server::{self, PolicyFn};
use crate::transfer::ServerEvent;

/// Callback slots consumed by the hosting UI/CLI. Configured before
/// [`start`] and treated as read-only once the daemon is running — every
/// field here is therefore plain data, not something behind its own lock.
pub struct ServerCallbacks {
    pub on_started: Box<dyn Fn() + Send + Sync>,
    pub on_stopped: Box<dyn Fn() + Send + Sync>,
    pub on_connection_accepted: Box<dyn Fn(SocketAddr) + Send + Sync>,
    pub on_connection_closed: Box<dyn Fn(SocketAddr) + Send + Sync>,
    pub on_transfer_requested: Arc<PolicyFn>,
    pub on_download_progress: Box<dyn Fn(&TransferProgress) + Send + Sync>,
    pub on_download_success: Box<dyn Fn(&FileBundle) + Send + Sync>,
    pub on_download_failed: Box<dyn Fn(u64) + Send + Sync>,
}

impl Default for ServerCallbacks {
    fn default() -> ServerCallbacks {
        ServerCallbacks {
            on_started: Box::new(|| {}),
            on_stopped: Box::new(|| {}),
            on_connection_accepted: Box::new(|_| {}),
            on_connection_closed: Box::new(|_| {}),
            on_transfer_requested: Arc::new(|_, _| false),
            on_download_progress: Box::new(|_| {}),
            on_download_success: Box::new(|_| {}),
            on_download_failed: Box::new(|_| {}),
        }
    }
}

struct Sockets {
    discovery: Option<Arc<UdpHandle>>,
    transfer: Option<Arc<TcpListenerHandle>>,
}

/// Owns every thread and socket a running daemon has. Cheap to clone the
/// handles workers need: each one gets a config snapshot by value and an
/// `Arc` to the shared socket cell, never a way to call back into this
/// struct.
pub struct ServerHandle {
    sockets: Mutex<Sockets>,
    discovery_thread: Mutex<Option<JoinHandle<()>>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    callbacks: Arc<ServerCallbacks>,
}

/// Starts both long-lived threads and returns once they're running.
pub fn serve(config: Config, callbacks: ServerCallbacks) -> Result<ServerHandle> {
    let callbacks = Arc::new(callbacks);

    let discovery_socket = discovery::bind_responder_socket().map_err(GlError::Socket)?;
    let discovery_socket = Arc::new(discovery_socket);

    let transfer_listener = match server::bind_transfer_listener() {
        Ok(l) => Arc::new(l),
        Err(e) => {
            // Unwind the discovery socket we already opened: either
            // socket fails to bind, both unwind.
            discovery_socket.shutdown();
            return Err(GlError::Socket(e));
        }
    };

    let identity = config.identity().clone();
    let discovery_thread = {
        let discovery_socket = discovery_socket.clone();
        std::thread::spawn(move || discovery::run_responder(discovery_socket, identity))
    };

    // Shared end-to-end with `ServerHandle.workers` — the accept loop
    // pushes into the very same cell `stop()` later drains, not a copy.
    let workers: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
    let accept_thread = {
        let transfer_listener = transfer_listener.clone();
        let config = config.clone();
        let callbacks = callbacks.clone();
        let workers = workers.clone();
        std::thread::spawn(move || {
            server::run_accept_loop(&transfer_listener, |conn| {
                let config = config.clone();
                let callbacks = callbacks.clone();
                let peer_addr = conn.peer_addr();
                let join = std::thread::spawn(move || {
                    run_worker(conn, &config, &callbacks, peer_addr);
                });
                workers.lock().unwrap_or_else(|e| e.into_inner()).push(join);
            });
        })
    };

    (callbacks.on_started)();

    Ok(ServerHandle {
        sockets: Mutex::new(Sockets {
            discovery: Some(discovery_socket),
            transfer: Some(transfer_listener),
        }),
        discovery_thread: Mutex::new(Some(discovery_thread)),
        accept_thread: Mutex::new(Some(accept_thread)),
        workers,
        callbacks,
    })
}

fn run_worker(
    conn: crate::socket::tcp::TcpConnHandle,
    config: &Config,
    callbacks: &ServerCallbacks,
    peer_addr: SocketAddr,
) {
    server::handle_connection(
        conn,
        config,
        callbacks.on_transfer_requested.clone(),
        server::DEFAULT_POLICY_TIMEOUT,
        crate::peer::DEFAULT_CHUNK_SIZE,
        |event| match event {
            ServerEvent::ConnectionAccepted => (callbacks.on_connection_accepted)(peer_addr),
            ServerEvent::ConnectionClosed => (callbacks.on_connection_closed)(peer_addr),
            ServerEvent::DownloadProgress(p) => (callbacks.on_download_progress)(&p),
            ServerEvent::DownloadSuccess(b) => (callbacks.on_download_success)(&b),
            ServerEvent::DownloadFailed { bytes_received } => {
                (callbacks.on_download_failed)(bytes_received)
            }
        },
    );
}

impl ServerHandle {
    /// `true` until [`ServerHandle::stop`] clears the socket slots.
    pub fn is_running(&self) -> bool {
        let sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
        sockets.discovery.is_some() || sockets.transfer.is_some()
    }

    /// Shuts down both sockets under the mutex, clears the slots,
    /// releases the mutex, then joins both long-lived threads and every
    /// still-live per-connection worker. Returns the first non-trivial
    /// error encountered; a shutdown call racing against a socket that's
    /// already closed is swallowed rather than surfaced.
    pub fn stop(&self) -> Result<()> {
        let mut first_error: Option<GlError> = None;
        let mut note_error = |e: GlError| {
            if first_error.is_none() {
                first_error = Some(e);
            }
        };

        {
            let mut sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(discovery) = sockets.discovery.take() {
                discovery.shutdown();
            }
            if let Some(transfer) = sockets.transfer.take() {
                if let Err(e) = transfer.shutdown() {
                    if !is_shutdown_race(&e) {
                        note_error(GlError::Socket(e));
                    }
                }
            }
        }

        if let Some(t) = self.discovery_thread.lock().unwrap_or_else(|e| e.into_inner()).take() {
            if t.join().is_err() {
                note_error(panicked_thread_error("discovery responder"));
            }
        }
        if let Some(t) = self.accept_thread.lock().unwrap_or_else(|e| e.into_inner()).take() {
            if t.join().is_err() {
                note_error(panicked_thread_error("transfer accept loop"));
            }
        }

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for worker in workers.drain(..) {
            if worker.join().is_err() {
                note_error(panicked_thread_error("transfer connection worker"));
            }
        }
        drop(workers);

        (self.callbacks.on_stopped)();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A shutdown call that races against a socket another thread already
/// closed is not a real failure — only an error of some other kind is.
fn is_shutdown_race(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::NotConnected)
}

fn panicked_thread_error(which: &str) -> GlError {
    GlError::Socket(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("{which} thread panicked"),
    ))
}

impl Drop for ServerHandle {
    /// Dropping a handle that's still running implies `stop()`; an error
    /// here has nowhere to propagate to, so it's logged instead.
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                log::error!("error stopping server handle during drop: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_DEVICE_TYPE;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    #[test]
    fn start_and_stop_within_a_bounded_time() {
        let dir = tempdir().unwrap();
        let config = Config::new([3; 8], DEFAULT_DEVICE_TYPE, "coordinator", dir.path()).unwrap();
        let started = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));

        let callbacks = ServerCallbacks {
            on_started: {
                let started = started.clone();
                Box::new(move || started.store(true, Ordering::SeqCst))
            },
            on_stopped: {
                let stopped = stopped.clone();
                Box::new(move || stopped.store(true, Ordering::SeqCst))
            },
            ..ServerCallbacks::default()
        };

        let handle = serve(config, callbacks).unwrap();
        assert!(started.load(Ordering::SeqCst));
        assert!(handle.is_running());

        let start = Instant::now();
        handle.stop().unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(!handle.is_running());
        assert!(stopped.load(Ordering::SeqCst));
    }
}
