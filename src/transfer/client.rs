//! The transfer client: one worker thread per outbound transfer, sharing
//! a single TCP connection for the request, the accept/decline byte, and
//! the data stream.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use crate::config::Config;
use crate::error::{GlError, Result};
use crate::message;
use crate::peer::{FileBundle, TransferProgress};
use crate::socket::tcp::{RecvOutcome, ShutdownHandle, TcpConnHandle};

use super::{ClientEvent, ACCEPT_BYTE};

/// A transfer in flight, returned by [`send`] once the connection is
/// established. `cancel()` is the only way to interrupt a send — there
/// is no cooperative flag.
pub struct SendHandle {
    join: JoinHandle<Result<()>>,
    shutdown: ShutdownHandle,
}

impl SendHandle {
    /// Shuts down the underlying socket; any blocked read or write in the
    /// worker thread returns `ShutdownLocally` and the worker surfaces
    /// `TransferInterrupted`.
    pub fn cancel(&self) {
        let _ = self.shutdown.shutdown();
    }

    /// Blocks until the transfer worker exits, returning its result.
    pub fn join(self) -> Result<()> {
        self.join
            .join()
            .unwrap_or_else(|_| GlError::abort_internal("send worker thread panicked"))
    }
}

/// Stats the file and builds its bundle, failing if it isn't a regular
/// file.
pub fn setup(file_path: impl AsRef<Path>) -> Result<FileBundle> {
    FileBundle::from_path(file_path)
}

/// Opens a connection to `peer_address`, requests the transfer of
/// `bundle`, and — if accepted — streams it. Spawns the worker thread and
/// returns as soon as the connection is established, so the caller can
/// `cancel()` a send already in flight.
pub fn send(
    config: &Config,
    peer_address: SocketAddr,
    bundle: FileBundle,
    chunk_size: u32,
    mut on_event: impl FnMut(ClientEvent) + Send + 'static,
) -> Result<SendHandle> {
    let identity = config.identity().clone();
    let (tx, rx) = mpsc::channel::<Result<ShutdownHandle>>();

    let join = thread::spawn(move || -> Result<()> {
        let mut conn = match TcpConnHandle::connect(peer_address) {
            Ok(conn) => conn,
            Err(e) => {
                let _ = tx.send(Err(GlError::Socket(e)));
                return Err(GlError::Socket(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "connection failed",
                )));
            }
        };
        let shutdown = match conn.shutdown_handle() {
            Ok(h) => h,
            Err(_) => GlError::abort_internal("failed to derive shutdown handle"),
        };
        let _ = tx.send(Ok(shutdown));

        run_send(&mut conn, identity, bundle, chunk_size, &mut on_event)
    });

    match rx.recv() {
        Ok(Ok(shutdown)) => Ok(SendHandle { join, shutdown }),
        Ok(Err(e)) => {
            let _ = join.join();
            Err(e)
        }
        Err(_) => {
            // Worker panicked before sending anything.
            let outcome = join.join();
            match outcome {
                Ok(Err(e)) => Err(e),
                _ => GlError::abort_internal("send worker thread panicked before connecting"),
            }
        }
    }
}

fn run_send(
    conn: &mut TcpConnHandle,
    identity: crate::config::Identity,
    bundle: FileBundle,
    chunk_size: u32,
    on_event: &mut (impl FnMut(ClientEvent) + Send + 'static),
) -> Result<()> {
    let request = message::encode_file_request(&identity, 0, &bundle.base_name, bundle.size);
    conn.write_all(&request)?;

    let mut response = [0u8; 1];
    match conn.read_exact_framed(&mut response)? {
        RecvOutcome::Ok(_) => {}
        RecvOutcome::Closed => return Err(peer_closed_before_response()),
        RecvOutcome::ShutdownLocally => {
            on_event(ClientEvent::Disconnected);
            return Err(GlError::TransferInterrupted { bytes_sent: 0 });
        }
    }

    let accepted = response[0] == ACCEPT_BYTE;
    on_event(ClientEvent::RequestResponse {
        bundle: bundle.clone(),
        accepted,
    });
    if !accepted {
        return Err(GlError::PolicyDeclined);
    }

    let source_path = bundle
        .original_path
        .as_ref()
        .unwrap_or_else(|| GlError::abort_internal("send() called on a bundle with no source path"));
    let mut file = std::fs::File::open(source_path)?;

    let chunks_total = crate::peer::chunks_total(bundle.size, chunk_size);
    let mut buf = vec![0u8; chunk_size as usize];
    let mut bytes_sent: u64 = 0;
    let mut chunk_index: u32 = 0;

    loop {
        let n = std::io::Read::read(&mut file, &mut buf).map_err(GlError::Socket)?;
        if n == 0 {
            break;
        }
        if conn.write_all(&buf[..n]).is_err() {
            return Err(GlError::TransferInterrupted { bytes_sent });
        }
        bytes_sent += n as u64;
        chunk_index += 1;
        on_event(ClientEvent::Progress(TransferProgress {
            bundle: bundle.clone(),
            bytes_transferred: bytes_sent,
            chunk_index,
            chunks_total,
            chunk_size,
        }));
    }

    if bytes_sent != bundle.size {
        return Err(GlError::TransferInterrupted { bytes_sent });
    }

    on_event(ClientEvent::Success(bundle));
    Ok(())
}

fn peer_closed_before_response() -> GlError {
    GlError::Socket(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "peer closed the connection before responding to the transfer request",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_DEVICE_TYPE;
    use crate::message::ControlMessage;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpListener, TcpStream};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn config() -> Config {
        Config::new([7; 8], DEFAULT_DEVICE_TYPE, "sender", "/tmp").unwrap()
    }

    fn loopback_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    /// Reads exactly one framed control message off a bare `TcpStream`,
    /// mirroring what `server.rs` does but without pulling it in, so this
    /// test exercises only the client's half of the contract.
    fn read_request(stream: &mut TcpStream) -> (u64, String) {
        let mut header = [0u8; message::HEADER_PEEK_LEN];
        stream.read_exact(&mut header).unwrap();
        let total_len = message::peek_len(&header).unwrap() as usize;
        let mut rest = vec![0u8; total_len - header.len()];
        stream.read_exact(&mut rest).unwrap();
        let mut full = header.to_vec();
        full.extend(rest);
        match message::parse(&full).unwrap() {
            ControlMessage::FileRequest { file_size, file_name, .. } => (file_size, file_name),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn send_streams_an_accepted_file_byte_exact() {
        let (listener, addr) = loopback_listener();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        let bundle = FileBundle::from_path(file.path()).unwrap();
        let expected_name = bundle.base_name.clone();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let (file_size, file_name) = read_request(&mut stream);
            assert_eq!(file_size, 5);
            assert_eq!(file_name, expected_name);
            stream.write_all(&[ACCEPT_BYTE]).unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).unwrap();
            received
        });

        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let handle = send(&config(), addr, bundle, 4096, move |event| {
            events_clone.lock().unwrap().push(format!("{event:?}"));
        })
        .unwrap();
        handle.join().unwrap();

        let received = server.join().unwrap();
        assert_eq!(received, b"hello");

        let recorded = events.lock().unwrap();
        assert!(recorded.iter().any(|e| e.contains("RequestResponse") && e.contains("accepted: true")));
        assert!(recorded.iter().any(|e| e.contains("Success")));
    }

    #[test]
    fn send_reports_decline() {
        let (listener, addr) = loopback_listener();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"x").unwrap();
        let bundle = FileBundle::from_path(file.path()).unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut header = [0u8; message::HEADER_PEEK_LEN];
            stream.read_exact(&mut header).unwrap();
            let total_len = message::peek_len(&header).unwrap() as usize;
            let mut rest = vec![0u8; total_len - header.len()];
            stream.read_exact(&mut rest).unwrap();
            stream.write_all(&[super::DECLINE_BYTE]).unwrap();
        });

        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let handle = send(&config(), addr, bundle, 4096, move |event| {
            events_clone.lock().unwrap().push(format!("{event:?}"));
        })
        .unwrap();

        let err = handle.join().unwrap_err();
        assert!(matches!(err, GlError::PolicyDeclined));
        server.join().unwrap();

        let recorded = events.lock().unwrap();
        assert!(recorded.iter().any(|e| e.contains("accepted: false")));
    }

    #[test]
    fn connect_failure_surfaces_immediately() {
        // Nothing listens on this port; the connection attempt itself
        // should fail before any thread-handoff games happen.
        let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 1);
        let result = send(&config(), addr, dummy_bundle(), 4096, |_| {});
        assert!(result.is_err());
    }

    fn dummy_bundle() -> FileBundle {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"x").unwrap();
        FileBundle::from_path(file.path()).unwrap()
    }

    #[test]
    fn cancel_interrupts_an_in_flight_send() {
        let (listener, addr) = loopback_listener();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; 1_000_000]).unwrap();
        let bundle = FileBundle::from_path(file.path()).unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut header = [0u8; message::HEADER_PEEK_LEN];
            stream.read_exact(&mut header).unwrap();
            let total_len = message::peek_len(&header).unwrap() as usize;
            let mut rest = vec![0u8; total_len - header.len()];
            stream.read_exact(&mut rest).unwrap();
            stream.write_all(&[ACCEPT_BYTE]).unwrap();
            // Accept the connection but never drain the data stream, so
            // the client's writes eventually block on a full socket
            // buffer until we close our end.
            thread::sleep(Duration::from_millis(200));
        });

        let handle = send(&config(), addr, bundle, 4096, |_| {}).unwrap();
        thread::sleep(Duration::from_millis(30));
        handle.cancel();
        let result = handle.join();
        assert!(result.is_err());
        server.join().unwrap();
    }
}
