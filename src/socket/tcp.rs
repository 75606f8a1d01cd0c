//! TCP side of the socket abstraction — used by the transfer listener and
//! per-connection workers. `shutdown()` here is genuine `shutdown(2)`:
//! POSIX defines it for connected and listening stream sockets, so it
//! reliably unblocks a thread parked in `accept`/`read`.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::{as_uninit_mut, libc_msg_peek};

/// Outcome of a single read (or a looped read-to-fill) on a connection.
#[derive(Debug, PartialEq, Eq)]
pub enum RecvOutcome {
    /// `usize` bytes were placed in the caller's buffer.
    Ok(usize),
    /// The peer closed its write half before the requested data arrived.
    Closed,
    /// `shutdown()` was called on this handle while the call was blocked.
    ShutdownLocally,
}

/// Outcome of an `accept()` call on a listener.
pub enum AcceptOutcome {
    Connected(TcpConnHandle),
    ShutdownLocally,
}

/// A listening TCP socket — one per running daemon (the transfer
/// listener; discovery uses UDP, see `udp.rs`).
pub struct TcpListenerHandle {
    socket: Socket,
    shutdown_requested: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl TcpListenerHandle {
    pub fn bind_listen(addr: SocketAddr, backlog: i32) -> io::Result<TcpListenerHandle> {
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(backlog)?;
        let local_addr = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "non-IP local address"))?;

        Ok(TcpListenerHandle {
            socket,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts the next inbound connection, or returns `ShutdownLocally`
    /// if the listener was shut down while this call was blocked — or
    /// immediately after: a connection that lands the instant before
    /// shutdown is still handed back as `ShutdownLocally` rather than
    /// silently dropped or leaked.
    pub fn accept(&self) -> io::Result<AcceptOutcome> {
        match self.socket.accept() {
            Ok((sock, addr)) => {
                if self.shutdown_requested.load(Ordering::SeqCst) {
                    let _ = sock.shutdown(std::net::Shutdown::Both);
                    return Ok(AcceptOutcome::ShutdownLocally);
                }
                let peer_addr = addr
                    .as_socket()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "non-IP peer address"))?;
                Ok(AcceptOutcome::Connected(TcpConnHandle::from_accepted(
                    sock, peer_addr,
                )))
            }
            Err(e) if self.shutdown_requested.load(Ordering::SeqCst) => {
                let _ = e;
                Ok(AcceptOutcome::ShutdownLocally)
            }
            Err(e) => Err(e),
        }
    }

    /// A handle that can call [`TcpListenerHandle::shutdown`] from
    /// another thread while this one is blocked in `accept`.
    pub fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        Ok(ShutdownHandle {
            socket: self.socket.try_clone()?,
            shutdown_requested: self.shutdown_requested.clone(),
        })
    }

    pub fn shutdown(&self) -> io::Result<()> {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.socket.shutdown(std::net::Shutdown::Both)
    }
}

/// A connected TCP stream: either the client's side of an outbound
/// transfer, or one of the server's per-connection workers.
pub struct TcpConnHandle {
    socket: Socket,
    shutdown_requested: Arc<AtomicBool>,
    peer_addr: SocketAddr,
}

impl TcpConnHandle {
    pub fn connect(addr: SocketAddr) -> io::Result<TcpConnHandle> {
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.connect(&SockAddr::from(addr))?;
        Ok(TcpConnHandle {
            socket,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            peer_addr: addr,
        })
    }

    fn from_accepted(socket: Socket, peer_addr: SocketAddr) -> TcpConnHandle {
        TcpConnHandle {
            socket,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            peer_addr,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.socket.write_all(buf)
    }

    /// A single, possibly-partial read. Used by the chunked bulk-transfer
    /// loops in the transfer client/server, which track their own byte counters.
    pub fn read_some(&mut self, buf: &mut [u8]) -> io::Result<RecvOutcome> {
        match self.socket.read(buf) {
            Ok(0) => Ok(self.closed_or_shutdown()),
            Ok(n) => Ok(RecvOutcome::Ok(n)),
            Err(e) if self.shutdown_requested.load(Ordering::SeqCst) => {
                let _ = e;
                Ok(RecvOutcome::ShutdownLocally)
            }
            Err(e) => Err(e),
        }
    }

    /// Loops until `buf` is completely filled, the peer closes, or this
    /// handle is shut down — the framed-control-message read contract.
    pub fn read_exact_framed(&mut self, buf: &mut [u8]) -> io::Result<RecvOutcome> {
        let mut total = 0;
        while total < buf.len() {
            match self.read_some(&mut buf[total..])? {
                RecvOutcome::Ok(n) => total += n,
                other => return Ok(other),
            }
        }
        Ok(RecvOutcome::Ok(total))
    }

    /// Non-consuming read, used to learn a frame's declared length before
    /// committing to reading the whole thing.
    pub fn peek(&mut self, buf: &mut [u8]) -> io::Result<RecvOutcome> {
        let uninit = as_uninit_mut(buf);
        match self.socket.recv_with_flags(uninit, libc_msg_peek()) {
            Ok(0) => Ok(self.closed_or_shutdown()),
            Ok(n) => Ok(RecvOutcome::Ok(n)),
            Err(e) if self.shutdown_requested.load(Ordering::SeqCst) => {
                let _ = e;
                Ok(RecvOutcome::ShutdownLocally)
            }
            Err(e) => Err(e),
        }
    }

    fn closed_or_shutdown(&self) -> RecvOutcome {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            RecvOutcome::ShutdownLocally
        } else {
            RecvOutcome::Closed
        }
    }

    /// A handle that can call [`TcpConnHandle::shutdown`] from another
    /// thread — this is how the transfer client's `cancel()` and the lifecycle coordinator's whole-daemon stop
    /// path unblock an in-flight transfer without a cooperative flag.
    pub fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        Ok(ShutdownHandle {
            socket: self.socket.try_clone()?,
            shutdown_requested: self.shutdown_requested.clone(),
        })
    }

    pub fn shutdown(&self) -> io::Result<()> {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.socket.shutdown(std::net::Shutdown::Both)
    }
}

/// A cheap, cloneable way to shut a [`TcpListenerHandle`] or
/// [`TcpConnHandle`] down from another thread.
pub struct ShutdownHandle {
    socket: Socket,
    shutdown_requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) -> io::Result<()> {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.socket.shutdown(std::net::Shutdown::Both)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::{Duration, Instant};

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
    }

    #[test]
    fn connect_accept_and_echo() {
        let listener = TcpListenerHandle::bind_listen(loopback(0), 10).unwrap();
        let addr = listener.local_addr();

        let server = std::thread::spawn(move || match listener.accept().unwrap() {
            AcceptOutcome::Connected(mut conn) => {
                let mut buf = [0u8; 5];
                assert_eq!(conn.read_exact_framed(&mut buf).unwrap(), RecvOutcome::Ok(5));
                assert_eq!(&buf, b"hello");
            }
            AcceptOutcome::ShutdownLocally => panic!("unexpected shutdown"),
        });

        let mut client = TcpConnHandle::connect(addr).unwrap();
        client.write_all(b"hello").unwrap();
        server.join().unwrap();
    }

    #[test]
    fn shutdown_unblocks_accept_quickly() {
        let listener = TcpListenerHandle::bind_listen(loopback(0), 10).unwrap();
        let shutdown = listener.shutdown_handle().unwrap();

        let worker = std::thread::spawn(move || listener.accept().unwrap());

        std::thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        shutdown.shutdown().unwrap();

        match worker.join().unwrap() {
            AcceptOutcome::ShutdownLocally => {}
            AcceptOutcome::Connected(_) => panic!("unexpected connection"),
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn shutdown_unblocks_a_parked_read() {
        let listener = TcpListenerHandle::bind_listen(loopback(0), 10).unwrap();
        let addr = listener.local_addr();
        let _client = TcpConnHandle::connect(addr).unwrap();

        let mut conn = match listener.accept().unwrap() {
            AcceptOutcome::Connected(c) => c,
            AcceptOutcome::ShutdownLocally => panic!("unexpected shutdown"),
        };
        let shutdown = conn.shutdown_handle().unwrap();

        let worker = std::thread::spawn(move || {
            let mut buf = [0u8; 16];
            conn.read_exact_framed(&mut buf)
        });

        std::thread::sleep(Duration::from_millis(20));
        shutdown.shutdown().unwrap();

        assert_eq!(worker.join().unwrap().unwrap(), RecvOutcome::ShutdownLocally);
    }
}
