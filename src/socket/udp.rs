//! UDP side of the socket abstraction — used by the discovery client
//! and responder.
//!
//! Cancellation note: `shutdown()` is the sole cancellation mechanism
//! across this crate, and that's exactly what [`tcp::TcpConnHandle`]
//! and [`tcp::TcpListenerHandle`] use — `shutdown(2)` on a connected or
//! listening TCP socket is POSIX-defined to unblock a thread parked in
//! `read`/`accept`. An *unconnected* UDP socket has no such guarantee:
//! `shutdown(2)` on it is undefined on most platforms and a no-op or
//! `ENOTCONN` in practice. [`UdpHandle`] therefore pairs the same
//! shutdown-requested flag with a short internal poll interval — the
//! blocked `recv_from` wakes at most [`POLL_INTERVAL`] after `shutdown()`
//! is called and checks the flag itself, rather than relying on the
//! kernel to interrupt it. Callers never observe this poll tick: it is
//! absorbed into `Timeout` bookkeeping and never surfaces on its own.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::{as_uninit_mut, is_timeout, libc_msg_peek};

/// Internal poll granularity backing UDP cancellation; bounds how long
/// `shutdown()` can take to unblock a parked `recv_from`.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of a single `recv_from`/`peek_from` call.
#[derive(Debug)]
pub enum RecvOutcome {
    /// `len` bytes were written into the caller's buffer, sent by `from`.
    Data { len: usize, from: SocketAddr },
    /// `shutdown()` was called on this handle (possibly from another
    /// thread) while this call was blocked.
    ShutdownLocally,
    /// The caller-specified timeout elapsed with no datagram arriving.
    /// Never produced when `timeout` is `None` (the responder's mode).
    Timeout,
}

/// A bound UDP socket plus the bookkeeping needed to cancel a blocked
/// receive from another thread.
pub struct UdpHandle {
    socket: Socket,
    shutdown_requested: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl UdpHandle {
    /// Binds a new UDP socket to `addr`, setting address reuse (and port
    /// reuse where the platform offers it) as listening sockets do
    /// throughout this crate.
    pub fn bind(addr: SocketAddr) -> io::Result<UdpHandle> {
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let local_addr = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "non-IP local address"))?;

        Ok(UdpHandle {
            socket,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            local_addr,
        })
    }

    /// Sets `SO_BROADCAST` and disables multicast loopback where
    /// available, as discovery sockets require.
    pub fn configure_for_discovery(&self) -> io::Result<()> {
        self.socket.set_broadcast(true)?;
        // Best-effort: not every platform exposes this for a socket that
        // isn't joined to a multicast group, so a failure here is not
        // fatal to discovery itself.
        let _ = self.socket.set_multicast_loop_v4(false);
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, &SockAddr::from(addr))
    }

    /// Receives the next datagram into `buf`.
    ///
    /// `peek`, when set, leaves the datagram in the socket's receive
    /// queue for a subsequent call. `timeout`
    /// bounds the logical wait for a datagram; `None` blocks until either
    /// data arrives or [`UdpHandle::shutdown`] is called (the discovery
    /// responder's mode, which never times out).
    pub fn recv_from(
        &self,
        buf: &mut [u8],
        peek: bool,
        timeout: Option<Duration>,
    ) -> io::Result<RecvOutcome> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let flags = if peek { libc_msg_peek() } else { 0 };

        loop {
            if self.shutdown_requested.load(Ordering::SeqCst) {
                return Ok(RecvOutcome::ShutdownLocally);
            }

            let uninit = as_uninit_mut(buf);
            match self.socket.recv_from_with_flags(uninit, flags) {
                Ok((len, addr)) => {
                    let from = addr.as_socket().ok_or_else(|| {
                        io::Error::new(io::ErrorKind::Other, "non-IP sender address")
                    })?;
                    return Ok(RecvOutcome::Data { len, from });
                }
                Err(e) if is_timeout(&e) => {
                    if self.shutdown_requested.load(Ordering::SeqCst) {
                        return Ok(RecvOutcome::ShutdownLocally);
                    }
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Ok(RecvOutcome::Timeout);
                        }
                    }
                    // Just a poll tick; keep waiting for the logical timeout.
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A handle that can call [`UdpHandle::shutdown`] from another thread
    /// while this one is blocked in `recv_from`.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown_requested: self.shutdown_requested.clone(),
        }
    }

    /// Requests that any thread parked in `recv_from` on this handle (or
    /// a [`ShutdownHandle`] derived from it) return
    /// `RecvOutcome::ShutdownLocally` within one poll interval.
    pub fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }
}

/// A cheap, cloneable way to shut a [`UdpHandle`] down from another
/// thread — the lifecycle coordinator holds one of these per socket it owns.
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown_requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn bind_and_send_recv_loopback() {
        let a = UdpHandle::bind(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)).unwrap();
        let b = UdpHandle::bind(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)).unwrap();

        a.send_to(b"hello", b.local_addr()).unwrap();

        let mut buf = [0u8; 16];
        match b.recv_from(&mut buf, false, Some(Duration::from_secs(1))).unwrap() {
            RecvOutcome::Data { len, from } => {
                assert_eq!(&buf[..len], b"hello");
                assert_eq!(from, a.local_addr());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn recv_times_out_with_no_traffic() {
        let a = UdpHandle::bind(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)).unwrap();
        let mut buf = [0u8; 16];
        match a
            .recv_from(&mut buf, false, Some(Duration::from_millis(120)))
            .unwrap()
        {
            RecvOutcome::Timeout => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn shutdown_unblocks_a_parked_recv() {
        let a = Arc::new(UdpHandle::bind(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)).unwrap());
        let shutdown = a.shutdown_handle();

        let worker = {
            let a = a.clone();
            std::thread::spawn(move || {
                let mut buf = [0u8; 16];
                a.recv_from(&mut buf, false, None).unwrap()
            })
        };

        std::thread::sleep(Duration::from_millis(75));
        shutdown.shutdown();

        match worker.join().unwrap() {
            RecvOutcome::ShutdownLocally => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn peek_leaves_datagram_for_next_read() {
        let a = UdpHandle::bind(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)).unwrap();
        let b = UdpHandle::bind(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)).unwrap();
        a.send_to(b"hi", b.local_addr()).unwrap();

        let mut peek_buf = [0u8; 16];
        let peeked = b
            .recv_from(&mut peek_buf, true, Some(Duration::from_secs(1)))
            .unwrap();
        assert!(matches!(peeked, RecvOutcome::Data { len: 2, .. }));

        let mut real_buf = [0u8; 16];
        let real = b
            .recv_from(&mut real_buf, false, Some(Duration::from_secs(1)))
            .unwrap();
        assert!(matches!(real, RecvOutcome::Data { len: 2, .. }));
        assert_eq!(&real_buf[..2], b"hi");
    }
}
