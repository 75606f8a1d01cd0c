//! Socket abstraction shared by discovery (UDP) and transfer (TCP).
//!
//! Built on `socket2` rather than bare `std::net`: `socket2::Socket` gives
//! pre-bind control of `SO_REUSEADDR`/`SO_REUSEPORT`/`SO_BROADCAST` and,
//! critically, a `shutdown()` that operates on the raw fd so a *different*
//! thread can unblock one parked in `recv`/`accept`. A
//! `try_clone`d handle plus an `Arc<AtomicBool>` "did we request this"
//! flag is how every handle tells a deliberate shutdown apart from a
//! genuine I/O error surfacing on the same blocked call.

pub mod tcp;
pub mod udp;

use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub use tcp::{AcceptOutcome, TcpConnHandle, TcpListenerHandle};
pub use udp::UdpHandle;

pub(crate) fn as_uninit_mut(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
    // SAFETY: `u8` and `MaybeUninit<u8>` share layout; the slice length is
    // unchanged and the kernel only ever writes initialized bytes back.
    unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) }
}

#[cfg(unix)]
pub(crate) fn libc_msg_peek() -> i32 {
    libc::MSG_PEEK
}

#[cfg(not(unix))]
pub(crate) fn libc_msg_peek() -> i32 {
    0x2 // MSG_PEEK's value is standardized across BSD-sockets implementations
}

pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// One usable local interface: IPv4 only, excludes loopback and anything
/// not up-and-broadcast-capable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub unicast_address: Ipv4Addr,
    pub broadcast_address: Ipv4Addr,
}

/// Enumerates usable IPv4 interfaces. Falls back to a single synthetic
/// "any interface" entry bound to `0.0.0.0` with the limited broadcast
/// address `255.255.255.255` when the platform enumeration API is
/// unavailable, so discovery still has one interface to broadcast on.
pub fn enumerate_interfaces() -> Vec<Interface> {
    match if_addrs::get_if_addrs() {
        Ok(addrs) => addrs
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .filter_map(|iface| match iface.addr {
                if_addrs::IfAddr::V4(v4) => {
                    let broadcast = v4.broadcast.unwrap_or_else(|| {
                        compute_broadcast(v4.ip, v4.netmask)
                    });
                    Some(Interface {
                        name: iface.name,
                        unicast_address: v4.ip,
                        broadcast_address: broadcast,
                    })
                }
                if_addrs::IfAddr::V6(_) => None,
            })
            .collect(),
        Err(_) => vec![Interface {
            name: "any".to_string(),
            unicast_address: Ipv4Addr::UNSPECIFIED,
            broadcast_address: Ipv4Addr::BROADCAST,
        }],
    }
}

/// `unicast | ~netmask`, used when the platform doesn't report a
/// broadcast address directly.
fn compute_broadcast(unicast: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    let ip = u32::from(unicast);
    let mask = u32::from(netmask);
    Ipv4Addr::from(ip | !mask)
}

pub(crate) fn socket_addr_v4(ip: Ipv4Addr, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(ip), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_fallback_for_slash_24() {
        let unicast: Ipv4Addr = "192.168.1.42".parse().unwrap();
        let netmask: Ipv4Addr = "255.255.255.0".parse().unwrap();
        assert_eq!(
            compute_broadcast(unicast, netmask),
            "192.168.1.255".parse::<Ipv4Addr>().unwrap()
        );
    }
}
