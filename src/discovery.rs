//! The UDP discovery engine: broadcasting queries on the client
//! side and answering them on the server side.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, Identity};
use crate::message::{self, ControlMessage};
use crate::peer::Peer;
use crate::socket::udp::{RecvOutcome, UdpHandle};
use crate::socket::{self, Interface};
use crate::GL_DISCOVERY_PORT;

/// Default discovery-client receive timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Large enough for any valid `Discovery` frame (19-byte header + up to a
/// 255-byte hostname), with headroom.
const DATAGRAM_BUF_LEN: usize = 512;

/// Runs one discovery round: broadcasts a query on every usable
/// interface and collects replies within `timeout` per interface.
/// `on_peer_discovered` is invoked once per distinct
/// `network_address` the instant a reply is accepted, and the full
/// deduplicated set is also returned once the round completes.
pub fn discover(
    config: &Config,
    timeout: Duration,
    mut on_peer_discovered: impl FnMut(&Peer),
) -> Vec<Peer> {
    let mut interfaces = socket::enumerate_interfaces();
    if interfaces.is_empty() {
        interfaces.push(Interface {
            name: "any".to_string(),
            unicast_address: Ipv4Addr::UNSPECIFIED,
            broadcast_address: Ipv4Addr::BROADCAST,
        });
    }

    let query = message::encode_discovery(config.identity());
    let mut seen = HashSet::new();
    let mut results = Vec::new();

    for interface in interfaces {
        match discover_on_interface(&interface, config.identity(), &query, timeout) {
            Ok(peers) => {
                for peer in peers {
                    if seen.insert(peer.network_address) {
                        on_peer_discovered(&peer);
                        results.push(peer);
                    }
                }
            }
            Err(e) => {
                log::warn!(
                    "discovery on interface {} ({}) failed: {e}",
                    interface.name,
                    interface.unicast_address
                );
            }
        }
    }

    results
}

fn discover_on_interface(
    interface: &Interface,
    our_identity: &Identity,
    query: &[u8],
    timeout: Duration,
) -> std::io::Result<Vec<Peer>> {
    let bind_addr = socket::socket_addr_v4(interface.unicast_address, 0);
    let handle = UdpHandle::bind(bind_addr)?;
    handle.configure_for_discovery()?;

    let broadcast_addr = socket::socket_addr_v4(interface.broadcast_address, GL_DISCOVERY_PORT);
    handle.send_to(query, broadcast_addr)?;
    log::debug!(
        "sent discovery query from {} to {broadcast_addr}",
        handle.local_addr()
    );

    let mut peers = Vec::new();
    let mut buf = [0u8; DATAGRAM_BUF_LEN];

    loop {
        match handle.recv_from(&mut buf, false, Some(timeout))? {
            RecvOutcome::Data { len, from } => {
                match message::parse(&buf[..len]) {
                    Ok(ControlMessage::Discovery { identity }) => {
                        // Our own broadcast never reaches the application
                        // layer.
                        if identity.unique_peer_id == our_identity.unique_peer_id {
                            continue;
                        }
                        peers.push(Peer::from_identity(identity, from));
                    }
                    _ => continue, // non-discovery or malformed: drop and continue
                }
            }
            RecvOutcome::Timeout => break,
            RecvOutcome::ShutdownLocally => break,
        }
    }

    Ok(peers)
}

/// Server side of discovery: answers discovery queries until `socket` is shut
/// down. Runs on its own thread, owned by the lifecycle coordinator.
pub fn run_responder(socket: Arc<UdpHandle>, identity: Identity) {
    let mut buf = [0u8; DATAGRAM_BUF_LEN];
    log::info!("discovery responder listening on {}", socket.local_addr());

    loop {
        match socket.recv_from(&mut buf, false, None) {
            Ok(RecvOutcome::Data { len, from }) => {
                match message::parse(&buf[..len]) {
                    Ok(ControlMessage::Discovery { identity: sender }) => {
                        if sender.unique_peer_id == identity.unique_peer_id {
                            continue; // self-origin: never answer our own query
                        }
                        let reply = message::encode_discovery(&identity);
                        if let Err(e) = socket.send_to(&reply, from) {
                            log::warn!("failed to answer discovery query from {from}: {e}");
                        }
                    }
                    _ => continue, // non-discovery or malformed: ignored silently
                }
            }
            Ok(RecvOutcome::Timeout) => continue,
            Ok(RecvOutcome::ShutdownLocally) => break,
            Err(e) => {
                log::error!("discovery responder recv error: {e}");
                break;
            }
        }
    }

    log::info!("discovery responder stopped");
}

/// Binds the responder's well-known socket. Separate from
/// [`run_responder`] so the lifecycle coordinator can register the handle
/// under its mutex before spawning the thread that runs the loop.
pub fn bind_responder_socket() -> std::io::Result<UdpHandle> {
    let addr: SocketAddr = socket::socket_addr_v4(Ipv4Addr::UNSPECIFIED, GL_DISCOVERY_PORT);
    let handle = UdpHandle::bind(addr)?;
    handle.configure_for_discovery()?;
    Ok(handle)
}
