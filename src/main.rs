//! Thin CLI front-end over the library's process-boundary surface:
//! `send`, `discover`, and `serve`. Owns argument parsing, log
//! initialization, and a minimal policy callback; none of the library's
//! modules depend on anything here.

use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::Rng;

use groundlift::config::DEFAULT_DEVICE_TYPE;
use groundlift::lifecycle::{self, ServerCallbacks};
use groundlift::transfer::{client, ClientEvent};
use groundlift::{discovery, Config, GlError, GL_TRANSFER_PORT};

#[derive(Parser, Debug)]
#[command(name = "groundlift", about = "LAN peer-to-peer file transfer")]
struct Cli {
    /// Hostname advertised to peers (defaults to $HOSTNAME, falling back to
    /// "groundlift-peer").
    #[arg(long, global = true)]
    hostname: Option<String>,

    /// 3-byte device type tag, e.g. DSK, LAP, PHN.
    #[arg(long, global = true)]
    device_type: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Broadcast a discovery query on every usable interface and print
    /// peers that respond within the timeout window.
    Discover {
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
    },
    /// Send a single file to a peer and report progress.
    Send {
        address: IpAddr,
        #[arg(long, default_value_t = GL_TRANSFER_PORT)]
        port: u16,
        file: PathBuf,
    },
    /// Run the discovery responder and transfer server until stopped.
    Serve {
        /// Directory incoming transfers are written to.
        #[arg(long)]
        download_dir: PathBuf,
        /// Accept every incoming transfer request without prompting.
        #[arg(long)]
        auto_accept: bool,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let identity = build_identity(cli.hostname, cli.device_type)?;

    match cli.command {
        Command::Discover { timeout_ms } => run_discover(identity, timeout_ms),
        Command::Send { address, port, file } => run_send(identity, address, port, file),
        Command::Serve { download_dir, auto_accept } => run_serve(identity, download_dir, auto_accept),
    }
}

struct Identity {
    unique_peer_id: [u8; 8],
    device_type: [u8; 3],
    hostname: String,
}

fn build_identity(hostname: Option<String>, device_type: Option<String>) -> anyhow::Result<Identity> {
    let hostname = hostname
        .or_else(|| std::env::var("HOSTNAME").ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "groundlift-peer".to_string());

    let device_type = match device_type {
        Some(s) => {
            let bytes = s.as_bytes();
            anyhow::ensure!(bytes.len() == 3, "--device-type must be exactly 3 bytes, got {s:?}");
            let mut tag = [0u8; 3];
            tag.copy_from_slice(bytes);
            tag
        }
        None => DEFAULT_DEVICE_TYPE,
    };

    let mut unique_peer_id = [0u8; 8];
    rand::thread_rng().fill(&mut unique_peer_id);

    Ok(Identity { unique_peer_id, device_type, hostname })
}

fn run_discover(identity: Identity, timeout_ms: u64) -> anyhow::Result<()> {
    // `discover()` doesn't read download_directory; the current directory
    // is an inert placeholder satisfying `Config::new`'s absolute-path
    // invariant.
    let cwd = std::env::current_dir()?;
    let config = Config::new(
        identity.unique_peer_id,
        identity.device_type,
        identity.hostname,
        cwd,
    )?;

    let peers = discovery::discover(&config, Duration::from_millis(timeout_ms), |peer| {
        println!(
            "{}\t{}\t{}",
            peer.network_address,
            String::from_utf8_lossy(&peer.device_type),
            peer.hostname
        );
    });

    if peers.is_empty() {
        eprintln!("no peers responded within {timeout_ms}ms");
    }
    Ok(())
}

fn run_send(identity: Identity, address: IpAddr, port: u16, file: PathBuf) -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    let config = Config::new(
        identity.unique_peer_id,
        identity.device_type,
        identity.hostname,
        cwd,
    )?;

    let bundle = client::setup(&file)?;
    let peer_addr = SocketAddr::new(address, port);

    let handle = client::send(&config, peer_addr, bundle, 4096, |event| match event {
        ClientEvent::RequestResponse { bundle, accepted } => {
            println!("{}: {}", bundle.base_name, if accepted { "accepted" } else { "declined" });
        }
        ClientEvent::Progress(p) => {
            println!("{}/{} bytes sent", p.bytes_transferred, p.bundle.size);
        }
        ClientEvent::Success(bundle) => println!("{} sent successfully", bundle.base_name),
        ClientEvent::Disconnected => eprintln!("peer disconnected"),
    })?;

    match handle.join() {
        Ok(()) => Ok(()),
        Err(GlError::PolicyDeclined) => {
            eprintln!("transfer declined by peer");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn run_serve(identity: Identity, download_dir: PathBuf, auto_accept: bool) -> anyhow::Result<()> {
    let config = Config::new(
        identity.unique_peer_id,
        identity.device_type,
        identity.hostname,
        std::fs::canonicalize(&download_dir)?,
    )?;

    let callbacks = ServerCallbacks {
        on_started: Box::new(|| println!("groundlift: serving")),
        on_stopped: Box::new(|| println!("groundlift: stopped")),
        on_connection_accepted: Box::new(|addr| log::info!("connection from {addr}")),
        on_connection_closed: Box::new(|addr| log::info!("connection from {addr} closed")),
        on_transfer_requested: std::sync::Arc::new(move |peer, bundle| {
            if auto_accept {
                return true;
            }
            prompt_accept(peer, bundle)
        }),
        on_download_progress: Box::new(|p| {
            println!("{}: {}/{} bytes", p.bundle.base_name, p.bytes_transferred, p.bundle.size);
        }),
        on_download_success: Box::new(|bundle| println!("{}: done", bundle.base_name)),
        on_download_failed: Box::new(|bytes_received| {
            eprintln!("transfer failed after {bytes_received} bytes");
        }),
    };

    let handle = lifecycle::serve(config, callbacks)?;

    println!("press enter to stop serving");
    let mut line = String::new();
    let _ = io::stdin().read_line(&mut line);

    handle.stop()?;
    Ok(())
}

fn prompt_accept(peer: &groundlift::Peer, bundle: &groundlift::FileBundle) -> bool {
    print!(
        "{} ({}) wants to send {} ({} bytes) - accept? [y/N] ",
        peer.hostname, peer.network_address, bundle.base_name, bundle.size
    );
    let _ = io::stdout().flush();
    let mut line = String::new();
    if io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
}

