//! # Loopback forwarding walkthrough
//!
//! Drives a [`TunnelHandler`] over the in-memory transport, playing the
//! remote peer by hand.
//!
//! Demonstrates:
//! - Remote forward on an ephemeral port, carrying a ping/pong exchange
//! - Direct connection to a local echo service
//! - Refused shell with the fixed banner
//! - Cancel, then disconnect releasing everything

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::info;
use tunnel_core::memory;
use tunnel_core::{ConnectionHandler, Endpoint, IdentifiedChannel};
use tunnel_server::{TunnelConfig, TunnelHandler};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Loopback forwarding demo
#[derive(Parser, Debug)]
#[command(name = "loopback_forward", about = "Exercise port forwarding over a loopback transport")]
struct Cli {
    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address the remote forward binds
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Principal the loopback connection is authenticated as
    #[arg(long, default_value = "demo")]
    user: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn sep(title: &str) {
    println!("\n{}", "=".repeat(60));
    println!("  {title}");
    println!("{}\n", "=".repeat(60));
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config = TunnelConfig::load(cli.config.as_deref()).context("loading config")?;
    let (transport, mut peer) = memory::pair(cli.user.clone());
    let handler = TunnelHandler::from_config(transport, &config, None);

    // ── Shell ───────────────────────────────────────────────────
    sep("SHELL: refused with banner");

    let (server_end, mut client_end) = tokio::io::duplex(1024);
    handler
        .on_shell_request(IdentifiedChannel::new(peer.allocate_id(), server_end))
        .await;
    let mut banner = vec![0u8; tunnel_server::session::NO_SHELL_MESSAGE.len()];
    timeout(STEP_TIMEOUT, client_end.read_exact(&mut banner))
        .await
        .context("waiting for banner")??;
    print!("{}", String::from_utf8_lossy(&banner));

    // ── Remote forward ──────────────────────────────────────────
    sep("REMOTE FORWARD: ping/pong through the peer");

    let Some(port) = handler.on_forward_request(&cli.bind, 0).await else {
        bail!("forward on {}:0 was refused", cli.bind);
    };
    println!("[Forward] {}:{port} is listening", cli.bind);

    let connect_host = if cli.bind == "0.0.0.0" || cli.bind.is_empty() || cli.bind == "*" {
        "127.0.0.1".to_string()
    } else {
        cli.bind.clone()
    };
    let mut client = TcpStream::connect((connect_host.as_str(), port))
        .await
        .context("connecting to forward")?;
    let mut forwarded = timeout(STEP_TIMEOUT, peer.accept_forwarded())
        .await
        .context("waiting for forwarded channel")?
        .context("server went away")?;
    println!(
        "[Peer] forwarded channel {} from {} for {}",
        forwarded.id, forwarded.origin, forwarded.destination
    );

    client.write_all(b"ping").await?;
    let mut buf = [0u8; 4];
    timeout(STEP_TIMEOUT, forwarded.stream.read_exact(&mut buf)).await??;
    println!("[Peer] received {:?}", String::from_utf8_lossy(&buf));
    forwarded.stream.write_all(b"pong").await?;
    timeout(STEP_TIMEOUT, client.read_exact(&mut buf)).await??;
    println!("[Client] received {:?}", String::from_utf8_lossy(&buf));
    drop(client);

    // ── Direct connection ───────────────────────────────────────
    sep("DIRECT: bridge to a local echo service");

    let echo = TcpListener::bind("127.0.0.1:0").await?;
    let echo_ep = Endpoint::from(echo.local_addr()?);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = echo.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });

    let origin = Endpoint::new("198.51.100.7", 40000);
    let (channel_id, mut direct) = peer
        .open_direct(&handler, &origin, &echo_ep)
        .await
        .context("opening direct channel")?;
    println!("[Direct] channel {channel_id} bridged to {echo_ep}");

    direct.write_all(b"hello through the tunnel").await?;
    let mut reply = [0u8; 24];
    timeout(STEP_TIMEOUT, direct.read_exact(&mut reply)).await??;
    println!("[Peer] echoed {:?}", String::from_utf8_lossy(&reply));
    println!(
        "[Direct] active bridges: {}",
        handler.coordinator().active_bridges()
    );
    drop(direct);

    // ── Teardown ────────────────────────────────────────────────
    sep("TEARDOWN: cancel and disconnect");

    handler.on_cancel_forward(&cli.bind, port).await;
    println!("[Forward] cancelled, {} forwards left", handler.coordinator().forwards().await.len());

    peer.disconnect();
    handler.on_disconnect().await;
    info!("demo finished");
    println!("[Done] connection closed");
    Ok(())
}
