//! The wimble node: listens for echo streams and optionally dials a peer.

mod cli;
mod config;

use crate::cli::Cli;
use anyhow::Context;
use clap::Parser;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wimble_wire::{
    decode, EchoHandler, Host, HostConfig, Keypair, PeerAddress, ECHO_PROTOCOL,
};

/// Version of the p2p layer announced at start-up.
const P2P_VERSION: &str = "0.0.1a";

fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

fn init_tracing(level: &str) {
    tracing_subscriber::fmt().with_env_filter(env_filter(level)).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The log level lives in the config file, so load it under a temporary
    // subscriber to keep its warnings visible.
    let mut node_config = tracing::subscriber::with_default(
        tracing_subscriber::fmt().with_env_filter(env_filter("info")).finish(),
        || config::load_config(cli.config.as_deref()),
    );
    init_tracing(&node_config.log_level);
    cli.apply(&mut node_config);

    println!("WimbleChain v{}", env!("CARGO_PKG_VERSION"));
    println!("Launching p2p version {P2P_VERSION}...");

    let keypair =
        Keypair::generate(node_config.effective_seed()).context("Failed to generate identity")?;
    let host = Host::start(HostConfig::from(&node_config), keypair)
        .await
        .with_context(|| format!("Failed to start host on {}", node_config.listen_addr))?;
    host.register_handler(ECHO_PROTOCOL, EchoHandler)?;

    let address = host.advertised_address();
    println!("Launched listener at address: {address}");
    info!(
        "Now run \"wimble -l {} -d {}{}\" on a different terminal",
        address.endpoint().port().saturating_add(1),
        address,
        if host.security_mode().is_insecure() { " --insecure" } else { "" }
    );

    if let Some(target) = cli.dial.as_deref() {
        let remote = decode(target).with_context(|| format!("Invalid peer address '{target}'"))?;
        send_echo(&host, &remote, &cli.message).await?;
    }
    if cli.self_dial {
        send_echo(&host, &address, &cli.message).await?;
    }

    info!("Listening for connections on port {}", address.endpoint().port());
    idle(Duration::from_secs(cli.tick_secs.max(1))).await;

    host.shutdown().await;
    Ok(())
}

/// Open an echo stream, send one line, print the reply.
async fn send_echo(host: &Host, remote: &PeerAddress, message: &str) -> anyhow::Result<()> {
    host.add_peer_address(remote);
    info!("opening stream to {}", remote);
    let mut stream = host
        .open_stream(remote.peer_id(), ECHO_PROTOCOL)
        .await
        .with_context(|| format!("Failed to open {ECHO_PROTOCOL} stream to {remote}"))?;

    stream.write_all(format!("{message}\n").as_bytes()).await?;
    stream.close_write().await?;

    let mut reply = Vec::new();
    stream
        .read_to_end(&mut reply)
        .await
        .context("Failed to read echo reply")?;
    stream.close().await?;
    info!("read reply: {:?}", String::from_utf8_lossy(&reply));
    Ok(())
}

/// Print a tick every `period` until Ctrl-C.
async fn idle(period: Duration) {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = ticker.tick() => println!("Tick..."),
        }
    }
}
