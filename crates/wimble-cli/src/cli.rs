//! Clap CLI definitions for the wimble node.

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use wimble_types::config::{NodeConfig, SecurityMode};

/// WimbleChain p2p node.
#[derive(Parser, Debug)]
#[command(name = "wimble", version, about = "WimbleChain p2p node")]
pub struct Cli {
    /// Path to config file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Port to listen on.
    #[arg(short = 'l', long = "listen-port")]
    pub listen_port: Option<u16>,

    /// IP address to bind.
    #[arg(long)]
    pub host: Option<IpAddr>,

    /// Disable transport encryption and peer authentication.
    #[arg(long)]
    pub insecure: bool,

    /// Seed for a deterministic identity (0 = random). Testing only.
    #[arg(long, allow_negative_numbers = true)]
    pub seed: Option<i64>,

    /// Full address of a peer to send the echo message to.
    #[arg(short = 'd', long)]
    pub dial: Option<String>,

    /// Send the echo message to this node's own address after start-up.
    #[arg(long)]
    pub self_dial: bool,

    /// Message sent on echo streams (a newline is appended).
    #[arg(long, default_value = "Hello, world!")]
    pub message: String,

    /// Seconds between idle ticks.
    #[arg(long, default_value_t = 10)]
    pub tick_secs: u64,
}

impl Cli {
    /// Override file configuration with the flags that were given.
    pub fn apply(&self, config: &mut NodeConfig) {
        if let Some(port) = self.listen_port {
            config.listen_addr.set_port(port);
        }
        if let Some(ip) = self.host {
            config.listen_addr.set_ip(ip);
        }
        if self.insecure {
            config.security = SecurityMode::Insecure;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
    }
}
