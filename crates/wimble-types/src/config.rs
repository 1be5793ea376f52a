//! Node configuration types.
//!
//! Loaded from `~/.wimble/config.toml` by the `wimble` binary; every field has
//! a default so a partial (or missing) file is valid.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Default listening address of a node.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8383";

/// Transport security applied to every connection of a host.
///
/// There is deliberately no `Default` impl: callers name the mode they want.
/// `Insecure` sends all traffic in plaintext and only exists for local testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Authenticated key exchange followed by AEAD-sealed records.
    Secured,
    /// No encryption and no proof of key possession.
    Insecure,
}

impl SecurityMode {
    /// Whether this mode skips transport encryption.
    pub fn is_insecure(self) -> bool {
        matches!(self, Self::Insecure)
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Secured => write!(f, "secured"),
            Self::Insecure => write!(f, "insecure"),
        }
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the listener binds to.
    pub listen_addr: SocketAddr,
    /// Transport security mode. Defaults to `secured`; `insecure` must be
    /// written out explicitly.
    pub security: SecurityMode,
    /// Seed for deterministic identity generation. `None` or `0` means the
    /// identity is drawn from OS randomness. Never set this in production.
    pub seed: Option<i64>,
    /// Upper bound for dial + handshake + protocol negotiation, in seconds.
    pub dial_timeout_secs: u64,
    /// Upper bound for the inbound handshake, in seconds.
    pub handshake_timeout_secs: u64,
    /// Log filter used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl NodeConfig {
    /// The configured seed, with `0` normalised to "no seed".
    pub fn effective_seed(&self) -> Option<i64> {
        self.seed.filter(|s| *s != 0)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8383)),
            security: SecurityMode::Secured,
            seed: None,
            dial_timeout_secs: 10,
            handshake_timeout_secs: 10,
            log_level: "info".to_string(),
        }
    }
}
