//! Errors from the wire layer.

use crate::address::Endpoint;
use crate::identity::PeerId;
use std::time::Duration;
use thiserror::Error;

/// Errors from identity, addressing, connection and stream handling.
#[derive(Debug, Error)]
pub enum WireError {
    /// The randomness source or key primitive failed.
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// The listening endpoint could not be bound.
    #[error("Failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },

    /// The string is not a valid multi-segment address.
    #[error("Malformed address '{address}': {reason}")]
    MalformedAddress { address: String, reason: String },

    /// The identity segment does not decode to a peer id.
    #[error("Unknown identifier encoding: {0}")]
    UnknownIdentifierEncoding(String),

    /// Decapsulation was asked for but the address carries no identity.
    #[error("Address has no identity segment: {0}")]
    NoIdentitySegment(String),

    /// No live address is known for the peer.
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// None of the peer's endpoints accepted a TCP connection.
    #[error("Dial to {endpoint} failed: {source}")]
    Dial {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },

    /// Security negotiation failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The remote refused the requested protocol.
    #[error("Protocol negotiation failed: remote does not support {protocol}")]
    ProtocolNegotiation { protocol: String },

    /// Dial, handshake and negotiation did not finish before the deadline.
    #[error("Dial timed out after {0:?}")]
    DialTimeout(Duration),

    /// An inbound stream asked for a protocol with no registered handler.
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// The stream ended before a full newline-terminated message arrived.
    #[error("Stream ended before a complete message was received")]
    IncompleteMessage,

    #[error("Invalid protocol name '{0}'")]
    InvalidProtocolName(String),

    #[error("Insecure transport is disabled in this build (enable the `insecure-transport` feature)")]
    InsecureTransportDisabled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Connection closed")]
    ConnectionClosed,

    /// Too many control frames are waiting for a stalled writer.
    #[error("Outbound control queue is full")]
    OutboundQueueFull,

    #[error("Stream reset by peer")]
    StreamReset,

    #[error("Stream already closed for writing")]
    StreamClosed,

    #[error("Host is shut down")]
    ShutDown,
}

impl WireError {
    pub(crate) fn malformed(address: &str, reason: impl Into<String>) -> Self {
        Self::MalformedAddress {
            address: address.to_string(),
            reason: reason.into(),
        }
    }
}

/// Alias for Result with WireError.
pub type WireResult<T> = Result<T, WireError>;
