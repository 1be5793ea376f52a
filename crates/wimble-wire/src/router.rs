//! Protocol router: maps protocol names to stream handlers.

use crate::error::{WireError, WireResult};
use crate::stream::Stream;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Longest protocol name accepted.
pub const MAX_PROTOCOL_NAME_LEN: usize = 140;

/// Serves inbound streams for one protocol.
///
/// Called once per stream that negotiated the protocol, on its own task.
/// Returning `Ok` closes the stream gracefully; returning `Err` resets it.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, stream: &mut Stream) -> WireResult<()>;
}

/// Thread-safe table of protocol handlers.
#[derive(Default)]
pub struct ProtocolRouter {
    handlers: RwLock<HashMap<String, Arc<dyn StreamHandler>>>,
}

impl ProtocolRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `protocol`, replacing any earlier registration.
    pub fn register(&self, protocol: &str, handler: Arc<dyn StreamHandler>) -> WireResult<()> {
        validate_protocol_name(protocol)?;
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.insert(protocol.to_string(), handler).is_some() {
            debug!(protocol, "replaced stream handler");
        } else {
            debug!(protocol, "registered stream handler");
        }
        Ok(())
    }

    /// Remove the handler for `protocol`. Returns whether one was registered.
    pub fn unregister(&self, protocol: &str) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.remove(protocol).is_some()
    }

    /// Handler for an exact protocol name.
    pub fn route(&self, protocol: &str) -> Option<Arc<dyn StreamHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(protocol).cloned()
    }

    /// Registered protocol names, sorted.
    pub fn protocols(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Protocol names start with `/`, are printable ASCII and at most
/// [`MAX_PROTOCOL_NAME_LEN`] bytes.
pub fn validate_protocol_name(name: &str) -> WireResult<()> {
    let valid = name.starts_with('/')
        && name.len() <= MAX_PROTOCOL_NAME_LEN
        && name.bytes().all(|b| b.is_ascii_graphic());
    if valid {
        Ok(())
    } else {
        Err(WireError::InvalidProtocolName(name.to_string()))
    }
}
