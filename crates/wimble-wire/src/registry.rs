//! Peer registry: known addresses for remote peers.
//!
//! The [`PeerRegistry`] is shared by the host and its callers. Addresses are
//! added manually (there is no discovery) and may carry an expiry; expired
//! addresses are ignored on lookup and removed by [`PeerRegistry::prune_expired`].

use crate::address::Endpoint;
use crate::identity::PeerId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// How long a known address stays usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressTtl {
    /// Never expires. Manually added addresses default to this.
    #[default]
    Permanent,
    /// Expires after the given duration. A duration past the clock's range
    /// never expires.
    For(Duration),
}

/// One known endpoint for a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownAddress {
    pub endpoint: Endpoint,
    /// `None` for permanent addresses.
    pub expires_at: Option<Instant>,
}

impl KnownAddress {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Thread-safe registry of peer addresses.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<PeerId, Vec<KnownAddress>>>>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh an address. An endpoint already known for the peer gets
    /// the new expiry.
    pub fn add_address(&self, peer: PeerId, endpoint: Endpoint, ttl: AddressTtl) {
        let expires_at = match ttl {
            AddressTtl::Permanent => None,
            AddressTtl::For(d) => Instant::now().checked_add(d),
        };
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let known = peers.entry(peer).or_default();
        match known.iter_mut().find(|k| k.endpoint == endpoint) {
            Some(existing) => existing.expires_at = expires_at,
            None => known.push(KnownAddress {
                endpoint,
                expires_at,
            }),
        }
    }

    /// Live endpoints for a peer, in insertion order.
    pub fn addresses(&self, peer: &PeerId) -> Vec<Endpoint> {
        let now = Instant::now();
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .get(peer)
            .map(|known| {
                known
                    .iter()
                    .filter(|k| k.is_live(now))
                    .map(|k| k.endpoint)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether at least one live address is known.
    pub fn has_addresses(&self, peer: &PeerId) -> bool {
        !self.addresses(peer).is_empty()
    }

    /// Forget a peer entirely.
    pub fn remove_peer(&self, peer: &PeerId) -> Option<Vec<KnownAddress>> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.remove(peer)
    }

    /// Drop expired addresses and peers left without any. Returns how many
    /// addresses were removed.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        peers.retain(|_, known| {
            let before = known.len();
            known.retain(|k| k.is_live(now));
            removed += before - known.len();
            !known.is_empty()
        });
        removed
    }

    /// All peers with at least one entry (live or not yet pruned).
    pub fn peers(&self) -> Vec<PeerId> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.keys().cloned().collect()
    }

    /// Number of peers tracked.
    pub fn len(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn peer() -> PeerId {
        Keypair::generate(None).unwrap().peer_id()
    }

    fn endpoint(port: u16) -> Endpoint {
        format!("/ip4/127.0.0.1/tcp/{port}").parse().unwrap()
    }

    #[test]
    fn test_add_and_lookup() {
        let registry = PeerRegistry::new();
        let id = peer();
        registry.add_address(id.clone(), endpoint(8383), AddressTtl::Permanent);
        registry.add_address(id.clone(), endpoint(8384), AddressTtl::Permanent);

        assert_eq!(registry.addresses(&id), vec![endpoint(8383), endpoint(8384)]);
        assert!(registry.has_addresses(&id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_peer_has_no_addresses() {
        let registry = PeerRegistry::new();
        assert!(registry.addresses(&peer()).is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_endpoint_refreshes_expiry() {
        let registry = PeerRegistry::new();
        let id = peer();
        registry.add_address(id.clone(), endpoint(8383), AddressTtl::For(Duration::ZERO));
        assert!(!registry.has_addresses(&id));

        registry.add_address(id.clone(), endpoint(8383), AddressTtl::Permanent);
        assert_eq!(registry.addresses(&id), vec![endpoint(8383)]);
    }

    #[test]
    fn test_expired_addresses_ignored_and_pruned() {
        let registry = PeerRegistry::new();
        let short = peer();
        let long = peer();
        registry.add_address(short.clone(), endpoint(1), AddressTtl::For(Duration::ZERO));
        registry.add_address(long.clone(), endpoint(2), AddressTtl::For(Duration::from_secs(3600)));
        registry.add_address(long.clone(), endpoint(3), AddressTtl::For(Duration::ZERO));

        assert!(registry.addresses(&short).is_empty());
        assert_eq!(registry.addresses(&long), vec![endpoint(2)]);
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.prune_expired(), 2);
        assert_eq!(registry.peers(), vec![long]);
    }

    #[test]
    fn test_unbounded_ttl_is_permanent() {
        let registry = PeerRegistry::new();
        let id = peer();
        registry.add_address(id.clone(), endpoint(8383), AddressTtl::For(Duration::MAX));
        assert_eq!(registry.addresses(&id), vec![endpoint(8383)]);
        assert_eq!(registry.prune_expired(), 0);

        let removed = registry.remove_peer(&id).unwrap();
        assert_eq!(removed[0].expires_at, None);
    }

    #[test]
    fn test_remove_peer() {
        let registry = PeerRegistry::new();
        let id = peer();
        registry.add_address(id.clone(), endpoint(8383), AddressTtl::default());
        let removed = registry.remove_peer(&id).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].expires_at, None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let registry = PeerRegistry::new();
        let view = registry.clone();
        registry.add_address(peer(), endpoint(8383), AddressTtl::Permanent);
        assert_eq!(view.len(), 1);
    }
}
