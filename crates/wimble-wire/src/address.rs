//! Self-describing peer addresses.
//!
//! An address is a sequence of `/<protocol>/<value>` segments, transport first
//! and identity last:
//!
//! ```text
//! /ip4/127.0.0.1/tcp/8383/p2p/12D3KooW...
//! \_____________________/\_______________/
//!        Endpoint             PeerId
//! ```
//!
//! [`encapsulate`] appends the identity segment to an [`Endpoint`];
//! [`decapsulate`] strips it again to obtain something a TCP socket can dial.
//! The legacy `/ipfs/` spelling of the identity segment is accepted on input.

use crate::error::{WireError, WireResult};
use crate::identity::PeerId;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// Name of the identity segment emitted by [`encode`].
pub const P2P_PROTOCOL: &str = "p2p";
/// Older name of the identity segment, still accepted when parsing.
pub const LEGACY_P2P_PROTOCOL: &str = "ipfs";

/// A TCP endpoint: host address and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    ip: IpAddr,
    port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn to_multiaddr(&self) -> Multiaddr {
        let ip = match self.ip {
            IpAddr::V4(v4) => Segment::Ip4(v4),
            IpAddr::V6(v6) => Segment::Ip6(v6),
        };
        Multiaddr {
            segments: vec![ip, Segment::Tcp(self.port)],
        }
    }

    fn from_segments(segments: &[Segment], original: &str) -> WireResult<Self> {
        match segments {
            [Segment::Ip4(ip), Segment::Tcp(port)] => Ok(Self::new(IpAddr::V4(*ip), *port)),
            [Segment::Ip6(ip), Segment::Tcp(port)] => Ok(Self::new(IpAddr::V6(*ip), *port)),
            _ => Err(WireError::malformed(
                original,
                "expected /ip4/<host>/tcp/<port> or /ip6/<host>/tcp/<port>",
            )),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "/ip4/{ip}/tcp/{}", self.port),
            IpAddr::V6(ip) => write!(f, "/ip6/{ip}/tcp/{}", self.port),
        }
    }
}

impl FromStr for Endpoint {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: Multiaddr = s.parse()?;
        Self::from_segments(&addr.segments, s)
    }
}

/// One `/<protocol>/<value>` component of an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Tcp(u16),
    P2p(PeerId),
}

impl Segment {
    fn is_ip(&self) -> bool {
        matches!(self, Self::Ip4(_) | Self::Ip6(_))
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip4(ip) => write!(f, "/ip4/{ip}"),
            Self::Ip6(ip) => write!(f, "/ip6/{ip}"),
            Self::Tcp(port) => write!(f, "/tcp/{port}"),
            Self::P2p(id) => write!(f, "/{P2P_PROTOCOL}/{id}"),
        }
    }
}

/// A parsed address that may or may not carry an identity segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Multiaddr {
    segments: Vec<Segment>,
}

impl Multiaddr {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The trailing identity, if present.
    pub fn peer_id(&self) -> Option<&PeerId> {
        match self.segments.last() {
            Some(Segment::P2p(id)) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for Multiaddr {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(rest) = s.strip_prefix('/') else {
            return Err(WireError::malformed(s, "address must start with '/'"));
        };

        let mut parts = rest.split('/');
        let mut segments = Vec::new();
        while let Some(name) = parts.next() {
            if name.is_empty() {
                return Err(WireError::malformed(s, "empty protocol name"));
            }
            let value = match parts.next() {
                Some(v) if !v.is_empty() => v,
                _ => return Err(WireError::malformed(s, format!("missing value for '{name}'"))),
            };
            let segment = match name {
                "ip4" => Segment::Ip4(
                    value
                        .parse()
                        .map_err(|_| WireError::malformed(s, format!("invalid ip4 '{value}'")))?,
                ),
                "ip6" => Segment::Ip6(
                    value
                        .parse()
                        .map_err(|_| WireError::malformed(s, format!("invalid ip6 '{value}'")))?,
                ),
                "tcp" => Segment::Tcp(
                    value
                        .parse()
                        .map_err(|_| WireError::malformed(s, format!("invalid tcp port '{value}'")))?,
                ),
                P2P_PROTOCOL | LEGACY_P2P_PROTOCOL => Segment::P2p(PeerId::from_base58(value)?),
                other => {
                    return Err(WireError::malformed(s, format!("unknown protocol '{other}'")))
                }
            };
            segments.push(segment);
        }

        validate_order(&segments, s)?;
        Ok(Self { segments })
    }
}

/// Transport segments nest ip → tcp, and the identity may only come last.
fn validate_order(segments: &[Segment], original: &str) -> WireResult<()> {
    for (i, segment) in segments.iter().enumerate() {
        let prev = i.checked_sub(1).map(|p| &segments[p]);
        match segment {
            Segment::Ip4(_) | Segment::Ip6(_) if i != 0 => {
                return Err(WireError::malformed(original, "ip segment must come first"));
            }
            Segment::Tcp(_) if !prev.is_some_and(Segment::is_ip) => {
                return Err(WireError::malformed(original, "tcp must follow an ip segment"));
            }
            Segment::P2p(_) if i + 1 != segments.len() => {
                return Err(WireError::malformed(original, "identity must be the last segment"));
            }
            _ => {}
        }
    }
    Ok(())
}

/// A dialable endpoint bound to the identity expected at it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub endpoint: Endpoint,
    pub peer_id: PeerId,
}

impl PeerAddress {
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn to_multiaddr(&self) -> Multiaddr {
        let mut addr = self.endpoint.to_multiaddr();
        addr.segments.push(Segment::P2p(self.peer_id.clone()));
        addr
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{P2P_PROTOCOL}/{}", self.endpoint, self.peer_id)
    }
}

impl FromStr for PeerAddress {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s)
    }
}

/// Render `<endpoint>/p2p/<base58 id>`.
pub fn encode(endpoint: &Endpoint, peer_id: &PeerId) -> String {
    encapsulate(*endpoint, peer_id.clone()).to_string()
}

/// Parse a full peer address.
pub fn decode(s: &str) -> WireResult<PeerAddress> {
    let addr: Multiaddr = s.parse()?;
    let Some((Segment::P2p(peer_id), transport)) = addr.segments.split_last() else {
        return Err(WireError::malformed(s, "missing trailing /p2p/<id> segment"));
    };
    Ok(PeerAddress {
        endpoint: Endpoint::from_segments(transport, s)?,
        peer_id: peer_id.clone(),
    })
}

/// Strip the trailing identity segment, leaving the dialable endpoint.
pub fn decapsulate(addr: &Multiaddr) -> WireResult<Endpoint> {
    match addr.segments.split_last() {
        Some((Segment::P2p(_), transport)) => Endpoint::from_segments(transport, &addr.to_string()),
        _ => Err(WireError::NoIdentitySegment(addr.to_string())),
    }
}

/// Attach an identity to an endpoint.
pub fn encapsulate(endpoint: Endpoint, peer_id: PeerId) -> PeerAddress {
    PeerAddress { endpoint, peer_id }
}
