//! Wimble wire layer: a minimal peer-to-peer host.
//!
//! Peers are identified by Ed25519 keys, addressed with multi-segment
//! strings such as `/ip4/127.0.0.1/tcp/8383/p2p/12D3KooW...`, and talk over
//! multiplexed TCP connections where every stream negotiates a protocol name.
//!
//! ## Architecture
//!
//! - **Keypair / PeerId**: node identity and the id derived from it
//! - **PeerAddress**: endpoint plus identity, with its text codec
//! - **Host**: listens, dials, and owns connections and the peer registry
//! - **ProtocolRouter / StreamHandler**: dispatch of inbound streams by protocol
//! - **EchoHandler**: the `/echo/1.0.0` protocol

pub mod address;
mod connection;
pub mod echo;
pub mod error;
pub mod frame;
mod handshake;
pub mod host;
pub mod identity;
pub mod registry;
pub mod router;
pub mod stream;

pub use address::{decapsulate, decode, encapsulate, encode, Endpoint, Multiaddr, PeerAddress};
pub use echo::{EchoHandler, ECHO_PROTOCOL};
pub use error::{WireError, WireResult};
pub use frame::STREAM_WINDOW;
pub use handshake::PROTOCOL_VERSION;
pub use host::{Host, HostConfig};
pub use identity::{Keypair, PeerId, PublicKey};
pub use registry::{AddressTtl, PeerRegistry};
pub use router::{ProtocolRouter, StreamHandler};
pub use stream::{read_line, Stream, MAX_LINE_LEN};
pub use wimble_types::config::SecurityMode;
