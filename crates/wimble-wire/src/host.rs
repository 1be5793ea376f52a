//! The host: a listening node that dials peers and serves inbound streams.
//!
//! A [`Host`] is created with [`Host::start`], which binds the listener and
//! spawns the accept loop. Each accepted connection runs the handshake and
//! then its own driver task; inbound streams are dispatched through the
//! host's [`ProtocolRouter`]. Outbound streams go through
//! [`Host::open_stream`], which reuses a live connection to the peer or dials
//! one of its known addresses.
//!
//! The host keeps running until [`Host::shutdown`] is called or the last
//! handle to it is dropped.

use crate::address::{encapsulate, Endpoint, PeerAddress};
use crate::connection::{self, ConnectionShared, ConnectionTable};
use crate::error::{WireError, WireResult};
use crate::handshake::{handshake, Role};
use crate::identity::{Keypair, PeerId};
use crate::registry::{AddressTtl, PeerRegistry};
use crate::router::{validate_protocol_name, ProtocolRouter, StreamHandler};
use crate::stream::Stream;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wimble_types::config::{NodeConfig, SecurityMode};

/// Default bound on dial + handshake + negotiation.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on the inbound handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long shutdown waits for connection tasks before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Host construction parameters.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Endpoint to bind. Port `0` picks a free port.
    pub listen: Endpoint,
    /// Connection security. Deliberately has no default.
    pub security: SecurityMode,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl HostConfig {
    pub fn new(listen: Endpoint, security: SecurityMode) -> Self {
        Self {
            listen,
            security,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl From<&NodeConfig> for HostConfig {
    fn from(config: &NodeConfig) -> Self {
        Self {
            listen: Endpoint::from(config.listen_addr),
            security: config.security,
            dial_timeout: Duration::from_secs(config.dial_timeout_secs),
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
        }
    }
}

/// Whether this build may run without transport security.
pub fn insecure_transport_allowed() -> bool {
    cfg!(debug_assertions) || cfg!(feature = "insecure-transport")
}

/// A running p2p node.
pub struct Host {
    keypair: Keypair,
    peer_id: PeerId,
    config: HostConfig,
    /// Actual bound endpoint (differs from the config when binding port 0).
    listen_endpoint: Endpoint,
    router: Arc<ProtocolRouter>,
    registry: PeerRegistry,
    connections: ConnectionTable,
    shutdown_tx: watch::Sender<bool>,
    running: AtomicBool,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    connection_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Host {
    /// Bind the listener and start accepting connections.
    pub async fn start(config: HostConfig, keypair: Keypair) -> WireResult<Arc<Self>> {
        if config.security.is_insecure() && !insecure_transport_allowed() {
            return Err(WireError::InsecureTransportDisabled);
        }

        let listener = TcpListener::bind(config.listen.socket_addr())
            .await
            .map_err(|source| WireError::Bind {
                endpoint: config.listen,
                source,
            })?;
        let listen_endpoint = Endpoint::from(listener.local_addr()?);
        let (shutdown_tx, _) = watch::channel(false);

        let host = Arc::new(Self {
            peer_id: keypair.peer_id(),
            keypair,
            config,
            listen_endpoint,
            router: Arc::new(ProtocolRouter::new()),
            registry: PeerRegistry::new(),
            connections: Arc::new(DashMap::new()),
            shutdown_tx,
            running: AtomicBool::new(true),
            accept_task: Mutex::new(None),
            connection_tasks: Mutex::new(Vec::new()),
        });

        info!(
            "P2P: listening on {} ({} transport)",
            host.advertised_address(),
            host.config.security
        );
        if host.config.security.is_insecure() {
            warn!("P2P: insecure transport: connections are neither authenticated nor encrypted");
        }

        let accept_task = tokio::spawn(Self::accept_loop(listener, Arc::downgrade(&host)));
        *host.accept_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(accept_task);
        Ok(host)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// The bound endpoint.
    pub fn listen_endpoint(&self) -> Endpoint {
        self.listen_endpoint
    }

    /// This host's full address: bound endpoint plus identity.
    pub fn advertised_address(&self) -> PeerAddress {
        encapsulate(self.listen_endpoint, self.peer_id.clone())
    }

    pub fn security_mode(&self) -> SecurityMode {
        self.config.security
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn router(&self) -> &ProtocolRouter {
        &self.router
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Live connections, inbound and outbound.
    pub fn connection_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .count()
    }

    /// Streams currently open across all connections.
    pub fn open_stream_count(&self) -> usize {
        self.connections
            .iter()
            .map(|entry| entry.value().stream_count())
            .sum()
    }

    /// Serve `protocol` with `handler`. Re-registering a name replaces the
    /// previous handler.
    pub fn register_handler<H>(&self, protocol: &str, handler: H) -> WireResult<()>
    where
        H: StreamHandler + 'static,
    {
        self.router.register(protocol, Arc::new(handler))
    }

    /// Remember an address for a peer.
    pub fn add_known_address(&self, peer: PeerId, endpoint: Endpoint, ttl: AddressTtl) {
        debug!("P2P: known address for {}: {} ({:?})", peer, endpoint, ttl);
        self.registry.add_address(peer, endpoint, ttl);
    }

    /// Remember a full peer address permanently.
    pub fn add_peer_address(&self, address: &PeerAddress) {
        self.add_known_address(
            address.peer_id().clone(),
            address.endpoint(),
            AddressTtl::Permanent,
        );
    }

    /// Open a stream to `peer` speaking `protocol`, bounded by the configured
    /// dial timeout.
    pub async fn open_stream(&self, peer: &PeerId, protocol: &str) -> WireResult<Stream> {
        self.open_stream_with_timeout(peer, protocol, self.config.dial_timeout)
            .await
    }

    /// Open a stream to `peer` speaking `protocol`.
    ///
    /// Fails with [`WireError::UnknownPeer`] without touching the network when
    /// no live address is known. Otherwise reuses a live connection or dials
    /// each known address in turn, then negotiates the protocol. The whole
    /// operation is bounded by `timeout`; a stream still negotiating when it
    /// expires is reset.
    pub async fn open_stream_with_timeout(
        &self,
        peer: &PeerId,
        protocol: &str,
        timeout: Duration,
    ) -> WireResult<Stream> {
        if !self.is_running() {
            return Err(WireError::ShutDown);
        }
        validate_protocol_name(protocol)?;

        let endpoints = self.registry.addresses(peer);
        if endpoints.is_empty() {
            return Err(WireError::UnknownPeer(peer.clone()));
        }

        match tokio::time::timeout(timeout, self.open_stream_inner(peer, protocol, &endpoints)).await
        {
            Ok(result) => result,
            Err(_) => {
                debug!("P2P: opening {} to {} timed out", protocol, peer);
                Err(WireError::DialTimeout(timeout))
            }
        }
    }

    async fn open_stream_inner(
        &self,
        peer: &PeerId,
        protocol: &str,
        endpoints: &[Endpoint],
    ) -> WireResult<Stream> {
        let conn = match self.live_connection(peer) {
            Some(conn) => {
                debug!("P2P: reusing connection to {}", peer);
                conn
            }
            None => self.dial(peer, endpoints).await?,
        };
        conn.open_stream(protocol).await
    }

    fn live_connection(&self, peer: &PeerId) -> Option<Arc<ConnectionShared>> {
        self.connections
            .get(peer)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|conn| !conn.is_closed())
    }

    async fn dial(&self, peer: &PeerId, endpoints: &[Endpoint]) -> WireResult<Arc<ConnectionShared>> {
        let mut last_error = None;
        for endpoint in endpoints {
            debug!("P2P: dialing {} at {}", peer, endpoint);
            let tcp = match TcpStream::connect(endpoint.socket_addr()).await {
                Ok(tcp) => tcp,
                Err(source) => {
                    debug!("P2P: dial to {} failed: {}", endpoint, source);
                    last_error = Some(WireError::Dial {
                        endpoint: *endpoint,
                        source,
                    });
                    continue;
                }
            };
            let _ = tcp.set_nodelay(true);

            let (reader, writer) = tcp.into_split();
            let session = match handshake(
                reader,
                writer,
                &self.keypair,
                self.config.security,
                Role::Dialer,
                Some(peer),
            )
            .await
            {
                Ok(session) => session,
                Err(e) => {
                    debug!("P2P: handshake with {} failed: {}", endpoint, e);
                    last_error = Some(e);
                    continue;
                }
            };
            info!("P2P: connected to {} at {}", peer, endpoint);

            let (conn, driver) = connection::spawn(
                session,
                Role::Dialer,
                Arc::clone(&self.router),
                self.shutdown_tx.subscribe(),
                Arc::clone(&self.connections),
            );
            self.track(driver);
            return Ok(conn);
        }
        Err(last_error.unwrap_or_else(|| WireError::UnknownPeer(peer.clone())))
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self
            .connection_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Internal accept loop, runs in a spawned task until shutdown aborts it
    /// or the host is dropped.
    async fn accept_loop(listener: TcpListener, host: Weak<Host>) {
        loop {
            let accepted = listener.accept().await;
            let Some(host) = host.upgrade() else {
                break;
            };
            match accepted {
                Ok((tcp, addr)) => {
                    debug!("P2P: accepted connection from {}", addr);
                    let inbound_host = Arc::clone(&host);
                    let task = tokio::spawn(async move {
                        if let Err(e) = inbound_host.handle_inbound(tcp).await {
                            warn!("P2P: inbound connection from {} failed: {}", addr, e);
                        }
                    });
                    host.track(task);
                }
                Err(e) => {
                    error!("P2P: accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handshake an accepted connection and hand it to a driver task.
    async fn handle_inbound(&self, tcp: TcpStream) -> WireResult<()> {
        let _ = tcp.set_nodelay(true);
        let (reader, writer) = tcp.into_split();
        let timeout = self.config.handshake_timeout;
        let session = tokio::time::timeout(
            timeout,
            handshake(
                reader,
                writer,
                &self.keypair,
                self.config.security,
                Role::Listener,
                None,
            ),
        )
        .await
        .map_err(|_| WireError::Handshake(format!("timed out after {timeout:?}")))??;

        if !self.is_running() {
            return Err(WireError::ShutDown);
        }
        info!("P2P: inbound connection from {}", session.remote_peer);

        let (_, driver) = connection::spawn(
            session,
            Role::Listener,
            Arc::clone(&self.router),
            self.shutdown_tx.subscribe(),
            Arc::clone(&self.connections),
        );
        self.track(driver);
        Ok(())
    }

    /// Stop accepting, reset every stream, close every connection.
    ///
    /// Safe to call more than once; later calls return immediately. The
    /// listening port is released when this returns.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("P2P: shutting down {}", self.peer_id);
        self.shutdown_tx.send_replace(true);

        let accept_task = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = accept_task {
            task.abort();
            let _ = task.await;
        }

        let tasks = std::mem::take(
            &mut *self
                .connection_tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.connections.clear();
        info!("P2P: {} stopped", self.peer_id);
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            debug!("P2P: {} dropped without shutdown", self.peer_id);
        }
        self.shutdown_tx.send_replace(true);
        let accept_task = self
            .accept_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = accept_task {
            task.abort();
        }
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("peer_id", &self.peer_id)
            .field("listen", &self.listen_endpoint)
            .field("security", &self.config.security)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo::{EchoHandler, ECHO_PROTOCOL};
    use crate::frame::FrameKind;
    use tokio::sync::mpsc;

    fn local_config(security: SecurityMode) -> HostConfig {
        HostConfig::new("/ip4/127.0.0.1/tcp/0".parse().unwrap(), security)
    }

    #[test]
    fn test_host_config_from_node_config() {
        let node = NodeConfig::default();
        let config = HostConfig::from(&node);
        assert_eq!(config.listen.to_string(), "/ip4/127.0.0.1/tcp/8383");
        assert_eq!(config.security, SecurityMode::Secured);
        assert_eq!(config.dial_timeout, Duration::from_secs(10));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_start_binds_ephemeral_port() {
        let host = Host::start(local_config(SecurityMode::Secured), Keypair::generate(None).unwrap())
            .await
            .unwrap();
        assert_ne!(host.listen_endpoint().port(), 0);
        assert_eq!(host.advertised_address().endpoint(), host.listen_endpoint());
        assert_eq!(host.advertised_address().peer_id(), host.peer_id());
        assert!(host.is_running());
        assert_eq!(host.connection_count(), 0);
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let first = Host::start(local_config(SecurityMode::Secured), Keypair::generate(None).unwrap())
            .await
            .unwrap();
        let taken = HostConfig::new(first.listen_endpoint(), SecurityMode::Secured);
        let result = Host::start(taken, Keypair::generate(None).unwrap()).await;
        assert!(matches!(result, Err(WireError::Bind { .. })));
        first.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_handler_validates_name() {
        let host = Host::start(local_config(SecurityMode::Secured), Keypair::generate(None).unwrap())
            .await
            .unwrap();
        host.register_handler(ECHO_PROTOCOL, EchoHandler).unwrap();
        host.register_handler(ECHO_PROTOCOL, EchoHandler).unwrap();
        assert_eq!(host.router().protocols(), vec![ECHO_PROTOCOL.to_string()]);
        assert!(matches!(
            host.register_handler("echo", EchoHandler),
            Err(WireError::InvalidProtocolName(_))
        ));
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_stream_after_shutdown() {
        let host = Host::start(local_config(SecurityMode::Secured), Keypair::generate(None).unwrap())
            .await
            .unwrap();
        let peer = Keypair::generate(None).unwrap().peer_id();
        host.add_known_address(peer.clone(), host.listen_endpoint(), AddressTtl::Permanent);
        host.shutdown().await;

        assert!(!host.is_running());
        assert!(matches!(
            host.open_stream(&peer, ECHO_PROTOCOL).await,
            Err(WireError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_expired_address_is_unknown_peer() {
        let host = Host::start(local_config(SecurityMode::Secured), Keypair::generate(None).unwrap())
            .await
            .unwrap();
        let peer = Keypair::generate(None).unwrap().peer_id();
        host.add_known_address(
            peer.clone(),
            "/ip4/127.0.0.1/tcp/9".parse().unwrap(),
            AddressTtl::For(Duration::ZERO),
        );
        assert!(matches!(
            host.open_stream(&peer, ECHO_PROTOCOL).await,
            Err(WireError::UnknownPeer(p)) if p == peer
        ));
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_unbounded_ttl_address_is_usable() {
        let host = Host::start(local_config(SecurityMode::Secured), Keypair::generate(None).unwrap())
            .await
            .unwrap();
        let peer = Keypair::generate(None).unwrap().peer_id();
        host.add_known_address(peer.clone(), host.listen_endpoint(), AddressTtl::For(Duration::MAX));
        assert_eq!(host.registry().addresses(&peer), vec![host.listen_endpoint()]);
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_negotiation_timeout_resets_pending_stream() {
        // Completes the handshake, then never answers the Open.
        let raw = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::from(raw.local_addr().unwrap());
        let mute = Keypair::generate(None).unwrap();
        let mute_id = mute.peer_id();
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let remote = tokio::spawn(async move {
            let (tcp, _) = raw.accept().await.unwrap();
            let (reader, writer) = tcp.into_split();
            let mut session = handshake(
                reader,
                writer,
                &mute,
                SecurityMode::Secured,
                Role::Listener,
                None,
            )
            .await
            .unwrap();
            while let Ok(Some(frame)) = session.reader.recv().await {
                if seen_tx.send(frame).is_err() {
                    break;
                }
            }
        });

        let host = Host::start(local_config(SecurityMode::Secured), Keypair::generate(None).unwrap())
            .await
            .unwrap();
        host.add_known_address(mute_id.clone(), endpoint, AddressTtl::Permanent);

        let timeout = Duration::from_millis(500);
        match host.open_stream_with_timeout(&mute_id, ECHO_PROTOCOL, timeout).await {
            Err(WireError::DialTimeout(d)) => assert_eq!(d, timeout),
            other => panic!("expected DialTimeout, got {other:?}"),
        }

        let open = seen.recv().await.unwrap();
        assert_eq!(open.kind, FrameKind::Open);
        assert_eq!(&open.payload[..], ECHO_PROTOCOL.as_bytes());
        let reset = seen.recv().await.unwrap();
        assert_eq!((reset.kind, reset.stream_id), (FrameKind::Reset, open.stream_id));
        assert_eq!(host.open_stream_count(), 0);
        assert_eq!(host.connection_count(), 1);

        host.shutdown().await;
        remote.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_host_releases_port() {
        let host = Host::start(local_config(SecurityMode::Secured), Keypair::generate(None).unwrap())
            .await
            .unwrap();
        let endpoint = host.listen_endpoint();
        drop(host);

        let mut rebound = None;
        for _ in 0..50 {
            if let Ok(listener) = TcpListener::bind(endpoint.socket_addr()).await {
                rebound = Some(listener);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(rebound.is_some(), "port {} still bound", endpoint.port());
    }
}
