use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::future::BoxFuture;
use iroh::discovery::pkarr::dht::DhtDiscovery;
use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler, Router};
use iroh::{Endpoint, NodeAddr, NodeId, SecretKey};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::stream::request_feed;
use super::{
    ConnectionHandler, ConnectionInfo, ConnectionKind, JoinOptions, PeerStream, SwarmError,
    SwarmEvent, SwarmTransport, DEFAULT_CHANNEL_CAPACITY,
};
use crate::keys::DiscoveryKey;

/// ALPN identifier for the replication protocol
pub const ALPN: &[u8] = b"/dat-share/1";

/// How long an accepted connection waits for the remote to hang up
///  after the replication stream has finished.
const CONNECTION_LINGER: Duration = Duration::from_secs(30);

#[derive(Default)]
pub struct IrohSwarmBuilder {
    /// the identity of the node, a fresh one is generated if unset
    secret_key: Option<SecretKey>,
    /// the interface to bind on, defaults to all interfaces
    bind_ip: Option<Ipv4Addr>,
}

impl IrohSwarmBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn secret_key(mut self, secret_key: SecretKey) -> Self {
        self.secret_key = Some(secret_key);
        self
    }

    pub fn bind_ip(mut self, ip: Ipv4Addr) -> Self {
        self.bind_ip = Some(ip);
        self
    }

    pub fn build(self) -> IrohSwarm {
        let secret_key = self
            .secret_key
            .unwrap_or_else(|| SecretKey::from_bytes(&rand::random()));
        let (events, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        IrohSwarm {
            secret_key,
            bind_ip: self.bind_ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
            router: Mutex::new(None),
            announced: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            events,
        }
    }
}

/// Swarm transport backed by an iroh endpoint with mainline DHT discovery.
///
/// The endpoint is bound lazily by [`SwarmTransport::listen`], since the
/// port is only known at that point.
pub struct IrohSwarm {
    secret_key: SecretKey,
    bind_ip: Ipv4Addr,
    router: Mutex<Option<Router>>,
    announced: Mutex<HashSet<DiscoveryKey>>,
    closed: AtomicBool,
    events: broadcast::Sender<SwarmEvent>,
}

impl fmt::Debug for IrohSwarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrohSwarm")
            .field("node_id", &self.secret_key.public())
            .field("bind_ip", &self.bind_ip)
            .field("listening", &self.router.lock().is_some())
            .field("announced", &self.announced.lock().len())
            .finish()
    }
}

impl IrohSwarm {
    pub fn builder() -> IrohSwarmBuilder {
        IrohSwarmBuilder::new()
    }

    pub fn node_id(&self) -> NodeId {
        self.secret_key.public()
    }

    /// Discovery keys currently announced on the swarm.
    pub fn announced(&self) -> Vec<DiscoveryKey> {
        let mut keys: Vec<_> = self.announced.lock().iter().copied().collect();
        keys.sort();
        keys
    }

    fn endpoint(&self) -> Result<Endpoint, SwarmError> {
        self.router
            .lock()
            .as_ref()
            .map(|router| router.endpoint().clone())
            .ok_or(SwarmError::NotListening)
    }

    /// Dial a peer and request the feed for `discovery_key`.
    ///
    /// Returns the stream positioned right after the negotiation frame.
    pub async fn open_feed(
        &self,
        peer: impl Into<NodeAddr>,
        discovery_key: &DiscoveryKey,
    ) -> Result<PeerStream, SwarmError> {
        let peer = peer.into();
        let endpoint = self.endpoint()?;

        tracing::debug!(peer = %peer.node_id, discovery_key = %discovery_key, "dialing peer");
        let conn = endpoint
            .connect(peer, ALPN)
            .await
            .map_err(|e| SwarmError::Connect(e.into()))?;
        let (send, recv) = conn
            .open_bi()
            .await
            .context("failed to open stream")
            .map_err(SwarmError::Connect)?;

        let mut io = tokio::io::join(recv, send);
        request_feed(&mut io, discovery_key).await?;
        Ok(Box::new(io))
    }

    async fn bind(&self, port: u16) -> Result<Endpoint, SwarmError> {
        let mainline_discovery = DhtDiscovery::builder()
            .secret_key(self.secret_key.clone())
            .build()
            .context("failed to build mainline discovery")
            .map_err(SwarmError::Bind)?;

        Endpoint::builder()
            .secret_key(self.secret_key.clone())
            .discovery(mainline_discovery)
            .bind_addr_v4(SocketAddrV4::new(self.bind_ip, port))
            .bind()
            .await
            .map_err(|e| SwarmError::Bind(e.into()))
    }
}

#[async_trait]
impl SwarmTransport for IrohSwarm {
    async fn listen(
        &self,
        port: u16,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<(), SwarmError> {
        if self.router.lock().is_some() {
            return Err(SwarmError::AlreadyListening);
        }

        let endpoint = match self.bind(port).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                let _ = self.events.send(SwarmEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        let protocol = SwarmProtocol {
            handler,
            events: self.events.clone(),
        };

        let router = Router::builder(endpoint).accept(ALPN, protocol).spawn();
        let raced = {
            let mut slot = self.router.lock();
            if slot.is_some() {
                Some(router)
            } else {
                *slot = Some(router);
                None
            }
        };
        if let Some(router) = raced {
            let _ = router.shutdown().await;
            return Err(SwarmError::AlreadyListening);
        }

        tracing::info!(node_id = %self.node_id(), port, "swarm listening");
        let _ = self.events.send(SwarmEvent::Listening { port });
        Ok(())
    }

    /// Record `discovery_key` as announced.
    ///
    /// Nothing is published to the DHT per key. Peers find this node
    /// through its node id, and the feed is picked by the key sent on each
    /// stream, so announcing only tracks what [`announced`](IrohSwarm::announced)
    /// reports.
    async fn join(
        &self,
        discovery_key: &DiscoveryKey,
        options: JoinOptions,
    ) -> Result<(), SwarmError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SwarmError::NotListening);
        }
        if options.announce {
            self.announced.lock().insert(*discovery_key);
        }
        tracing::debug!(discovery_key = %discovery_key, announce = options.announce, "joined swarm");
        Ok(())
    }

    async fn leave(&self, discovery_key: &DiscoveryKey) -> Result<(), SwarmError> {
        self.announced.lock().remove(discovery_key);
        tracing::debug!(discovery_key = %discovery_key, "left swarm");
        Ok(())
    }

    async fn close(&self) -> Result<(), SwarmError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.announced.lock().clear();
        let router = self.router.lock().take();
        if let Some(router) = router {
            router
                .shutdown()
                .await
                .map_err(|e| SwarmError::Shutdown(e.into()))?;
        }

        tracing::info!("swarm closed");
        let _ = self.events.send(SwarmEvent::Closed);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.events.subscribe()
    }
}

/// Protocol handler registered on the router for [`ALPN`].
#[derive(Clone)]
struct SwarmProtocol {
    handler: Arc<dyn ConnectionHandler>,
    events: broadcast::Sender<SwarmEvent>,
}

impl fmt::Debug for SwarmProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwarmProtocol").finish_non_exhaustive()
    }
}

impl ProtocolHandler for SwarmProtocol {
    #[allow(refining_impl_trait)]
    fn accept(&self, conn: Connection) -> BoxFuture<'static, Result<(), AcceptError>> {
        let handler = self.handler.clone();
        let events = self.events.clone();
        Box::pin(async move {
            let peer = conn.remote_node_id().ok().map(|id| id.to_string());
            tracing::debug!(peer = ?peer, "new connection");

            let (send, recv) = conn.accept_bi().await.map_err(|e| {
                tracing::error!("failed to accept bidirectional stream: {}", e);
                let _ = events.send(SwarmEvent::Error(e.to_string()));
                AcceptError::from(e)
            })?;

            let info = ConnectionInfo {
                peer,
                kind: ConnectionKind::Quic,
                inbound: true,
            };
            let stream = handler.on_connection(info);
            stream.run(Box::new(tokio::io::join(recv, send))).await;

            // let the dialer read everything before the connection drops
            let _ = tokio::time::timeout(CONNECTION_LINGER, conn.closed()).await;
            Ok(())
        })
    }
}
