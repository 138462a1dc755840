use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::keys::DiscoveryKey;

mod iroh_swarm;
mod stream;

pub use iroh_swarm::{IrohSwarm, IrohSwarmBuilder, ALPN};
pub use stream::{request_feed, FeedHandler, PeerIo, PeerStream, ReplicationStream};

/// Default capacity for swarm event channels
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("swarm is already listening")]
    AlreadyListening,
    #[error("swarm is not listening")]
    NotListening,
    #[error("failed to bind swarm endpoint: {0:#}")]
    Bind(#[source] anyhow::Error),
    #[error("failed to connect to peer: {0:#}")]
    Connect(#[source] anyhow::Error),
    #[error("failed to shut down swarm: {0:#}")]
    Shutdown(#[source] anyhow::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle events published by a swarm transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmEvent {
    /// The listener is bound and accepting connections
    Listening { port: u16 },
    /// A swarm-level failure that did not stop the transport
    Error(String),
    /// The transport has closed
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Quic,
    Memory,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Quic => write!(f, "quic"),
            ConnectionKind::Memory => write!(f, "memory"),
        }
    }
}

/// What the transport knows about a peer connection when it is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Remote peer identity, if the transport exposes one
    pub peer: Option<String>,
    pub kind: ConnectionKind,
    /// True when the remote peer dialed us
    pub inbound: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct JoinOptions {
    pub announce: bool,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self { announce: true }
    }
}

/// Produces a replication stream for each accepted peer connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_connection(&self, info: ConnectionInfo) -> ReplicationStream;
}

/// Network layer peers rendezvous on.
///
/// A transport accepts inbound connections once [`listen`](Self::listen)
/// is called and hands each one to the registered [`ConnectionHandler`].
/// Membership in the swarm is tracked per discovery key.
#[async_trait]
pub trait SwarmTransport: Send + Sync + fmt::Debug + 'static {
    async fn listen(&self, port: u16, handler: Arc<dyn ConnectionHandler>)
        -> Result<(), SwarmError>;

    async fn join(&self, discovery_key: &DiscoveryKey, options: JoinOptions)
        -> Result<(), SwarmError>;

    async fn leave(&self, discovery_key: &DiscoveryKey) -> Result<(), SwarmError>;

    async fn close(&self) -> Result<(), SwarmError>;

    fn subscribe(&self) -> broadcast::Receiver<SwarmEvent>;
}
