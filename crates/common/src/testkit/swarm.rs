use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::keys::DiscoveryKey;
use crate::swarm::{
    request_feed, ConnectionHandler, ConnectionInfo, ConnectionKind, JoinOptions, SwarmError,
    SwarmEvent, SwarmTransport, DEFAULT_CHANNEL_CAPACITY,
};

const DUPLEX_BUFFER: usize = 64 * 1024;

/// Swarm transport that records membership and connects peers over
///  in-process duplex pipes.
pub struct MemorySwarm {
    handler: Mutex<Option<Arc<dyn ConnectionHandler>>>,
    port: Mutex<Option<u16>>,
    joined: Mutex<HashSet<DiscoveryKey>>,
    joins: AtomicUsize,
    leaves: AtomicUsize,
    closed: AtomicBool,
    events: broadcast::Sender<SwarmEvent>,
}

impl fmt::Debug for MemorySwarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySwarm")
            .field("port", &*self.port.lock())
            .field("joined", &self.joined.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Default for MemorySwarm {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySwarm {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            handler: Mutex::new(None),
            port: Mutex::new(None),
            joined: Mutex::new(HashSet::new()),
            joins: AtomicUsize::new(0),
            leaves: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            events,
        }
    }

    pub fn port(&self) -> Option<u16> {
        *self.port.lock()
    }

    pub fn is_listening(&self) -> bool {
        self.handler.lock().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_joined(&self, discovery_key: &DiscoveryKey) -> bool {
        self.joined.lock().contains(discovery_key)
    }

    /// Number of discovery keys currently joined
    pub fn joined(&self) -> usize {
        self.joined.lock().len()
    }

    pub fn joins(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    pub fn leaves(&self) -> usize {
        self.leaves.load(Ordering::SeqCst)
    }

    /// Publish a transport error without closing.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.events.send(SwarmEvent::Error(reason.into()));
    }

    /// Connect a simulated peer asking for `discovery_key`.
    ///
    /// Returns the peer's end of the pipe and the task running the
    /// listener side of the session.
    pub async fn dial(
        &self,
        discovery_key: &DiscoveryKey,
    ) -> Result<(DuplexStream, JoinHandle<()>), SwarmError> {
        let handler = self.handler.lock().clone().ok_or(SwarmError::NotListening)?;
        let (mut client, server) = tokio::io::duplex(DUPLEX_BUFFER);

        let stream = handler.on_connection(ConnectionInfo {
            peer: Some("memory-peer".to_string()),
            kind: ConnectionKind::Memory,
            inbound: true,
        });
        let session = tokio::spawn(stream.run(Box::new(server)));

        request_feed(&mut client, discovery_key).await?;
        Ok((client, session))
    }
}

#[async_trait]
impl SwarmTransport for MemorySwarm {
    async fn listen(
        &self,
        port: u16,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<(), SwarmError> {
        {
            let mut slot = self.handler.lock();
            if slot.is_some() {
                return Err(SwarmError::AlreadyListening);
            }
            *slot = Some(handler);
        }
        *self.port.lock() = Some(port);
        let _ = self.events.send(SwarmEvent::Listening { port });
        Ok(())
    }

    async fn join(
        &self,
        discovery_key: &DiscoveryKey,
        _options: JoinOptions,
    ) -> Result<(), SwarmError> {
        if self.is_closed() {
            return Err(SwarmError::NotListening);
        }
        self.joined.lock().insert(*discovery_key);
        self.joins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn leave(&self, discovery_key: &DiscoveryKey) -> Result<(), SwarmError> {
        self.joined.lock().remove(discovery_key);
        self.leaves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), SwarmError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.handler.lock().take();
        self.joined.lock().clear();
        let _ = self.events.send(SwarmEvent::Closed);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.events.subscribe()
    }
}
