//! Coordinator lifecycle notifications and their broadcast emitter.

use tokio::sync::broadcast;

use crate::keys::DiscoveryKey;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Notifications published by the share coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareEvent {
    /// The swarm listener is bound
    Listening { port: u16 },
    /// The swarm transport has closed
    Closed { operator_initiated: bool },
    /// A directory finished joining the swarm
    Shared(DiscoveryKey),
    /// A peer started replicating an archive
    Replicating(DiscoveryKey),
}

/// Fans [`ShareEvent`]s out to every subscriber.
///
/// Emitting never waits. A subscriber that falls more than the channel
/// capacity behind loses the oldest events and sees a lag error instead.
#[derive(Debug)]
pub struct Notifier {
    tx: broadcast::Sender<ShareEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ShareEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShareEvent> {
        self.tx.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
