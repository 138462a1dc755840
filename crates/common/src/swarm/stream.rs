use std::fmt;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::ConnectionInfo;
use crate::archive::ArchiveError;
use crate::keys::{DiscoveryKey, KEY_SIZE};

/// Byte stream a replication session runs over.
pub trait PeerIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerIo for T {}

pub type PeerStream = Box<dyn PeerIo>;

/// Invoked once the peer has told us which feed it wants.
pub type FeedHandler =
    Box<dyn FnOnce(DiscoveryKey, PeerStream) -> BoxFuture<'static, Result<(), ArchiveError>> + Send>;

/// A single peer replication session.
///
/// The dialing peer opens with the raw discovery key of the archive it
/// wants (see [`request_feed`]). Once that frame has been read the
/// registered feed handler takes over the stream.
pub struct ReplicationStream {
    id: u64,
    info: ConnectionInfo,
    on_feed: Option<FeedHandler>,
}

impl fmt::Debug for ReplicationStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationStream")
            .field("id", &self.id)
            .field("info", &self.info)
            .field("has_feed_handler", &self.on_feed.is_some())
            .finish()
    }
}

impl ReplicationStream {
    pub fn new(id: u64, info: ConnectionInfo) -> Self {
        Self {
            id,
            info,
            on_feed: None,
        }
    }

    pub fn on_feed<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(DiscoveryKey, PeerStream) -> BoxFuture<'static, Result<(), ArchiveError>>
            + Send
            + 'static,
    {
        self.on_feed = Some(Box::new(handler));
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Drive the session to completion over `io`.
    ///
    /// Errors never escape; they are logged against the connection id.
    pub async fn run(self, mut io: PeerStream) {
        let conn = self.id;
        tracing::debug!(
            conn,
            peer = ?self.info.peer,
            kind = %self.info.kind,
            inbound = self.info.inbound,
            "replication stream opened"
        );

        let mut buff = [0u8; KEY_SIZE];
        if let Err(e) = io.read_exact(&mut buff).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                tracing::debug!(conn, "replication stream ended before feed");
            } else {
                tracing::debug!(conn, error = %e, "replication stream error");
            }
            tracing::debug!(conn, "replication stream closed");
            return;
        }

        let discovery_key = DiscoveryKey::from_bytes(buff);
        tracing::debug!(conn, discovery_key = %discovery_key, "feed");

        match self.on_feed {
            Some(handler) => match handler(discovery_key, io).await {
                Ok(()) => tracing::debug!(conn, "replication stream ended"),
                Err(e) => tracing::debug!(conn, error = %e, "replication stream error"),
            },
            None => tracing::debug!(conn, "no feed handler registered"),
        }

        tracing::debug!(conn, "replication stream closed");
    }
}

/// Open a replication session by asking the remote for `discovery_key`.
pub async fn request_feed<W>(io: &mut W, discovery_key: &DiscoveryKey) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    io.write_all(discovery_key.as_bytes()).await?;
    io.flush().await
}
