use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::keys::{ArchiveKey, DiscoveryKey, KeyError};
use crate::swarm::{PeerStream, SwarmError, SwarmTransport};

mod fs;
mod manifest;

pub use fs::{FsArchive, FsArchiveStore};
pub use manifest::{read_replica, Entry, Manifest, Replica, SignedManifest};

/// Default name of the per-directory metadata directory
pub const DEFAULT_METADATA_DIR: &str = ".dat";

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("directory does not exist: {0}")]
    MissingDirectory(PathBuf),
    #[error("not an archive: {0}")]
    NotAnArchive(PathBuf),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("manifest error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("manifest too large: {0} bytes")]
    ManifestTooLarge(usize),
    #[error("archive is closed")]
    Closed,
    #[error("swarm error: {0}")]
    Swarm(#[from] SwarmError),
}

/// Where an archive comes from when it is handed to the store.
#[derive(Debug)]
pub enum ArchiveSource<A> {
    /// Create or open the archive rooted at `absolute`. `relative` is the
    ///  caller supplied directory identifier, kept for diagnostics.
    FromPath { relative: PathBuf, absolute: PathBuf },
    /// An archive that is already open
    FromExistingHandle(Arc<A>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveOptions {
    /// name of the metadata directory inside the archived directory
    pub metadata_dir: String,
    /// create the metadata directory when it does not exist yet
    pub create_if_missing: bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            metadata_dir: DEFAULT_METADATA_DIR.to_string(),
            create_if_missing: true,
        }
    }
}

/// Creates or opens archives. The returned handle is ready to use.
#[async_trait]
pub trait ArchiveStore: Send + Sync + fmt::Debug + 'static {
    type Archive: Archive;

    async fn create_archive(
        &self,
        source: ArchiveSource<Self::Archive>,
        options: &ArchiveOptions,
    ) -> Result<Arc<Self::Archive>, ArchiveError>;
}

/// A single archived directory.
#[async_trait]
pub trait Archive: Send + Sync + fmt::Debug + 'static {
    fn archive_key(&self) -> ArchiveKey;

    fn discovery_key(&self) -> DiscoveryKey;

    /// Whether the archive is currently joined to a swarm
    fn sharing(&self) -> bool;

    /// Mirror the directory into the archive, returning the content version.
    async fn import_files(&self) -> Result<u64, ArchiveError>;

    async fn join_swarm(&self, swarm: &dyn SwarmTransport) -> Result<(), ArchiveError>;

    /// Leave the swarm. A no-op when the archive is not sharing.
    async fn leave_swarm(&self, swarm: &dyn SwarmTransport) -> Result<(), ArchiveError>;

    async fn replicate(&self, stream: PeerStream) -> Result<(), ArchiveError>;

    async fn close(&self) -> Result<(), ArchiveError>;
}
