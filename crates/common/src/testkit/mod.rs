/// In-memory collaborators for exercising the share coordinator
///
/// Nothing here touches the network or writes archive metadata, so tests
/// can drive the coordinator through its whole lifecycle in-process.
///
/// # Example
///
/// ```rust,ignore
/// use common::testkit::memory_coordinator;
///
/// #[tokio::test]
/// async fn test_share() -> anyhow::Result<()> {
///     let root = tempfile::TempDir::new()?;
///     std::fs::create_dir(root.path().join("site"))?;
///
///     let (coordinator, store, swarm) = memory_coordinator(root.path(), 3282)?;
///     coordinator.start_listening().await?;
///     coordinator.init_directory("site").await?;
///     let ids = coordinator.share_directory("site", false).await?;
///
///     assert!(swarm.is_joined(&ids.discovery_key));
///     assert_eq!(store.created(), 1);
///     coordinator.shutdown().await?;
///     Ok(())
/// }
/// ```
mod archive;
mod swarm;

use std::path::PathBuf;
use std::sync::Arc;

pub use archive::{MemoryArchive, MemoryArchiveStore};
pub use swarm::MemorySwarm;

use crate::coordinator::{ConfigError, ShareCoordinator};

pub type MemoryCoordinator = ShareCoordinator<MemoryArchiveStore, MemorySwarm>;

/// Build a coordinator over fresh in-memory collaborators, returning
///  handles to both so tests can inspect them.
pub fn memory_coordinator(
    root_dir: impl Into<PathBuf>,
    port: u16,
) -> Result<(MemoryCoordinator, Arc<MemoryArchiveStore>, Arc<MemorySwarm>), ConfigError> {
    with_store(root_dir, port, MemoryArchiveStore::new())
}

/// Like [`memory_coordinator`] with a caller supplied archive store.
pub fn with_store(
    root_dir: impl Into<PathBuf>,
    port: u16,
    store: MemoryArchiveStore,
) -> Result<(MemoryCoordinator, Arc<MemoryArchiveStore>, Arc<MemorySwarm>), ConfigError> {
    let store = Arc::new(store);
    let swarm = Arc::new(MemorySwarm::new());
    let coordinator = MemoryCoordinator::builder()
        .root_dir(root_dir)
        .port(port)
        .archive_store(store.clone())
        .transport(swarm.clone())
        .build()?;
    Ok((coordinator, store, swarm))
}
