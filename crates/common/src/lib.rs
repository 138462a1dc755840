/**
 * Archive store abstraction and the filesystem
 *  backed implementation.
 * An archive is a versioned, content-addressed
 *  snapshot of a managed directory.
 */
pub mod archive;
/**
 * The share coordinator: maps managed directories
 *  to archives and archives to discovery keys,
 *  drives swarm membership and dispatches
 *  inbound replication.
 */
pub mod coordinator;
/**
 * Archive and discovery key types.
 */
pub mod keys;
/**
 * Swarm transport abstraction, the iroh backed
 *  transport and the per-connection replication
 *  stream.
 */
pub mod swarm;
/**
 * In-memory collaborators for exercising the
 *  coordinator without touching the network.
 */
pub mod testkit;
/**
 * Helper for setting build version information
 *  at compile time.
 */
pub mod version;

pub mod prelude {
    pub use crate::archive::{Archive, ArchiveError, ArchiveSource, ArchiveStore};
    pub use crate::coordinator::{
        ArchiveIds, ConfigError, CoordinatorBuilder, CoordinatorError, ShareCoordinator,
        ShareEvent, SyncOutcome,
    };
    pub use crate::keys::{ArchiveKey, DiscoveryKey};
    pub use crate::swarm::{SwarmError, SwarmEvent, SwarmTransport};
    pub use crate::version::BuildInfo;
}
