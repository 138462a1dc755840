use crate::archive::ArchiveError;
use crate::swarm::SwarmError;

/// Invalid arguments when building a [`ShareCoordinator`](super::ShareCoordinator).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("both root_dir and port are missing")]
    MissingRootAndPort,
    #[error("root_dir is missing")]
    MissingRoot,
    #[error("port is missing")]
    MissingPort,
    #[error("root_dir is invalid: {0}")]
    InvalidRoot(String),
    #[error("an archive store is required")]
    MissingArchiveStore,
    #[error("a swarm transport is required")]
    MissingTransport,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Cannot share {0}. It is not initialized")]
    NotInitialized(String),
    #[error("{0} does not exist")]
    NotFound(String),
    #[error("{dir} holds the same archive as {owner}")]
    DuplicateArchive { dir: String, owner: String },
    #[error("coordinator is shutting down")]
    ShuttingDown,
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("swarm error: {0}")]
    Swarm(#[from] SwarmError),
}
