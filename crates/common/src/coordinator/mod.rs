use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::archive::{Archive, ArchiveOptions, ArchiveSource, ArchiveStore};
use crate::keys::{ArchiveKey, DiscoveryKey};
use crate::swarm::{ConnectionHandler, ConnectionInfo, ReplicationStream, SwarmEvent, SwarmTransport};

mod error;
mod events;
mod index;
mod locks;
mod path;

pub use error::{ConfigError, CoordinatorError};
pub use events::{Notifier, ShareEvent};
pub use index::{ArchiveIndex, InsertError};
pub use locks::{DirGuard, DirLocks};
pub use path::resolve_path;

/// Identifiers handed back for a tracked directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveIds {
    pub discovery_key: DiscoveryKey,
    pub archive_key: ArchiveKey,
}

impl ArchiveIds {
    pub fn of<A: Archive + ?Sized>(archive: &A) -> Self {
        Self {
            discovery_key: archive.discovery_key(),
            archive_key: archive.archive_key(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryInfo {
    pub dir: PathBuf,
    pub discovery_key: DiscoveryKey,
    pub archive_key: ArchiveKey,
    pub sharing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub dir: String,
    pub discovery_key: DiscoveryKey,
    pub archive_key: ArchiveKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub dir: String,
    pub error: String,
}

/// Outcome of reconciling the tracked set against a desired directory list.
///
/// Every input directory appears exactly once, in either `results` or
/// `errors`, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub results: Vec<SyncResult>,
    pub errors: Vec<SyncFailure>,
}

pub struct CoordinatorBuilder<S: ArchiveStore, T: SwarmTransport> {
    root_dir: Option<PathBuf>,
    port: Option<u16>,
    store: Option<Arc<S>>,
    transport: Option<Arc<T>>,
    options: ArchiveOptions,
}

impl<S: ArchiveStore, T: SwarmTransport> Default for CoordinatorBuilder<S, T> {
    fn default() -> Self {
        Self {
            root_dir: None,
            port: None,
            store: None,
            transport: None,
            options: ArchiveOptions::default(),
        }
    }
}

impl<S: ArchiveStore, T: SwarmTransport> CoordinatorBuilder<S, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory every managed directory is resolved against
    pub fn root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(root_dir.into());
        self
    }

    /// Port the swarm listens on
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn archive_store(mut self, store: impl Into<Arc<S>>) -> Self {
        self.store = Some(store.into());
        self
    }

    pub fn transport(mut self, transport: impl Into<Arc<T>>) -> Self {
        self.transport = Some(transport.into());
        self
    }

    pub fn archive_options(mut self, options: ArchiveOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<ShareCoordinator<S, T>, ConfigError> {
        let (root_dir, port) = match (self.root_dir, self.port) {
            (None, None) => return Err(ConfigError::MissingRootAndPort),
            (None, Some(_)) => return Err(ConfigError::MissingRoot),
            (Some(_), None) => return Err(ConfigError::MissingPort),
            (Some(root_dir), Some(port)) => (root_dir, port),
        };
        if root_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidRoot("root_dir is empty".to_string()));
        }
        // directories are tracked by canonical path, so the root must be too
        let root_dir = std::fs::canonicalize(&root_dir).unwrap_or(root_dir);
        let store = self.store.ok_or(ConfigError::MissingArchiveStore)?;
        let transport = self.transport.ok_or(ConfigError::MissingTransport)?;

        Ok(ShareCoordinator {
            inner: Arc::new(Inner {
                root_dir,
                port,
                store,
                transport,
                options: self.options,
                index: ArchiveIndex::new(),
                locks: DirLocks::new(),
                notifier: Notifier::new(),
                listening: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                connections: AtomicU64::new(0),
            }),
        })
    }
}

struct Inner<S: ArchiveStore, T: SwarmTransport> {
    root_dir: PathBuf,
    port: u16,
    store: Arc<S>,
    transport: Arc<T>,
    options: ArchiveOptions,
    index: ArchiveIndex<S::Archive>,
    locks: DirLocks,
    notifier: Notifier,
    listening: AtomicBool,
    shutting_down: AtomicBool,
    connections: AtomicU64,
}

/// Keeps managed directories, their archives and swarm membership in step.
///
/// Cheap to clone; clones share the same index and transport. All
/// mutating operations on one directory are serialized, operations on
/// different directories run concurrently.
pub struct ShareCoordinator<S: ArchiveStore, T: SwarmTransport> {
    inner: Arc<Inner<S, T>>,
}

impl<S: ArchiveStore, T: SwarmTransport> Clone for ShareCoordinator<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: ArchiveStore, T: SwarmTransport> fmt::Debug for ShareCoordinator<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareCoordinator")
            .field("root_dir", &self.inner.root_dir)
            .field("port", &self.inner.port)
            .field("directories", &self.inner.index.len())
            .field("listening", &self.is_listening())
            .finish()
    }
}

impl<S: ArchiveStore, T: SwarmTransport> ShareCoordinator<S, T> {
    pub fn builder() -> CoordinatorBuilder<S, T> {
        CoordinatorBuilder::new()
    }

    pub fn root_dir(&self) -> &Path {
        &self.inner.root_dir
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShareEvent> {
        self.inner.notifier.subscribe()
    }

    pub fn resolve_path(&self, dir: impl AsRef<Path>) -> PathBuf {
        resolve_path(&self.inner.root_dir, dir)
    }

    /// Resolve `dir` and collapse `..` segments and symlinks, so every
    /// spelling of a directory maps to one index entry. Paths that do not
    /// exist are returned as resolved.
    async fn locate(&self, dir: impl AsRef<Path>) -> PathBuf {
        let path = self.resolve_path(dir);
        tokio::fs::canonicalize(&path).await.unwrap_or(path)
    }

    /// Blocking counterpart of [`locate`](Self::locate) for the read accessors.
    fn locate_now(&self, dir: impl AsRef<Path>) -> PathBuf {
        let path = self.resolve_path(dir);
        std::fs::canonicalize(&path).unwrap_or(path)
    }

    /// Whether `dir` exists under the root.
    pub async fn can_share(&self, dir: impl AsRef<Path>) -> bool {
        let path = self.resolve_path(dir);
        tokio::fs::try_exists(&path).await.unwrap_or(false)
    }

    /// Bind the transport and start accepting peers.
    ///
    /// Transport lifecycle events are republished as [`ShareEvent`]s.
    pub async fn start_listening(&self) -> Result<(), CoordinatorError> {
        let events = self.inner.transport.subscribe();
        let forwarder = tokio::spawn(forward_swarm_events(Arc::downgrade(&self.inner), events));

        let handler: Arc<dyn ConnectionHandler> = Arc::new(ConnectionDispatch {
            inner: Arc::downgrade(&self.inner),
        });
        if let Err(e) = self.inner.transport.listen(self.inner.port, handler).await {
            forwarder.abort();
            tracing::error!(port = self.inner.port, error = %e, "failed to start listening");
            return Err(e.into());
        }
        Ok(())
    }

    /// Track `dir`, creating its archive on first use.
    pub async fn init_directory(
        &self,
        dir: impl AsRef<Path>,
    ) -> Result<ArchiveIds, CoordinatorError> {
        let dir = dir.as_ref();
        let path = self.locate(dir).await;
        let _guard = self.inner.locks.lock(&path).await;
        self.init_locked(dir, path).await
    }

    async fn init_locked(&self, dir: &Path, path: PathBuf) -> Result<ArchiveIds, CoordinatorError> {
        if let Some(archive) = self.inner.index.archive_for_dir(&path) {
            return Ok(ArchiveIds::of(&*archive));
        }
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(CoordinatorError::ShuttingDown);
        }
        if !self.can_share(&path).await {
            return Err(CoordinatorError::NotFound(dir.display().to_string()));
        }

        let source = ArchiveSource::FromPath {
            relative: dir.to_path_buf(),
            absolute: path.clone(),
        };
        let archive = self
            .inner
            .store
            .create_archive(source, &self.inner.options)
            .await?;
        let ids = ArchiveIds::of(&*archive);

        if let Err(rejected) = self.inner.index.insert(path.clone(), archive) {
            let err = match &rejected {
                InsertError::Sealed(_) => CoordinatorError::ShuttingDown,
                InsertError::KeyOwned { owner, .. } => CoordinatorError::DuplicateArchive {
                    dir: dir.display().to_string(),
                    owner: owner.display().to_string(),
                },
            };
            if let Err(e) = rejected.into_archive().close().await {
                tracing::warn!(dir = %path.display(), error = %e, "failed to close archive");
            }
            return Err(err);
        }

        tracing::info!(
            dir = %path.display(),
            discovery_key = %ids.discovery_key,
            "initialized directory"
        );
        Ok(ids)
    }

    /// Import `dir` and join the swarm with its discovery key.
    ///
    /// The directory must have been initialized.
    pub async fn share_directory(
        &self,
        dir: impl AsRef<Path>,
        skip_import: bool,
    ) -> Result<ArchiveIds, CoordinatorError> {
        let dir = dir.as_ref();
        let path = self.locate(dir).await;
        let _guard = self.inner.locks.lock(&path).await;

        let archive = self
            .inner
            .index
            .archive_for_dir(&path)
            .ok_or_else(|| CoordinatorError::NotInitialized(dir.display().to_string()))?;
        let ids = ArchiveIds::of(&*archive);

        if !skip_import {
            archive.import_files().await?;
        }

        if !archive.sharing() {
            archive.join_swarm(&*self.inner.transport).await?;
            tracing::info!(
                dir = %path.display(),
                discovery_key = %ids.discovery_key,
                "sharing directory"
            );
            self.inner
                .notifier
                .emit(ShareEvent::Shared(ids.discovery_key));
        }

        Ok(ids)
    }

    /// Stop sharing `dir` and forget it.
    ///
    /// Returns false when the directory was not tracked. A tracked directory
    /// that is not sharing is left as is.
    pub async fn unshare_directory(
        &self,
        dir: impl AsRef<Path>,
    ) -> Result<bool, CoordinatorError> {
        let path = self.locate(dir).await;
        let _guard = self.inner.locks.lock(&path).await;

        let Some(archive) = self.inner.index.archive_for_dir(&path) else {
            return Ok(false);
        };
        if !archive.sharing() {
            return Ok(true);
        }

        archive.leave_swarm(&*self.inner.transport).await?;
        self.inner.index.remove(&path);
        archive.close().await?;

        tracing::info!(
            dir = %path.display(),
            discovery_key = %archive.discovery_key(),
            "unshared directory"
        );
        Ok(true)
    }

    /// Re-import the files of a tracked directory.
    ///
    /// Swarm membership is left alone. Returns false when untracked.
    pub async fn update_directory(
        &self,
        dir: impl AsRef<Path>,
    ) -> Result<bool, CoordinatorError> {
        let path = self.locate(dir).await;
        let _guard = self.inner.locks.lock(&path).await;

        let Some(archive) = self.inner.index.archive_for_dir(&path) else {
            return Ok(false);
        };
        let version = archive.import_files().await?;
        tracing::debug!(dir = %path.display(), version, "updated directory");
        Ok(true)
    }

    /// Make the shared set match `dirs`.
    ///
    /// Tracked directories missing from `dirs` are unshared first, then
    /// every listed directory is initialized and shared concurrently.
    pub async fn sync<D: AsRef<Path>>(&self, dirs: &[D]) -> SyncOutcome {
        let wanted: HashSet<PathBuf> = join_all(dirs.iter().map(|d| self.locate(d)))
            .await
            .into_iter()
            .collect();

        for (path, _) in self.inner.index.entries() {
            if wanted.contains(&path) {
                continue;
            }
            if let Err(e) = self.unshare_directory(&path).await {
                tracing::warn!(dir = %path.display(), error = %e, "failed to unshare during sync");
            }
        }

        let established = join_all(dirs.iter().map(|d| self.establish(d.as_ref()))).await;

        let mut outcome = SyncOutcome::default();
        for (dir, result) in dirs.iter().zip(established) {
            let dir = dir.as_ref().display().to_string();
            match result {
                Ok(ids) => outcome.results.push(SyncResult {
                    dir,
                    discovery_key: ids.discovery_key,
                    archive_key: ids.archive_key,
                }),
                Err(e) => {
                    tracing::warn!(dir = %dir, error = %e, "failed to sync directory");
                    outcome.errors.push(SyncFailure {
                        dir,
                        error: e.to_string(),
                    })
                }
            }
        }

        tracing::info!(
            shared = outcome.results.len(),
            failed = outcome.errors.len(),
            "sync complete"
        );
        outcome
    }

    async fn establish(&self, dir: &Path) -> Result<ArchiveIds, CoordinatorError> {
        if !self.can_share(dir).await {
            return Err(CoordinatorError::NotFound(dir.display().to_string()));
        }
        self.init_directory(dir).await?;
        self.share_directory(dir, false).await
    }

    /// Build the replication stream for an accepted peer connection.
    pub fn on_connection(&self, info: ConnectionInfo) -> ReplicationStream {
        dispatch(&self.inner, info)
    }

    /// Close every archive, clear the index and close the transport.
    ///
    /// Archive close failures are logged and otherwise ignored.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let archives = self.inner.index.seal();
        tracing::info!(archives = archives.len(), "shutting down coordinator");

        join_all(archives.iter().map(|(path, archive)| async move {
            if let Err(e) = archive.close().await {
                tracing::warn!(dir = %path.display(), error = %e, "failed to close archive");
            }
        }))
        .await;

        self.inner.transport.close().await?;
        Ok(())
    }

    pub fn num_directories(&self) -> usize {
        self.inner.index.len()
    }

    /// Number of tracked archives currently joined to the swarm
    pub fn num_sharing(&self) -> usize {
        self.inner
            .index
            .entries()
            .iter()
            .filter(|(_, archive)| archive.sharing())
            .count()
    }

    pub fn discovery_key_for(&self, dir: impl AsRef<Path>) -> Option<DiscoveryKey> {
        self.inner.index.key_for_dir(&self.locate_now(dir))
    }

    pub fn archive_for_dir(&self, dir: impl AsRef<Path>) -> Option<Arc<S::Archive>> {
        self.inner.index.archive_for_dir(&self.locate_now(dir))
    }

    pub fn archive_for_key(&self, key: &DiscoveryKey) -> Option<Arc<S::Archive>> {
        self.inner.index.archive_for_key(key)
    }

    pub fn is_tracked(&self, dir: impl AsRef<Path>) -> bool {
        self.inner.index.contains_dir(&self.locate_now(dir))
    }

    pub fn is_key_tracked(&self, key: &DiscoveryKey) -> bool {
        self.inner.index.contains_key(key)
    }

    pub fn list_directories(&self) -> Vec<DirectoryInfo> {
        self.inner
            .index
            .entries()
            .into_iter()
            .map(|(dir, archive)| DirectoryInfo {
                dir,
                discovery_key: archive.discovery_key(),
                archive_key: archive.archive_key(),
                sharing: archive.sharing(),
            })
            .collect()
    }
}

/// Connection handler registered with the transport. Holds the coordinator
///  weakly so the transport never keeps it alive.
struct ConnectionDispatch<S: ArchiveStore, T: SwarmTransport> {
    inner: Weak<Inner<S, T>>,
}

impl<S: ArchiveStore, T: SwarmTransport> ConnectionHandler for ConnectionDispatch<S, T> {
    fn on_connection(&self, info: ConnectionInfo) -> ReplicationStream {
        match self.inner.upgrade() {
            Some(inner) => dispatch(&inner, info),
            None => ReplicationStream::new(0, info),
        }
    }
}

fn dispatch<S: ArchiveStore, T: SwarmTransport>(
    inner: &Arc<Inner<S, T>>,
    info: ConnectionInfo,
) -> ReplicationStream {
    let conn = inner.connections.fetch_add(1, Ordering::SeqCst) + 1;
    tracing::debug!(conn, peer = ?info.peer, kind = %info.kind, "peer connected");

    let weak = Arc::downgrade(inner);
    ReplicationStream::new(conn, info).on_feed(move |discovery_key, stream| {
        Box::pin(async move {
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            let Some(archive) = inner.index.archive_for_key(&discovery_key) else {
                tracing::debug!(conn, discovery_key = %discovery_key, "archive not found");
                return Ok(());
            };
            inner
                .notifier
                .emit(ShareEvent::Replicating(discovery_key));
            archive.replicate(stream).await
        })
    })
}

async fn forward_swarm_events<S: ArchiveStore, T: SwarmTransport>(
    inner: Weak<Inner<S, T>>,
    mut events: broadcast::Receiver<SwarmEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "swarm event stream lagged");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };

        match event {
            SwarmEvent::Listening { port } => {
                inner.listening.store(true, Ordering::SeqCst);
                tracing::info!(port, "listening");
                inner.notifier.emit(ShareEvent::Listening { port });
            }
            SwarmEvent::Error(e) => {
                tracing::error!(error = %e, "swarm error");
            }
            SwarmEvent::Closed => {
                inner.listening.store(false, Ordering::SeqCst);
                let operator_initiated = inner.shutting_down.load(Ordering::SeqCst);
                if operator_initiated {
                    tracing::info!("swarm closed");
                } else {
                    tracing::warn!("swarm closed without a shutdown request");
                }
                inner
                    .notifier
                    .emit(ShareEvent::Closed { operator_initiated });
                return;
            }
        }
    }
}
