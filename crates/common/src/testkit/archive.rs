use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use crate::archive::{Archive, ArchiveError, ArchiveOptions, ArchiveSource, ArchiveStore};
use crate::keys::{ArchiveKey, ArchiveSecret, DiscoveryKey};
use crate::swarm::{JoinOptions, PeerStream, SwarmTransport};

/// Archive store that keeps everything in memory and counts what it is asked to do.
///
/// Archive keys are stable per path, so re-creating an archive for the
/// same directory yields the same identifiers.
#[derive(Debug, Default)]
pub struct MemoryArchiveStore {
    keys: Mutex<HashMap<PathBuf, ArchiveKey>>,
    archives: Mutex<Vec<Arc<MemoryArchive>>>,
    created: AtomicUsize,
    creation_delay: Option<Duration>,
    failing: Mutex<HashSet<PathBuf>>,
}

impl MemoryArchiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stall every archive creation, widening the window for concurrent calls.
    pub fn with_creation_delay(delay: Duration) -> Self {
        Self {
            creation_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Number of archives created from a path
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Every archive created so far, oldest first
    pub fn archives(&self) -> Vec<Arc<MemoryArchive>> {
        self.archives.lock().clone()
    }

    /// Make every later creation for `path` fail.
    pub fn fail_create(&self, path: impl AsRef<Path>) {
        self.failing.lock().insert(canonical(path.as_ref()));
    }

    /// The most recent archive created for `path`
    pub fn archive_at(&self, path: impl AsRef<Path>) -> Option<Arc<MemoryArchive>> {
        let path = canonical(path.as_ref());
        self.archives
            .lock()
            .iter()
            .rev()
            .find(|a| a.root() == path.as_path())
            .cloned()
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchiveStore {
    type Archive = MemoryArchive;

    async fn create_archive(
        &self,
        source: ArchiveSource<MemoryArchive>,
        _options: &ArchiveOptions,
    ) -> Result<Arc<MemoryArchive>, ArchiveError> {
        let absolute = match source {
            ArchiveSource::FromExistingHandle(archive) => return Ok(archive),
            ArchiveSource::FromPath { absolute, .. } => absolute,
        };

        if let Some(delay) = self.creation_delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(&absolute) {
            return Err(injected("create"));
        }

        let key = *self
            .keys
            .lock()
            .entry(absolute.clone())
            .or_insert_with(|| ArchiveSecret::generate().archive_key());
        let archive = Arc::new(MemoryArchive::with_key(absolute, key));

        self.created.fetch_add(1, Ordering::SeqCst);
        self.archives.lock().push(archive.clone());
        Ok(archive)
    }
}

#[derive(Debug)]
pub struct MemoryArchive {
    root: PathBuf,
    archive_key: ArchiveKey,
    discovery_key: DiscoveryKey,
    version: AtomicU64,
    sharing: AtomicBool,
    closed: AtomicBool,
    imports: AtomicUsize,
    replications: AtomicUsize,
    fail_import: AtomicBool,
    fail_close: AtomicBool,
}

impl MemoryArchive {
    pub fn with_key(root: impl Into<PathBuf>, archive_key: ArchiveKey) -> Self {
        Self {
            root: root.into(),
            discovery_key: archive_key.discovery_key(),
            archive_key,
            version: AtomicU64::new(0),
            sharing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            imports: AtomicUsize::new(0),
            replications: AtomicUsize::new(0),
            fail_import: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
        }
    }

    /// New archive with a random key
    pub fn generate(root: impl Into<PathBuf>) -> Self {
        Self::with_key(root, ArchiveSecret::generate().archive_key())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn imports(&self) -> usize {
        self.imports.load(Ordering::SeqCst)
    }

    pub fn replications(&self) -> usize {
        self.replications.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make later imports fail, or succeed again.
    pub fn set_fail_import(&self, fail: bool) {
        self.fail_import.store(fail, Ordering::SeqCst);
    }

    /// Make later closes fail without closing the archive.
    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<(), ArchiveError> {
        if self.is_closed() {
            return Err(ArchiveError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Archive for MemoryArchive {
    fn archive_key(&self) -> ArchiveKey {
        self.archive_key
    }

    fn discovery_key(&self) -> DiscoveryKey {
        self.discovery_key
    }

    fn sharing(&self) -> bool {
        self.sharing.load(Ordering::SeqCst)
    }

    async fn import_files(&self) -> Result<u64, ArchiveError> {
        self.ensure_open()?;
        if self.fail_import.load(Ordering::SeqCst) {
            return Err(injected("import"));
        }
        self.imports.fetch_add(1, Ordering::SeqCst);
        Ok(self.version.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn join_swarm(&self, swarm: &dyn SwarmTransport) -> Result<(), ArchiveError> {
        self.ensure_open()?;
        swarm
            .join(&self.discovery_key, JoinOptions { announce: true })
            .await?;
        self.sharing.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn leave_swarm(&self, swarm: &dyn SwarmTransport) -> Result<(), ArchiveError> {
        if !self.sharing() {
            return Ok(());
        }
        swarm.leave(&self.discovery_key).await?;
        self.sharing.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Writes the archive key and hangs up.
    async fn replicate(&self, mut stream: PeerStream) -> Result<(), ArchiveError> {
        self.ensure_open()?;
        self.replications.fetch_add(1, Ordering::SeqCst);
        stream.write_all(self.archive_key.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ArchiveError> {
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(injected("close"));
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn injected(op: &str) -> ArchiveError {
    ArchiveError::Io(std::io::Error::other(format!("{op} failed")))
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
