use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::manifest::{Entry, Manifest};
use super::{Archive, ArchiveError, ArchiveOptions, ArchiveSource, ArchiveStore};
use crate::keys::{ArchiveKey, ArchiveSecret, DiscoveryKey};
use crate::swarm::{JoinOptions, PeerStream, SwarmTransport};

const KEY_FILE: &str = "key";
const MANIFEST_FILE: &str = "manifest.json";

/// Archive store keeping archive metadata inside each shared directory.
#[derive(Debug, Clone, Default)]
pub struct FsArchiveStore;

impl FsArchiveStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ArchiveStore for FsArchiveStore {
    type Archive = FsArchive;

    async fn create_archive(
        &self,
        source: ArchiveSource<FsArchive>,
        options: &ArchiveOptions,
    ) -> Result<Arc<FsArchive>, ArchiveError> {
        match source {
            ArchiveSource::FromExistingHandle(archive) => Ok(archive),
            ArchiveSource::FromPath { relative, absolute } => {
                tracing::debug!(dir = %relative.display(), path = %absolute.display(), "opening archive");
                FsArchive::open(absolute, options).await.map(Arc::new)
            }
        }
    }
}

/// An archive backed by a directory on the local filesystem.
#[derive(Debug)]
pub struct FsArchive {
    root: PathBuf,
    metadata_dir: PathBuf,
    metadata_name: String,
    secret: ArchiveSecret,
    archive_key: ArchiveKey,
    discovery_key: DiscoveryKey,
    manifest: RwLock<Manifest>,
    resumed: bool,
    sharing: AtomicBool,
    closed: AtomicBool,
}

impl FsArchive {
    /// Open the archive rooted at `root`, creating its metadata if allowed.
    pub async fn open(
        root: impl Into<PathBuf>,
        options: &ArchiveOptions,
    ) -> Result<Self, ArchiveError> {
        let root = root.into();
        let is_dir = tokio::fs::metadata(&root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(ArchiveError::MissingDirectory(root));
        }

        let metadata_dir = root.join(&options.metadata_dir);
        if !tokio::fs::try_exists(&metadata_dir).await? {
            if !options.create_if_missing {
                return Err(ArchiveError::NotAnArchive(root));
            }
            tokio::fs::create_dir_all(&metadata_dir).await?;
        }

        let key_path = metadata_dir.join(KEY_FILE);
        let secret = if tokio::fs::try_exists(&key_path).await? {
            let hex = tokio::fs::read_to_string(&key_path).await?;
            ArchiveSecret::from_hex(&hex)?
        } else {
            let secret = ArchiveSecret::generate();
            write_atomic(&key_path, secret.to_hex().as_bytes()).await?;
            secret
        };

        let manifest_path = metadata_dir.join(MANIFEST_FILE);
        let (manifest, resumed) = if tokio::fs::try_exists(&manifest_path).await? {
            let bytes = tokio::fs::read(&manifest_path).await?;
            (serde_json::from_slice(&bytes)?, true)
        } else {
            (Manifest::default(), false)
        };

        let archive_key = secret.archive_key();
        Ok(Self {
            discovery_key: archive_key.discovery_key(),
            archive_key,
            secret,
            root,
            metadata_dir,
            metadata_name: options.metadata_dir.clone(),
            manifest: RwLock::new(manifest),
            resumed,
            sharing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True when an existing manifest was loaded at open time
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn manifest(&self) -> Manifest {
        self.manifest.read().await.clone()
    }

    pub async fn version(&self) -> u64 {
        self.manifest.read().await.version
    }

    fn ensure_open(&self) -> Result<(), ArchiveError> {
        if self.is_closed() {
            return Err(ArchiveError::Closed);
        }
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<Entry>, ArchiveError> {
        let mut entries = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut read_dir = tokio::fs::read_dir(&dir).await?;
            while let Some(item) = read_dir.next_entry().await? {
                let file_type = item.file_type().await?;
                let path = item.path();
                if file_type.is_symlink() {
                    continue;
                }
                if file_type.is_dir() {
                    if dir == self.root && item.file_name() == self.metadata_name.as_str() {
                        continue;
                    }
                    pending.push(path);
                } else if file_type.is_file() {
                    let data = tokio::fs::read(&path).await?;
                    entries.push(Entry {
                        path: relative_path(&self.root, &path),
                        size: data.len() as u64,
                        hash: blake3::hash(&data).to_hex().to_string(),
                    });
                }
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}

#[async_trait]
impl Archive for FsArchive {
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
        let entries = self.scan().await?;

        let mut manifest = self.manifest.write().await;
        if manifest.entries == entries {
            tracing::debug!(root = %self.root.display(), version = manifest.version, "archive unchanged");
            return Ok(manifest.version);
        }

        let next = Manifest {
            version: manifest.version + 1,
            entries,
        };
        let bytes = serde_json::to_vec_pretty(&next)?;
        write_atomic(&self.metadata_dir.join(MANIFEST_FILE), &bytes).await?;
        *manifest = next;

        tracing::info!(
            root = %self.root.display(),
            version = manifest.version,
            files = manifest.entries.len(),
            bytes = manifest.total_size(),
            "imported files"
        );
        Ok(manifest.version)
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

    async fn replicate(&self, mut stream: PeerStream) -> Result<(), ArchiveError> {
        self.ensure_open()?;
        let manifest = self.manifest().await;
        let signed = manifest.sign(&self.secret)?;
        signed.write_to(&mut stream).await?;

        for entry in &manifest.entries {
            let data = tokio::fs::read(self.root.join(&entry.path)).await?;
            if data.len() as u64 != entry.size {
                return Err(ArchiveError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("{} changed since last import", entry.path),
                )));
            }
            stream.write_u64(entry.size).await?;
            stream.write_all(&data).await?;
        }

        stream.shutdown().await?;
        tracing::debug!(
            discovery_key = %self.discovery_key,
            version = manifest.version,
            "replicated archive"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), ArchiveError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(root = %self.root.display(), "archive closed");
        }
        Ok(())
    }
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArchiveError> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
