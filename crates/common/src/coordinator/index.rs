use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::archive::Archive;
use crate::keys::DiscoveryKey;

#[derive(Debug)]
struct Maps<A> {
    dirs: HashMap<PathBuf, DiscoveryKey>,
    /// each archive remembers the directory that owns it
    archives: HashMap<DiscoveryKey, (PathBuf, Arc<A>)>,
    sealed: bool,
}

/// Why [`ArchiveIndex::insert`] refused an archive. The rejected archive
///  is handed back so the caller can close it.
#[derive(Debug)]
pub enum InsertError<A> {
    /// The index was sealed by shutdown
    Sealed(Arc<A>),
    /// Another directory already owns the archive's discovery key
    KeyOwned { owner: PathBuf, archive: Arc<A> },
}

impl<A> InsertError<A> {
    pub fn into_archive(self) -> Arc<A> {
        match self {
            InsertError::Sealed(archive) => archive,
            InsertError::KeyOwned { archive, .. } => archive,
        }
    }
}

/// Directory to discovery key to archive index.
///
/// Both maps live behind one lock, so a reader never sees a directory
/// whose archive is missing or the other way round. A discovery key
/// belongs to at most one directory. Once sealed the index stays empty.
#[derive(Debug)]
pub struct ArchiveIndex<A> {
    inner: Mutex<Maps<A>>,
}

impl<A: Archive> ArchiveIndex<A> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Maps {
                dirs: HashMap::new(),
                archives: HashMap::new(),
                sealed: false,
            }),
        }
    }

    /// Register `archive` under `dir`, keyed by the archive's own discovery key.
    pub fn insert(&self, dir: PathBuf, archive: Arc<A>) -> Result<(), InsertError<A>> {
        let key = archive.discovery_key();
        let mut maps = self.inner.lock();
        if maps.sealed {
            return Err(InsertError::Sealed(archive));
        }
        if let Some((owner, _)) = maps.archives.get(&key) {
            if owner != &dir {
                return Err(InsertError::KeyOwned {
                    owner: owner.clone(),
                    archive,
                });
            }
        }
        if let Some(previous) = maps.dirs.insert(dir.clone(), key) {
            if previous != key {
                maps.archives.remove(&previous);
            }
        }
        maps.archives.insert(key, (dir, archive));
        Ok(())
    }

    /// Remove `dir` and its archive together.
    pub fn remove(&self, dir: &Path) -> Option<Arc<A>> {
        let mut maps = self.inner.lock();
        let key = maps.dirs.remove(dir)?;
        maps.archives.remove(&key).map(|(_, archive)| archive)
    }

    /// Empty the index and refuse further inserts, handing back every
    ///  archive it held.
    pub fn seal(&self) -> Vec<(PathBuf, Arc<A>)> {
        let mut maps = self.inner.lock();
        maps.sealed = true;
        maps.dirs.clear();
        std::mem::take(&mut maps.archives).into_values().collect()
    }

    pub fn key_for_dir(&self, dir: &Path) -> Option<DiscoveryKey> {
        self.inner.lock().dirs.get(dir).copied()
    }

    pub fn archive_for_dir(&self, dir: &Path) -> Option<Arc<A>> {
        let maps = self.inner.lock();
        let key = maps.dirs.get(dir)?;
        maps.archives.get(key).map(|(_, archive)| archive.clone())
    }

    pub fn archive_for_key(&self, key: &DiscoveryKey) -> Option<Arc<A>> {
        self.inner
            .lock()
            .archives
            .get(key)
            .map(|(_, archive)| archive.clone())
    }

    pub fn contains_dir(&self, dir: &Path) -> bool {
        self.inner.lock().dirs.contains_key(dir)
    }

    pub fn contains_key(&self, key: &DiscoveryKey) -> bool {
        self.inner.lock().archives.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every entry, sorted by directory.
    pub fn entries(&self) -> Vec<(PathBuf, Arc<A>)> {
        let mut entries: Vec<_> = self
            .inner
            .lock()
            .archives
            .values()
            .map(|(dir, archive)| (dir.clone(), archive.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

impl<A: Archive> Default for ArchiveIndex<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::MemoryArchive;

    #[test]
    fn test_insert_and_remove_keep_maps_in_step() {
        let index = ArchiveIndex::new();
        let archive = Arc::new(MemoryArchive::generate("/root/a"));
        let key = archive.discovery_key();

        index.insert(PathBuf::from("/root/a"), archive).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.key_for_dir(Path::new("/root/a")), Some(key));
        assert!(index.contains_key(&key));

        let removed = index.remove(Path::new("/root/a")).unwrap();
        assert_eq!(removed.discovery_key(), key);
        assert!(index.is_empty());
        assert!(!index.contains_key(&key));
        assert!(index.remove(Path::new("/root/a")).is_none());
    }

    #[test]
    fn test_seal_empties_and_refuses_inserts() {
        let index = ArchiveIndex::new();
        for dir in ["/root/a", "/root/b"] {
            index
                .insert(PathBuf::from(dir), Arc::new(MemoryArchive::generate(dir)))
                .unwrap();
        }
        let drained = index.seal();
        assert_eq!(drained.len(), 2);
        assert!(index.is_empty());
        assert!(index.entries().is_empty());

        let late = Arc::new(MemoryArchive::generate("/root/c"));
        assert!(index.insert(PathBuf::from("/root/c"), late).is_err());
        assert!(index.is_empty());
    }

    #[test]
    fn test_key_belongs_to_one_directory() {
        let index = ArchiveIndex::new();
        let first = Arc::new(MemoryArchive::generate("/root/a"));
        let key = first.discovery_key();
        let twin = Arc::new(MemoryArchive::with_key("/root/b", first.archive_key()));

        index.insert(PathBuf::from("/root/a"), first).unwrap();
        match index.insert(PathBuf::from("/root/b"), twin) {
            Err(InsertError::KeyOwned { owner, .. }) => {
                assert_eq!(owner, PathBuf::from("/root/a"))
            }
            other => panic!("expected KeyOwned, got {:?}", other),
        }

        assert_eq!(index.len(), 1);
        assert!(!index.contains_dir(Path::new("/root/b")));
        assert_eq!(index.key_for_dir(Path::new("/root/a")), Some(key));

        // re-registering under the owning directory is allowed
        let again = Arc::new(MemoryArchive::generate("/root/a"));
        let again_key = again.discovery_key();
        index.insert(PathBuf::from("/root/a"), again).unwrap();
        assert!(!index.contains_key(&key));
        assert!(index.contains_key(&again_key));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_entries_sorted_by_dir() {
        let index = ArchiveIndex::new();
        for dir in ["/root/c", "/root/a", "/root/b"] {
            index
                .insert(PathBuf::from(dir), Arc::new(MemoryArchive::generate(dir)))
                .unwrap();
        }
        let dirs: Vec<_> = index.entries().into_iter().map(|(d, _)| d).collect();
        assert_eq!(
            dirs,
            vec![
                PathBuf::from("/root/a"),
                PathBuf::from("/root/b"),
                PathBuf::from("/root/c")
            ]
        );
    }
}
