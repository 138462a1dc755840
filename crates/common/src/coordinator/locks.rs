use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-directory async locks.
///
/// Operations on the same resolved path run one at a time, operations on
/// different paths never wait on each other.
#[derive(Debug, Default)]
pub struct DirLocks {
    locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

/// Held for the duration of a directory operation.
#[derive(Debug)]
pub struct DirGuard<'a> {
    locks: &'a DirLocks,
    path: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
}

impl DirLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, path: &Path) -> DirGuard<'_> {
        let mutex = self
            .locks
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone();
        let guard = mutex.lock_owned().await;
        DirGuard {
            locks: self,
            path: path.to_path_buf(),
            guard: Some(guard),
        }
    }

    /// Number of paths with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for DirGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.locks.lock();
        // only the map holds the mutex once nobody is waiting on it
        if let Some(mutex) = locks.get(&self.path) {
            if Arc::strong_count(mutex) == 1 {
                locks.remove(&self.path);
            }
        }
    }
}
