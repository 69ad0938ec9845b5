//! Ownership of the watchers covering one tree.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::debug;

use crate::watcher::DirectoryWatcher;

/// The set of active [`DirectoryWatcher`]s, at most one per path.
///
/// Every mutation and iteration takes the write lock, so concurrent callers
/// never interleave inside the map.
#[derive(Debug, Default)]
pub struct WatcherRegistry {
    watchers: RwLock<HashMap<PathBuf, DirectoryWatcher>>,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `watcher` unless its path is already covered.
    ///
    /// A rejected watcher is stopped and dropped. Returns whether it was
    /// inserted.
    pub async fn insert(&self, watcher: DirectoryWatcher) -> bool {
        let mut watchers = self.watchers.write().await;

        if watchers.contains_key(watcher.path()) {
            debug!("Already covered: {}", watcher.path().display());
            watcher.stop();
            return false;
        }

        watchers.insert(watcher.path().to_path_buf(), watcher);
        true
    }

    /// Stop and drop every watcher whose path is in `paths`.
    pub async fn remove<'a>(&self, paths: impl IntoIterator<Item = &'a PathBuf>) -> usize {
        let mut watchers = self.watchers.write().await;

        let mut removed = 0;
        for path in paths {
            if let Some(watcher) = watchers.remove(path) {
                watcher.stop();
                removed += 1;
            }
        }

        if removed > 0 {
            debug!("Removed {removed} watchers ({} remain)", watchers.len());
        }
        removed
    }

    /// Stop and drop every watcher.
    pub async fn remove_all(&self) {
        let mut watchers = self.watchers.write().await;

        for watcher in watchers.values() {
            watcher.stop();
        }
        let count = watchers.len();
        watchers.clear();

        debug!("Removed all {count} watchers");
    }

    pub async fn contains(&self, path: &Path) -> bool {
        self.watchers.read().await.contains_key(path)
    }

    /// Watched paths equal to or beneath any of `roots`.
    pub async fn paths_within(&self, roots: &BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
        self.watchers
            .read()
            .await
            .keys()
            .filter(|path| roots.iter().any(|root| path.starts_with(root)))
            .cloned()
            .collect()
    }

    /// Snapshot of the watched paths.
    pub async fn paths(&self) -> BTreeSet<PathBuf> {
        self.watchers.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.watchers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.watchers.read().await.is_empty()
    }
}
