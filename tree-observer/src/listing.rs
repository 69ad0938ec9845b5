//! Directory listing used for discovery, snapshots and settle fingerprints.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::ObserverConfig;
use crate::error::{Result, WatcherError};

/// File system primitives the observer depends on.
///
/// [`LocalFileSystem`] is the implementation used in practice; the trait
/// exists so discovery and snapshotting can be swapped out in tests.
pub trait DirectoryListing: Send + Sync {
    /// Immediate children of `dir`, optionally without hidden entries.
    fn list_directory(&self, dir: &Path, skip_hidden: bool) -> Result<Vec<PathBuf>>;

    /// Subdirectories of `dir` worth observing, excluding `dir` itself.
    fn list_directories(&self, dir: &Path, recursive: bool) -> Result<Vec<PathBuf>>;

    /// Size of a regular file, `None` for anything else.
    fn file_size(&self, path: &Path) -> Option<u64>;

    fn is_directory(&self, path: &Path) -> bool {
        path.is_dir()
    }

    /// Whether `path` is a directory the observer should cover.
    fn should_descend(&self, path: &Path) -> bool {
        self.is_directory(path)
    }
}

/// [`DirectoryListing`] backed by the local file system.
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem {
    config: ObserverConfig,
}

impl LocalFileSystem {
    pub fn new(config: ObserverConfig) -> Self {
        Self { config }
    }

    fn is_hidden(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'))
    }

    fn is_filtered(&self, path: &Path) -> bool {
        (self.config.skip_hidden && Self::is_hidden(path))
            || self.config.is_package(path)
            || self.config.should_exclude(path)
    }
}

impl DirectoryListing for LocalFileSystem {
    fn list_directory(&self, dir: &Path, skip_hidden: bool) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(dir).map_err(|e| WatcherError::enumeration(dir, e))?;

        let mut paths = Vec::new();
        for entry in entries {
            match entry {
                Ok(entry) => {
                    let path = entry.path();
                    if skip_hidden && Self::is_hidden(&path) {
                        continue;
                    }
                    paths.push(path);
                }
                // Entries can vanish between readdir and stat.
                Err(e) => debug!("Skipping unreadable entry in {}: {e}", dir.display()),
            }
        }

        paths.sort();
        Ok(paths)
    }

    fn list_directories(&self, dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
        let walker = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(if recursive { usize::MAX } else { 1 })
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0 || (e.file_type().is_dir() && !self.is_filtered(e.path()))
            });

        let mut directories = Vec::new();
        for entry in walker {
            match entry {
                Ok(entry) => directories.push(entry.into_path()),
                Err(e) if e.depth() == 0 => {
                    return Err(WatcherError::enumeration(dir, e.into()));
                }
                Err(e) => warn!("Skipping unreadable directory under {}: {e}", dir.display()),
            }
        }

        Ok(directories)
    }

    fn file_size(&self, path: &Path) -> Option<u64> {
        fs::metadata(path)
            .ok()
            .filter(fs::Metadata::is_file)
            .map(|m| m.len())
    }

    /// Symlinked directories are not followed, matching discovery.
    fn should_descend(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok_and(|m| m.is_dir()) && !self.is_filtered(path)
    }
}
