//! Directory events produced by observation.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Entries that appeared in or vanished from one watched directory.
///
/// Two events are equal when kind, files and source all match, which is what
/// the coalescer relies on to drop duplicates within a quiet window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DirectoryEvent {
    /// Entries newly present in `source`.
    Added {
        files: BTreeSet<PathBuf>,
        source: PathBuf,
    },

    /// Entries no longer present in `source`.
    Removed {
        files: BTreeSet<PathBuf>,
        source: PathBuf,
    },
}

impl DirectoryEvent {
    pub fn added(files: impl IntoIterator<Item = PathBuf>, source: impl Into<PathBuf>) -> Self {
        Self::Added {
            files: files.into_iter().collect(),
            source: source.into(),
        }
    }

    pub fn removed(files: impl IntoIterator<Item = PathBuf>, source: impl Into<PathBuf>) -> Self {
        Self::Removed {
            files: files.into_iter().collect(),
            source: source.into(),
        }
    }

    /// Check if this event reports new entries.
    pub fn is_added(&self) -> bool {
        matches!(self, Self::Added { .. })
    }

    /// The watched directory the event originated from.
    pub fn source(&self) -> &Path {
        match self {
            Self::Added { source, .. } | Self::Removed { source, .. } => source,
        }
    }

    /// The affected entries.
    pub fn files(&self) -> &BTreeSet<PathBuf> {
        match self {
            Self::Added { files, .. } | Self::Removed { files, .. } => files,
        }
    }
}
