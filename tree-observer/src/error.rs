//! Error types for tree observation.

use thiserror::Error;

/// Result type alias for observer operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors that can occur while observing a directory tree.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Path does not resolve to a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// The OS refused a watch on the directory.
    #[error("failed to open {path} for watching: {source}")]
    OpenFailed {
        path: String,
        #[source]
        source: notify::Error,
    },

    /// Listing a directory failed.
    #[error("failed to enumerate {path}: {source}")]
    EnumerationFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The subscriber rejected a batch.
    #[error("event delivery failed: {0}")]
    DeliveryFailed(String),

    /// A watch is already registered for the path.
    #[error("already watching: {0}")]
    AlreadyWatching(String),

    /// The watcher was stopped and cannot be restarted.
    #[error("watcher stopped: {0}")]
    Stopped(String),

    /// Notify error.
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl WatcherError {
    pub(crate) fn enumeration(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::EnumerationFailed {
            path: path.display().to_string(),
            source,
        }
    }
}
