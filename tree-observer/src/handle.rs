//! OS watch registrations.
//!
//! A [`WatchBackend`] wraps one `notify` watcher and routes its raw events to
//! per-directory wake-up channels. Each watched directory holds a
//! [`WatchHandle`], a non-recursive registration that is released when the
//! handle is closed or dropped.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::{Result, WatcherError};

type Routes = Arc<RwLock<HashMap<PathBuf, mpsc::UnboundedSender<()>>>>;

/// Shared `notify` watcher for every directory of one tree.
pub struct WatchBackend {
    watcher: Mutex<RecommendedWatcher>,
    routes: Routes,
}

impl WatchBackend {
    /// Create a backend with the platform's recommended watcher.
    pub fn new() -> Result<Arc<Self>> {
        let routes: Routes = Arc::new(RwLock::new(HashMap::new()));
        let callback_routes = routes.clone();

        let watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => dispatch(&callback_routes, &event),
                Err(e) => error!("Watch error: {e}"),
            },
        )?;

        Ok(Arc::new(Self {
            watcher: Mutex::new(watcher),
            routes,
        }))
    }

    /// Register a non-recursive watch on `dir`.
    ///
    /// The receiver gets one unit message per raw notification touching an
    /// immediate child of `dir` (or `dir` itself).
    pub fn open(
        self: &Arc<Self>,
        dir: &Path,
    ) -> Result<(WatchHandle, mpsc::UnboundedReceiver<()>)> {
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut routes = self.routes.write();
            if routes.contains_key(dir) {
                return Err(WatcherError::AlreadyWatching(dir.display().to_string()));
            }
            routes.insert(dir.to_path_buf(), tx);
        }

        if let Err(source) = self.watcher.lock().watch(dir, RecursiveMode::NonRecursive) {
            self.routes.write().remove(dir);
            return Err(WatcherError::OpenFailed {
                path: dir.display().to_string(),
                source,
            });
        }

        debug!("Opened watch: {}", dir.display());
        Ok((
            WatchHandle {
                path: dir.to_path_buf(),
                backend: Arc::clone(self),
                open: true,
            },
            rx,
        ))
    }

    /// Directories with an open registration.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.routes.read().keys().cloned().collect()
    }

    fn close(&self, dir: &Path) {
        self.routes.write().remove(dir);

        // The OS drops the watch on its own when the directory is deleted.
        if let Err(e) = self.watcher.lock().unwatch(dir) {
            debug!("Unwatch {} failed: {e}", dir.display());
        }
    }
}

impl fmt::Debug for WatchBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchBackend")
            .field("routes", &self.routes.read().len())
            .finish()
    }
}

fn dispatch(routes: &Routes, event: &notify::Event) {
    // Our own listings open the directory; those reads must not re-trigger a settle.
    if matches!(event.kind, EventKind::Access(_)) {
        return;
    }

    let routes = routes.read();
    for path in &event.paths {
        let targets = std::iter::once(path.as_path()).chain(path.parent());
        for target in targets {
            if let Some(tx) = routes.get(target) {
                let _ = tx.send(());
            }
        }
    }
}

/// One directory's registration with a [`WatchBackend`].
pub struct WatchHandle {
    path: PathBuf,
    backend: Arc<WatchBackend>,
    open: bool,
}

impl WatchHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Release the OS registration. Idempotent.
    pub fn close(&mut self) {
        if std::mem::take(&mut self.open) {
            self.backend.close(&self.path);
            debug!("Closed watch: {}", self.path.display());
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("path", &self.path)
            .field("open", &self.open)
            .finish()
    }
}
