//! Observation of a whole directory tree.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coalescer::EventCoalescer;
use crate::config::ObserverConfig;
use crate::error::{Result, WatcherError};
use crate::event::DirectoryEvent;
use crate::handle::WatchBackend;
use crate::listing::{DirectoryListing, LocalFileSystem};
use crate::registry::WatcherRegistry;
use crate::subscriber::{DirectorySubscriber, EventBatch};
use crate::watcher::DirectoryWatcher;

/// Watches a root directory and every current and future subdirectory,
/// delivering coalesced add/remove batches to a subscriber.
///
/// ```no_run
/// # async fn demo() -> codex_tree_observer::Result<()> {
/// use codex_tree_observer::{ObserverConfig, TreeObserver};
///
/// let (observer, mut batches) = TreeObserver::with_channel("/music", ObserverConfig::default())?;
/// observer.start().await?;
///
/// while let Some(batch) = batches.recv().await {
///     for event in batch {
///         println!("{:?} in {}", event.files(), event.source().display());
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct TreeObserver {
    core: Arc<ObserverCore>,
    session: Mutex<Option<Session>>,
}

/// State shared with the event-loop task.
struct ObserverCore {
    root: PathBuf,
    config: ObserverConfig,
    listing: Arc<dyn DirectoryListing>,
    backend: Arc<WatchBackend>,
    registry: WatcherRegistry,
    coalescer: EventCoalescer,
}

/// One start/stop cycle.
struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TreeObserver {
    /// Create an observer for `root`, delivering batches to `subscriber`.
    ///
    /// Fails with [`WatcherError::NotADirectory`] unless `root` is an existing
    /// directory.
    pub fn new(
        root: impl AsRef<Path>,
        subscriber: Arc<dyn DirectorySubscriber>,
        config: ObserverConfig,
    ) -> Result<Self> {
        let listing = Arc::new(LocalFileSystem::new(config.clone()));
        Self::with_listing(root, subscriber, config, listing)
    }

    /// Create an observer and a receiver for its batches.
    pub fn with_channel(
        root: impl AsRef<Path>,
        config: ObserverConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<EventBatch>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = Self::new(root, Arc::new(tx), config)?;
        Ok((observer, rx))
    }

    /// Create an observer with a custom [`DirectoryListing`].
    pub fn with_listing(
        root: impl AsRef<Path>,
        subscriber: Arc<dyn DirectorySubscriber>,
        config: ObserverConfig,
        listing: Arc<dyn DirectoryListing>,
    ) -> Result<Self> {
        let root = root.as_ref();
        config.validate()?;

        if !listing.is_directory(root) {
            return Err(WatcherError::NotADirectory(root.display().to_string()));
        }
        // Notify reports canonical paths on some platforms; match them.
        let root = dunce::canonicalize(root)?;

        let coalescer = EventCoalescer::new(config.quiet_window(), subscriber);

        Ok(Self {
            core: Arc::new(ObserverCore {
                root,
                config,
                listing,
                backend: WatchBackend::new()?,
                registry: WatcherRegistry::new(),
                coalescer,
            }),
            session: Mutex::new(None),
        })
    }

    /// Install a watcher on the root and every subdirectory. No-op if
    /// already observing.
    ///
    /// Directories that cannot be watched are logged and skipped.
    pub async fn start(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }

        let core = &self.core;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        core.coalescer.open();

        let mut installed = 0usize;
        for dir in core.discover(&core.root) {
            if core.install(dir, false, &events_tx).await {
                installed += 1;
            }
        }

        if installed == 0 {
            warn!("No directories could be watched under {}", core.root.display());
        }
        info!(
            "Observing {installed} directories under {}",
            core.root.display()
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_event_loop(
            Arc::clone(core),
            events_rx,
            events_tx,
            cancel.clone(),
        ));
        *session = Some(Session { cancel, task });

        Ok(())
    }

    /// Stop every watcher and drop pending events without delivering them.
    /// Idempotent.
    pub async fn stop(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };

        self.core.coalescer.dispose();
        session.cancel.cancel();
        if let Err(e) = session.task.await {
            if !e.is_cancelled() {
                warn!("Event loop ended abnormally: {e}");
            }
        }
        self.core.registry.remove_all().await;

        info!("Stopped observing {}", self.core.root.display());
    }

    /// Check if the observer has been started and not stopped.
    pub async fn is_observing(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Directories currently covered by a watcher.
    pub async fn observed_directories(&self) -> BTreeSet<PathBuf> {
        self.core.registry.paths().await
    }

    /// The canonical root path.
    pub fn root(&self) -> &Path {
        &self.core.root
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.core.config
    }
}

impl Drop for TreeObserver {
    fn drop(&mut self) {
        self.core.coalescer.dispose();
        if let Some(session) = self.session.get_mut().take() {
            session.cancel.cancel();
            session.task.abort();
        }
        // Watchers stop themselves when the last reference to the core goes.
    }
}

impl std::fmt::Debug for TreeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeObserver")
            .field("root", &self.core.root)
            .finish()
    }
}

async fn run_event_loop(
    core: Arc<ObserverCore>,
    mut events_rx: mpsc::UnboundedReceiver<DirectoryEvent>,
    events_tx: mpsc::UnboundedSender<DirectoryEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events_rx.recv() => match event {
                Some(event) => core.handle_observation(event, &events_tx).await,
                None => break,
            },
        }
    }
}

impl ObserverCore {
    /// `dir` plus every subdirectory below it that should be covered.
    fn discover(&self, dir: &Path) -> Vec<PathBuf> {
        let mut directories = vec![dir.to_path_buf()];

        match self.listing.list_directories(dir, true) {
            Ok(subdirectories) => directories.extend(subdirectories),
            Err(e) => warn!("Observing {} without its subdirectories: {e}", dir.display()),
        }

        directories
    }

    /// Create, start and register a watcher for `dir`. Returns false if the
    /// directory was already covered or could not be watched.
    ///
    /// A `discovered` directory appeared during observation; whatever it
    /// already holds is reported once its watcher settles.
    async fn install(
        &self,
        dir: PathBuf,
        discovered: bool,
        events_tx: &mpsc::UnboundedSender<DirectoryEvent>,
    ) -> bool {
        if self.registry.contains(&dir).await {
            return false;
        }

        let listing = Arc::clone(&self.listing);
        let backend = Arc::clone(&self.backend);
        let created = if discovered {
            DirectoryWatcher::discovered(&dir, &self.config, listing, backend)
        } else {
            DirectoryWatcher::new(&dir, &self.config, listing, backend)
        };
        let watcher = match created {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!("Skipping {}: {e}", dir.display());
                return false;
            }
        };

        watcher.set_delegate(events_tx.clone());
        if let Err(e) = watcher.start() {
            warn!("Skipping {}: {e}", dir.display());
            return false;
        }

        self.registry.insert(watcher).await
    }

    async fn handle_observation(
        &self,
        event: DirectoryEvent,
        events_tx: &mpsc::UnboundedSender<DirectoryEvent>,
    ) {
        if !self.registry.contains(event.source()).await {
            debug!(
                "Not adjusting coverage for unwatched source {}",
                event.source().display()
            );
        } else {
            match &event {
                DirectoryEvent::Added { files, source } => {
                    debug!("{} added under {}", files.len(), source.display());

                    for path in files {
                        if !self.listing.should_descend(path) {
                            continue;
                        }
                        for dir in self.discover(path) {
                            self.install(dir, true, events_tx).await;
                        }
                    }
                }
                DirectoryEvent::Removed { files, source } => {
                    debug!("{} removed under {}", files.len(), source.display());

                    let stale = self.registry.paths_within(files).await;
                    if !stale.is_empty() {
                        self.registry.remove(&stale).await;
                    }
                }
            }
        }

        self.coalescer.record(event);
    }
}
