//! Single-directory watcher with settle detection.
//!
//! A raw notification only says that *something* changed in a directory, and
//! it arrives on the first write of what may be a long copy. The watcher
//! therefore polls a cheap fingerprint (entry name and size) until it stops
//! changing, then diffs the directory against its last snapshot and emits
//! one delta.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ObserverConfig;
use crate::error::{Result, WatcherError};
use crate::event::DirectoryEvent;
use crate::handle::{WatchBackend, WatchHandle};
use crate::listing::DirectoryListing;

/// Lifecycle of a [`DirectoryWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Created, not yet started.
    Idle,

    /// Waiting for raw notifications.
    Watching,

    /// Polling until the directory stops changing.
    Settling,

    /// Stopped for good.
    Stopped,
}

type Fingerprint = BTreeMap<PathBuf, u64>;

enum SettleOutcome {
    Settled,
    Unreadable,
    Cancelled,
}

/// State shared between the watcher and its settle task.
struct Shared {
    path: PathBuf,
    poll_interval: Duration,
    retry_count: u32,
    skip_hidden: bool,
    listing: Arc<dyn DirectoryListing>,
    snapshot: Mutex<BTreeSet<PathBuf>>,
    /// Run one settle cycle as soon as the watch opens.
    settle_on_start: bool,
    state: Mutex<WatcherState>,
    delegate: Mutex<Option<mpsc::UnboundedSender<DirectoryEvent>>>,
}

/// Watches the immediate contents of one directory.
pub struct DirectoryWatcher {
    shared: Arc<Shared>,
    backend: Arc<WatchBackend>,
    cancel: CancellationToken,
    handle: Mutex<Option<WatchHandle>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DirectoryWatcher {
    /// Create a watcher and take the initial snapshot of `path`.
    pub fn new(
        path: impl Into<PathBuf>,
        config: &ObserverConfig,
        listing: Arc<dyn DirectoryListing>,
        backend: Arc<WatchBackend>,
    ) -> Result<Self> {
        let path = path.into();
        Self::check_directory(&path, listing.as_ref())?;

        let snapshot = listing
            .list_directory(&path, config.skip_hidden)?
            .into_iter()
            .collect();

        Ok(Self::build(path, config, listing, backend, snapshot, false))
    }

    /// Create a watcher for a directory that appeared while its parent was
    /// observed.
    ///
    /// The snapshot starts empty and the first settle runs when the watcher
    /// starts, so entries written before the watch opened are reported as
    /// added.
    pub fn discovered(
        path: impl Into<PathBuf>,
        config: &ObserverConfig,
        listing: Arc<dyn DirectoryListing>,
        backend: Arc<WatchBackend>,
    ) -> Result<Self> {
        let path = path.into();
        Self::check_directory(&path, listing.as_ref())?;

        Ok(Self::build(path, config, listing, backend, BTreeSet::new(), true))
    }

    fn check_directory(path: &Path, listing: &dyn DirectoryListing) -> Result<()> {
        if !listing.is_directory(path) {
            return Err(WatcherError::NotADirectory(path.display().to_string()));
        }
        Ok(())
    }

    fn build(
        path: PathBuf,
        config: &ObserverConfig,
        listing: Arc<dyn DirectoryListing>,
        backend: Arc<WatchBackend>,
        snapshot: BTreeSet<PathBuf>,
        settle_on_start: bool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                path,
                poll_interval: config.poll_interval(),
                retry_count: config.retry_count.max(1),
                skip_hidden: config.skip_hidden,
                listing,
                snapshot: Mutex::new(snapshot),
                settle_on_start,
                state: Mutex::new(WatcherState::Idle),
                delegate: Mutex::new(None),
            }),
            backend,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Set the channel that receives this watcher's deltas.
    pub fn set_delegate(&self, delegate: mpsc::UnboundedSender<DirectoryEvent>) {
        *self.shared.delegate.lock() = Some(delegate);
    }

    /// Open the OS watch and spawn the settle task. No-op if already watching.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        match *state {
            WatcherState::Idle => {}
            WatcherState::Watching | WatcherState::Settling => return Ok(()),
            WatcherState::Stopped => {
                return Err(WatcherError::Stopped(self.shared.path.display().to_string()));
            }
        }

        let (handle, signals) = self.backend.open(&self.shared.path)?;
        *self.handle.lock() = Some(handle);

        let task = tokio::spawn(run(
            Arc::clone(&self.shared),
            signals,
            self.cancel.clone(),
        ));
        *self.task.lock() = Some(task);
        *state = WatcherState::Watching;

        debug!("Started watching: {}", self.shared.path.display());
        Ok(())
    }

    /// Detach the delegate, cancel any settle in progress and close the OS
    /// watch. Idempotent; no delta is delivered after this returns.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if *state == WatcherState::Stopped {
                return;
            }
            *state = WatcherState::Stopped;
        }

        self.shared.delegate.lock().take();
        self.cancel.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        if let Some(mut handle) = self.handle.lock().take() {
            handle.close();
        }

        debug!("Stopped watching: {}", self.shared.path.display());
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn state(&self) -> WatcherState {
        *self.shared.state.lock()
    }

    /// Check if the watcher holds an open OS watch.
    pub fn is_watching(&self) -> bool {
        matches!(
            self.state(),
            WatcherState::Watching | WatcherState::Settling
        )
    }

    /// Last settled contents of the directory.
    pub fn snapshot(&self) -> BTreeSet<PathBuf> {
        self.shared.snapshot.lock().clone()
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("path", &self.shared.path)
            .field("state", &self.state())
            .finish()
    }
}

async fn run(
    shared: Arc<Shared>,
    mut signals: mpsc::UnboundedReceiver<()>,
    cancel: CancellationToken,
) {
    if shared.settle_on_start && !settle_cycle(&shared, &mut signals, &cancel).await {
        trace!("Settle task finished: {}", shared.path.display());
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            signal = signals.recv() => {
                if signal.is_none() || !settle_cycle(&shared, &mut signals, &cancel).await {
                    break;
                }
            }
        }
    }

    trace!("Settle task finished: {}", shared.path.display());
}

/// One Watching → Settling → Watching round. Returns false once the watcher
/// has been stopped.
async fn settle_cycle(
    shared: &Shared,
    signals: &mut mpsc::UnboundedReceiver<()>,
    cancel: &CancellationToken,
) -> bool {
    if !shared.transition(WatcherState::Watching, WatcherState::Settling) {
        return false;
    }

    match shared.settle(signals, cancel).await {
        SettleOutcome::Settled => shared.publish_changes(),
        SettleOutcome::Unreadable => {}
        SettleOutcome::Cancelled => return false,
    }

    shared.transition(WatcherState::Settling, WatcherState::Watching)
}

impl Shared {
    /// Move from `from` to `to`; fails once the watcher has been stopped.
    fn transition(&self, from: WatcherState, to: WatcherState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        *state = to;
        true
    }

    fn fingerprint(&self) -> Result<Fingerprint> {
        let entries = self.listing.list_directory(&self.path, false)?;

        Ok(entries
            .into_iter()
            .filter_map(|path| {
                let size = self.listing.file_size(&path)?;
                Some((path, size))
            })
            .collect())
    }

    async fn settle(
        &self,
        signals: &mut mpsc::UnboundedReceiver<()>,
        cancel: &CancellationToken,
    ) -> SettleOutcome {
        let mut previous = match self.fingerprint() {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                warn!("Settle aborted: {e}");
                return SettleOutcome::Unreadable;
            }
        };
        let mut retries_left = self.retry_count;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return SettleOutcome::Cancelled,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            // Notifications that arrived while polling belong to this cycle.
            let mut absorbed = 0usize;
            while signals.try_recv().is_ok() {
                absorbed += 1;
            }

            let current = match self.fingerprint() {
                Ok(fingerprint) => fingerprint,
                Err(e) => {
                    warn!("Settle aborted: {e}");
                    return SettleOutcome::Unreadable;
                }
            };

            if current != previous {
                trace!(
                    "Still changing: {} ({absorbed} notifications absorbed)",
                    self.path.display()
                );
                retries_left = self.retry_count;
            } else {
                retries_left -= 1;
                if retries_left == 0 {
                    return SettleOutcome::Settled;
                }
            }

            previous = current;
        }
    }

    fn publish_changes(&self) {
        let current: BTreeSet<PathBuf> = match self.listing.list_directory(&self.path, self.skip_hidden) {
            Ok(entries) => entries.into_iter().collect(),
            Err(e) => {
                warn!("Skipping delta: {e}");
                return;
            }
        };

        let (added, removed) = {
            let mut snapshot = self.snapshot.lock();
            let added: BTreeSet<PathBuf> = current.difference(&snapshot).cloned().collect();
            let removed: BTreeSet<PathBuf> = snapshot.difference(&current).cloned().collect();
            *snapshot = current;
            (added, removed)
        };

        if added.is_empty() && removed.is_empty() {
            trace!("Settled without entry changes: {}", self.path.display());
            return;
        }

        // Sent under the lock so a concurrent stop() cannot be overtaken.
        let delegate = self.delegate.lock();
        let Some(tx) = delegate.as_ref() else {
            return;
        };

        if !removed.is_empty() {
            debug!("{} entries removed from {}", removed.len(), self.path.display());
            let _ = tx.send(DirectoryEvent::Removed {
                files: removed,
                source: self.path.clone(),
            });
        }

        if !added.is_empty() {
            debug!("{} entries added to {}", added.len(), self.path.display());
            let _ = tx.send(DirectoryEvent::Added {
                files: added,
                source: self.path.clone(),
            });
        }
    }
}
