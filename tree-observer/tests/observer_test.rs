//! End-to-end tests for tree observation on the real file system.
//!
//! Timings are shortened (50ms polls, 400ms quiet window) so each scenario
//! settles well within a second.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use codex_tree_observer::{
    DirectoryEvent, DirectoryListing, EventBatch, LocalFileSystem, ObserverConfig, Result,
    TreeObserver, WatcherError,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::assert_ok;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config() -> ObserverConfig {
    ObserverConfig::new()
        .with_poll_interval(Duration::from_millis(50))
        .with_retry_count(3)
        .with_quiet_window(Duration::from_millis(400))
}

async fn next_batch(rx: &mut mpsc::UnboundedReceiver<EventBatch>) -> EventBatch {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for a batch")
        .expect("batch channel closed")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<EventBatch>, window: Duration) {
    if let Ok(batch) = timeout(window, rx.recv()).await {
        panic!("unexpected batch: {batch:?}");
    }
}

/// Gather events across batches until `expected` have all been seen.
async fn collect_events(
    rx: &mut mpsc::UnboundedReceiver<EventBatch>,
    expected: &EventBatch,
) -> EventBatch {
    let mut seen = EventBatch::new();
    while !expected.is_subset(&seen) {
        seen.extend(next_batch(rx).await);
    }
    seen
}

fn touch(path: &Path) {
    let mut file = File::create(path).unwrap();
    writeln!(file, "contents").unwrap();
}

async fn observe(root: &Path) -> (TreeObserver, mpsc::UnboundedReceiver<EventBatch>) {
    init_logging();
    let (observer, rx) = TreeObserver::with_channel(root, fast_config()).unwrap();
    assert_ok!(observer.start().await);
    (observer, rx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_quick_creations_arrive_as_one_batch_then_removal() {
    let temp_dir = TempDir::new().unwrap();
    let (observer, mut rx) = observe(temp_dir.path()).await;
    let root = observer.root().to_path_buf();

    touch(&root.join("a.txt"));
    touch(&root.join("b.txt"));

    let batch = next_batch(&mut rx).await;
    assert_eq!(
        batch,
        EventBatch::from([DirectoryEvent::added(
            [root.join("a.txt"), root.join("b.txt")],
            &root
        )])
    );

    fs::remove_file(root.join("a.txt")).unwrap();

    let batch = next_batch(&mut rx).await;
    assert_eq!(
        batch,
        EventBatch::from([DirectoryEvent::removed([root.join("a.txt")], &root)])
    );

    assert_quiet(&mut rx, Duration::from_secs(1)).await;
    observer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_subdirectory_becomes_observed() {
    let temp_dir = TempDir::new().unwrap();
    let (observer, mut rx) = observe(temp_dir.path()).await;
    let root = observer.root().to_path_buf();
    let sub = root.join("sub");

    fs::create_dir(&sub).unwrap();

    let batch = next_batch(&mut rx).await;
    assert_eq!(
        batch,
        EventBatch::from([DirectoryEvent::added([sub.clone()], &root)])
    );
    assert!(observer.observed_directories().await.contains(&sub));

    touch(&sub.join("c.txt"));

    let batch = next_batch(&mut rx).await;
    assert_eq!(
        batch,
        EventBatch::from([DirectoryEvent::added([sub.join("c.txt")], &sub)])
    );

    observer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_written_right_after_mkdir_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    let (observer, mut rx) = observe(temp_dir.path()).await;
    let root = observer.root().to_path_buf();
    let sub = root.join("sub");

    fs::create_dir(&sub).unwrap();
    touch(&sub.join("c.txt"));

    let expected = EventBatch::from([
        DirectoryEvent::added([sub.clone()], &root),
        DirectoryEvent::added([sub.join("c.txt")], &sub),
    ]);
    let seen = collect_events(&mut rx, &expected).await;
    assert_eq!(seen, expected);
    assert!(observer.observed_directories().await.contains(&sub));

    assert_quiet(&mut rx, Duration::from_secs(1)).await;
    observer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deleted_subdirectory_is_no_longer_observed() {
    let temp_dir = TempDir::new().unwrap();
    fs::create_dir_all(temp_dir.path().join("sub/deeper")).unwrap();

    let (observer, mut rx) = observe(temp_dir.path()).await;
    let root = observer.root().to_path_buf();
    let sub = root.join("sub");
    assert_eq!(
        observer.observed_directories().await,
        BTreeSet::from([root.clone(), sub.clone(), sub.join("deeper")])
    );

    fs::remove_dir_all(&sub).unwrap();

    let batch = next_batch(&mut rx).await;
    assert_eq!(
        batch,
        EventBatch::from([DirectoryEvent::removed([sub.clone()], &root)])
    );
    assert_eq!(
        observer.observed_directories().await,
        BTreeSet::from([root.clone()])
    );

    assert_quiet(&mut rx, Duration::from_secs(1)).await;
    observer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_changes_further_apart_than_window_are_separate_batches() {
    let temp_dir = TempDir::new().unwrap();
    let (observer, mut rx) = observe(temp_dir.path()).await;
    let root = observer.root().to_path_buf();

    touch(&root.join("first.txt"));
    let first = next_batch(&mut rx).await;

    tokio::time::sleep(Duration::from_millis(600)).await;
    touch(&root.join("second.txt"));
    let second = next_batch(&mut rx).await;

    assert_eq!(
        first,
        EventBatch::from([DirectoryEvent::added([root.join("first.txt")], &root)])
    );
    assert_eq!(
        second,
        EventBatch::from([DirectoryEvent::added([root.join("second.txt")], &root)])
    );

    observer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_changes_across_directories_share_a_batch() {
    let temp_dir = TempDir::new().unwrap();
    fs::create_dir_all(temp_dir.path().join("left")).unwrap();
    fs::create_dir_all(temp_dir.path().join("right")).unwrap();

    let (observer, mut rx) = observe(temp_dir.path()).await;
    let root = observer.root().to_path_buf();

    touch(&root.join("left/l.txt"));
    touch(&root.join("right/r.txt"));

    let batch = next_batch(&mut rx).await;
    assert_eq!(
        batch,
        EventBatch::from([
            DirectoryEvent::added([root.join("left/l.txt")], root.join("left")),
            DirectoryEvent::added([root.join("right/r.txt")], root.join("right")),
        ])
    );

    observer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_moved_in_subtree_is_fully_observed() {
    let temp_dir = TempDir::new().unwrap();
    let staging = temp_dir.path().join("staging");
    let watched = temp_dir.path().join("watched");
    fs::create_dir_all(staging.join("album/disc1")).unwrap();
    touch(&staging.join("album/disc1/intro.wav"));
    fs::create_dir_all(&watched).unwrap();

    let (observer, mut rx) = observe(&watched).await;
    let root = observer.root().to_path_buf();
    let album = root.join("album");

    fs::rename(staging.join("album"), &album).unwrap();

    // Contents of the moved-in tree are reported by its new watchers.
    let expected = EventBatch::from([
        DirectoryEvent::added([album.clone()], &root),
        DirectoryEvent::added([album.join("disc1")], &album),
        DirectoryEvent::added([album.join("disc1/intro.wav")], album.join("disc1")),
    ]);
    let seen = collect_events(&mut rx, &expected).await;
    assert_eq!(seen, expected);
    assert_eq!(
        observer.observed_directories().await,
        BTreeSet::from([root.clone(), album.clone(), album.join("disc1")])
    );

    touch(&album.join("disc1/track.wav"));
    let batch = next_batch(&mut rx).await;
    assert_eq!(
        batch,
        EventBatch::from([DirectoryEvent::added(
            [album.join("disc1/track.wav")],
            album.join("disc1")
        )])
    );

    observer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_drops_pending_events() {
    let temp_dir = TempDir::new().unwrap();
    let (observer, mut rx) = observe(temp_dir.path()).await;
    let root = observer.root().to_path_buf();

    touch(&root.join("never-reported.txt"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    observer.stop().await;
    observer.stop().await;
    assert!(!observer.is_observing().await);

    touch(&root.join("after-stop.txt"));
    assert_quiet(&mut rx, Duration::from_millis(1500)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropping_observer_closes_the_stream() {
    let temp_dir = TempDir::new().unwrap();
    let (observer, mut rx) = observe(temp_dir.path()).await;
    let root = observer.root().to_path_buf();

    drop(observer);
    touch(&root.join("after-drop.txt"));

    let next = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(next, None);
}

/// Refuses to list any directory named `locked`, like a permission error.
struct LockedListing {
    inner: LocalFileSystem,
}

impl LockedListing {
    fn check(path: &Path) -> Result<()> {
        if path.file_name().is_some_and(|n| n == "locked") {
            return Err(WatcherError::EnumerationFailed {
                path: path.display().to_string(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }
        Ok(())
    }
}

impl DirectoryListing for LockedListing {
    fn list_directory(&self, dir: &Path, skip_hidden: bool) -> Result<Vec<PathBuf>> {
        Self::check(dir)?;
        self.inner.list_directory(dir, skip_hidden)
    }

    fn list_directories(&self, dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
        self.inner.list_directories(dir, recursive)
    }

    fn file_size(&self, path: &Path) -> Option<u64> {
        self.inner.file_size(path)
    }

    fn should_descend(&self, path: &Path) -> bool {
        self.inner.should_descend(path)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreadable_subdirectory_is_skipped() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    fs::create_dir_all(temp_dir.path().join("locked")).unwrap();
    fs::create_dir_all(temp_dir.path().join("open")).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let observer = TreeObserver::with_listing(
        temp_dir.path(),
        Arc::new(tx),
        fast_config(),
        Arc::new(LockedListing {
            inner: LocalFileSystem::new(fast_config()),
        }),
    )
    .unwrap();
    assert_ok!(observer.start().await);

    let root = observer.root().to_path_buf();
    assert_eq!(
        observer.observed_directories().await,
        BTreeSet::from([root.clone(), root.join("open")])
    );

    touch(&root.join("locked/hidden-from-us.txt"));
    touch(&root.join("open/visible.txt"));

    let batch = next_batch(&mut rx).await;
    assert_eq!(
        batch,
        EventBatch::from([DirectoryEvent::added(
            [root.join("open/visible.txt")],
            root.join("open")
        )])
    );

    observer.stop().await;
}
