//! # Tree Observer
//!
//! This crate watches a directory and all of its current and future
//! subdirectories, and reports which entries were added or removed anywhere
//! in the tree once changes have settled.
//!
//! ## Features
//!
//! - **Per-directory Watching**: One non-recursive OS watch per directory
//! - **Settle Detection**: Multi-file copies collapse into a single delta
//! - **Dynamic Coverage**: New subdirectories are picked up, removed ones dropped
//! - **Event Coalescing**: Bursts across the tree arrive as one batch
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Tree Observer                           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  notify ──► DirectoryWatcher ──► TreeObserver ──► EventCoalescer │
//! │              (settle/poll)           │                  │        │
//! │                                      ▼                  ▼        │
//! │                               WatcherRegistry       Subscriber   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod coalescer;
pub mod config;
pub mod error;
pub mod event;
pub mod handle;
pub mod listing;
pub mod observer;
pub mod registry;
pub mod subscriber;
pub mod watcher;

pub use coalescer::EventCoalescer;
pub use config::ObserverConfig;
pub use error::{Result, WatcherError};
pub use event::DirectoryEvent;
pub use handle::{WatchBackend, WatchHandle};
pub use listing::{DirectoryListing, LocalFileSystem};
pub use observer::TreeObserver;
pub use registry::WatcherRegistry;
pub use subscriber::{DirectorySubscriber, EventBatch};
pub use watcher::{DirectoryWatcher, WatcherState};
