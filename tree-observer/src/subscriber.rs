//! Receivers of coalesced event batches.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::event::DirectoryEvent;

/// A batch delivered after one quiet window.
pub type EventBatch = HashSet<DirectoryEvent>;

/// Consumer of coalesced directory events.
///
/// Called at most once per quiet window with every distinct event recorded
/// since the previous delivery. A returned error is logged and the batch is
/// not redelivered.
#[async_trait]
pub trait DirectorySubscriber: Send + Sync {
    async fn directory_updated(&self, events: EventBatch) -> anyhow::Result<()>;
}

#[async_trait]
impl DirectorySubscriber for mpsc::UnboundedSender<EventBatch> {
    async fn directory_updated(&self, events: EventBatch) -> anyhow::Result<()> {
        self.send(events)
            .map_err(|_| anyhow::anyhow!("event receiver dropped"))
    }
}

#[async_trait]
impl DirectorySubscriber for mpsc::Sender<EventBatch> {
    async fn directory_updated(&self, events: EventBatch) -> anyhow::Result<()> {
        self.send(events)
            .await
            .map_err(|_| anyhow::anyhow!("event receiver dropped"))
    }
}
