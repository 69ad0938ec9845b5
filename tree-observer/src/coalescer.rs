//! Trailing-window debounce of directory events.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, trace, warn};

use crate::error::{Result, WatcherError};
use crate::event::DirectoryEvent;
use crate::subscriber::{DirectorySubscriber, EventBatch};

#[derive(Default)]
struct CoalescerState {
    pending: EventBatch,
    timer: Option<JoinHandle<Result<()>>>,
    /// Delivery that has left the quiet window but not yet returned, tagged
    /// with its generation.
    in_flight: Option<(u64, AbortHandle)>,
    /// Bumped whenever the outstanding timer is superseded or disposed.
    generation: u64,
    closed: bool,
}

/// Accumulates events and hands them to the subscriber once no new event
/// has arrived for a full quiet window.
pub struct EventCoalescer {
    quiet_window: Duration,
    subscriber: Arc<dyn DirectorySubscriber>,
    state: Arc<Mutex<CoalescerState>>,
}

impl EventCoalescer {
    pub fn new(quiet_window: Duration, subscriber: Arc<dyn DirectorySubscriber>) -> Self {
        Self {
            quiet_window,
            subscriber,
            state: Arc::new(Mutex::new(CoalescerState::default())),
        }
    }

    /// Add `event` to the pending batch and restart the quiet window.
    ///
    /// Ignored after [`dispose`](Self::dispose) until [`open`](Self::open).
    /// Must be called from within a tokio runtime.
    pub fn record(&self, event: DirectoryEvent) {
        let mut state = self.state.lock();
        if state.closed {
            trace!("Dropping event recorded after dispose");
            return;
        }

        state.pending.insert(event);

        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation += 1;

        state.timer = Some(tokio::spawn(flush_after(
            self.quiet_window,
            state.generation,
            Arc::clone(&self.state),
            Arc::clone(&self.subscriber),
        )));
    }

    /// Cancel the outstanding timer and drop pending events undelivered.
    ///
    /// A delivery still waiting on the subscriber is aborted too. A batch the
    /// subscriber has already accepted cannot be recalled.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.generation += 1;
        state.pending.clear();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if let Some((_, delivery)) = state.in_flight.take() {
            delivery.abort();
        }
    }

    /// Accept events again after [`dispose`](Self::dispose).
    pub fn open(&self) {
        self.state.lock().closed = false;
    }

    /// Snapshot of the pending events.
    pub fn pending(&self) -> EventBatch {
        self.state.lock().pending.clone()
    }

    pub fn is_flush_scheduled(&self) -> bool {
        self.state.lock().timer.is_some()
    }
}

impl Drop for EventCoalescer {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn flush_after(
    quiet_window: Duration,
    generation: u64,
    state: Arc<Mutex<CoalescerState>>,
    subscriber: Arc<dyn DirectorySubscriber>,
) -> Result<()> {
    tokio::time::sleep(quiet_window).await;

    let batch = {
        let mut state = state.lock();
        // A newer record or a dispose won the race against this wake-up.
        if state.generation != generation || state.closed {
            return Ok(());
        }
        // Later records must not abort this task, but dispose still can.
        state.in_flight = state
            .timer
            .take()
            .map(|timer| (generation, timer.abort_handle()));
        std::mem::take(&mut state.pending)
    };

    if batch.is_empty() {
        return Ok(());
    }

    debug!("Delivering {} directory events", batch.len());
    let result = subscriber.directory_updated(batch).await;

    {
        let mut state = state.lock();
        if state.in_flight.as_ref().is_some_and(|(g, _)| *g == generation) {
            state.in_flight = None;
        }
    }

    result.map_err(|e| {
        let err = WatcherError::DeliveryFailed(format!("{e:#}"));
        warn!("{err}");
        err
    })
}
