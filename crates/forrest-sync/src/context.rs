//! # Sync Context
//!
//! Process-wide state shared by the gateway and every collection engine.
//!
//! ```text
//! ┌──────────┐  ingest()   ┌──────────────────────────────────┐  changes   ┌────────────┐
//! │ Gateway  │ ──────────► │ SyncContext                      │ ─────────► │ SyncEngine │
//! └──────────┘             │  watermark  forrestLastUpdate    │ broadcast  │ (per coll) │
//!                          │  queue      forrestUpdateQuery   │            └─────┬──────┘
//!                          │  changes    broadcast<Watermark> │ ◄────────────────┘
//!                          └──────────────────────────────────┘  remove_handled()
//! ```
//!
//! Only the gateway appends to the queue, only the owning engine removes
//! from its own slice. Both go through the cell's update closure so an
//! append and a removal never interleave.

use forrest_core::{ChangeEvent, PendingQueue, Timestamp, Watermark, PENDING_QUEUE_KEY, WATERMARK_KEY};
use forrest_db::{Database, DbResult, PersistMode, PersistentCell};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Buffered watermark notifications per subscriber before it lags.
const CHANGE_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct SyncContext {
    watermark: PersistentCell<Watermark>,
    queue: PersistentCell<PendingQueue>,
    changes: broadcast::Sender<Watermark>,
}

impl SyncContext {
    /// Loads the persisted watermark and pending queue.
    ///
    /// The watermark is written after `watermark_debounce` of quiet; the
    /// queue is written on every change.
    pub async fn open(db: &Database, watermark_debounce: Duration) -> DbResult<Arc<Self>> {
        let mode = if watermark_debounce.is_zero() {
            PersistMode::Immediate
        } else {
            PersistMode::Debounced(watermark_debounce)
        };

        let watermark =
            PersistentCell::load(db.state(), WATERMARK_KEY, Watermark::default(), mode).await?;
        let queue = PersistentCell::load(
            db.state(),
            PENDING_QUEUE_KEY,
            PendingQueue::default(),
            PersistMode::Immediate,
        )
        .await?;
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);

        debug!(
            watermark = ?watermark.get().get(),
            pending = queue.borrow().len(),
            "Sync context opened"
        );

        Ok(Arc::new(SyncContext {
            watermark,
            queue,
            changes,
        }))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn watermark(&self) -> Watermark {
        self.watermark.get()
    }

    /// Snapshot of one collection's pending events, in arrival order.
    pub fn pending(&self, branch: &str) -> Vec<ChangeEvent> {
        self.queue.borrow().slice(branch).to_vec()
    }

    /// Snapshot of the whole queue.
    pub fn queue(&self) -> PendingQueue {
        self.queue.get()
    }

    /// Notified after every ingest with the watermark at that moment.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<Watermark> {
        self.changes.subscribe()
    }

    pub fn subscribe_watermark(&self) -> watch::Receiver<Watermark> {
        self.watermark.subscribe()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Queues one streamed event and advances the watermark to the stream's
    /// event id, or to the event time when the stream sent none.
    pub async fn ingest(&self, event: ChangeEvent, event_id: Option<Timestamp>) -> DbResult<()> {
        let mark = event_id.unwrap_or(event.time);
        debug!(id = %event.id, branch = %event.branch, action = %event.action, "Event queued");

        self.queue.update(|queue| queue.push(event)).await?;
        self.watermark.update(|w| w.advance(mark)).await?;
        self.notify();
        Ok(())
    }

    /// Queues a catch-up batch and advances the watermark to its newest
    /// event. Notifies once.
    pub async fn ingest_batch(&self, events: Vec<ChangeEvent>) -> DbResult<()> {
        if events.is_empty() {
            return Ok(());
        }

        let newest = events.iter().map(|e| e.time).max();
        let count = events.len();

        self.queue.update(|queue| queue.extend(events)).await?;
        if let Some(newest) = newest {
            self.watermark.update(|w| w.advance(newest)).await?;
        }
        debug!(count, "Event batch queued");
        self.notify();
        Ok(())
    }

    /// Removes exactly `handled` from `branch`. Returns how many were found.
    pub async fn remove_handled(&self, branch: &str, handled: &[ChangeEvent]) -> DbResult<usize> {
        if handled.is_empty() {
            return Ok(0);
        }
        self.queue
            .update(|queue| queue.remove_handled(branch, handled))
            .await
    }

    /// Writes any debounced watermark change now.
    pub async fn flush(&self) -> DbResult<()> {
        self.watermark.flush().await?;
        self.queue.flush().await
    }

    fn notify(&self) {
        // No engine listening yet is fine; the queue keeps the events.
        let _ = self.changes.send(self.watermark.get());
    }
}
