//! # Persistent Cells
//!
//! A reactive value that survives restarts: readers subscribe through a
//! `tokio::sync::watch` channel, every change is written to `state_cells`.
//!
//! ## Write Modes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        PersistentCell<T>                                │
//! │                                                                         │
//! │  set / update ──► watch::Sender (subscribers see it immediately)       │
//! │                        │                                                │
//! │          ┌─────────────┴──────────────┐                                 │
//! │          ▼                            ▼                                 │
//! │   Immediate                     Debounced(delay)                        │
//! │   write before returning        writer task: Dirty ─► wait delay        │
//! │                                 (reset on each Dirty, capped at         │
//! │                                 MAX_WAIT_FACTOR × delay)                │
//! │                                 ─► write latest                         │
//! │                                 Flush ─► write now, reply               │
//! │                                 cell dropped ─► final write, exit       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Whatever the mode, the value written is read from the channel at write
//! time, so the last write always carries the newest value.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::{DbError, DbResult};
use crate::repository::state::StateRepository;

/// Bound for values a cell can hold.
pub trait CellValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CellValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// When a cell writes its value to the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistMode {
    /// Every change is written before `set`/`update` return.
    #[default]
    Immediate,
    /// Changes are written once no further change arrived for the delay,
    /// and never later than [`MAX_WAIT_FACTOR`] delays after the first
    /// unwritten change.
    Debounced(Duration),
}

/// Bound on how many debounce delays a steady stream of changes can hold
/// back a write.
pub const MAX_WAIT_FACTOR: u32 = 4;

enum WriterCommand {
    Dirty,
    Flush(oneshot::Sender<DbResult<()>>),
}

/// A named, observable, persisted value.
pub struct PersistentCell<T: CellValue> {
    key: String,
    tx: watch::Sender<T>,
    repo: StateRepository,
    /// Serialises immediate writes so they land in change order.
    write_lock: Mutex<()>,
    writer: Option<mpsc::UnboundedSender<WriterCommand>>,
}

impl<T: CellValue> fmt::Debug for PersistentCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentCell")
            .field("key", &self.key)
            .field("debounced", &self.writer.is_some())
            .finish()
    }
}

impl<T: CellValue> PersistentCell<T> {
    /// Loads the cell stored under `key`, or starts from `default` when the
    /// key is absent.
    ///
    /// A stored value that no longer decodes is logged and replaced by
    /// `default` rather than failing startup.
    pub async fn load(
        repo: StateRepository,
        key: impl Into<String>,
        default: T,
        mode: PersistMode,
    ) -> DbResult<Self> {
        let key = key.into();

        let initial = match repo.get_json::<T>(&key).await {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(DbError::Serialization(reason)) => {
                warn!(key = %key, reason = %reason, "Discarding undecodable cell value");
                default
            }
            Err(e) => return Err(e),
        };

        let (tx, rx) = watch::channel(initial);

        let writer = match mode {
            PersistMode::Immediate => None,
            PersistMode::Debounced(delay) => {
                let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                tokio::spawn(run_writer(key.clone(), repo.clone(), rx, cmd_rx, delay));
                Some(cmd_tx)
            }
        };

        debug!(key = %key, ?mode, "Cell loaded");

        Ok(PersistentCell {
            key,
            tx,
            repo,
            write_lock: Mutex::new(()),
            writer,
        })
    }

    /// Storage key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns a clone of the current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Borrows the current value. Don't hold across an `.await`.
    pub fn borrow(&self) -> watch::Ref<'_, T> {
        self.tx.borrow()
    }

    /// Subscribes to changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Replaces the value.
    pub async fn set(&self, value: T) -> DbResult<()> {
        self.tx.send_replace(value);
        self.persist().await
    }

    /// Mutates the value in place under the channel lock and returns the
    /// closure's result. Concurrent updates never interleave.
    pub async fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> DbResult<R> {
        let mut result = None;
        self.tx.send_modify(|value| result = Some(f(value)));
        self.persist().await?;
        result.ok_or_else(|| DbError::Internal("cell update closure did not run".to_string()))
    }

    /// Writes any pending debounced change now.
    pub async fn flush(&self) -> DbResult<()> {
        match &self.writer {
            None => Ok(()),
            Some(writer) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                writer
                    .send(WriterCommand::Flush(reply_tx))
                    .map_err(|_| DbError::Internal(format!("writer for '{}' stopped", self.key)))?;
                reply_rx
                    .await
                    .map_err(|_| DbError::Internal(format!("writer for '{}' stopped", self.key)))?
            }
        }
    }

    async fn persist(&self) -> DbResult<()> {
        match &self.writer {
            Some(writer) => {
                if writer.send(WriterCommand::Dirty).is_err() {
                    return Err(DbError::Internal(format!("writer for '{}' stopped", self.key)));
                }
                Ok(())
            }
            None => {
                let _guard = self.write_lock.lock().await;
                let text = serde_json::to_string(&*self.tx.borrow())?;
                self.repo.put(&self.key, &text).await
            }
        }
    }
}

// =============================================================================
// Debounced Writer
// =============================================================================

async fn run_writer<T: CellValue>(
    key: String,
    repo: StateRepository,
    value: watch::Receiver<T>,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
    delay: Duration,
) {
    debug!(key = %key, delay_ms = delay.as_millis() as u64, "Cell writer started");

    while let Some(first) = commands.recv().await {
        let mut dirty = false;
        let mut waiters = Vec::new();
        let mut closed = false;

        match first {
            WriterCommand::Dirty => dirty = true,
            WriterCommand::Flush(reply) => waiters.push(reply),
        }

        // Trailing debounce: every Dirty restarts the delay, up to the deadline
        let deadline = Instant::now() + delay * MAX_WAIT_FACTOR;
        while dirty && waiters.is_empty() {
            let wake = (Instant::now() + delay).min(deadline);
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(WriterCommand::Dirty) => continue,
                    Some(WriterCommand::Flush(reply)) => waiters.push(reply),
                    None => {
                        closed = true;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(wake) => break,
            }
        }

        // Fold in anything else already queued
        while let Ok(cmd) = commands.try_recv() {
            match cmd {
                WriterCommand::Dirty => dirty = true,
                WriterCommand::Flush(reply) => waiters.push(reply),
            }
        }

        let result = if dirty { write_current(&key, &repo, &value).await } else { Ok(()) };
        if let Err(e) = &result {
            error!(key = %key, error = %e, "Debounced cell write failed");
        }
        for reply in waiters {
            let outcome = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(DbError::Internal(e.to_string())),
            };
            let _ = reply.send(outcome);
        }

        if closed {
            break;
        }
    }

    debug!(key = %key, "Cell writer stopped");
}

async fn write_current<T: CellValue>(
    key: &str,
    repo: &StateRepository,
    value: &watch::Receiver<T>,
) -> DbResult<()> {
    let text = serde_json::to_string(&*value.borrow())?;
    repo.put(key, &text).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    async fn setup() -> StateRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().state()
    }

    #[tokio::test]
    async fn test_immediate_cell_persists_and_reloads() {
        let repo = setup().await;
        let cell = PersistentCell::load(repo.clone(), "counter", 0_i64, PersistMode::Immediate)
            .await
            .unwrap();
        assert_eq!(cell.get(), 0);

        cell.set(5).await.unwrap();
        let doubled = cell.update(|v| {
            *v *= 2;
            *v
        })
        .await
        .unwrap();
        assert_eq!(doubled, 10);

        let reloaded = PersistentCell::load(repo, "counter", 0_i64, PersistMode::Immediate)
            .await
            .unwrap();
        assert_eq!(reloaded.get(), 10);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let repo = setup().await;
        let cell = PersistentCell::load(repo, "flag", false, PersistMode::Immediate)
            .await
            .unwrap();
        let mut rx = cell.subscribe();

        cell.set(true).await.unwrap();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_debounced_cell_writes_after_quiet_period() {
        let repo = setup().await;
        let cell = PersistentCell::load(
            repo.clone(),
            "list",
            Vec::<i64>::new(),
            PersistMode::Debounced(Duration::from_millis(50)),
        )
        .await
        .unwrap();

        cell.update(|v| v.push(1)).await.unwrap();
        cell.update(|v| v.push(2)).await.unwrap();
        assert_eq!(repo.get("list").await.unwrap(), None);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(repo.get("list").await.unwrap().as_deref(), Some("[1,2]"));
    }

    #[tokio::test]
    async fn test_steady_changes_still_get_written() {
        let repo = setup().await;
        let cell = PersistentCell::load(
            repo.clone(),
            "mark",
            0_i64,
            PersistMode::Debounced(Duration::from_millis(50)),
        )
        .await
        .unwrap();

        // Changes every 10ms never leave a 50ms quiet period
        for i in 1..=50 {
            cell.set(i).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let written = repo.get("mark").await.unwrap();
        assert!(written.is_some(), "nothing written while changes kept coming");
    }

    #[tokio::test]
    async fn test_flush_writes_pending_change() {
        let repo = setup().await;
        let cell = PersistentCell::load(
            repo.clone(),
            "list",
            Vec::<i64>::new(),
            PersistMode::Debounced(Duration::from_secs(60)),
        )
        .await
        .unwrap();

        cell.set(vec![7]).await.unwrap();
        cell.flush().await.unwrap();
        assert_eq!(repo.get("list").await.unwrap().as_deref(), Some("[7]"));

        // Nothing pending: flush is a no-op
        cell.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_value_falls_back_to_default() {
        let repo = setup().await;
        repo.put("counter", "\"not a number\"").await.unwrap();

        let cell = PersistentCell::load(repo, "counter", 3_i64, PersistMode::Immediate)
            .await
            .unwrap();
        assert_eq!(cell.get(), 3);
    }
}
