//! # Busy Flag
//!
//! Observable "work in progress" marker for one collection, set for the
//! duration of a reconciliation pass or a write.
//!
//! ```text
//!   take() ──► busy = true, (re)arm timer ──┬── release() ──► busy = false
//!                                           │
//!                                           └── timeout ────► busy = false
//!                                                             alert "Time out"
//! ```
//!
//! Re-taking the flag cancels the previous timer so only one is ever armed.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::alert::AlertSink;

/// Alert raised when the flag clears itself.
pub const TIMEOUT_ALERT: &str = "Time out";

pub struct BusyFlag {
    tx: Arc<watch::Sender<bool>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
    alert: Arc<dyn AlertSink>,
}

impl BusyFlag {
    pub fn new(timeout: Duration, alert: Arc<dyn AlertSink>) -> Self {
        let (tx, _) = watch::channel(false);
        BusyFlag {
            tx: Arc::new(tx),
            timer: Mutex::new(None),
            timeout,
            alert,
        }
    }

    /// Marks the collection busy and arms a fresh timeout.
    pub fn take(&self) {
        self.tx.send_replace(true);

        let tx = self.tx.clone();
        let alert = self.alert.clone();
        let timeout = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!(?timeout, "Busy flag timed out");
            tx.send_replace(false);
            alert.alert(TIMEOUT_ALERT);
        });

        if let Some(previous) = self.swap_timer(Some(timer)) {
            previous.abort();
        }
    }

    /// Clears the flag and disarms the timeout.
    pub fn release(&self) {
        if let Some(timer) = self.swap_timer(None) {
            timer.abort();
        }
        self.tx.send_replace(false);
    }

    pub fn is_busy(&self) -> bool {
        *self.tx.borrow()
    }

    /// Watch the flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// True while a timeout is armed and has not fired.
    pub fn has_pending_timeout(&self) -> bool {
        let guard = match self.timer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.as_ref().is_some_and(|timer| !timer.is_finished())
    }

    fn swap_timer(&self, next: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
        let mut guard = match self.timer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, next)
    }
}

impl Drop for BusyFlag {
    fn drop(&mut self) {
        if let Some(timer) = self.swap_timer(None) {
            timer.abort();
        }
    }
}

impl std::fmt::Debug for BusyFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusyFlag")
            .field("busy", &self.is_busy())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::MemoryAlertSink;

    fn flag(secs: u64) -> (BusyFlag, Arc<MemoryAlertSink>) {
        let sink = Arc::new(MemoryAlertSink::new());
        (BusyFlag::new(Duration::from_secs(secs), sink.clone()), sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_and_release() {
        let (busy, sink) = flag(30);
        assert!(!busy.is_busy());

        busy.take();
        assert!(busy.is_busy());
        assert!(busy.has_pending_timeout());

        busy.release();
        assert!(!busy.is_busy());
        assert!(!busy.has_pending_timeout());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(sink.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_clears_and_alerts() {
        let (busy, sink) = flag(30);
        busy.take();

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert!(!busy.is_busy());
        assert_eq!(sink.messages(), vec![TIMEOUT_ALERT]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retake_rearms_single_timer() {
        let (busy, sink) = flag(30);
        busy.take();
        tokio::time::sleep(Duration::from_secs(20)).await;

        busy.take();
        tokio::time::sleep(Duration::from_secs(20)).await;
        // The first timer would have fired by now
        assert!(busy.is_busy());
        assert!(sink.messages().is_empty());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!busy.is_busy());
        assert_eq!(sink.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_sees_changes() {
        let (busy, _sink) = flag(30);
        let mut rx = busy.subscribe();

        busy.take();
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        busy.release();
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }
}
