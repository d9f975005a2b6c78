//! # Collection Sync Engine
//!
//! Keeps one collection's local store consistent with the tree backend.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncEngine (one per collection)                  │
//! │                                                                         │
//! │  open()                                                                │
//! │    ├─ pick store: IndexedRecordStore (schema) / LocalRecordStore       │
//! │    ├─ load {name}LastUpdate                                            │
//! │    ├─ mark absent or stale? ──► GET tree/batch/{name} ──► store.batch  │
//! │    └─ spawn listener                                                   │
//! │                                                                         │
//! │  listener: watermark broadcast ──► coalesce ──► reconcile()            │
//! │                                                                         │
//! │  reconcile()  (one at a time)                                          │
//! │    snapshot PendingQueue[name] ──► busy ──► apply all concurrently:    │
//! │      delete / archive ........ store.delete (no network)               │
//! │      time <= mark ............ skipped                                 │
//! │      post / put .............. GET tree/rest/{name}/{id} ──► store     │
//! │    remove handled events ──► advance mark ──► release busy             │
//! │                                                                         │
//! │  post / put / delete  (write path)                                     │
//! │    validate ──► busy ──► request ──► alert response ──► release busy   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! An event leaves the queue only once its delete or fetch-and-store has
//! succeeded. A failing event stays queued and is retried on the next
//! broadcast, indefinitely.

use forrest_core::{
    is_stale, last_update_key, max_updated, validate_collection_name, AcceptAll, Action,
    ChangeEvent, IndexSchema, Record, RecordId, RecordValidator, Timestamp, Watermark,
};
use forrest_db::{Database, PersistMode, PersistentCell, RecordStore};
use futures_util::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alert::{AlertSink, LogAlertSink};
use crate::busy::BusyFlag;
use crate::config::{CollectionConfig, EngineSettings};
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::http::{RestClient, WriteMethod, WriteResponse};

/// Status reported for a write that never got a response.
pub const NETWORK_FAILURE_STATUS: u16 = 503;

/// Alert raised when the validator rejects a record.
pub const VALIDATION_ALERT: &str = "Record failed validation";

/// Alert raised for a write answered without a readable body.
pub const SUCCESS_ALERT: &str = "success";

// =============================================================================
// Collection Options
// =============================================================================

/// Runtime options for one collection.
#[derive(Clone)]
pub struct CollectionOptions {
    name: String,
    indexes: Option<IndexSchema>,
    validator: Arc<dyn RecordValidator>,
    alert: Arc<dyn AlertSink>,
}

impl CollectionOptions {
    /// Local store, accept-all validator, alerts to the log.
    pub fn new(name: impl Into<String>) -> Self {
        CollectionOptions {
            name: name.into(),
            indexes: None,
            validator: Arc::new(AcceptAll),
            alert: Arc::new(LogAlertSink),
        }
    }

    pub fn from_config(config: &CollectionConfig) -> Self {
        let options = Self::new(config.name.clone());
        match &config.indexes {
            Some(indexes) => options.indexes(indexes.clone()),
            None => options,
        }
    }

    /// Keep the collection in an indexed table.
    pub fn indexes(mut self, schema: IndexSchema) -> Self {
        self.indexes = Some(schema);
        self
    }

    /// Predicate every posted or put record must pass.
    pub fn validator(mut self, validator: impl RecordValidator + 'static) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    pub fn alert(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert = sink;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for CollectionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionOptions")
            .field("name", &self.name)
            .field("indexes", &self.indexes)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Pass Report
// =============================================================================

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Fetched and stored.
    pub applied: usize,
    /// Already covered by the last-update mark.
    pub skipped: usize,
    /// Removed locally.
    pub deleted: usize,
    /// Left pending for the next pass.
    pub failed: usize,
}

impl PassReport {
    /// Events handled in this pass (everything but the failures).
    pub fn handled(&self) -> usize {
        self.applied + self.skipped + self.deleted
    }
}

enum Applied {
    Fetched,
    Skipped,
    Deleted,
}

// =============================================================================
// Sync Engine
// =============================================================================

struct EngineInner {
    name: String,
    store: RecordStore,
    mark: PersistentCell<Option<Timestamp>>,
    ctx: Arc<SyncContext>,
    client: RestClient,
    busy: BusyFlag,
    validator: Arc<dyn RecordValidator>,
    alert: Arc<dyn AlertSink>,
    pass_lock: Mutex<()>,
}

/// Sync engine for one collection.
///
/// ## Usage
/// ```rust,ignore
/// let tasks = SyncEngine::open(
///     ctx.clone(),
///     client.clone(),
///     &db,
///     &config.engine,
///     CollectionOptions::new("tasks").validator(RequireId),
/// )
/// .await?;
///
/// let status = tasks.post(Record::new().with("id", json!("t1"))).await?;
/// let records = tasks.records().await?;
/// ```
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    shutdown_tx: mpsc::Sender<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Opens the collection's store, bootstraps it when its mark is absent
    /// or stale, and starts listening for queued events.
    ///
    /// A failed bootstrap is logged; the engine starts regardless.
    pub async fn open(
        ctx: Arc<SyncContext>,
        client: RestClient,
        db: &Database,
        settings: &EngineSettings,
        options: CollectionOptions,
    ) -> SyncResult<Self> {
        let CollectionOptions {
            name,
            indexes,
            validator,
            alert,
        } = options;
        validate_collection_name(&name)?;

        let debounce = settings.persist_debounce();
        let mode = if debounce.is_zero() {
            PersistMode::Immediate
        } else {
            PersistMode::Debounced(debounce)
        };

        let store = RecordStore::open(db, &name, indexes, mode).await?;
        let mark =
            PersistentCell::load(db.state(), last_update_key(&name), None, PersistMode::Immediate)
                .await?;

        let inner = Arc::new(EngineInner {
            busy: BusyFlag::new(settings.busy_timeout(), alert.clone()),
            name,
            store,
            mark,
            ctx,
            client,
            validator,
            alert,
            pass_lock: Mutex::new(()),
        });

        inner.bootstrap_if_stale(settings.staleness()).await;

        // Subscribe before the first pass so nothing ingested meanwhile is missed
        let changes = inner.ctx.subscribe_changes();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let listener = tokio::spawn(run_listener(inner.clone(), changes, shutdown_rx));

        info!(
            collection = %inner.name,
            indexed = inner.store.is_indexed(),
            "Sync engine started"
        );

        Ok(SyncEngine {
            inner,
            shutdown_tx,
            listener: Mutex::new(Some(listener)),
        })
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Drains this collection's pending events once. Concurrent calls run
    /// one after another.
    pub async fn reconcile(&self) -> SyncResult<PassReport> {
        self.inner.reconcile().await
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Creates a record on the server. Returns the response status.
    pub async fn post(&self, record: Record) -> SyncResult<u16> {
        self.inner.check(&record)?;
        let inner = &self.inner;
        inner.busy.take();
        let result = inner.client.write(&inner.name, WriteMethod::Post, &record).await;
        Ok(inner.finish_write(result))
    }

    /// Replaces a record on the server. Returns the response status.
    pub async fn put(&self, record: Record) -> SyncResult<u16> {
        self.inner.check(&record)?;
        if record.id().is_none() {
            let message = "Record has no id";
            self.inner.alert.alert(message);
            return Err(SyncError::ValidationFailed(message.to_string()));
        }
        let inner = &self.inner;
        inner.busy.take();
        let result = inner.client.write(&inner.name, WriteMethod::Put, &record).await;
        Ok(inner.finish_write(result))
    }

    /// Deletes a record (or one of its sub-targets) on the server. Returns
    /// the response status.
    pub async fn delete(&self, id: &RecordId, target: &str) -> SyncResult<u16> {
        let inner = &self.inner;
        inner.busy.take();
        let result = inner.client.delete(&inner.name, id, target).await;
        Ok(inner.finish_write(result))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn store(&self) -> &RecordStore {
        &self.inner.store
    }

    /// Every record currently held locally.
    pub async fn records(&self) -> SyncResult<Vec<Record>> {
        Ok(self.inner.store.all().await?)
    }

    pub async fn get(&self, id: &RecordId) -> SyncResult<Option<Record>> {
        Ok(self.inner.store.get(id).await?)
    }

    /// Watch the busy flag.
    pub fn busy(&self) -> watch::Receiver<bool> {
        self.inner.busy.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.is_busy()
    }

    /// Time of the newest applied change.
    pub fn last_update(&self) -> Option<Timestamp> {
        self.inner.mark.get()
    }

    /// This collection's slice of the pending queue.
    pub fn pending(&self) -> Vec<ChangeEvent> {
        self.inner.ctx.pending(&self.inner.name)
    }

    /// Watch the record list. Only local stores are observable.
    pub fn subscribe_records(&self) -> Option<watch::Receiver<Vec<Record>>> {
        match &self.inner.store {
            RecordStore::Local(store) => Some(store.subscribe()),
            RecordStore::Indexed(_) => None,
        }
    }

    /// Stops the listener after any pass in flight and flushes the store.
    pub async fn shutdown(&self) -> SyncResult<()> {
        // Fails only if the listener already stopped
        let _ = self.shutdown_tx.send(()).await;

        if let Some(listener) = self.listener.lock().await.take() {
            if let Err(e) = listener.await {
                warn!(collection = %self.inner.name, error = %e, "Listener task failed");
            }
        }

        self.inner.busy.release();
        self.inner.store.flush().await?;
        info!(collection = %self.inner.name, "Sync engine stopped");
        Ok(())
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("name", &self.inner.name)
            .field("busy", &self.inner.busy.is_busy())
            .field("last_update", &self.inner.mark.get())
            .finish()
    }
}

impl EngineInner {
    async fn bootstrap_if_stale(&self, staleness: Duration) {
        let mark = self.mark.get();
        if !is_stale(mark, staleness, Timestamp::now()) {
            debug!(collection = %self.name, ?mark, "Last update is recent, skipping bootstrap");
            return;
        }

        match self.bootstrap().await {
            Ok(count) => info!(collection = %self.name, count, "Bootstrap complete"),
            Err(e) if e.is_protocol_error() => {
                error!(collection = %self.name, error = %e, "Bootstrap batch unreadable")
            }
            Err(e) => warn!(collection = %self.name, error = %e, "Bootstrap failed"),
        }
    }

    /// Replaces the store with the server's full collection. The mark
    /// becomes the newest `upd` in the batch, or the fetch time when no
    /// record carries one.
    async fn bootstrap(&self) -> SyncResult<usize> {
        let fetched_at = Timestamp::now();
        let records = self.client.fetch_collection_batch(&self.name).await?;
        let newest = max_updated(&records).unwrap_or(fetched_at);
        let kept = self.store.batch(records).await?;
        self.mark.set(Some(newest)).await?;
        Ok(kept)
    }

    async fn reconcile(&self) -> SyncResult<PassReport> {
        let _pass = self.pass_lock.lock().await;

        let events = self.ctx.pending(&self.name);
        if events.is_empty() {
            return Ok(PassReport::default());
        }

        self.busy.take();
        let result = self.apply_pending(&events).await;
        self.busy.release();
        result
    }

    async fn apply_pending(&self, events: &[ChangeEvent]) -> SyncResult<PassReport> {
        let mark = self.mark.get();
        debug!(collection = %self.name, count = events.len(), ?mark, "Reconciling");

        let outcomes = join_all(events.iter().map(|event| self.apply(event, mark))).await;

        let mut report = PassReport::default();
        let mut handled = Vec::with_capacity(events.len());
        let mut fetched = Vec::new();
        let mut earliest_failure: Option<Timestamp> = None;

        for (event, outcome) in events.iter().zip(outcomes) {
            match outcome {
                Ok(Applied::Fetched) => {
                    report.applied += 1;
                    fetched.push(event.time);
                    handled.push(event.clone());
                }
                Ok(Applied::Skipped) => {
                    report.skipped += 1;
                    handled.push(event.clone());
                }
                Ok(Applied::Deleted) => {
                    report.deleted += 1;
                    handled.push(event.clone());
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        collection = %self.name,
                        id = %event.id,
                        action = %event.action,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Event left pending"
                    );
                    earliest_failure = Some(earliest_failure.map_or(event.time, |t| t.min(event.time)));
                }
            }
        }

        self.ctx.remove_handled(&self.name, &handled).await?;

        // Never move past a failed event, or its retry would be skipped
        let next_mark = fetched
            .into_iter()
            .filter(|time| earliest_failure.map_or(true, |failed| *time < failed))
            .max();
        if let Some(next) = next_mark {
            if mark.map_or(true, |current| next > current) {
                self.mark.set(Some(next)).await?;
            }
        }

        debug!(collection = %self.name, ?report, "Pass complete");
        Ok(report)
    }

    async fn apply(&self, event: &ChangeEvent, mark: Option<Timestamp>) -> SyncResult<Applied> {
        if event.action.is_removal() {
            self.store.delete(&event.id).await?;
            return Ok(Applied::Deleted);
        }
        if mark.is_some_and(|m| event.time <= m) {
            return Ok(Applied::Skipped);
        }

        let record = self.client.fetch_record(&self.name, &event.id).await?;
        if event.action == Action::Put {
            self.store.put(record).await?;
        } else {
            self.store.post(record).await?;
        }
        Ok(Applied::Fetched)
    }

    fn check(&self, record: &Record) -> SyncResult<()> {
        if self.validator.validate(record) {
            return Ok(());
        }
        debug!(collection = %self.name, "Record rejected by validator");
        self.alert.alert(VALIDATION_ALERT);
        Err(SyncError::ValidationFailed(VALIDATION_ALERT.to_string()))
    }

    /// Alerts the server's answer and releases the busy flag.
    fn finish_write(&self, result: SyncResult<WriteResponse>) -> u16 {
        let status = match result {
            Ok(response) if matches!(response.status, 204 | 404) => {
                debug!(collection = %self.name, status = response.status, "Write answered silently");
                response.status
            }
            Ok(response) => {
                self.alert.alert(&alert_text(response.body.as_ref()));
                response.status
            }
            Err(e) => {
                warn!(collection = %self.name, error = %e, "Write failed");
                NETWORK_FAILURE_STATUS
            }
        };
        self.busy.release();
        status
    }
}

/// Text shown for a write response body.
fn alert_text(body: Option<&Value>) -> String {
    match body {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => SUCCESS_ALERT.to_string(),
    }
}

// =============================================================================
// Listener
// =============================================================================

async fn run_listener(
    inner: Arc<EngineInner>,
    mut changes: broadcast::Receiver<Watermark>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    // Events persisted by an earlier run
    run_pass(&inner).await;

    loop {
        tokio::select! {
            received = changes.recv() => match received {
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    let closed = drain_buffered(&mut changes);
                    run_pass(&inner).await;
                    if closed {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },

            _ = shutdown_rx.recv() => break,
        }
    }

    debug!(collection = %inner.name, "Listener stopped");
}

/// Swallows notifications already buffered so one pass covers them all.
/// Returns true if the channel closed.
fn drain_buffered(changes: &mut broadcast::Receiver<Watermark>) -> bool {
    loop {
        match changes.try_recv() {
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Closed) => return true,
        }
    }
}

async fn run_pass(inner: &EngineInner) {
    match inner.reconcile().await {
        Ok(report) if report == PassReport::default() => {}
        Ok(report) => info!(
            collection = %inner.name,
            applied = report.applied,
            skipped = report.skipped,
            deleted = report.deleted,
            failed = report.failed,
            "Reconciliation pass"
        ),
        Err(e) => warn!(collection = %inner.name, error = %e, "Reconciliation pass failed"),
    }
}
