//! # Local Record Store
//!
//! An ordered list of records kept in one [`PersistentCell`] under the
//! collection name. Used for collections without an index schema.
//!
//! | Operation | Absent id             | Present id              |
//! |-----------|-----------------------|-------------------------|
//! | `post`    | append                | replace in place        |
//! | `put`     | prepend               | replace in place        |
//! | `delete`  | no-op, returns the id | remove, returns the id  |

use forrest_core::{validate_collection_name, Record, RecordId};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cell::{PersistMode, PersistentCell};
use crate::error::DbResult;
use crate::pool::Database;

/// Records of one collection held as a persisted list.
#[derive(Debug)]
pub struct LocalRecordStore {
    name: String,
    cell: PersistentCell<Vec<Record>>,
}

impl LocalRecordStore {
    /// Opens (or creates) the store for `name`. Names that collide with
    /// persisted sync state are rejected.
    pub async fn open(db: &Database, name: impl Into<String>, mode: PersistMode) -> DbResult<Self> {
        let name = name.into();
        validate_collection_name(&name)?;
        let cell = PersistentCell::load(db.state(), name.clone(), Vec::new(), mode).await?;
        debug!(collection = %name, records = cell.borrow().len(), "Local store opened");
        Ok(LocalRecordStore { name, cell })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replaces the whole collection. Records without an id are dropped.
    /// Returns the number of records kept.
    pub async fn batch(&self, records: Vec<Record>) -> DbResult<usize> {
        let (kept, dropped): (Vec<_>, Vec<_>) =
            records.into_iter().partition(|r| r.id().is_some());
        if !dropped.is_empty() {
            warn!(collection = %self.name, dropped = dropped.len(), "Batch records without id ignored");
        }
        let count = kept.len();
        self.cell.set(kept).await?;
        Ok(count)
    }

    /// Adds a record at the end. A record with a known id replaces the
    /// existing entry instead, so ids stay unique.
    pub async fn post(&self, record: Record) -> DbResult<RecordId> {
        let id = record.require_id()?;
        let key = id.clone();
        self.cell
            .update(move |records| match position(records, &key) {
                Some(pos) => records[pos] = record,
                None => records.push(record),
            })
            .await?;
        Ok(id)
    }

    /// Replaces the record with the same id, or inserts it at the front.
    pub async fn put(&self, record: Record) -> DbResult<RecordId> {
        let id = record.require_id()?;
        let key = id.clone();
        self.cell
            .update(move |records| match position(records, &key) {
                Some(pos) => records[pos] = record,
                None => records.insert(0, record),
            })
            .await?;
        Ok(id)
    }

    /// Removes the record with `id`. Removing an absent id succeeds.
    pub async fn delete(&self, id: &RecordId) -> DbResult<RecordId> {
        let removed = self
            .cell
            .update(|records| match position(records, id) {
                Some(pos) => {
                    records.remove(pos);
                    true
                }
                None => false,
            })
            .await?;
        debug!(collection = %self.name, id = %id, removed, "Local delete");
        Ok(id.clone())
    }

    pub fn get(&self, id: &RecordId) -> Option<Record> {
        let records = self.cell.borrow();
        position(&records, id).map(|pos| records[pos].clone())
    }

    /// All records in store order.
    pub fn all(&self) -> Vec<Record> {
        self.cell.get()
    }

    pub fn len(&self) -> usize {
        self.cell.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cell.borrow().is_empty()
    }

    /// Subscribes to the record list.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Record>> {
        self.cell.subscribe()
    }

    /// Writes any pending debounced change.
    pub async fn flush(&self) -> DbResult<()> {
        self.cell.flush().await
    }
}

fn position(records: &[Record], id: &RecordId) -> Option<usize> {
    records.iter().position(|r| r.id().as_ref() == Some(id))
}
