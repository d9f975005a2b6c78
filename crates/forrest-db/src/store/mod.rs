//! # Record Stores
//!
//! Where a collection's records live locally.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           RecordStore                                   │
//! │                                                                         │
//! │   index schema given? ──no──► LocalRecordStore                          │
//! │          │                    (persisted Vec<Record>, observable)       │
//! │         yes                                                             │
//! │          │                                                              │
//! │          ▼                                                              │
//! │   IndexedRecordStore                                                    │
//! │   (records_{name} table + json_extract indexes)                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod indexed;
pub mod local;

use forrest_core::{IndexSchema, Record, RecordId};

use crate::cell::PersistMode;
use crate::error::DbResult;
use crate::pool::Database;

pub use indexed::IndexedRecordStore;
pub use local::LocalRecordStore;

/// Either kind of record store.
#[derive(Debug)]
pub enum RecordStore {
    Local(LocalRecordStore),
    Indexed(IndexedRecordStore),
}

impl RecordStore {
    /// Opens an indexed store when `schema` is given, a local one otherwise.
    pub async fn open(
        db: &Database,
        name: &str,
        schema: Option<IndexSchema>,
        mode: PersistMode,
    ) -> DbResult<Self> {
        match schema {
            Some(schema) => Ok(RecordStore::Indexed(
                IndexedRecordStore::open(db, name, schema).await?,
            )),
            None => Ok(RecordStore::Local(LocalRecordStore::open(db, name, mode).await?)),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RecordStore::Local(store) => store.name(),
            RecordStore::Indexed(store) => store.name(),
        }
    }

    pub fn is_indexed(&self) -> bool {
        matches!(self, RecordStore::Indexed(_))
    }

    /// Replaces the whole collection.
    pub async fn batch(&self, records: Vec<Record>) -> DbResult<usize> {
        match self {
            RecordStore::Local(store) => store.batch(records).await,
            RecordStore::Indexed(store) => store.batch(records).await,
        }
    }

    pub async fn post(&self, record: Record) -> DbResult<RecordId> {
        match self {
            RecordStore::Local(store) => store.post(record).await,
            RecordStore::Indexed(store) => store.post(record).await,
        }
    }

    pub async fn put(&self, record: Record) -> DbResult<RecordId> {
        match self {
            RecordStore::Local(store) => store.put(record).await,
            RecordStore::Indexed(store) => store.put(record).await,
        }
    }

    pub async fn delete(&self, id: &RecordId) -> DbResult<RecordId> {
        match self {
            RecordStore::Local(store) => store.delete(id).await,
            RecordStore::Indexed(store) => store.delete(id).await,
        }
    }

    pub async fn get(&self, id: &RecordId) -> DbResult<Option<Record>> {
        match self {
            RecordStore::Local(store) => Ok(store.get(id)),
            RecordStore::Indexed(store) => store.get(id).await,
        }
    }

    pub async fn all(&self) -> DbResult<Vec<Record>> {
        match self {
            RecordStore::Local(store) => Ok(store.all()),
            RecordStore::Indexed(store) => store.all().await,
        }
    }

    /// Writes pending debounced changes. Indexed stores write through.
    pub async fn flush(&self) -> DbResult<()> {
        match self {
            RecordStore::Local(store) => store.flush().await,
            RecordStore::Indexed(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DbConfig;
    use serde_json::json;

    #[tokio::test]
    async fn test_open_picks_store_kind() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let local = RecordStore::open(&db, "notes", None, PersistMode::Immediate)
            .await
            .unwrap();
        assert!(!local.is_indexed());

        let indexed = RecordStore::open(&db, "tasks", Some(IndexSchema::new()), PersistMode::Immediate)
            .await
            .unwrap();
        assert!(indexed.is_indexed());

        for store in [&local, &indexed] {
            let id = store
                .put(Record::new().with("id", json!("x")).with("upd", json!(1)))
                .await
                .unwrap();
            assert!(store.get(&id).await.unwrap().is_some());
            assert_eq!(store.all().await.unwrap().len(), 1);
            store.delete(&id).await.unwrap();
            assert!(store.all().await.unwrap().is_empty());
        }
    }
}
