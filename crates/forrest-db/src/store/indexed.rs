//! # Indexed Record Store
//!
//! One SQLite table per collection with a JSON body column and expression
//! indexes over selected fields.
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  records_tasks                                                          │
//! │  ┌───────────┬─────────────────────────────────────────────────────┐   │
//! │  │ id (PK)   │ body (JSON text)                                    │   │
//! │  ├───────────┼─────────────────────────────────────────────────────┤   │
//! │  │ "a"       │ {"id":"a","upd":1700000000000,"uid":"u1",...}       │   │
//! │  └───────────┴─────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  idx_records_tasks_upd   ON (json_extract(body, '$.upd'))              │
//! │  idx_records_tasks_uid   ON (json_extract(body, '$.uid'))              │
//! │  idx_records_tasks_gid   ON (json_extract(body, '$.gid'))              │
//! │  idx_records_tasks_<ix>  ON (json_extract(body, '$.<field>'))          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Table, index and field names are spliced into SQL, so they must pass
//! [`validate_identifier`]. Values are always bound.

use forrest_core::{validate_identifier, IndexSchema, Record, RecordId};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};
use crate::pool::Database;

/// Records of one collection in a dedicated indexed table.
#[derive(Debug, Clone)]
pub struct IndexedRecordStore {
    pool: SqlitePool,
    name: String,
    table: String,
    schema: IndexSchema,
}

impl IndexedRecordStore {
    /// Opens the store, creating the table and indexes if needed.
    pub async fn open(db: &Database, name: impl Into<String>, schema: IndexSchema) -> DbResult<Self> {
        let name = name.into();
        validate_identifier(&name)?;
        let table = format!("records_{name}");
        let indexes = schema.resolved()?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (id TEXT PRIMARY KEY NOT NULL, body TEXT NOT NULL)"
        ))
        .execute(db.pool())
        .await?;

        for (index, field) in &indexes {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_{index} ON {table} (json_extract(body, '$.{field}'))"
            ))
            .execute(db.pool())
            .await?;
        }

        info!(collection = %name, indexes = indexes.len(), "Indexed store opened");

        Ok(IndexedRecordStore {
            pool: db.pool().clone(),
            name,
            table,
            schema,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    /// Replaces the whole collection in one transaction. Records without an
    /// id are dropped. Returns the number of records stored.
    ///
    /// Records created locally between the server producing the batch and
    /// this call are lost.
    pub async fn batch(&self, records: Vec<Record>) -> DbResult<usize> {
        let mut rows = Vec::with_capacity(records.len());
        let mut dropped = 0usize;
        for record in &records {
            match record.id() {
                Some(id) => rows.push((id, serde_json::to_string(record)?)),
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            warn!(collection = %self.name, dropped, "Batch records without id ignored");
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        sqlx::query(&format!("DELETE FROM {}", self.table))
            .execute(&mut *tx)
            .await?;

        let insert = format!("INSERT OR REPLACE INTO {} (id, body) VALUES (?1, ?2)", self.table);
        for (id, body) in &rows {
            sqlx::query(&insert)
                .bind(id.as_str())
                .bind(body)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        debug!(collection = %self.name, count = rows.len(), "Indexed batch stored");
        Ok(rows.len())
    }

    /// Inserts or replaces by id.
    pub async fn put(&self, record: Record) -> DbResult<RecordId> {
        let id = record.require_id()?;
        let body = serde_json::to_string(&record)?;

        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {} (id, body) VALUES (?1, ?2)",
            self.table
        ))
        .bind(id.as_str())
        .bind(body)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Same as [`IndexedRecordStore::put`].
    pub async fn post(&self, record: Record) -> DbResult<RecordId> {
        self.put(record).await
    }

    /// Removes by id. Removing an absent id succeeds.
    pub async fn delete(&self, id: &RecordId) -> DbResult<RecordId> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = ?1", self.table))
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        debug!(collection = %self.name, id = %id, removed = result.rows_affected(), "Indexed delete");
        Ok(id.clone())
    }

    pub async fn get(&self, id: &RecordId) -> DbResult<Option<Record>> {
        let body: Option<String> =
            sqlx::query_scalar(&format!("SELECT body FROM {} WHERE id = ?1", self.table))
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        body.map(|text| decode(&text)).transpose()
    }

    /// All records in insertion order.
    pub async fn all(&self) -> DbResult<Vec<Record>> {
        let bodies: Vec<String> =
            sqlx::query_scalar(&format!("SELECT body FROM {} ORDER BY rowid", self.table))
                .fetch_all(&self.pool)
                .await?;
        bodies.iter().map(|text| decode(text)).collect()
    }

    /// Records whose indexed field equals `value`.
    ///
    /// `index` is an index name from the schema or one of `upd`, `uid`,
    /// `gid`.
    pub async fn find_by_index(&self, index: &str, value: &Value) -> DbResult<Vec<Record>> {
        let field = self
            .schema
            .field_for(index)
            .ok_or_else(|| DbError::not_found("Index", index))?;
        validate_identifier(field)?;

        let sql = format!(
            "SELECT body FROM {} WHERE json_extract(body, '$.{field}') = ?1 ORDER BY rowid",
            self.table
        );
        let query = sqlx::query_scalar::<_, String>(&sql);
        let query = match value {
            Value::String(s) => query.bind(s.clone()),
            Value::Bool(b) => query.bind(i64::from(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64().unwrap_or_default()),
            },
            Value::Null => return Ok(Vec::new()),
            other => query.bind(other.to_string()),
        };

        let bodies = query.fetch_all(&self.pool).await?;
        bodies.iter().map(|text| decode(text)).collect()
    }

    pub async fn count(&self) -> DbResult<u64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.table))
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

fn decode(text: &str) -> DbResult<Record> {
    Ok(serde_json::from_str(text)?)
}
