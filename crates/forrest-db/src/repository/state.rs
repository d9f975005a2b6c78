//! # State Repository
//!
//! Key/value access to the `state_cells` table. Values are JSON text.
//!
//! ```text
//! ┌──────────────────────────┬──────────────────────────────┬─────────────┐
//! │ key                      │ value                        │ updated_at  │
//! ├──────────────────────────┼──────────────────────────────┼─────────────┤
//! │ forrestLastUpdate        │ 1700000000000                │ 2024-...    │
//! │ forrestUpdateQuery       │ {"tasks":[{"id":"a",...}]}   │ 2024-...    │
//! │ tasksLastUpdate          │ 1699999999000                │ 2024-...    │
//! │ tasks                    │ [{"id":"a","upd":...}, ...]  │ 2024-...    │
//! └──────────────────────────┴──────────────────────────────┴─────────────┘
//! ```

use chrono::Utc;
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;

/// Repository for named persisted cells.
#[derive(Debug, Clone)]
pub struct StateRepository {
    pool: SqlitePool,
}

impl StateRepository {
    /// Creates a new StateRepository.
    pub fn new(pool: SqlitePool) -> Self {
        StateRepository { pool }
    }

    /// Returns the raw JSON text stored under `key`.
    pub async fn get(&self, key: &str) -> DbResult<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM state_cells WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    /// Returns the value stored under `key`, decoded from JSON.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        match self.get(key).await? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// Stores raw JSON text under `key`, replacing any previous value.
    pub async fn put(&self, key: &str, value: &str) -> DbResult<()> {
        debug!(key = %key, bytes = value.len(), "Persisting cell");

        sqlx::query(
            r#"
            INSERT INTO state_cells (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::pool::{Database, DbConfig};
    use crate::DbError;
    use serde_json::json;

    async fn setup() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn test_put_get_overwrite() {
        let repo = setup().await.state();

        assert_eq!(repo.get("forrestLastUpdate").await.unwrap(), None);
        repo.put("forrestLastUpdate", "10").await.unwrap();
        repo.put("forrestLastUpdate", "20").await.unwrap();
        assert_eq!(
            repo.get("forrestLastUpdate").await.unwrap().as_deref(),
            Some("20")
        );
    }

    #[tokio::test]
    async fn test_json_cells() {
        let repo = setup().await.state();

        repo.put("tasks", &json!([{"id": "a"}]).to_string()).await.unwrap();
        let value: serde_json::Value = repo.get_json("tasks").await.unwrap().unwrap();
        assert_eq!(value, json!([{"id": "a"}]));

        repo.put("broken", "{not json").await.unwrap();
        let err = repo.get_json::<serde_json::Value>("broken").await.unwrap_err();
        assert!(matches!(err, DbError::Serialization(_)));
    }
}
