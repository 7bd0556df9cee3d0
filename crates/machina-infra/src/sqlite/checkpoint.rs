//! SQLite checkpoint store.
//!
//! One row per key. The snapshot is stored as JSON text; `execution_id`,
//! `step` and `event` are copied into columns for inspection.

use chrono::Utc;
use machina_core::store::CheckpointStore;
use machina_types::error::StoreError;
use machina_types::snapshot::MachineSnapshot;
use sqlx::Row;

use super::pool::DatabasePool;
use super::query_error;

/// SQLite-backed implementation of `CheckpointStore`.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: DatabasePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, key: &str, snapshot: &MachineSnapshot) -> Result<(), StoreError> {
        let body = serde_json::to_string(snapshot)?;
        let event = serde_json::to_value(snapshot.event)?;
        let event = event.as_str().unwrap_or_default().to_string();
        let step = i64::try_from(snapshot.step)
            .map_err(|_| StoreError::Query(format!("step {} out of range", snapshot.step)))?;

        sqlx::query(
            r#"INSERT INTO checkpoints (key, execution_id, step, event, snapshot, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT (key) DO UPDATE SET
                   execution_id = excluded.execution_id,
                   step = excluded.step,
                   event = excluded.event,
                   snapshot = excluded.snapshot,
                   updated_at = excluded.updated_at"#,
        )
        .bind(key)
        .bind(&snapshot.execution_id)
        .bind(step)
        .bind(&event)
        .bind(&body)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<MachineSnapshot>, StoreError> {
        let row = sqlx::query("SELECT snapshot FROM checkpoints WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let body: String = row.try_get("snapshot").map_err(query_error)?;
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM checkpoints WHERE key = ?")
            .bind(key)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT key FROM checkpoints WHERE substr(key, 1, length(?)) = ? ORDER BY key",
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in &rows {
            keys.push(row.try_get::<String, _>("key").map_err(query_error)?);
        }
        Ok(keys)
    }
}
