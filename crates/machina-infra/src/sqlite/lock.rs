//! SQLite execution lock: a row per held key.

use chrono::Utc;
use machina_core::store::ExecutionLock;
use machina_types::error::StoreError;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::query_error;

/// Lock holders are identified by a per-instance token recorded in the row.
#[derive(Clone)]
pub struct SqliteExecutionLock {
    pool: DatabasePool,
    holder: String,
}

impl SqliteExecutionLock {
    pub fn new(pool: DatabasePool) -> Self {
        Self {
            pool,
            holder: format!("{}:{}", std::process::id(), Uuid::now_v7()),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl ExecutionLock for SqliteExecutionLock {
    async fn acquire(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO execution_locks (key, holder, acquired_at) VALUES (?, ?, ?)",
        )
        .bind(key)
        .bind(&self.holder)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        let acquired = result.rows_affected() == 1;
        if !acquired {
            tracing::debug!(key, "lock row already present");
        }
        Ok(acquired)
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM execution_locks WHERE key = ? AND holder = ?")
            .bind(key)
            .bind(&self.holder)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        if result.rows_affected() == 0 {
            tracing::debug!(key, "no lock row held by this instance");
        }
        Ok(())
    }
}
