//! SQLite result channel.
//!
//! Results are upserted rows keyed by URI. Blocking reads wake on writes
//! made through any clone of this channel and otherwise poll the table.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use machina_core::store::{ReadOptions, ReadOutcome, ResultChannel};
use machina_types::error::StoreError;
use serde_json::Value;
use sqlx::Row;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::pool::DatabasePool;
use super::query_error;

#[derive(Clone)]
pub struct SqliteResultChannel {
    pool: DatabasePool,
    notify: Arc<Notify>,
    poll_interval: Duration,
}

impl SqliteResultChannel {
    pub fn new(pool: DatabasePool) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn read_now(&self, uri: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT value FROM results WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        match row {
            Some(row) => {
                let text: String = row.try_get("value").map_err(query_error)?;
                Ok(Some(serde_json::from_str(&text)?))
            }
            None => Ok(None),
        }
    }
}

impl ResultChannel for SqliteResultChannel {
    async fn write(&self, uri: &str, data: &Value) -> Result<(), StoreError> {
        let text = serde_json::to_string(data)?;
        sqlx::query(
            r#"INSERT INTO results (uri, value, written_at) VALUES (?, ?, ?)
               ON CONFLICT (uri) DO UPDATE SET value = excluded.value, written_at = excluded.written_at"#,
        )
        .bind(uri)
        .bind(&text)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        self.notify.notify_waiters();
        tracing::debug!(uri, "result written");
        Ok(())
    }

    async fn read(&self, uri: &str, options: ReadOptions) -> Result<ReadOutcome, StoreError> {
        if !options.block {
            return Ok(match self.read_now(uri).await? {
                Some(value) => ReadOutcome::Ready(value),
                None => ReadOutcome::Absent,
            });
        }

        let deadline = options.timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.read_now(uri).await? {
                return Ok(ReadOutcome::Ready(value));
            }

            let mut wait = self.poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(ReadOutcome::TimedOut);
                }
                wait = wait.min(deadline - now);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn exists(&self, uri: &str) -> Result<bool, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM results WHERE uri = ?)")
            .bind(uri)
            .fetch_one(&self.pool.reader)
            .await
            .map_err(query_error)?;
        Ok(row.0 != 0)
    }

    async fn delete(&self, uri: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM results WHERE uri = ?")
            .bind(uri)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(())
    }
}
