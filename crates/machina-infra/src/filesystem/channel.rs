//! File-backed result channel.
//!
//! `{scheme}://{execution_id}/result` maps to
//! `{root}/{scheme}/{execution_id}/result.json`. Blocking reads wake on
//! writes made through any clone of the same channel and poll for writes
//! from other processes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use machina_core::store::{ReadOptions, ReadOutcome, ResultChannel};
use machina_types::error::StoreError;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{key_path, read_optional, remove_optional, write_atomic};

/// Default interval between existence checks while blocked.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct FileResultChannel {
    root: PathBuf,
    notify: Arc<Notify>,
    poll_interval: Duration,
}

impl FileResultChannel {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            notify: Arc::new(Notify::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Channel rooted at `{data_dir}/results`.
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("results"))
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn path_for(&self, uri: &str) -> Result<PathBuf, StoreError> {
        key_path(&self.root, &uri_key(uri)?)
    }

    async fn read_now(&self, path: &Path) -> Result<Option<Value>, StoreError> {
        match read_optional(path).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// `scheme://rest` -> `scheme/rest`, rejecting URIs without a scheme.
pub(crate) fn uri_key(uri: &str) -> Result<String, StoreError> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| StoreError::InvalidKey(uri.to_string()))?;
    let scheme_ok = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !scheme_ok || rest.is_empty() {
        return Err(StoreError::InvalidKey(uri.to_string()));
    }
    Ok(format!("{scheme}/{rest}"))
}

impl ResultChannel for FileResultChannel {
    async fn write(&self, uri: &str, data: &Value) -> Result<(), StoreError> {
        let path = self.path_for(uri)?;
        let bytes = serde_json::to_vec(data)?;
        write_atomic(&path, &bytes).await?;
        self.notify.notify_waiters();
        tracing::debug!(uri, "result written");
        Ok(())
    }

    async fn read(&self, uri: &str, options: ReadOptions) -> Result<ReadOutcome, StoreError> {
        let path = self.path_for(uri)?;
        if !options.block {
            return Ok(match self.read_now(&path).await? {
                Some(value) => ReadOutcome::Ready(value),
                None => ReadOutcome::Absent,
            });
        }

        let deadline = options.timeout.map(|t| Instant::now() + t);
        loop {
            // Register interest before checking so a write in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.read_now(&path).await? {
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
        let path = self.path_for(uri)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn delete(&self, uri: &str) -> Result<(), StoreError> {
        let path = self.path_for(uri)?;
        remove_optional(&path).await
    }
}
