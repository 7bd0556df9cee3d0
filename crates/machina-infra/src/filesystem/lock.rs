//! File-backed execution lock using exclusive file creation.
//!
//! `acquire` creates `{root}/{key}.lock` with `create_new`; the file holds
//! the holder's pid, a per-instance holder token and the acquisition time.
//! `release` removes the file only when the token matches, so a release from
//! another instance leaves the lock in place. A crashed holder leaves the
//! file behind until it is removed by hand.

use std::path::{Path, PathBuf};

use chrono::Utc;
use machina_core::store::ExecutionLock;
use machina_types::error::StoreError;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{read_optional, remove_optional, validate_key};

#[derive(Debug, Clone)]
pub struct FileExecutionLock {
    root: PathBuf,
    holder: String,
}

impl FileExecutionLock {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            holder: Uuid::now_v7().to_string(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Lock directory `{data_dir}/locks`.
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("locks"))
    }

    fn lock_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        if key.contains('/') {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(format!("{key}.lock")))
    }
}

impl ExecutionLock for FileExecutionLock {
    async fn acquire(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.lock_path(key)?;
        tokio::fs::create_dir_all(&self.root).await?;

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::debug!(key, "lock file already present");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let holder = serde_json::json!({
            "pid": std::process::id(),
            "holder": self.holder,
            "acquired_at": Utc::now().to_rfc3339(),
        });
        file.write_all(&serde_json::to_vec(&holder)?).await?;
        file.flush().await?;
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        let path = self.lock_path(key)?;
        let Some(bytes) = read_optional(&path).await? else {
            return Ok(());
        };
        let owner = serde_json::from_slice::<serde_json::Value>(&bytes)
            .ok()
            .and_then(|v| v.get("holder").and_then(|h| h.as_str()).map(str::to_string));
        if owner.as_deref() != Some(self.holder.as_str()) {
            tracing::debug!(
                key,
                owner = owner.as_deref().unwrap_or(""),
                "lock held by another holder, not releasing"
            );
            return Ok(());
        }
        remove_optional(&path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_acquire_is_exclusive_until_release() {
        let dir = tempdir().unwrap();
        let lock = FileExecutionLock::new(dir.path());
        assert!(lock.acquire("e1").await.unwrap());
        assert!(!lock.acquire("e1").await.unwrap());
        assert!(lock.acquire("e2").await.unwrap());

        lock.release("e1").await.unwrap();
        assert!(lock.acquire("e1").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let dir = tempdir().unwrap();
        let lock = FileExecutionLock::new(dir.path());
        lock.release("never-held").await.unwrap();
        assert!(lock.acquire("x").await.unwrap());
        lock.release("x").await.unwrap();
        lock.release("x").await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_file_records_holder() {
        let dir = tempdir().unwrap();
        let lock = FileExecutionLock::new(dir.path());
        assert!(lock.acquire("exec.1.0").await.unwrap());
        let content = tokio::fs::read_to_string(dir.path().join("exec.1.0.lock"))
            .await
            .unwrap();
        let holder: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(holder["pid"], serde_json::json!(std::process::id()));
        assert_eq!(holder["holder"], serde_json::json!(lock.holder()));
    }

    #[tokio::test]
    async fn test_release_by_other_instance_keeps_lock() {
        let dir = tempdir().unwrap();
        let first = FileExecutionLock::new(dir.path());
        let second = FileExecutionLock::new(dir.path());
        assert_ne!(first.holder(), second.holder());

        assert!(first.acquire("shared").await.unwrap());
        second.release("shared").await.unwrap();
        assert!(!second.acquire("shared").await.unwrap());

        first.release("shared").await.unwrap();
        assert!(second.acquire("shared").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_path_like_keys() {
        let dir = tempdir().unwrap();
        let lock = FileExecutionLock::new(dir.path());
        assert!(lock.acquire("../x").await.is_err());
        assert!(lock.acquire("a/b").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_single_winner() {
        let dir = tempdir().unwrap();
        let lock = Arc::new(FileExecutionLock::new(dir.path()));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let lock = Arc::clone(&lock);
            handles.push(tokio::spawn(async move { lock.acquire("shared").await.unwrap() }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
