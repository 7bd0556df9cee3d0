//! File-backed checkpoint store: one JSON file per snapshot.

use std::path::{Path, PathBuf};

use machina_core::store::CheckpointStore;
use machina_types::error::StoreError;
use machina_types::snapshot::MachineSnapshot;

use super::{key_path, read_optional, remove_optional, validate_key, write_atomic};

/// Stores snapshots as `{root}/{key}.json`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at `{data_dir}/checkpoints`.
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("checkpoints"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, key: &str, snapshot: &MachineSnapshot) -> Result<(), StoreError> {
        let path = key_path(&self.root, key)?;
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&path, &bytes).await?;
        tracing::debug!(key, path = %path.display(), "checkpoint written");
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<MachineSnapshot>, StoreError> {
        let path = key_path(&self.root, key)?;
        match read_optional(&path).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = key_path(&self.root, key)?;
        remove_optional(&path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        // Only walk the directory named by the prefix, when it names one.
        let (start, key_base) = match prefix.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => {
                validate_key(dir)?;
                (self.root.join(dir), format!("{dir}/"))
            }
            _ => (self.root.clone(), String::new()),
        };

        let mut keys = Vec::new();
        let mut pending = vec![(start, key_base)];
        while let Some((dir, base)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), format!("{base}{name}/")));
                } else if let Some(stem) = name.strip_suffix(".json") {
                    let key = format!("{base}{stem}");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
