//! Filesystem backends for Machina.
//!
//! Checkpoints, results and locks live under one data directory:
//!
//! ```text
//! {data_dir}/checkpoints/{execution_id}/step_000001.json
//! {data_dir}/results/{scheme}/{execution_id}/result.json
//! {data_dir}/locks/{execution_id}.lock
//! ```
//!
//! Every value write goes to a temporary sibling first and is renamed into
//! place, so readers never observe a partial file.

pub mod channel;
pub mod checkpoint;
pub mod lock;

use std::path::{Path, PathBuf};

use machina_types::error::StoreError;
use uuid::Uuid;

pub use channel::FileResultChannel;
pub use checkpoint::FileCheckpointStore;
pub use lock::FileExecutionLock;

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `MACHINA_DATA_DIR` environment variable
/// 2. `~/.machina`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("MACHINA_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".machina");
    }

    // Last resort: current directory
    PathBuf::from(".machina")
}

/// Reject keys that could escape the backend's root directory.
///
/// A key is a `/`-separated relative path whose segments are non-empty and
/// are neither `.` nor `..`.
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = key.is_empty()
        || key.contains('\\')
        || key.contains('\0')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Map a validated key to `{root}/{key}.json`.
pub(crate) fn key_path(root: &Path, key: &str) -> Result<PathBuf, StoreError> {
    validate_key(key)?;
    let mut path = root.to_path_buf();
    for segment in key.split('/') {
        path.push(segment);
    }
    path.set_extension(match path.extension() {
        Some(ext) => format!("{}.json", ext.to_string_lossy()),
        None => "json".to_string(),
    });
    Ok(path)
}

/// Write `bytes` to `path` through a temporary file and a rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::now_v7()));
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Read a file, mapping "not found" to `None`.
pub(crate) async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove a file; a missing file is not an error.
pub(crate) async fn remove_optional(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
