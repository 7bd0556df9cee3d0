//! Checkpoint store trait, in-memory backend, and key management.
//!
//! Snapshots are stored under `{execution_id}/step_{step:06}`. The zero
//! padding makes lexicographic key order match step order, so "latest" is the
//! max of a prefix listing.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use machina_types::error::StoreError;
use machina_types::snapshot::MachineSnapshot;

// ---------------------------------------------------------------------------
// CheckpointStore trait
// ---------------------------------------------------------------------------

/// Durable key/value storage for machine snapshots.
///
/// `save` must be atomic: `load` never observes a partially written snapshot.
/// Saving to an existing key overwrites it.
pub trait CheckpointStore: Send + Sync {
    fn save(
        &self,
        key: &str,
        snapshot: &MachineSnapshot,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn load(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<MachineSnapshot>, StoreError>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// All keys starting with `prefix`, sorted ascending.
    fn list(&self, prefix: &str) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;
}

/// Object-safe version of [`CheckpointStore`].
pub trait CheckpointStoreDyn: Send + Sync {
    fn save_boxed<'a>(
        &'a self,
        key: &'a str,
        snapshot: &'a MachineSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    fn load_boxed<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<MachineSnapshot>, StoreError>> + Send + 'a>>;

    fn delete_boxed<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    fn list_boxed<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, StoreError>> + Send + 'a>>;
}

impl<T: CheckpointStore> CheckpointStoreDyn for T {
    fn save_boxed<'a>(
        &'a self,
        key: &'a str,
        snapshot: &'a MachineSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(self.save(key, snapshot))
    }

    fn load_boxed<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<MachineSnapshot>, StoreError>> + Send + 'a>>
    {
        Box::pin(self.load(key))
    }

    fn delete_boxed<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(self.delete(key))
    }

    fn list_boxed<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, StoreError>> + Send + 'a>> {
        Box::pin(self.list(prefix))
    }
}

/// Type-erased checkpoint store shared by an executor and its children.
#[derive(Clone)]
pub struct BoxCheckpointStore {
    inner: Arc<dyn CheckpointStoreDyn>,
}

impl BoxCheckpointStore {
    pub fn new<T: CheckpointStore + 'static>(store: T) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    pub async fn save(&self, key: &str, snapshot: &MachineSnapshot) -> Result<(), StoreError> {
        self.inner.save_boxed(key, snapshot).await
    }

    pub async fn load(&self, key: &str) -> Result<Option<MachineSnapshot>, StoreError> {
        self.inner.load_boxed(key).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete_boxed(key).await
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list_boxed(prefix).await
    }
}

impl Default for BoxCheckpointStore {
    fn default() -> Self {
        Self::new(MemoryCheckpointStore::new())
    }
}

// ---------------------------------------------------------------------------
// MemoryCheckpointStore
// ---------------------------------------------------------------------------

/// Process-local checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: DashMap<String, MachineSnapshot>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, key: &str, snapshot: &MachineSnapshot) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<MachineSnapshot>, StoreError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Key formatting and latest-snapshot resolution over a [`BoxCheckpointStore`].
#[derive(Clone, Default)]
pub struct CheckpointManager {
    store: BoxCheckpointStore,
}

impl CheckpointManager {
    pub fn new(store: BoxCheckpointStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &BoxCheckpointStore {
        &self.store
    }

    /// `{execution_id}/step_{step:06}`.
    pub fn key(execution_id: &str, step: u64) -> String {
        format!("{execution_id}/step_{step:06}")
    }

    fn prefix(execution_id: &str) -> String {
        format!("{execution_id}/")
    }

    /// Persist a snapshot under its execution id and step. Returns the key.
    pub async fn save(&self, snapshot: &MachineSnapshot) -> Result<String, StoreError> {
        let key = Self::key(&snapshot.execution_id, snapshot.step);
        self.store.save(&key, snapshot).await?;
        tracing::debug!(
            execution_id = %snapshot.execution_id,
            step = snapshot.step,
            event = ?snapshot.event,
            "checkpoint saved"
        );
        Ok(key)
    }

    pub async fn load_step(
        &self,
        execution_id: &str,
        step: u64,
    ) -> Result<Option<MachineSnapshot>, StoreError> {
        self.store.load(&Self::key(execution_id, step)).await
    }

    /// Sorted checkpoint keys for one execution.
    pub async fn keys(&self, execution_id: &str) -> Result<Vec<String>, StoreError> {
        self.store.list(&Self::prefix(execution_id)).await
    }

    /// The snapshot with the highest step, if any. Steps are compared as
    /// numbers since the zero padding stops at six digits.
    pub async fn latest(&self, execution_id: &str) -> Result<Option<MachineSnapshot>, StoreError> {
        let prefix = Self::prefix(execution_id);
        let keys = self.keys(execution_id).await?;
        let newest = keys
            .iter()
            .filter_map(|key| step_of(key, &prefix).map(|step| (step, key)))
            .max_by_key(|(step, _)| *step);
        match newest {
            Some((_, key)) => self.store.load(key).await,
            None => Ok(None),
        }
    }

    pub async fn has_checkpoints(&self, execution_id: &str) -> Result<bool, StoreError> {
        Ok(!self.keys(execution_id).await?.is_empty())
    }

    /// Delete every checkpoint of an execution. Returns how many were removed.
    pub async fn delete_all(&self, execution_id: &str) -> Result<usize, StoreError> {
        let keys = self.keys(execution_id).await?;
        for key in &keys {
            self.store.delete(key).await?;
        }
        tracing::debug!(execution_id, deleted = keys.len(), "checkpoints deleted");
        Ok(keys.len())
    }
}

fn step_of(key: &str, prefix: &str) -> Option<u64> {
    key.strip_prefix(prefix)?.strip_prefix("step_")?.parse().ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
