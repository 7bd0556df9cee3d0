//! Execution lock: non-blocking mutual exclusion keyed by execution id.
//!
//! `acquire` never waits. It returns `false` when another holder has the
//! key. `release` is idempotent. There is no expiry: a crashed holder keeps
//! the lock until something external clears it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashSet;
use machina_types::error::StoreError;

pub trait ExecutionLock: Send + Sync {
    fn acquire(&self, key: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn release(&self, key: &str) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Object-safe version of [`ExecutionLock`].
pub trait ExecutionLockDyn: Send + Sync {
    fn acquire_boxed<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>>;

    fn release_boxed<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;
}

impl<T: ExecutionLock> ExecutionLockDyn for T {
    fn acquire_boxed<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>> {
        Box::pin(self.acquire(key))
    }

    fn release_boxed<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(self.release(key))
    }
}

#[derive(Clone)]
pub struct BoxExecutionLock {
    inner: Arc<dyn ExecutionLockDyn>,
}

impl BoxExecutionLock {
    pub fn new<T: ExecutionLock + 'static>(lock: T) -> Self {
        Self {
            inner: Arc::new(lock),
        }
    }

    pub async fn acquire(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.acquire_boxed(key).await
    }

    pub async fn release(&self, key: &str) -> Result<(), StoreError> {
        self.inner.release_boxed(key).await
    }

    /// Acquire `key` and return a guard that releases it, or `None` when the
    /// key is held elsewhere.
    pub async fn try_lock(&self, key: &str) -> Result<Option<ExecutionLockGuard>, StoreError> {
        if self.acquire(key).await? {
            Ok(Some(ExecutionLockGuard {
                lock: self.clone(),
                key: key.to_string(),
                armed: true,
            }))
        } else {
            Ok(None)
        }
    }
}

/// A held execution lock.
///
/// Call [`ExecutionLockGuard::release`] on the normal exit path. If the guard
/// is dropped while still held (the owning future was cancelled) the release
/// is spawned onto the current tokio runtime.
pub struct ExecutionLockGuard {
    lock: BoxExecutionLock,
    key: String,
    armed: bool,
}

impl ExecutionLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) -> Result<(), StoreError> {
        self.armed = false;
        self.lock.release(&self.key).await
    }
}

impl Drop for ExecutionLockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let lock = self.lock.clone();
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match lock.release(&key).await {
                        Ok(()) => tracing::debug!(key, "execution lock released on drop"),
                        Err(e) => {
                            tracing::warn!(key, error = %e, "failed to release dropped execution lock")
                        }
                    }
                });
            }
            Err(_) => tracing::warn!(key, "execution lock dropped outside a runtime, left held"),
        }
    }
}

impl std::fmt::Debug for ExecutionLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLockGuard")
            .field("key", &self.key)
            .field("armed", &self.armed)
            .finish()
    }
}

impl Default for BoxExecutionLock {
    fn default() -> Self {
        Self::new(NoopExecutionLock)
    }
}

/// Always grants the lock. Correct for single-process deployments that never
/// resume the same execution concurrently.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExecutionLock;

impl ExecutionLock for NoopExecutionLock {
    async fn acquire(&self, _key: &str) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn release(&self, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Process-local lock set.
#[derive(Debug, Default)]
pub struct MemoryExecutionLock {
    held: DashSet<String>,
}

impl MemoryExecutionLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.contains(key)
    }
}

impl ExecutionLock for MemoryExecutionLock {
    async fn acquire(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.held.insert(key.to_string()))
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        self.held.remove(key);
        Ok(())
    }
}
