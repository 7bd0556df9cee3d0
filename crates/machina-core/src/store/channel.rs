//! Result channel: a write-once, many-reader rendezvous keyed by URI.
//!
//! Child machines write their final output (or an error wrapper) to
//! `{scheme}://{execution_id}/result`; parents block on a read of the same
//! URI. A blocking read that times out reports [`ReadOutcome::TimedOut`],
//! never [`ReadOutcome::Absent`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use machina_types::error::StoreError;
use serde_json::Value;
use tokio::sync::oneshot;

/// URI under which an execution publishes its result.
pub fn result_uri(scheme: &str, execution_id: &str) -> String {
    format!("{scheme}://{execution_id}/result")
}

/// How a read should wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Wait for a value if none is present yet.
    pub block: bool,
    /// Upper bound on a blocking wait. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl ReadOptions {
    pub fn non_blocking() -> Self {
        Self::default()
    }

    pub fn blocking(timeout: Option<Duration>) -> Self {
        Self {
            block: true,
            timeout,
        }
    }
}

/// Outcome of a [`ResultChannel::read`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Ready(Value),
    /// Nothing written (non-blocking read).
    Absent,
    /// A blocking read gave up after its timeout.
    TimedOut,
}

impl ReadOutcome {
    pub fn into_value(self) -> Option<Value> {
        match self {
            ReadOutcome::Ready(value) => Some(value),
            ReadOutcome::Absent | ReadOutcome::TimedOut => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ResultChannel trait
// ---------------------------------------------------------------------------

pub trait ResultChannel: Send + Sync {
    /// Store `data` at `uri` and wake every blocked reader.
    fn write(&self, uri: &str, data: &Value) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn read(
        &self,
        uri: &str,
        options: ReadOptions,
    ) -> impl Future<Output = Result<ReadOutcome, StoreError>> + Send;

    fn exists(&self, uri: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn delete(&self, uri: &str) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Object-safe version of [`ResultChannel`].
pub trait ResultChannelDyn: Send + Sync {
    fn write_boxed<'a>(
        &'a self,
        uri: &'a str,
        data: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    fn read_boxed<'a>(
        &'a self,
        uri: &'a str,
        options: ReadOptions,
    ) -> Pin<Box<dyn Future<Output = Result<ReadOutcome, StoreError>> + Send + 'a>>;

    fn exists_boxed<'a>(
        &'a self,
        uri: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>>;

    fn delete_boxed<'a>(
        &'a self,
        uri: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;
}

impl<T: ResultChannel> ResultChannelDyn for T {
    fn write_boxed<'a>(
        &'a self,
        uri: &'a str,
        data: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(self.write(uri, data))
    }

    fn read_boxed<'a>(
        &'a self,
        uri: &'a str,
        options: ReadOptions,
    ) -> Pin<Box<dyn Future<Output = Result<ReadOutcome, StoreError>> + Send + 'a>> {
        Box::pin(self.read(uri, options))
    }

    fn exists_boxed<'a>(
        &'a self,
        uri: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>> {
        Box::pin(self.exists(uri))
    }

    fn delete_boxed<'a>(
        &'a self,
        uri: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(self.delete(uri))
    }
}

/// Type-erased result channel shared by an executor tree.
#[derive(Clone)]
pub struct BoxResultChannel {
    inner: Arc<dyn ResultChannelDyn>,
}

impl BoxResultChannel {
    pub fn new<T: ResultChannel + 'static>(channel: T) -> Self {
        Self {
            inner: Arc::new(channel),
        }
    }

    pub async fn write(&self, uri: &str, data: &Value) -> Result<(), StoreError> {
        self.inner.write_boxed(uri, data).await
    }

    pub async fn read(&self, uri: &str, options: ReadOptions) -> Result<ReadOutcome, StoreError> {
        self.inner.read_boxed(uri, options).await
    }

    pub async fn exists(&self, uri: &str) -> Result<bool, StoreError> {
        self.inner.exists_boxed(uri).await
    }

    pub async fn delete(&self, uri: &str) -> Result<(), StoreError> {
        self.inner.delete_boxed(uri).await
    }
}

impl Default for BoxResultChannel {
    fn default() -> Self {
        Self::new(MemoryResultChannel::new())
    }
}

// ---------------------------------------------------------------------------
// MemoryResultChannel
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ChannelState {
    values: HashMap<String, Value>,
    waiters: HashMap<String, Vec<oneshot::Sender<Value>>>,
}

/// Process-local result channel.
///
/// Values and waiters sit behind one mutex so a read that registers a waiter
/// can never miss a concurrent write. `write` resolves every waiter before it
/// returns.
#[derive(Debug, Default)]
pub struct MemoryResultChannel {
    state: Mutex<ChannelState>,
}

impl MemoryResultChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ChannelState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Query("result channel mutex poisoned".to_string()))
    }

    /// Return the value, or register a waiter for it.
    fn value_or_waiter(
        &self,
        uri: &str,
    ) -> Result<Result<Value, oneshot::Receiver<Value>>, StoreError> {
        let mut state = self.lock()?;
        if let Some(value) = state.values.get(uri) {
            return Ok(Ok(value.clone()));
        }
        let (tx, rx) = oneshot::channel();
        let waiters = state.waiters.entry(uri.to_string()).or_default();
        waiters.retain(|w| !w.is_closed());
        waiters.push(tx);
        Ok(Err(rx))
    }
}

impl ResultChannel for MemoryResultChannel {
    async fn write(&self, uri: &str, data: &Value) -> Result<(), StoreError> {
        let waiters = {
            let mut state = self.lock()?;
            state.values.insert(uri.to_string(), data.clone());
            state.waiters.remove(uri).unwrap_or_default()
        };
        let woken = waiters
            .into_iter()
            .filter_map(|w| w.send(data.clone()).ok())
            .count();
        tracing::debug!(uri, woken, "result written");
        Ok(())
    }

    async fn read(&self, uri: &str, options: ReadOptions) -> Result<ReadOutcome, StoreError> {
        if !options.block {
            let state = self.lock()?;
            return Ok(state
                .values
                .get(uri)
                .cloned()
                .map_or(ReadOutcome::Absent, ReadOutcome::Ready));
        }

        let rx = match self.value_or_waiter(uri)? {
            Ok(value) => return Ok(ReadOutcome::Ready(value)),
            Err(rx) => rx,
        };

        let received = match options.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(received) => received,
                Err(_) => return Ok(ReadOutcome::TimedOut),
            },
            None => rx.await,
        };

        // A dropped sender means the channel itself went away.
        Ok(received.map_or(ReadOutcome::Absent, ReadOutcome::Ready))
    }

    async fn exists(&self, uri: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.values.contains_key(uri))
    }

    async fn delete(&self, uri: &str) -> Result<(), StoreError> {
        self.lock()?.values.remove(uri);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
