//! Storage backend factory.
//!
//! Builds the checkpoint store, result channel and execution lock selected
//! by `[storage] backend` and hands them to an executor builder. All three
//! always come from the same backend.

use std::path::Path;
use std::time::Duration;

use machina_core::machine::MachineExecutorBuilder;
use machina_core::store::{
    BoxCheckpointStore, BoxExecutionLock, BoxResultChannel, MemoryCheckpointStore,
    MemoryExecutionLock, MemoryResultChannel,
};
use machina_types::config::{EngineConfig, StorageBackend};
use machina_types::error::StoreError;

use crate::config::effective_data_dir;
use crate::filesystem::{FileCheckpointStore, FileExecutionLock, FileResultChannel};
use crate::sqlite::{DatabasePool, SqliteCheckpointStore, SqliteExecutionLock, SqliteResultChannel};

/// The storage collaborators shared by every executor in a deployment.
#[derive(Clone)]
pub struct Backends {
    pub checkpoints: BoxCheckpointStore,
    pub channel: BoxResultChannel,
    pub lock: BoxExecutionLock,
    pub default_max_steps: u64,
}

impl Backends {
    /// Process-local backends.
    pub fn memory() -> Self {
        Self {
            checkpoints: BoxCheckpointStore::new(MemoryCheckpointStore::new()),
            channel: BoxResultChannel::new(MemoryResultChannel::new()),
            lock: BoxExecutionLock::new(MemoryExecutionLock::new()),
            default_max_steps: EngineConfig::default().defaults.max_steps,
        }
    }

    /// File backends under `data_dir`.
    pub fn file(data_dir: &Path, poll_interval: Duration) -> Self {
        Self {
            checkpoints: BoxCheckpointStore::new(FileCheckpointStore::in_data_dir(data_dir)),
            channel: BoxResultChannel::new(
                FileResultChannel::in_data_dir(data_dir).with_poll_interval(poll_interval),
            ),
            lock: BoxExecutionLock::new(FileExecutionLock::in_data_dir(data_dir)),
            default_max_steps: EngineConfig::default().defaults.max_steps,
        }
    }

    /// SQLite backends sharing one pool.
    pub fn sqlite(pool: DatabasePool, poll_interval: Duration) -> Self {
        Self {
            checkpoints: BoxCheckpointStore::new(SqliteCheckpointStore::new(pool.clone())),
            channel: BoxResultChannel::new(
                SqliteResultChannel::new(pool.clone()).with_poll_interval(poll_interval),
            ),
            lock: BoxExecutionLock::new(SqliteExecutionLock::new(pool)),
            default_max_steps: EngineConfig::default().defaults.max_steps,
        }
    }

    /// Build the backends named by `config`.
    pub async fn from_config(config: &EngineConfig) -> Result<Self, StoreError> {
        let poll_interval = Duration::from_millis(config.channel.poll_interval_ms);
        let backends = match config.storage.backend {
            StorageBackend::Memory => Self::memory(),
            StorageBackend::File => {
                let data_dir = effective_data_dir(config);
                tracing::info!(data_dir = %data_dir.display(), "using file storage");
                Self::file(&data_dir, poll_interval)
            }
            StorageBackend::Sqlite => {
                let data_dir = effective_data_dir(config);
                tracing::info!(data_dir = %data_dir.display(), "using sqlite storage");
                let pool = DatabasePool::open_in(&data_dir)
                    .await
                    .map_err(|e| StoreError::Query(e.to_string()))?;
                Self::sqlite(pool, poll_interval)
            }
        };
        Ok(Self {
            default_max_steps: config.defaults.max_steps,
            ..backends
        })
    }

    /// Install these backends on an executor builder.
    pub fn apply(&self, builder: MachineExecutorBuilder) -> MachineExecutorBuilder {
        builder
            .checkpoint_store(self.checkpoints.clone())
            .result_channel(self.channel.clone())
            .execution_lock(self.lock.clone())
            .default_max_steps(self.default_max_steps)
    }
}
