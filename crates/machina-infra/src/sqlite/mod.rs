//! SQLite storage layer.
//!
//! Checkpoint store, result channel and execution lock backed by one SQLite
//! database with WAL mode and split read/write connection pools.

pub mod channel;
pub mod checkpoint;
pub mod lock;
pub mod pool;

use machina_types::error::StoreError;

pub use channel::SqliteResultChannel;
pub use checkpoint::SqliteCheckpointStore;
pub use lock::SqliteExecutionLock;
pub use pool::DatabasePool;

fn query_error(e: sqlx::Error) -> StoreError {
    StoreError::Query(e.to_string())
}
