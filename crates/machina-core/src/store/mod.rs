//! Storage seams shared by every executor in a tree: checkpoints, results,
//! and execution locks.
//!
//! Each trait uses RPITIT and ships with an in-memory implementation and a
//! type-erased `Box*` wrapper. Durable backends live in `machina-infra`.

pub mod channel;
pub mod checkpoint;
pub mod lock;

pub use channel::{
    BoxResultChannel, MemoryResultChannel, ReadOptions, ReadOutcome, ResultChannel, result_uri,
};
pub use checkpoint::{BoxCheckpointStore, CheckpointManager, CheckpointStore, MemoryCheckpointStore};
pub use lock::{
    BoxExecutionLock, ExecutionLock, ExecutionLockGuard, MemoryExecutionLock, NoopExecutionLock,
};
