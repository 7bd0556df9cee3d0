use thiserror::Error;

/// Errors from storage backends (checkpoint store, result channel, lock).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("query error: {0}")]
    Query(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),
}
