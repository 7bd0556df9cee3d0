//! Engine configuration types for Machina.
//!
//! `EngineConfig` represents `machina.toml`, which selects the storage backend
//! shared by every executor in a deployment and sets engine-wide defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration. All fields have defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

/// Which backend holds checkpoints, results, and locks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process-local maps. Suitable for tests and single-process runs.
    #[default]
    Memory,
    /// One file per checkpoint/result/lock under `data_dir`.
    File,
    /// A SQLite database at `{data_dir}/machina.db`.
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Overrides the resolved data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Poll interval for blocking reads on shared backends.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    50
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Step budget applied to definitions that leave `max_steps` unset.
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
}

fn default_max_steps() -> u64 {
    1000
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
        }
    }
}
