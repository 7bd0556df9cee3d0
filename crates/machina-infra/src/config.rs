//! Engine configuration loader for Machina.
//!
//! Reads `machina.toml` from the data directory (`~/.machina/` by default)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when
//! the file is missing or malformed.

use std::path::{Path, PathBuf};

use machina_types::config::EngineConfig;

use crate::filesystem::resolve_data_dir;

/// Name of the engine configuration file inside the data directory.
pub const CONFIG_FILE: &str = "machina.toml";

/// Smallest accepted poll interval for blocking reads.
const MIN_POLL_INTERVAL_MS: u64 = 1;

/// Load engine configuration from `{data_dir}/machina.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the file exists and parses successfully, returns the parsed config.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE} found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(mut config) => {
            config.channel.poll_interval_ms = config.channel.poll_interval_ms.max(MIN_POLL_INTERVAL_MS);
            config
        }
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// The directory backends should use.
///
/// Priority:
/// 1. `[storage] data_dir` from the config
/// 2. [`resolve_data_dir`] (`MACHINA_DATA_DIR`, then `~/.machina`)
pub fn effective_data_dir(config: &EngineConfig) -> PathBuf {
    config
        .storage
        .data_dir
        .clone()
        .unwrap_or_else(resolve_data_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use machina_types::config::StorageBackend;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.defaults.max_steps, 1000);
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"
[storage]
backend = "file"
data_dir = "/srv/machina"

[channel]
poll_interval_ms = 0

[defaults]
max_steps = 250
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert_eq!(config.defaults.max_steps, 250);
        // Zero would spin; clamped to the floor.
        assert_eq!(config.channel.poll_interval_ms, MIN_POLL_INTERVAL_MS);
        assert_eq!(effective_data_dir(&config), PathBuf::from("/srv/machina"));
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.storage.backend, StorageBackend::Memory);
    }

    #[tokio::test]
    async fn load_engine_config_unknown_backend_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE), "[storage]\nbackend = \"redis\"\n")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.storage.backend, StorageBackend::Memory);
    }
}
