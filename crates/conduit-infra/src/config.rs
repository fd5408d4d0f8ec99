//! Global configuration loader for Conduit.
//!
//! Reads `config.toml` from the data directory (`~/.conduit/` in production)
//! and deserializes it into [`GlobalConfig`]. Falls back to sensible defaults
//! when the file is missing or malformed.

use std::path::{Path, PathBuf};

use conduit_types::config::GlobalConfig;

use crate::sqlite::pool::database_url_for;

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "CONDUIT_DATA_DIR";

/// Resolve the data directory: `$CONDUIT_DATA_DIR`, else `~/.conduit`.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".conduit")
}

/// Load global configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`GlobalConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the file exists and parses successfully, returns the parsed config.
pub async fn load_global_config(data_dir: &Path) -> GlobalConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
    };

    match toml::from_str::<GlobalConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            GlobalConfig::default()
        }
    }
}

/// Resolve the database URL.
///
/// Priority: explicit override (CLI flag or env), then `database_url` from
/// `config.toml`, then `<data_dir>/conduit.db`.
pub fn resolve_database_url(
    config: &GlobalConfig,
    data_dir: &Path,
    override_url: Option<&str>,
) -> String {
    override_url
        .map(str::to_string)
        .or_else(|| config.database_url.clone())
        .unwrap_or_else(|| database_url_for(data_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_types::config::ConsumerMode;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_global_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_global_config(tmp.path()).await;
        assert_eq!(config, GlobalConfig::default());
    }

    #[tokio::test]
    async fn load_global_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
[consumer]
queues = ["workflow_requests", "review_requests"]
max_read_count = 2

[consumer.mode]
kind = "bounded_parallel"
max_parallel_workers = 4
timeout_ms = 5000
"#,
        )
        .await
        .unwrap();

        let config = load_global_config(tmp.path()).await;
        assert_eq!(config.consumer.queues.len(), 2);
        assert_eq!(config.consumer.max_read_count, 2);
        assert_eq!(
            config.consumer.mode,
            ConsumerMode::BoundedParallel {
                max_parallel_workers: 4,
                timeout_ms: 5_000
            }
        );
    }

    #[tokio::test]
    async fn load_global_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_global_config(tmp.path()).await;
        assert_eq!(config, GlobalConfig::default());
    }

    #[test]
    fn resolve_database_url_priority() {
        let dir = Path::new("/data");
        let mut config = GlobalConfig::default();

        assert_eq!(
            resolve_database_url(&config, dir, None),
            "sqlite:///data/conduit.db?mode=rwc"
        );

        config.database_url = Some("sqlite:///from/config.db".into());
        assert_eq!(
            resolve_database_url(&config, dir, None),
            "sqlite:///from/config.db"
        );
        assert_eq!(
            resolve_database_url(&config, dir, Some("sqlite:///flag.db")),
            "sqlite:///flag.db"
        );
    }
}
