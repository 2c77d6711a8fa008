//! Global configuration loader for Strata.
//!
//! Reads `config.toml` from the data directory (`~/.strata/` in production)
//! and deserializes it into [`GlobalConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;

use strata_types::config::GlobalConfig;

use crate::filesystem::config_path;
use crate::sqlite::pool::database_url;

/// Load global configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`GlobalConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the file exists and parses successfully, returns the parsed config.
pub async fn load_global_config(data_dir: &Path) -> GlobalConfig {
    let config_path = config_path(data_dir);

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

/// Database URL: the configured one, else `strata.db` in the data directory.
pub fn resolve_database_url(config: &GlobalConfig, data_dir: &Path) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(|| database_url(data_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_global_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_global_config(tmp.path()).await;
        assert!(config.database_url.is_none());
        assert_eq!(config.engine.daemon_workers, 4);
    }

    #[tokio::test]
    async fn load_global_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
database_url = "sqlite:///var/lib/strata/prov.db"

[engine]
daemon_workers = 16
max_poll_interval_ms = 30000
"#,
        )
        .await
        .unwrap();

        let config = load_global_config(tmp.path()).await;
        assert_eq!(config.engine.daemon_workers, 16);
        assert_eq!(config.engine.max_poll_interval_ms, 30_000);
        assert_eq!(config.engine.poll_interval_ms, 50);
        assert_eq!(
            resolve_database_url(&config, tmp.path()),
            "sqlite:///var/lib/strata/prov.db"
        );
    }

    #[tokio::test]
    async fn load_global_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_global_config(tmp.path()).await;
        assert_eq!(config.engine.poll_interval_ms, 50);
    }

    #[test]
    fn database_url_defaults_to_data_dir() {
        let tmp = TempDir::new().unwrap();
        let url = resolve_database_url(&GlobalConfig::default(), tmp.path());
        assert!(url.contains(&tmp.path().display().to_string()));
        assert!(url.ends_with("strata.db?mode=rwc"));
    }
}
