//! Application state wiring the store for CLI commands.
//!
//! The graph facade and checkpoint manager are generic over the repository
//! trait; AppState pins them to the SQLite implementation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use strata_core::checkpoint::CheckpointManager;
use strata_core::provenance::ProvenanceGraph;
use strata_infra::config::{load_global_config, resolve_database_url};
use strata_infra::filesystem::resolve_data_dir;
use strata_infra::sqlite::pool::DatabasePool;
use strata_infra::sqlite::provenance::SqliteProvenanceRepository;
use strata_types::config::GlobalConfig;

pub type Repo = SqliteProvenanceRepository;

/// Shared state for CLI commands.
pub struct AppState {
    pub repo: Arc<Repo>,
    pub graph: ProvenanceGraph<Repo>,
    pub checkpoints: CheckpointManager<Repo>,
    pub config: GlobalConfig,
    pub data_dir: PathBuf,
    pub database_url: String,
}

impl AppState {
    /// Open the store in the resolved data directory.
    pub async fn init() -> anyhow::Result<Self> {
        Self::open(resolve_data_dir()).await
    }

    pub async fn open(data_dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let config = load_global_config(&data_dir).await;
        let database_url = resolve_database_url(&config, &data_dir);
        let pool = DatabasePool::new(&database_url)
            .await
            .with_context(|| format!("failed to open database {database_url}"))?;

        tracing::debug!(
            data_dir = %data_dir.display(),
            database = %database_url,
            "opened provenance store"
        );

        let repo = Arc::new(SqliteProvenanceRepository::new(pool));
        Ok(Self {
            graph: ProvenanceGraph::from_shared(Arc::clone(&repo)),
            checkpoints: CheckpointManager::new(
                Arc::clone(&repo),
                config.engine.max_context_bytes,
            ),
            repo,
            config,
            data_dir,
            database_url,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A state over a fresh data directory that outlives the test.
    pub(crate) async fn temp_state() -> AppState {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        std::mem::forget(dir);
        AppState::open(path).await.unwrap()
    }

    #[tokio::test]
    async fn open_creates_database_in_data_dir() {
        let state = temp_state().await;
        assert!(state.data_dir.join("strata.db").exists());
        assert!(state.database_url.starts_with("sqlite://"));
        assert_eq!(state.config.engine.daemon_workers, 4);
    }
}
