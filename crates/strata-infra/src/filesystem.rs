//! Data directory layout.

use std::path::{Path, PathBuf};

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `STRATA_DATA_DIR` environment variable
/// 2. `~/.strata`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STRATA_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".strata");
    }

    // Last resort: current directory
    PathBuf::from(".strata")
}

/// `{data_dir}/strata.db`
pub fn database_path(data_dir: &Path) -> PathBuf {
    data_dir.join("strata.db")
}

/// `{data_dir}/config.toml`
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

/// Parent of the local backend's per-job scratch directories: `{data_dir}/jobs/`.
pub fn jobs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("jobs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_live_under_the_data_dir() {
        let root = Path::new("/tmp/strata-test");
        assert_eq!(database_path(root), root.join("strata.db"));
        assert_eq!(config_path(root), root.join("config.toml"));
        assert_eq!(jobs_dir(root), root.join("jobs"));
    }

    #[test]
    fn resolve_data_dir_is_never_empty() {
        assert!(!resolve_data_dir().as_os_str().is_empty());
    }
}
