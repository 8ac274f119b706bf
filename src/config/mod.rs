// Layered configuration system

pub mod loader;
pub mod merger;

pub use loader::{
    validate_config, BackendConfig, ConfigLoader, ConflictConfig, OrchestratorConfig,
    Parallelization, QueueConfig, StageFailurePolicy, StageSettings, StrategyConfig,
    WorkspaceConfig,
};
pub use merger::{ConfigMerger, PartialConfig, PartialQueueConfig, PartialStrategyConfig};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Load and merge configuration from all sources
/// Priority: CLI -> Project -> Global -> Defaults
pub fn load_merged_config(
    project_path: Option<&Path>,
    cli_overrides: Option<PartialConfig>,
) -> Result<OrchestratorConfig> {
    let loader = if let Some(path) = project_path {
        ConfigLoader::new().with_project_path(path)
    } else {
        ConfigLoader::new()
    };

    let global = loader.load_global().context("Invalid global config")?;
    let project = loader.load_project().context("Invalid project config")?;

    let config = ConfigMerger::new()
        .with_global(global)
        .with_project(project)
        .with_cli(cli_overrides)
        .merge();

    validate_config(&config)?;
    Ok(config)
}

/// Get config file paths for debugging
pub fn get_config_paths(project_path: Option<&Path>) -> (Option<PathBuf>, Option<PathBuf>) {
    let loader = if let Some(path) = project_path {
        ConfigLoader::new().with_project_path(path)
    } else {
        ConfigLoader::new()
    };

    (
        loader.global_config_path().map(|p| p.to_path_buf()),
        loader.project_config_path().map(|p| p.to_path_buf()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_merged_config_with_project() {
        let temp_dir = TempDir::new().unwrap();
        let config_dir = temp_dir.path().join(".orchestrator");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(
            config_dir.join("config.toml"),
            "[queue]\nmax_concurrent_tasks = 3\n",
        )
        .unwrap();

        let config = load_merged_config(Some(temp_dir.path()), None).unwrap();
        assert_eq!(config.queue.max_concurrent_tasks, 3);
    }

    #[test]
    fn test_invalid_project_config_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let config_dir = temp_dir.path().join(".orchestrator");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join("config.toml"), "[queue\nbroken").unwrap();

        assert!(load_merged_config(Some(temp_dir.path()), None).is_err());
    }

    #[test]
    fn test_cli_overrides_are_validated() {
        let cli = PartialConfig {
            queue: Some(PartialQueueConfig {
                max_concurrent_tasks: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let temp_dir = TempDir::new().unwrap();
        assert!(load_merged_config(Some(temp_dir.path()), Some(cli)).is_err());
    }

    #[test]
    fn test_get_config_paths() {
        let temp_dir = TempDir::new().unwrap();
        let (_, project) = get_config_paths(Some(temp_dir.path()));
        assert_eq!(
            project.unwrap(),
            temp_dir.path().join(".orchestrator").join("config.toml")
        );
    }
}
