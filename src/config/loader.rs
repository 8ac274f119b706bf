// Configuration file loading

use crate::models::PipelineStage;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// Orchestrator configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrchestratorConfig {
    /// Task queue settings
    #[serde(default)]
    pub queue: QueueConfig,
    /// Workspace isolation settings
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    /// Conflict manager settings
    #[serde(default)]
    pub conflicts: ConflictConfig,
    /// Strategy engine settings
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Execution backend settings
    #[serde(default)]
    pub backend: BackendConfig,
}

/// Task queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Global cap on in-progress tasks
    #[serde(rename = "maxConcurrentTasks", alias = "max_concurrent_tasks", default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    /// Elapsed time after which an in-progress task is failed
    #[serde(rename = "taskTimeoutSecs", alias = "task_timeout_secs", default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    /// Fixed delay before a failed task becomes dispatchable again
    #[serde(rename = "retryBackoffMs", alias = "retry_backoff_ms", default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// Max retries for tasks that don't specify their own
    #[serde(rename = "defaultMaxRetries", alias = "default_max_retries", default = "default_max_retries")]
    pub default_max_retries: u32,
    /// How often the timeout sweep runs
    #[serde(rename = "timeoutSweepIntervalSecs", alias = "timeout_sweep_interval_secs", default = "default_timeout_sweep")]
    pub timeout_sweep_interval_secs: u64,
}

fn default_max_concurrent() -> usize { 5 }
fn default_task_timeout() -> u64 { 600 }
fn default_retry_backoff() -> u64 { 5000 }
fn default_max_retries() -> u32 { 3 }
fn default_timeout_sweep() -> u64 { 5 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent(),
            task_timeout_secs: default_task_timeout(),
            retry_backoff_ms: default_retry_backoff(),
            default_max_retries: default_max_retries(),
            timeout_sweep_interval_secs: default_timeout_sweep(),
        }
    }
}

/// Workspace isolation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Worktree root, relative to the repository
    #[serde(rename = "worktreeDir", alias = "worktree_dir", default = "default_worktree_dir")]
    pub worktree_dir: String,
    /// Session store file, relative to the repository
    #[serde(rename = "stateFile", alias = "state_file", default = "default_state_file")]
    pub state_file: String,
    /// Branch agents fork from and merge into; resolved from HEAD when unset
    #[serde(rename = "baseBranch", alias = "base_branch", default)]
    pub base_branch: Option<String>,
    /// Delay between a terminal session state and workspace teardown
    #[serde(rename = "cleanupGraceSecs", alias = "cleanup_grace_secs", default = "default_cleanup_grace")]
    pub cleanup_grace_secs: u64,
    #[serde(rename = "commitAuthorName", alias = "commit_author_name", default = "default_author_name")]
    pub commit_author_name: String,
    #[serde(rename = "commitAuthorEmail", alias = "commit_author_email", default = "default_author_email")]
    pub commit_author_email: String,
}

fn default_worktree_dir() -> String { ".orchestrator/worktrees".to_string() }
fn default_state_file() -> String { ".orchestrator/sessions.json".to_string() }
fn default_cleanup_grace() -> u64 { 60 }
fn default_author_name() -> String { "Agent Orchestrator".to_string() }
fn default_author_email() -> String { "orchestrator@localhost".to_string() }

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            worktree_dir: default_worktree_dir(),
            state_file: default_state_file(),
            base_branch: None,
            cleanup_grace_secs: default_cleanup_grace(),
            commit_author_name: default_author_name(),
            commit_author_email: default_author_email(),
        }
    }
}

/// Conflict manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// Window in which another agent's operation on the same path counts as concurrent
    #[serde(rename = "recencyWindowSecs", alias = "recency_window_secs", default = "default_recency_window")]
    pub recency_window_secs: u64,
    /// Lease length when the requester doesn't give one
    #[serde(rename = "defaultLockSecs", alias = "default_lock_secs", default = "default_lock_secs")]
    pub default_lock_secs: u64,
    #[serde(rename = "lockSweepIntervalSecs", alias = "lock_sweep_interval_secs", default = "default_lock_sweep")]
    pub lock_sweep_interval_secs: u64,
    /// File names (or relative paths) whose edits are always high severity
    #[serde(rename = "sensitivePaths", alias = "sensitive_paths", default = "default_sensitive_paths")]
    pub sensitive_paths: Vec<String>,
}

fn default_recency_window() -> u64 { 30 }
fn default_lock_secs() -> u64 { 300 }
fn default_lock_sweep() -> u64 { 10 }
fn default_sensitive_paths() -> Vec<String> {
    [
        "package.json",
        "package-lock.json",
        "Cargo.toml",
        "Cargo.lock",
        "config.json",
        "tsconfig.json",
        ".env",
        "Dockerfile",
        "docker-compose.yml",
        "pyproject.toml",
        "go.mod",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            recency_window_secs: default_recency_window(),
            default_lock_secs: default_lock_secs(),
            lock_sweep_interval_secs: default_lock_sweep(),
            sensitive_paths: default_sensitive_paths(),
        }
    }
}

/// What a pipeline does when a stage has failed tasks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageFailurePolicy {
    /// Halt the pipeline
    Stop,
    /// Record the failures and move on to the next stage
    Continue,
    /// Re-queue the stage's failed tasks once before deciding
    Retry,
}

impl Default for StageFailurePolicy {
    fn default() -> Self {
        StageFailurePolicy::Stop
    }
}

/// How many of a pipeline stage's tasks may run at once
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Parallelization {
    Parallel,
    Sequential,
}

/// Overrides for one pipeline stage. Unset fields keep the stage's built-in
/// mode and the strategy-wide failure policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelization: Option<Parallelization>,
    #[serde(
        rename = "failurePolicy",
        alias = "failure_policy",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub failure_policy: Option<StageFailurePolicy>,
}

/// Strategy engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Dispatch loop period
    #[serde(rename = "tickMs", alias = "tick_ms", default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Adaptive re-evaluation period
    #[serde(rename = "evaluationIntervalSecs", alias = "evaluation_interval_secs", default = "default_evaluation_interval")]
    pub evaluation_interval_secs: u64,
    #[serde(rename = "efficiencyThreshold", alias = "efficiency_threshold", default = "default_efficiency_threshold")]
    pub efficiency_threshold: f64,
    #[serde(rename = "errorRateThreshold", alias = "error_rate_threshold", default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    #[serde(rename = "resourcePressureThreshold", alias = "resource_pressure_threshold", default = "default_pressure_threshold")]
    pub resource_pressure_threshold: f64,
    /// Fraction of respondents that must approve a gated task
    #[serde(rename = "consensusThreshold", alias = "consensus_threshold", default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
    #[serde(rename = "votingTimeoutSecs", alias = "voting_timeout_secs", default = "default_voting_timeout")]
    pub voting_timeout_secs: u64,
    /// Recovery succeeds only below this failure ratio
    #[serde(rename = "recoverySuccessRatio", alias = "recovery_success_ratio", default = "default_recovery_ratio")]
    pub recovery_success_ratio: f64,
    /// Highest failed/total ratio a pipeline stage may have and still pass its gate
    #[serde(rename = "qualityGateMaxFailureRatio", alias = "quality_gate_max_failure_ratio", default)]
    pub quality_gate_max_failure_ratio: f64,
    #[serde(rename = "stageFailurePolicy", alias = "stage_failure_policy", default)]
    pub stage_failure_policy: StageFailurePolicy,
    /// Per-stage overrides, e.g. `[strategy.stages.testing]`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stages: BTreeMap<PipelineStage, StageSettings>,
}

fn default_tick_ms() -> u64 { 500 }
fn default_evaluation_interval() -> u64 { 30 }
fn default_efficiency_threshold() -> f64 { 0.7 }
fn default_error_rate_threshold() -> f64 { 0.1 }
fn default_pressure_threshold() -> f64 { 0.8 }
fn default_consensus_threshold() -> f64 { 0.66 }
fn default_voting_timeout() -> u64 { 30 }
fn default_recovery_ratio() -> f64 { 0.1 }

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            evaluation_interval_secs: default_evaluation_interval(),
            efficiency_threshold: default_efficiency_threshold(),
            error_rate_threshold: default_error_rate_threshold(),
            resource_pressure_threshold: default_pressure_threshold(),
            consensus_threshold: default_consensus_threshold(),
            voting_timeout_secs: default_voting_timeout(),
            recovery_success_ratio: default_recovery_ratio(),
            quality_gate_max_failure_ratio: 0.0,
            stage_failure_policy: StageFailurePolicy::Stop,
            stages: BTreeMap::new(),
        }
    }
}

/// Execution backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Program started for each task
    #[serde(default = "default_backend_command")]
    pub command: String,
    /// Arguments; `{task}` and `{workspace}` are substituted
    #[serde(default = "default_backend_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_backend_command() -> String { "claude".to_string() }
fn default_backend_args() -> Vec<String> {
    vec!["-p".to_string(), "{task}".to_string()]
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_backend_command(),
            args: default_backend_args(),
            env: HashMap::new(),
        }
    }
}

/// Config loader
pub struct ConfigLoader {
    /// Global config path
    global_path: Option<PathBuf>,
    /// Project config path
    project_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self {
            global_path: Self::get_global_config_path(),
            project_path: None,
        }
    }

    /// Set the project path
    pub fn with_project_path(mut self, path: &Path) -> Self {
        self.project_path = Some(path.join(".orchestrator").join("config.toml"));
        self
    }

    /// Get the global config path
    fn get_global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("agent-orchestrator").join("config.toml"))
    }

    /// Load global config
    pub fn load_global(&self) -> Result<Option<OrchestratorConfig>> {
        if let Some(ref path) = self.global_path {
            self.load_from_path(path)
        } else {
            Ok(None)
        }
    }

    /// Load project config
    pub fn load_project(&self) -> Result<Option<OrchestratorConfig>> {
        if let Some(ref path) = self.project_path {
            self.load_from_path(path)
        } else {
            Ok(None)
        }
    }

    /// Load config from a specific path; a missing file is not an error
    pub fn load_from_path(&self, path: &Path) -> Result<Option<OrchestratorConfig>> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config file '{}': {}", path.display(), e))?;

        let config: OrchestratorConfig = toml::from_str(&contents)
            .map_err(|e| anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;

        validate_config(&config)?;

        Ok(Some(config))
    }

    /// Get the global config path
    pub fn global_config_path(&self) -> Option<&Path> {
        self.global_path.as_deref()
    }

    /// Get the project config path
    pub fn project_config_path(&self) -> Option<&Path> {
        self.project_path.as_deref()
    }

    /// Save config to a specific path
    pub fn save_to_path(&self, path: &Path, config: &OrchestratorConfig) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    anyhow!("Failed to create config directory '{}': {}", parent.display(), e)
                })?;
            }
        }

        validate_config(config)?;

        let contents = toml::to_string_pretty(config)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;

        fs::write(path, contents)
            .map_err(|e| anyhow!("Failed to write config file '{}': {}", path.display(), e))?;

        log::info!("Saved config to: {}", path.display());
        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate config values
pub fn validate_config(config: &OrchestratorConfig) -> Result<()> {
    if config.queue.max_concurrent_tasks == 0 {
        return Err(anyhow!("max_concurrent_tasks must be greater than 0"));
    }

    if config.queue.task_timeout_secs == 0 {
        return Err(anyhow!("task_timeout_secs must be greater than 0"));
    }

    if config.strategy.tick_ms == 0 {
        return Err(anyhow!("tick_ms must be greater than 0"));
    }

    let ratios = [
        ("efficiency_threshold", config.strategy.efficiency_threshold),
        ("error_rate_threshold", config.strategy.error_rate_threshold),
        ("resource_pressure_threshold", config.strategy.resource_pressure_threshold),
        ("consensus_threshold", config.strategy.consensus_threshold),
        ("recovery_success_ratio", config.strategy.recovery_success_ratio),
        ("quality_gate_max_failure_ratio", config.strategy.quality_gate_max_failure_ratio),
    ];
    for (name, value) in ratios {
        if !(0.0..=1.0).contains(&value) {
            return Err(anyhow!("{} must be between 0 and 1, got {}", name, value));
        }
    }

    if config.backend.command.trim().is_empty() {
        return Err(anyhow!("backend command cannot be empty"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_loads_global_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_dir = temp_dir.path().join("agent-orchestrator");
        fs::create_dir_all(&config_dir).unwrap();

        let config_content = r#"
[queue]
max_concurrent_tasks = 8
task_timeout_secs = 120

[conflicts]
recency_window_secs = 10
"#;

        fs::write(config_dir.join("config.toml"), config_content).unwrap();

        let loader = ConfigLoader {
            global_path: Some(config_dir.join("config.toml")),
            project_path: None,
        };

        let config = loader.load_global().unwrap().unwrap();
        assert_eq!(config.queue.max_concurrent_tasks, 8);
        assert_eq!(config.queue.task_timeout_secs, 120);
        assert_eq!(config.queue.retry_backoff_ms, 5000);
        assert_eq!(config.conflicts.recency_window_secs, 10);
    }

    #[test]
    fn test_loads_project_config_with_camel_case_keys() {
        let temp_dir = TempDir::new().unwrap();
        let config_dir = temp_dir.path().join(".orchestrator");
        fs::create_dir_all(&config_dir).unwrap();

        let config_content = r#"
[strategy]
consensusThreshold = 0.5
stageFailurePolicy = "continue"

[workspace]
baseBranch = "develop"
"#;

        fs::write(config_dir.join("config.toml"), config_content).unwrap();

        let loader = ConfigLoader::new().with_project_path(temp_dir.path());

        let config = loader.load_project().unwrap().unwrap();
        assert_eq!(config.strategy.consensus_threshold, 0.5);
        assert_eq!(
            config.strategy.stage_failure_policy,
            StageFailurePolicy::Continue
        );
        assert_eq!(config.workspace.base_branch.as_deref(), Some("develop"));
    }

    #[test]
    fn test_loads_per_stage_settings() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        let config_content = r#"
[strategy]
stageFailurePolicy = "continue"

[strategy.stages.implementation]
parallelization = "sequential"

[strategy.stages.testing]
failurePolicy = "retry"

[strategy.stages.deployment]
failure_policy = "stop"
"#;
        fs::write(&path, config_content).unwrap();

        let config = ConfigLoader::new().load_from_path(&path).unwrap().unwrap();
        let stages = &config.strategy.stages;
        assert_eq!(stages.len(), 3);
        assert_eq!(
            stages[&PipelineStage::Implementation].parallelization,
            Some(Parallelization::Sequential)
        );
        assert_eq!(stages[&PipelineStage::Implementation].failure_policy, None);
        assert_eq!(
            stages[&PipelineStage::Testing].failure_policy,
            Some(StageFailurePolicy::Retry)
        );
        assert_eq!(
            stages[&PipelineStage::Deployment].failure_policy,
            Some(StageFailurePolicy::Stop)
        );
        assert!(!stages.contains_key(&PipelineStage::Planning));
    }

    #[test]
    fn test_handles_missing_config_files_gracefully() {
        let temp_dir = TempDir::new().unwrap();
        let loader = ConfigLoader::new().with_project_path(temp_dir.path());

        let project = loader.load_project().unwrap();
        assert!(project.is_none());
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "[queue]\nmax_concurrent_tasks = 0\n").unwrap();

        let loader = ConfigLoader::new();
        let result = loader.load_from_path(&path);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_out_of_range_threshold() {
        let mut config = OrchestratorConfig::default();
        config.strategy.error_rate_threshold = 1.5;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("error_rate_threshold"));
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = OrchestratorConfig::default();
        config.queue.max_concurrent_tasks = 2;
        config.backend.args = vec!["run".to_string(), "{task}".to_string()];

        let loader = ConfigLoader::new();
        loader.save_to_path(&path, &config).unwrap();

        let loaded = loader.load_from_path(&path).unwrap().unwrap();
        assert_eq!(loaded.queue.max_concurrent_tasks, 2);
        assert_eq!(loaded.backend.args, vec!["run", "{task}"]);
    }

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.conflicts.default_lock_secs, 300);
        assert_eq!(config.strategy.evaluation_interval_secs, 30);
        assert!(config
            .conflicts
            .sensitive_paths
            .contains(&"config.json".to_string()));
    }
}
