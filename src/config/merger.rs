// Configuration merging with priority

use crate::config::loader::{
    BackendConfig, ConflictConfig, OrchestratorConfig, QueueConfig, StageFailurePolicy,
    StrategyConfig, WorkspaceConfig,
};
use serde::{Deserialize, Serialize};

/// Partial configuration for merging
/// Uses Option<T> for all fields to support partial overrides
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PartialConfig {
    #[serde(default)]
    pub queue: Option<PartialQueueConfig>,
    #[serde(default)]
    pub workspace: Option<PartialWorkspaceConfig>,
    #[serde(default)]
    pub conflicts: Option<PartialConflictConfig>,
    #[serde(default)]
    pub strategy: Option<PartialStrategyConfig>,
    #[serde(default)]
    pub backend: Option<PartialBackendConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PartialQueueConfig {
    pub max_concurrent_tasks: Option<usize>,
    pub task_timeout_secs: Option<u64>,
    pub retry_backoff_ms: Option<u64>,
    pub default_max_retries: Option<u32>,
    pub timeout_sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PartialWorkspaceConfig {
    pub worktree_dir: Option<String>,
    pub state_file: Option<String>,
    pub base_branch: Option<String>,
    pub cleanup_grace_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PartialConflictConfig {
    pub recency_window_secs: Option<u64>,
    pub default_lock_secs: Option<u64>,
    pub lock_sweep_interval_secs: Option<u64>,
    pub sensitive_paths: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PartialStrategyConfig {
    pub tick_ms: Option<u64>,
    pub evaluation_interval_secs: Option<u64>,
    pub consensus_threshold: Option<f64>,
    pub voting_timeout_secs: Option<u64>,
    pub stage_failure_policy: Option<StageFailurePolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PartialBackendConfig {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
}

/// Configuration merger
/// Priority order: CLI -> Project -> Global -> Defaults
pub struct ConfigMerger {
    defaults: OrchestratorConfig,
    global: Option<OrchestratorConfig>,
    project: Option<OrchestratorConfig>,
    cli: Option<PartialConfig>,
}

impl ConfigMerger {
    /// Create a new config merger with defaults
    pub fn new() -> Self {
        Self {
            defaults: OrchestratorConfig::default(),
            global: None,
            project: None,
            cli: None,
        }
    }

    /// Set global config
    pub fn with_global(mut self, config: Option<OrchestratorConfig>) -> Self {
        self.global = config;
        self
    }

    /// Set project config
    pub fn with_project(mut self, config: Option<OrchestratorConfig>) -> Self {
        self.project = config;
        self
    }

    /// Set CLI overrides
    pub fn with_cli(mut self, config: Option<PartialConfig>) -> Self {
        self.cli = config;
        self
    }

    /// Merge all configs with priority
    pub fn merge(&self) -> OrchestratorConfig {
        let mut result = self.defaults.clone();

        if let Some(ref global) = self.global {
            result = self.merge_full(&result, global);
        }

        // Project overrides global
        if let Some(ref project) = self.project {
            result = self.merge_full(&result, project);
        }

        // CLI overrides have highest priority
        if let Some(ref cli) = self.cli {
            result = self.merge_partial(&result, cli);
        }

        result
    }

    /// Merge two full configs; only optional fields fall back to the base
    fn merge_full(
        &self,
        base: &OrchestratorConfig,
        over: &OrchestratorConfig,
    ) -> OrchestratorConfig {
        let mut merged = over.clone();
        merged.workspace.base_branch = over
            .workspace
            .base_branch
            .clone()
            .or_else(|| base.workspace.base_branch.clone());
        for (key, value) in &base.backend.env {
            merged
                .backend
                .env
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        merged
    }

    /// Merge partial config into full config
    fn merge_partial(&self, base: &OrchestratorConfig, partial: &PartialConfig) -> OrchestratorConfig {
        OrchestratorConfig {
            queue: partial
                .queue
                .as_ref()
                .map(|p| merge_partial_queue(&base.queue, p))
                .unwrap_or_else(|| base.queue.clone()),
            workspace: partial
                .workspace
                .as_ref()
                .map(|p| merge_partial_workspace(&base.workspace, p))
                .unwrap_or_else(|| base.workspace.clone()),
            conflicts: partial
                .conflicts
                .as_ref()
                .map(|p| merge_partial_conflicts(&base.conflicts, p))
                .unwrap_or_else(|| base.conflicts.clone()),
            strategy: partial
                .strategy
                .as_ref()
                .map(|p| merge_partial_strategy(&base.strategy, p))
                .unwrap_or_else(|| base.strategy.clone()),
            backend: partial
                .backend
                .as_ref()
                .map(|p| merge_partial_backend(&base.backend, p))
                .unwrap_or_else(|| base.backend.clone()),
        }
    }
}

impl Default for ConfigMerger {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_partial_queue(base: &QueueConfig, p: &PartialQueueConfig) -> QueueConfig {
    QueueConfig {
        max_concurrent_tasks: p.max_concurrent_tasks.unwrap_or(base.max_concurrent_tasks),
        task_timeout_secs: p.task_timeout_secs.unwrap_or(base.task_timeout_secs),
        retry_backoff_ms: p.retry_backoff_ms.unwrap_or(base.retry_backoff_ms),
        default_max_retries: p.default_max_retries.unwrap_or(base.default_max_retries),
        timeout_sweep_interval_secs: p
            .timeout_sweep_interval_secs
            .unwrap_or(base.timeout_sweep_interval_secs),
    }
}

fn merge_partial_workspace(base: &WorkspaceConfig, p: &PartialWorkspaceConfig) -> WorkspaceConfig {
    WorkspaceConfig {
        worktree_dir: p
            .worktree_dir
            .clone()
            .unwrap_or_else(|| base.worktree_dir.clone()),
        state_file: p.state_file.clone().unwrap_or_else(|| base.state_file.clone()),
        base_branch: p.base_branch.clone().or_else(|| base.base_branch.clone()),
        cleanup_grace_secs: p.cleanup_grace_secs.unwrap_or(base.cleanup_grace_secs),
        commit_author_name: base.commit_author_name.clone(),
        commit_author_email: base.commit_author_email.clone(),
    }
}

fn merge_partial_conflicts(base: &ConflictConfig, p: &PartialConflictConfig) -> ConflictConfig {
    ConflictConfig {
        recency_window_secs: p.recency_window_secs.unwrap_or(base.recency_window_secs),
        default_lock_secs: p.default_lock_secs.unwrap_or(base.default_lock_secs),
        lock_sweep_interval_secs: p
            .lock_sweep_interval_secs
            .unwrap_or(base.lock_sweep_interval_secs),
        sensitive_paths: p
            .sensitive_paths
            .clone()
            .unwrap_or_else(|| base.sensitive_paths.clone()),
    }
}

fn merge_partial_strategy(base: &StrategyConfig, p: &PartialStrategyConfig) -> StrategyConfig {
    StrategyConfig {
        tick_ms: p.tick_ms.unwrap_or(base.tick_ms),
        evaluation_interval_secs: p
            .evaluation_interval_secs
            .unwrap_or(base.evaluation_interval_secs),
        consensus_threshold: p.consensus_threshold.unwrap_or(base.consensus_threshold),
        voting_timeout_secs: p.voting_timeout_secs.unwrap_or(base.voting_timeout_secs),
        stage_failure_policy: p.stage_failure_policy.unwrap_or(base.stage_failure_policy),
        ..base.clone()
    }
}

fn merge_partial_backend(base: &BackendConfig, p: &PartialBackendConfig) -> BackendConfig {
    BackendConfig {
        command: p.command.clone().unwrap_or_else(|| base.command.clone()),
        args: p.args.clone().unwrap_or_else(|| base.args.clone()),
        env: base.env.clone(),
    }
}
