//! Staged pipeline: planning, implementation, testing, deployment

pub use crate::config::Parallelization;
use crate::config::{StageFailurePolicy, StrategyConfig};
pub use crate::models::PipelineStage;
use crate::models::{Task, TaskStatus};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConfig {
    pub stage: PipelineStage,
    pub parallelization: Parallelization,
    pub failure_policy: StageFailurePolicy,
}

impl StageConfig {
    /// Dispatch limit for one tick of this stage
    pub fn limit(&self, cap: usize) -> usize {
        match self.parallelization {
            Parallelization::Parallel => cap.max(1),
            Parallelization::Sequential => 1,
        }
    }
}

/// The four canonical stages in execution order
pub fn default_stages(failure_policy: StageFailurePolicy) -> Vec<StageConfig> {
    PipelineStage::all()
        .iter()
        .map(|stage| StageConfig {
            stage: *stage,
            parallelization: match stage {
                PipelineStage::Planning | PipelineStage::Deployment => Parallelization::Sequential,
                PipelineStage::Implementation | PipelineStage::Testing => Parallelization::Parallel,
            },
            failure_policy,
        })
        .collect()
}

/// Built-in stages with the configured per-stage overrides applied
pub fn stage_configs(config: &StrategyConfig) -> Vec<StageConfig> {
    default_stages(config.stage_failure_policy)
        .into_iter()
        .map(|mut stage| {
            if let Some(settings) = config.stages.get(&stage.stage) {
                if let Some(mode) = settings.parallelization {
                    stage.parallelization = mode;
                }
                if let Some(policy) = settings.failure_policy {
                    stage.failure_policy = policy;
                }
            }
            stage
        })
        .collect()
}

fn stage_patterns() -> &'static [(PipelineStage, Option<Regex>)] {
    static PATTERNS: OnceLock<Vec<(PipelineStage, Option<Regex>)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                PipelineStage::Deployment,
                Regex::new(r"(?i)\b(deploy\w*|release|publish|ship|rollout)\b").ok(),
            ),
            (
                PipelineStage::Testing,
                Regex::new(r"(?i)\b(test\w*|verify|validate|qa|e2e)\b").ok(),
            ),
            (
                PipelineStage::Planning,
                Regex::new(r"(?i)\b(plan\w*|design|research|spec\w*|analy[sz]e)\b").ok(),
            ),
        ]
    })
}

/// Keyword inference; anything unmatched is implementation work
pub fn infer_stage(description: &str) -> PipelineStage {
    stage_patterns()
        .iter()
        .find(|(_, re)| re.as_ref().map_or(false, |re| re.is_match(description)))
        .map(|(stage, _)| *stage)
        .unwrap_or(PipelineStage::Implementation)
}

/// Declared stage, else inferred from the description
pub fn stage_for(task: &Task) -> PipelineStage {
    task.stage.unwrap_or_else(|| infer_stage(&task.description))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateResult {
    pub stage: PipelineStage,
    pub passed: bool,
    pub failure_ratio: f64,
    pub reason: String,
}

/// Post-stage check: the stage's failure ratio must not exceed `max_failure_ratio`
pub fn quality_gate(stage: PipelineStage, tasks: &[Task], max_failure_ratio: f64) -> GateResult {
    let in_stage: Vec<&Task> = tasks.iter().filter(|t| stage_for(t) == stage).collect();
    let failed = in_stage.iter().filter(|t| t.status == TaskStatus::Failed).count();
    let failure_ratio = if in_stage.is_empty() {
        0.0
    } else {
        failed as f64 / in_stage.len() as f64
    };
    let passed = failure_ratio <= max_failure_ratio;

    GateResult {
        stage,
        passed,
        failure_ratio,
        reason: if passed {
            format!("{} stage passed ({} task(s))", stage, in_stage.len())
        } else {
            format!(
                "{} stage failed its quality gate: {}/{} task(s) failed",
                stage,
                failed,
                in_stage.len()
            )
        },
    }
}

/// What the driver does once a stage has no live tasks left
#[derive(Debug, Clone, PartialEq)]
pub enum StageVerdict {
    Advance,
    /// Re-queue these failed tasks and stay on the stage
    Retry(Vec<String>),
    Halt(String),
}

/// Apply the failure policy, then the gate. `retried` tells whether this
/// stage already used its one retry.
pub fn stage_verdict(
    config: &StageConfig,
    tasks: &[Task],
    max_failure_ratio: f64,
    retried: bool,
) -> StageVerdict {
    let failed: Vec<String> = tasks
        .iter()
        .filter(|t| stage_for(t) == config.stage && t.status == TaskStatus::Failed)
        .map(|t| t.id.clone())
        .collect();

    if !failed.is_empty() {
        match config.failure_policy {
            StageFailurePolicy::Stop => {
                return StageVerdict::Halt(format!(
                    "{} stage stopped after {} failed task(s)",
                    config.stage,
                    failed.len()
                ))
            }
            StageFailurePolicy::Retry if !retried => return StageVerdict::Retry(failed),
            StageFailurePolicy::Retry => {
                return StageVerdict::Halt(format!(
                    "{} stage still has {} failed task(s) after retry",
                    config.stage,
                    failed.len()
                ))
            }
            // Failures are recorded and the gate is advisory
            StageFailurePolicy::Continue => {
                log::warn!(
                    "[Pipeline] {} stage finished with {} failed task(s), continuing",
                    config.stage,
                    failed.len()
                );
                return StageVerdict::Advance;
            }
        }
    }

    let gate = quality_gate(config.stage, tasks, max_failure_ratio);
    if gate.passed {
        StageVerdict::Advance
    } else {
        StageVerdict::Halt(gate.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewTask;

    fn task(desc: &str, status: TaskStatus) -> Task {
        let mut task = Task::from_new(NewTask::new("s1", "a", desc), 0);
        task.status = status;
        task
    }

    #[test]
    fn test_infer_stage() {
        assert_eq!(infer_stage("Design the storage schema"), PipelineStage::Planning);
        assert_eq!(infer_stage("Implement the parser"), PipelineStage::Implementation);
        assert_eq!(infer_stage("Write integration tests"), PipelineStage::Testing);
        assert_eq!(infer_stage("Deploy to staging"), PipelineStage::Deployment);
    }

    #[test]
    fn test_declared_stage_wins() {
        let mut t = task("Write tests", TaskStatus::Pending);
        t.stage = Some(PipelineStage::Implementation);
        assert_eq!(stage_for(&t), PipelineStage::Implementation);
    }

    #[test]
    fn test_default_stages_order_and_mode() {
        let stages = default_stages(StageFailurePolicy::Stop);
        let order: Vec<PipelineStage> = stages.iter().map(|s| s.stage).collect();
        assert_eq!(order, PipelineStage::all().to_vec());
        assert_eq!(stages[0].limit(4), 1);
        assert_eq!(stages[1].limit(4), 4);
    }

    #[test]
    fn test_stage_overrides_apply_per_stage() {
        use crate::config::StageSettings;

        let mut config = StrategyConfig::default();
        config.stage_failure_policy = StageFailurePolicy::Continue;
        config.stages.insert(
            PipelineStage::Implementation,
            StageSettings {
                parallelization: Some(Parallelization::Sequential),
                failure_policy: None,
            },
        );
        config.stages.insert(
            PipelineStage::Testing,
            StageSettings {
                parallelization: None,
                failure_policy: Some(StageFailurePolicy::Retry),
            },
        );

        let stages = stage_configs(&config);
        assert_eq!(stages[0].failure_policy, StageFailurePolicy::Continue);
        assert_eq!(stages[1].limit(4), 1);
        assert_eq!(stages[1].failure_policy, StageFailurePolicy::Continue);
        assert_eq!(stages[2].limit(4), 4);
        assert_eq!(stages[2].failure_policy, StageFailurePolicy::Retry);
        assert_eq!(stages[3].limit(4), 1);
    }

    #[test]
    fn test_quality_gate() {
        let tasks = vec![
            task("Write tests", TaskStatus::Completed),
            task("Verify output", TaskStatus::Failed),
        ];
        let gate = quality_gate(PipelineStage::Testing, &tasks, 0.0);
        assert!(!gate.passed);
        assert!((gate.failure_ratio - 0.5).abs() < 1e-9);
        assert!(quality_gate(PipelineStage::Testing, &tasks, 0.5).passed);
    }

    #[test]
    fn test_stage_verdict_policies() {
        let tasks = vec![
            task("Implement a", TaskStatus::Completed),
            task("Implement b", TaskStatus::Failed),
        ];
        let mut config = default_stages(StageFailurePolicy::Stop)[1].clone();
        assert!(matches!(stage_verdict(&config, &tasks, 0.0, false), StageVerdict::Halt(_)));

        config.failure_policy = StageFailurePolicy::Retry;
        assert!(matches!(stage_verdict(&config, &tasks, 0.0, false), StageVerdict::Retry(ids) if ids.len() == 1));
        assert!(matches!(stage_verdict(&config, &tasks, 0.0, true), StageVerdict::Halt(_)));

        config.failure_policy = StageFailurePolicy::Continue;
        assert_eq!(stage_verdict(&config, &tasks, 0.0, false), StageVerdict::Advance);
    }

    #[test]
    fn test_clean_stage_advances() {
        let tasks = vec![task("Implement a", TaskStatus::Completed)];
        let config = default_stages(StageFailurePolicy::Stop)[1].clone();
        assert_eq!(stage_verdict(&config, &tasks, 0.0, false), StageVerdict::Advance);
    }
}
