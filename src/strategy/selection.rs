//! Strategy selection scoring

use super::recovery::{classify_error, ErrorClass};
use crate::models::{CoordinationStrategy, StrategyDecision, Task, TaskPriority, TaskStatus};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Signals the selector scores against
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyContext {
    pub agent_count: usize,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    /// Completed over finished attempts; 1.0 before anything finished
    pub efficiency: f64,
    /// Failed over total
    pub error_rate: f64,
    /// 0.0 (trivial) to 1.0 (complex)
    pub complexity: f64,
    pub elapsed_secs: f64,
    /// Some failure looked like a timeout or a permission problem
    pub has_recoverable_errors: bool,
    /// Failed tasks whose last error was a timeout or a permission problem
    pub recoverable_failures: usize,
    pub resource_pressure: Option<f64>,
}

impl StrategyContext {
    pub fn from_tasks(tasks: &[Task], agent_count: usize, elapsed_secs: f64) -> Self {
        let completed = tasks.iter().filter(|t| t.status == TaskStatus::Completed).count();
        let failed = tasks.iter().filter(|t| t.status == TaskStatus::Failed).count();
        let failed_attempts: usize = tasks.iter().map(|t| t.error_history.len()).sum();

        let efficiency = if completed + failed_attempts == 0 {
            1.0
        } else {
            completed as f64 / (completed + failed_attempts) as f64
        };
        let error_rate = if tasks.is_empty() {
            0.0
        } else {
            failed as f64 / tasks.len() as f64
        };
        let recoverable_failures = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .filter_map(|t| t.last_error())
            .filter(|e| classify_error(e) != ErrorClass::Other)
            .count();

        Self {
            agent_count,
            total_tasks: tasks.len(),
            completed_tasks: completed,
            failed_tasks: failed,
            efficiency,
            error_rate,
            complexity: estimate_complexity(tasks),
            elapsed_secs,
            has_recoverable_errors: recoverable_failures > 0,
            recoverable_failures,
            resource_pressure: None,
        }
    }
}

/// Mean of description length, dependency fan-in and priority, each in [0, 1]
pub fn estimate_complexity(tasks: &[Task]) -> f64 {
    if tasks.is_empty() {
        return 0.0;
    }
    let total: f64 = tasks
        .iter()
        .map(|t| {
            let length = (t.description.len() as f64 / 500.0).min(1.0);
            let deps = (t.dependencies.len() as f64 / 3.0).min(1.0);
            let priority = match t.priority {
                TaskPriority::High => 1.0,
                TaskPriority::Medium => 0.5,
                TaskPriority::Low => 0.2,
            };
            0.4 * length + 0.3 * deps + 0.3 * priority
        })
        .sum();
    total / tasks.len() as f64
}

/// Weighted score of one strategy; higher is better
pub fn score(strategy: CoordinationStrategy, ctx: &StrategyContext) -> f64 {
    let agents = (ctx.agent_count as f64 / 5.0).min(1.0);
    let few_agents = if ctx.agent_count <= 2 { 1.0 } else { 0.0 };
    let many_agents = if ctx.agent_count > 3 { 1.0 } else { 0.0 };
    let late = (ctx.elapsed_secs / 600.0).min(1.0);
    let pressure = ctx.resource_pressure.unwrap_or(0.0);
    let recoverable = if ctx.has_recoverable_errors { 1.0 } else { 0.0 };
    let recoverable_count = ctx.recoverable_failures.min(4) as f64;

    let raw = match strategy {
        CoordinationStrategy::Parallel => {
            0.5 + 0.3 * ctx.efficiency + 0.1 * agents
                - 0.8 * ctx.error_rate
                - 0.2 * ctx.complexity
                - 0.3 * recoverable
        }
        CoordinationStrategy::Sequential => {
            0.3 + 0.3 * ctx.complexity + 0.2 * few_agents - 0.1 * agents + 0.1 * ctx.error_rate
        }
        CoordinationStrategy::PhasedParallel => {
            0.35 + 0.2 * ctx.complexity + 0.15 * agents + 0.1 * ctx.efficiency - 0.4 * ctx.error_rate
        }
        CoordinationStrategy::Adaptive => {
            0.3 + 0.3 * (1.0 - ctx.efficiency) + 0.1 * late - 0.2 * ctx.error_rate
        }
        CoordinationStrategy::Consensus => {
            0.2 + 0.3 * ctx.complexity + 0.1 * many_agents - 0.2 * ctx.error_rate
        }
        CoordinationStrategy::Pipeline => 0.25 + 0.25 * ctx.complexity + 0.3 * pressure,
        CoordinationStrategy::Recovery => {
            0.1 + 1.5 * ctx.error_rate + 0.25 * recoverable_count
        }
    };
    raw.max(0.0)
}

fn justification(strategy: CoordinationStrategy, ctx: &StrategyContext) -> String {
    let reason = match strategy {
        CoordinationStrategy::Parallel => "tasks are independent and execution is healthy",
        CoordinationStrategy::Sequential => "complex work with few agents benefits from one task at a time",
        CoordinationStrategy::PhasedParallel => "work splits into phases that can each run in parallel",
        CoordinationStrategy::Adaptive => "efficiency is low, pacing should follow live metrics",
        CoordinationStrategy::Consensus => "risky, complex work should be reviewed by the agents first",
        CoordinationStrategy::Pipeline => "resource pressure calls for staged execution",
        CoordinationStrategy::Recovery => "the failure rate requires remediation",
    };
    format!(
        "{}: {} (agents={}, efficiency={:.2}, error rate={:.2}, complexity={:.2})",
        strategy, reason, ctx.agent_count, ctx.efficiency, ctx.error_rate, ctx.complexity
    )
}

/// Highest-scoring strategy, re-evaluated one minute out
pub fn select_optimal_strategy(ctx: &StrategyContext) -> StrategyDecision {
    let mut scores: Vec<(CoordinationStrategy, f64)> = CoordinationStrategy::all()
        .iter()
        .map(|s| (*s, score(*s, ctx)))
        .collect();
    // Stable sort keeps declaration order on ties, so parallel wins a draw
    scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let (best, best_score) = scores[0];
    let runner_up = scores.get(1).map_or(0.0, |s| s.1);
    let confidence = if best_score > 0.0 {
        (0.5 + (best_score - runner_up) / best_score).min(1.0)
    } else {
        0.0
    };

    let mut parameters = HashMap::new();
    for (strategy, value) in &scores {
        parameters.insert(format!("score.{}", strategy), serde_json::json!(value));
    }

    StrategyDecision {
        strategy: best,
        justification: justification(best, ctx),
        confidence,
        parameters,
        next_evaluation: Utc::now() + Duration::minutes(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewTask, TaskResult};

    fn task(status: TaskStatus, error: Option<&str>) -> Task {
        let mut task = Task::from_new(NewTask::new("s1", "a", "implement feature"), 3);
        task.status = status;
        if let Some(e) = error {
            task.error_history.push(e.to_string());
            task.result = Some(TaskResult::failure(e));
        }
        task
    }

    #[test]
    fn test_fresh_session_prefers_parallel() {
        let tasks = vec![task(TaskStatus::Pending, None), task(TaskStatus::Pending, None)];
        let ctx = StrategyContext::from_tasks(&tasks, 4, 0.0);
        let decision = select_optimal_strategy(&ctx);
        assert_eq!(decision.strategy, CoordinationStrategy::Parallel);
        assert!(decision.next_evaluation > Utc::now());
        assert!(decision.justification.starts_with("parallel"));
    }

    #[test]
    fn test_timeouts_with_five_agents_favour_recovery() {
        let tasks = vec![
            task(TaskStatus::Completed, None),
            task(TaskStatus::Completed, None),
            task(TaskStatus::Completed, None),
            task(TaskStatus::Failed, Some("Task timed out after 600s")),
            task(TaskStatus::Failed, Some("connection timeout")),
        ];
        let ctx = StrategyContext::from_tasks(&tasks, 5, 120.0);
        assert!(ctx.has_recoverable_errors);
        assert!(
            score(CoordinationStrategy::Recovery, &ctx) > score(CoordinationStrategy::Parallel, &ctx)
        );
        assert_eq!(select_optimal_strategy(&ctx).strategy, CoordinationStrategy::Recovery);
    }

    fn timeouts_among(total: usize) -> Vec<Task> {
        let mut tasks: Vec<Task> = (0..total - 2).map(|_| task(TaskStatus::Completed, None)).collect();
        tasks.push(task(TaskStatus::Failed, Some("Task timed out after 600s")));
        tasks.push(task(TaskStatus::Failed, Some("connection timeout")));
        tasks
    }

    #[test]
    fn test_two_timeouts_favour_recovery_in_larger_sessions() {
        for total in [10, 20] {
            let ctx = StrategyContext::from_tasks(&timeouts_among(total), 5, 120.0);
            assert_eq!(ctx.recoverable_failures, 2);
            let recovery = score(CoordinationStrategy::Recovery, &ctx);
            let parallel = score(CoordinationStrategy::Parallel, &ctx);
            assert!(recovery > parallel, "{} tasks: recovery {} <= parallel {}", total, recovery, parallel);
            assert_eq!(select_optimal_strategy(&ctx).strategy, CoordinationStrategy::Recovery);
        }
    }

    #[test]
    fn test_unclassified_failures_do_not_count_as_recoverable() {
        let mut tasks = timeouts_among(10);
        for t in tasks.iter_mut().filter(|t| t.status == TaskStatus::Failed) {
            t.result = Some(TaskResult::failure("assertion failed"));
        }
        let ctx = StrategyContext::from_tasks(&tasks, 5, 120.0);
        assert!(!ctx.has_recoverable_errors);
        assert_eq!(ctx.recoverable_failures, 0);
    }

    #[test]
    fn test_pressure_favours_pipeline() {
        let ctx = StrategyContext {
            agent_count: 3,
            efficiency: 0.9,
            complexity: 0.9,
            resource_pressure: Some(0.95),
            ..Default::default()
        };
        assert!(score(CoordinationStrategy::Pipeline, &ctx) > score(CoordinationStrategy::Parallel, &ctx));
    }

    #[test]
    fn test_complexity_estimate() {
        let mut t = Task::from_new(NewTask::new("s", "a", &"x".repeat(1000)), 3);
        t.priority = TaskPriority::High;
        t.dependencies = vec!["a".into(), "b".into(), "c".into()];
        assert!((estimate_complexity(&[t]) - 1.0).abs() < 1e-9);
        assert_eq!(estimate_complexity(&[]), 0.0);
    }
}
