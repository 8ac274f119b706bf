//! Live performance metrics and adaptive transitions

use crate::config::StrategyConfig;
use crate::models::{CoordinationStrategy, Task, TaskStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    /// Completed tasks over finished attempts (successful or not)
    pub efficiency: f64,
    /// Terminally failed over total
    pub error_rate: f64,
    /// Completed tasks per minute of elapsed time
    pub throughput: f64,
    pub resource_pressure: Option<f64>,
}

impl PerformanceMetrics {
    pub fn compute(tasks: &[Task], elapsed_secs: f64, resource_pressure: Option<f64>) -> Self {
        let completed = tasks.iter().filter(|t| t.status == TaskStatus::Completed).count();
        let failed = tasks.iter().filter(|t| t.status == TaskStatus::Failed).count();
        let in_progress = tasks.iter().filter(|t| t.status == TaskStatus::InProgress).count();
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
        let minutes = (elapsed_secs / 60.0).max(1.0 / 60.0);

        Self {
            total: tasks.len(),
            completed,
            failed,
            in_progress,
            efficiency,
            error_rate,
            throughput: completed as f64 / minutes,
            resource_pressure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub to: CoordinationStrategy,
    pub reason: String,
}

/// Threshold check. Error rate wins over pressure, which wins over efficiency.
pub fn evaluate(
    metrics: &PerformanceMetrics,
    current: CoordinationStrategy,
    config: &StrategyConfig,
) -> Option<Transition> {
    let candidate = if metrics.error_rate > config.error_rate_threshold {
        Some(Transition {
            to: CoordinationStrategy::Recovery,
            reason: format!(
                "error rate {:.2} above {:.2}",
                metrics.error_rate, config.error_rate_threshold
            ),
        })
    } else if let Some(pressure) = metrics
        .resource_pressure
        .filter(|p| *p > config.resource_pressure_threshold)
    {
        Some(Transition {
            to: CoordinationStrategy::Pipeline,
            reason: format!(
                "resource pressure {:.2} above {:.2}",
                pressure, config.resource_pressure_threshold
            ),
        })
    } else if metrics.efficiency < config.efficiency_threshold {
        Some(Transition {
            to: CoordinationStrategy::Adaptive,
            reason: format!(
                "efficiency {:.2} below {:.2}",
                metrics.efficiency, config.efficiency_threshold
            ),
        })
    } else {
        None
    };

    candidate.filter(|t| t.to != current)
}

/// Per-tick dispatch limit under adaptive pacing: halve the cap while
/// efficiency is below threshold, quarter it under resource pressure
pub fn pacing_limit(metrics: &PerformanceMetrics, cap: usize, config: &StrategyConfig) -> usize {
    let mut limit = cap;
    if metrics.efficiency < config.efficiency_threshold {
        limit /= 2;
    }
    if metrics
        .resource_pressure
        .map_or(false, |p| p > config.resource_pressure_threshold)
    {
        limit /= 2;
    }
    limit.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewTask;

    fn task(status: TaskStatus, failures: usize) -> Task {
        let mut task = Task::from_new(NewTask::new("s1", "a", "work"), 3);
        task.status = status;
        task.error_history = (0..failures).map(|i| format!("error {}", i)).collect();
        task
    }

    #[test]
    fn test_compute_metrics() {
        let tasks = vec![
            task(TaskStatus::Completed, 1),
            task(TaskStatus::Completed, 0),
            task(TaskStatus::Failed, 1),
            task(TaskStatus::InProgress, 0),
        ];
        let m = PerformanceMetrics::compute(&tasks, 120.0, None);
        assert_eq!(m.completed, 2);
        assert_eq!(m.in_progress, 1);
        assert!((m.efficiency - 0.5).abs() < 1e-9);
        assert!((m.error_rate - 0.25).abs() < 1e-9);
        assert!((m.throughput - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_activity_is_fully_efficient() {
        let m = PerformanceMetrics::compute(&[task(TaskStatus::Pending, 0)], 0.0, None);
        assert_eq!(m.efficiency, 1.0);
        assert_eq!(evaluate(&m, CoordinationStrategy::Adaptive, &StrategyConfig::default()), None);
    }

    #[test]
    fn test_error_rate_switches_to_recovery() {
        let tasks = vec![task(TaskStatus::Failed, 1), task(TaskStatus::Completed, 0)];
        let m = PerformanceMetrics::compute(&tasks, 60.0, Some(0.9));
        let t = evaluate(&m, CoordinationStrategy::Parallel, &StrategyConfig::default()).unwrap();
        assert_eq!(t.to, CoordinationStrategy::Recovery);
        // Already recovering: nothing to do
        assert_eq!(evaluate(&m, CoordinationStrategy::Recovery, &StrategyConfig::default()), None);
    }

    #[test]
    fn test_pressure_switches_to_pipeline() {
        let tasks = vec![task(TaskStatus::Completed, 0)];
        let m = PerformanceMetrics::compute(&tasks, 60.0, Some(0.85));
        let t = evaluate(&m, CoordinationStrategy::Adaptive, &StrategyConfig::default()).unwrap();
        assert_eq!(t.to, CoordinationStrategy::Pipeline);
    }

    #[test]
    fn test_low_efficiency_paces_down() {
        let tasks = vec![task(TaskStatus::Completed, 2), task(TaskStatus::Pending, 1)];
        let m = PerformanceMetrics::compute(&tasks, 60.0, None);
        let config = StrategyConfig::default();
        assert_eq!(
            evaluate(&m, CoordinationStrategy::Parallel, &config).map(|t| t.to),
            Some(CoordinationStrategy::Adaptive)
        );
        assert_eq!(pacing_limit(&m, 6, &config), 3);
        assert_eq!(pacing_limit(&m, 1, &config), 1);
    }
}
