//! Failure analysis and remediation planning

use crate::models::{Task, TaskStatus};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Timeout factor applied by a widen-timeouts action
pub const TIMEOUT_WIDEN_FACTOR: f64 = 2.0;
/// Delay before retried tasks become eligible again
pub const RETRY_BACKOFF_MS: u64 = 1000;
/// A failure ratio at or above this restarts the whole session
pub const RESTART_RATIO: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Timeout,
    Permission,
    Other,
}

fn timeout_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(timed?\s?out|deadline exceeded)\b").ok())
        .as_ref()
}

fn permission_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(permission|access denied|\bdenied\b|eacces|eperm|forbidden|unauthori[sz]ed)").ok()
    })
    .as_ref()
}

pub fn classify_error(message: &str) -> ErrorClass {
    if timeout_re().map_or(false, |re| re.is_match(message)) {
        ErrorClass::Timeout
    } else if permission_re().map_or(false, |re| re.is_match(message)) {
        ErrorClass::Permission
    } else {
        ErrorClass::Other
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureAnalysis {
    pub total: usize,
    pub failed: usize,
    pub failure_ratio: f64,
    pub timeouts: Vec<String>,
    pub permission_errors: Vec<String>,
    pub other_errors: Vec<String>,
    /// Agents that own at least one failed task
    pub failing_agents: BTreeSet<String>,
}

impl FailureAnalysis {
    pub fn failed_task_ids(&self) -> impl Iterator<Item = &String> {
        self.timeouts
            .iter()
            .chain(&self.permission_errors)
            .chain(&self.other_errors)
    }
}

pub fn analyze(tasks: &[Task]) -> FailureAnalysis {
    let mut analysis = FailureAnalysis {
        total: tasks.len(),
        ..Default::default()
    };

    for task in tasks.iter().filter(|t| t.status == TaskStatus::Failed) {
        analysis.failed += 1;
        analysis.failing_agents.insert(task.agent_id.clone());
        let bucket = match classify_error(task.last_error().unwrap_or_default()) {
            ErrorClass::Timeout => &mut analysis.timeouts,
            ErrorClass::Permission => &mut analysis.permission_errors,
            ErrorClass::Other => &mut analysis.other_errors,
        };
        bucket.push(task.id.clone());
    }

    if analysis.total > 0 {
        analysis.failure_ratio = analysis.failed as f64 / analysis.total as f64;
    }
    analysis
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RemediationAction {
    /// Re-queue the given failed tasks after a delay
    RetryWithBackoff { task_ids: Vec<String>, delay_ms: u64 },
    /// Re-queue a failed task on another agent
    ReassignAgent { task_id: String, from: String, to: String },
    /// Re-queue every failed task of the session
    RestartSession,
    /// Scale the session's task timeout
    WidenTimeouts { factor: f64 },
}

impl RemediationAction {
    pub fn name(&self) -> &'static str {
        match self {
            RemediationAction::RetryWithBackoff { .. } => "retry_with_backoff",
            RemediationAction::ReassignAgent { .. } => "reassign_agent",
            RemediationAction::RestartSession => "restart_session",
            RemediationAction::WidenTimeouts { .. } => "widen_timeouts",
        }
    }
}

/// Ordered remediation for a failure pattern. `tasks` maps failed ids back
/// to their owners for reassignment.
pub fn plan(analysis: &FailureAnalysis, tasks: &[Task], agents: &[String]) -> Vec<RemediationAction> {
    let mut actions = Vec::new();
    if analysis.failed == 0 {
        return actions;
    }

    if !analysis.timeouts.is_empty() {
        actions.push(RemediationAction::WidenTimeouts {
            factor: TIMEOUT_WIDEN_FACTOR,
        });
    }

    if analysis.failure_ratio >= RESTART_RATIO {
        actions.push(RemediationAction::RestartSession);
        return actions;
    }

    // Permission problems are agent-specific: move the work elsewhere
    let healthy: Vec<&String> = agents
        .iter()
        .filter(|a| !analysis.failing_agents.contains(*a))
        .collect();
    let mut retry: Vec<String> = Vec::new();
    for (i, task_id) in analysis.permission_errors.iter().enumerate() {
        let owner = tasks.iter().find(|t| &t.id == task_id).map(|t| t.agent_id.clone());
        let alternate = if healthy.is_empty() {
            agents.iter().find(|a| Some(*a) != owner.as_ref())
        } else {
            Some(healthy[i % healthy.len()])
        };
        match (owner, alternate) {
            (Some(from), Some(to)) => actions.push(RemediationAction::ReassignAgent {
                task_id: task_id.clone(),
                from,
                to: to.clone(),
            }),
            _ => retry.push(task_id.clone()),
        }
    }

    retry.extend(analysis.timeouts.iter().cloned());
    retry.extend(analysis.other_errors.iter().cloned());
    if !retry.is_empty() {
        actions.push(RemediationAction::RetryWithBackoff {
            task_ids: retry,
            delay_ms: RETRY_BACKOFF_MS,
        });
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewTask, TaskResult};

    fn failed(agent: &str, error: &str) -> Task {
        let mut task = Task::from_new(NewTask::new("s1", agent, "work"), 0);
        task.status = TaskStatus::Failed;
        task.error_history.push(error.to_string());
        task.result = Some(TaskResult::failure(error));
        task
    }

    fn done(agent: &str) -> Task {
        let mut task = Task::from_new(NewTask::new("s1", agent, "work"), 0);
        task.status = TaskStatus::Completed;
        task
    }

    fn agents(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("agent-{}", i)).collect()
    }

    #[test]
    fn test_classify_error() {
        assert_eq!(classify_error("Task timed out after 600s"), ErrorClass::Timeout);
        assert_eq!(classify_error("request timeout"), ErrorClass::Timeout);
        assert_eq!(classify_error("EACCES: permission denied, open '/etc'"), ErrorClass::Permission);
        assert_eq!(classify_error("403 Forbidden"), ErrorClass::Permission);
        assert_eq!(classify_error("syntax error"), ErrorClass::Other);
    }

    #[test]
    fn test_timeouts_widen_and_retry() {
        let tasks = vec![
            done("agent-1"),
            done("agent-2"),
            done("agent-3"),
            failed("agent-4", "timeout while compiling"),
            failed("agent-5", "Task timed out after 600s"),
        ];
        let analysis = analyze(&tasks);
        assert_eq!(analysis.failed, 2);
        assert!((analysis.failure_ratio - 0.4).abs() < 1e-9);
        assert_eq!(analysis.timeouts.len(), 2);

        let actions = plan(&analysis, &tasks, &agents(5));
        assert_eq!(actions[0], RemediationAction::WidenTimeouts { factor: 2.0 });
        assert!(matches!(
            &actions[1],
            RemediationAction::RetryWithBackoff { task_ids, .. } if task_ids.len() == 2
        ));
    }

    #[test]
    fn test_permission_errors_are_reassigned_to_healthy_agents() {
        let tasks = vec![
            done("agent-1"),
            done("agent-2"),
            done("agent-3"),
            failed("agent-3", "permission denied"),
        ];
        let analysis = analyze(&tasks);
        let actions = plan(&analysis, &tasks, &agents(3));
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            RemediationAction::ReassignAgent { from, to, .. } => {
                assert_eq!(from, "agent-3");
                assert_eq!(to, "agent-1");
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_single_agent_permission_error_falls_back_to_retry() {
        let tasks = vec![done("solo"), done("solo"), failed("solo", "access denied")];
        let analysis = analyze(&tasks);
        let actions = plan(&analysis, &tasks, &["solo".to_string()]);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].name(), "retry_with_backoff");
    }

    #[test]
    fn test_majority_failure_restarts_session() {
        let tasks = vec![failed("a", "boom"), failed("b", "boom"), done("c")];
        let actions = plan(&analyze(&tasks), &tasks, &agents(3));
        assert_eq!(actions, vec![RemediationAction::RestartSession]);
    }

    #[test]
    fn test_nothing_to_do_without_failures() {
        let tasks = vec![done("a")];
        assert!(plan(&analyze(&tasks), &tasks, &agents(1)).is_empty());
    }
}
