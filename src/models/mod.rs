// Data models shared by the queue, workspace manager and coordinator

pub mod state_machine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    High,
    Medium,
    Low,
}

impl TaskPriority {
    /// Dispatch rank, lower is dispatched first
    pub fn rank(&self) -> u8 {
        match self {
            TaskPriority::High => 0,
            TaskPriority::Medium => 1,
            TaskPriority::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::High => "high",
            TaskPriority::Medium => "medium",
            TaskPriority::Low => "low",
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Medium
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(TaskPriority::High),
            "medium" => Ok(TaskPriority::Medium),
            "low" => Ok(TaskPriority::Low),
            _ => Err(format!(
                "Unknown priority: '{}'. Expected one of: high, medium, low",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Blocked,
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Blocked => "blocked",
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Canonical pipeline stages, executed strictly in this order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Planning,
    Implementation,
    Testing,
    Deployment,
}

impl PipelineStage {
    pub fn all() -> &'static [PipelineStage] {
        &[
            PipelineStage::Planning,
            PipelineStage::Implementation,
            PipelineStage::Testing,
            PipelineStage::Deployment,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Planning => "planning",
            PipelineStage::Implementation => "implementation",
            PipelineStage::Testing => "testing",
            PipelineStage::Deployment => "deployment",
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome reported for one task attempt
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TaskResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub session_id: String,
    pub agent_id: String,
    pub description: String,
    pub priority: TaskPriority,
    pub dependencies: Vec<String>,
    pub status: TaskStatus,
    /// Assignment time, also the FIFO key within a priority band
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Number of times this task has been handed out
    pub attempt: u32,
    /// Retry backoff gate
    pub not_before: Option<DateTime<Utc>>,
    pub phase: Option<u32>,
    pub stage: Option<PipelineStage>,
    pub result: Option<TaskResult>,
    /// Errors from earlier failed attempts
    #[serde(default)]
    pub error_history: Vec<String>,
}

impl Task {
    /// Fresh record for an enqueue request; the queue decides the initial status
    pub fn from_new(spec: NewTask, default_max_retries: u32) -> Self {
        Task {
            id: crate::utils::generate_id("task"),
            session_id: spec.session_id,
            agent_id: spec.agent_id,
            description: spec.description,
            priority: spec.priority,
            dependencies: spec.dependencies,
            status: TaskStatus::Blocked,
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            attempt: 0,
            not_before: None,
            phase: spec.phase,
            stage: spec.stage,
            result: None,
            error_history: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        state_machine::is_terminal_state(self.status)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.result
            .as_ref()
            .and_then(|r| r.error.as_deref())
            .or_else(|| self.error_history.last().map(|s| s.as_str()))
    }

    pub fn wait_time_ms(&self) -> Option<i64> {
        self.started_at
            .map(|started| (started - self.enqueued_at).num_milliseconds())
    }

    pub fn execution_time_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some((completed - started).num_milliseconds()),
            _ => None,
        }
    }
}

/// Request to enqueue a task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub session_id: String,
    pub agent_id: String,
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub phase: Option<u32>,
    #[serde(default)]
    pub stage: Option<PipelineStage>,
}

impl NewTask {
    pub fn new(session_id: &str, agent_id: &str, description: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            description: description.to_string(),
            priority: TaskPriority::default(),
            dependencies: Vec::new(),
            max_retries: None,
            phase: None,
            stage: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_phase(mut self, phase: u32) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_stage(mut self, stage: PipelineStage) -> Self {
        self.stage = Some(stage);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationStrategy {
    Parallel,
    Sequential,
    PhasedParallel,
    Adaptive,
    Consensus,
    Pipeline,
    Recovery,
}

impl CoordinationStrategy {
    pub fn all() -> &'static [CoordinationStrategy] {
        &[
            CoordinationStrategy::Parallel,
            CoordinationStrategy::Sequential,
            CoordinationStrategy::PhasedParallel,
            CoordinationStrategy::Adaptive,
            CoordinationStrategy::Consensus,
            CoordinationStrategy::Pipeline,
            CoordinationStrategy::Recovery,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinationStrategy::Parallel => "parallel",
            CoordinationStrategy::Sequential => "sequential",
            CoordinationStrategy::PhasedParallel => "phased_parallel",
            CoordinationStrategy::Adaptive => "adaptive",
            CoordinationStrategy::Consensus => "consensus",
            CoordinationStrategy::Pipeline => "pipeline",
            CoordinationStrategy::Recovery => "recovery",
        }
    }
}

impl Default for CoordinationStrategy {
    fn default() -> Self {
        CoordinationStrategy::Parallel
    }
}

impl std::fmt::Display for CoordinationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CoordinationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "parallel" => Ok(CoordinationStrategy::Parallel),
            "sequential" => Ok(CoordinationStrategy::Sequential),
            "phased_parallel" | "phased" => Ok(CoordinationStrategy::PhasedParallel),
            "adaptive" => Ok(CoordinationStrategy::Adaptive),
            "consensus" => Ok(CoordinationStrategy::Consensus),
            "pipeline" => Ok(CoordinationStrategy::Pipeline),
            "recovery" => Ok(CoordinationStrategy::Recovery),
            _ => Err(format!(
                "Unknown strategy: '{}'. Expected one of: parallel, sequential, phased_parallel, adaptive, consensus, pipeline, recovery",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Planning,
    Executing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Planning => "planning",
            SessionStatus::Executing => "executing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Mutable coordination state carried by a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub current_phase: String,
    pub active_agents: Vec<String>,
    pub completed_agents: Vec<String>,
    #[serde(default)]
    pub shared_context: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub total_execution_ms: i64,
    /// Fraction of session wall time each agent spent executing tasks
    #[serde(default)]
    pub agent_utilization: HashMap<String, f64>,
}

/// A chosen strategy with the reasoning behind it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyDecision {
    pub strategy: CoordinationStrategy,
    pub justification: String,
    pub confidence: f64,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    pub next_evaluation: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyTransition {
    pub from: CoordinationStrategy,
    pub to: CoordinationStrategy,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub task_description: String,
    pub agents: Vec<String>,
    pub strategy: CoordinationStrategy,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Workspace ids owned by this session
    pub workspaces: Vec<String>,
    #[serde(default)]
    pub state: SessionState,
    #[serde(default)]
    pub metrics: SessionMetrics,
    #[serde(default)]
    pub strategy_history: Vec<StrategyTransition>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Active,
    Merged,
    Error,
    Cleaned,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Active => "active",
            WorkspaceStatus::Merged => "merged",
            WorkspaceStatus::Error => "error",
            WorkspaceStatus::Cleaned => "cleaned",
        }
    }

    /// Workspace still has a worktree on disk
    pub fn is_live(&self) -> bool {
        !matches!(self, WorkspaceStatus::Cleaned)
    }
}

impl std::fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub session_id: String,
    pub agent_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub created_at: DateTime<Utc>,
    pub status: WorkspaceStatus,
    pub error: Option<String>,
}

impl Workspace {
    /// Deterministic branch name for an agent's workspace
    pub fn branch_name(session_id: &str, agent_id: &str) -> String {
        format!("orchestrator/{}/{}", session_id, agent_id)
    }
}

/// One task inside a submitted plan; dependencies refer to other keys in the plan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanTask {
    pub key: String,
    pub agent_id: String,
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub phase: Option<u32>,
    #[serde(default)]
    pub stage: Option<PipelineStage>,
}

/// Caller-submitted plan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationPlan {
    pub description: String,
    pub agents: Vec<String>,
    #[serde(default)]
    pub strategy: CoordinationStrategy,
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
}

impl OrchestrationPlan {
    /// Tasks to enqueue; an empty task list becomes one task per agent
    pub fn decompose(&self) -> Vec<PlanTask> {
        if !self.tasks.is_empty() {
            return self.tasks.clone();
        }

        self.agents
            .iter()
            .map(|agent| PlanTask {
                key: agent.clone(),
                agent_id: agent.clone(),
                description: self.description.clone(),
                priority: TaskPriority::Medium,
                depends_on: Vec::new(),
                max_retries: None,
                phase: None,
                stage: None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    pub agent_id: String,
    pub branch: String,
    pub success: bool,
    pub fast_forward: bool,
    pub commit_id: Option<String>,
    pub conflict_files: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedTaskSummary {
    pub task_id: String,
    pub agent_id: String,
    pub description: String,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl From<&Task> for FailedTaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            agent_id: task.agent_id.clone(),
            description: task.description.clone(),
            error: task.last_error().map(|s| s.to_string()),
            retry_count: task.retry_count,
        }
    }
}

/// Terminal report for a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResult {
    pub session_id: String,
    pub status: SessionStatus,
    pub completed_tasks: Vec<String>,
    pub failed_tasks: Vec<FailedTaskSummary>,
    pub blocked_tasks: Vec<String>,
    /// Ids of conflicts that were neither resolved nor auto-merged
    pub unresolved_conflicts: Vec<String>,
    pub merges: Vec<MergeOutcome>,
    pub strategy_history: Vec<StrategyTransition>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionProgress {
    pub session_id: String,
    pub status: SessionStatus,
    pub strategy: CoordinationStrategy,
    pub phase: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub blocked: usize,
    pub percent: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_rank_orders_high_first() {
        assert!(TaskPriority::High.rank() < TaskPriority::Medium.rank());
        assert!(TaskPriority::Medium.rank() < TaskPriority::Low.rank());
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "phased-parallel".parse::<CoordinationStrategy>().unwrap(),
            CoordinationStrategy::PhasedParallel
        );
        assert_eq!(
            "Recovery".parse::<CoordinationStrategy>().unwrap(),
            CoordinationStrategy::Recovery
        );
        assert!("chaos".parse::<CoordinationStrategy>().is_err());
    }

    #[test]
    fn test_strategy_serializes_snake_case() {
        let json = serde_json::to_string(&CoordinationStrategy::PhasedParallel).unwrap();
        assert_eq!(json, "\"phased_parallel\"");
    }

    #[test]
    fn test_branch_name_is_deterministic() {
        assert_eq!(
            Workspace::branch_name("sess-1", "agent-a"),
            "orchestrator/sess-1/agent-a"
        );
    }

    #[test]
    fn test_plan_without_tasks_decomposes_per_agent() {
        let plan = OrchestrationPlan {
            description: "Add logging".to_string(),
            agents: vec!["a".to_string(), "b".to_string()],
            strategy: CoordinationStrategy::Parallel,
            tasks: vec![],
        };

        let tasks = plan.decompose();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].agent_id, "a");
        assert_eq!(tasks[1].description, "Add logging");
    }

    #[test]
    fn test_task_result_constructors() {
        let ok = TaskResult::success("done");
        assert!(ok.success);
        assert_eq!(ok.output.as_deref(), Some("done"));

        let err = TaskResult::failure("boom");
        assert!(!err.success);
        assert_eq!(err.error.as_deref(), Some("boom"));
    }
}
