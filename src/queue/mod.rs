//! Task queue
//!
//! Single-writer registry for every task in every session. All status
//! transitions go through one mutex, which also makes the concurrency
//! admission check atomic with respect to concurrent dequeues.
//!
//! Lifecycle: `blocked -> pending -> in_progress -> {completed | failed}`,
//! with `in_progress -> pending` for retries after a fixed backoff.

pub mod graph;

pub use graph::{DependencyGraph, DependencyValidationError};

use crate::config::QueueConfig;
use crate::events::{EventSink, OrchestratorEvent, TaskStatusChangedPayload};
use crate::models::state_machine::{transition_state, StateTransitionError};
use crate::models::{NewTask, PipelineStage, Task, TaskResult, TaskStatus};
use crate::utils::lock_mutex_recover;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Unknown dependency: {0}")]
    UnknownDependency(String),

    #[error("Invalid dependencies: {0}")]
    InvalidDependencies(#[from] DependencyValidationError),

    #[error("Task {0} is not in progress")]
    NotInProgress(String),

    #[error(transparent)]
    InvalidTransition(#[from] StateTransitionError),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Returned by `enqueue`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueReceipt {
    pub task_id: String,
    /// 1-based position among waiting tasks in dispatch order
    pub queue_position: usize,
}

/// Batch entry whose dependencies may refer to other entries by key
#[derive(Debug, Clone)]
pub struct BatchTask {
    pub key: String,
    pub task: NewTask,
    /// Keys of other entries in the same batch
    pub depends_on_keys: Vec<String>,
}

/// Restricts which pending tasks a dequeue may hand out
#[derive(Debug, Clone, Default)]
pub struct DequeueFilter {
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    /// Only tasks whose phase is at most this value (tasks without a phase always match)
    pub max_phase: Option<u32>,
    pub stage: Option<PipelineStage>,
    /// Cap on the session's in-progress tasks, on top of the global cap
    pub session_limit: Option<usize>,
}

impl DequeueFilter {
    pub fn for_session(session_id: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            ..Default::default()
        }
    }

    fn matches(&self, task: &Task) -> bool {
        if let Some(ref session_id) = self.session_id {
            if &task.session_id != session_id {
                return false;
            }
        }
        if let Some(ref agent_id) = self.agent_id {
            if &task.agent_id != agent_id {
                return false;
            }
        }
        if let (Some(max_phase), Some(phase)) = (self.max_phase, task.phase) {
            if phase > max_phase {
                return false;
            }
        }
        if let Some(stage) = self.stage {
            if task.stage != Some(stage) {
                return false;
            }
        }
        true
    }
}

/// Task counts and timing
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: usize,
    pub blocked: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    /// Mean enqueue-to-start time of started tasks
    pub average_wait_ms: f64,
    /// Mean start-to-finish time of completed tasks
    pub average_execution_ms: f64,
}

impl QueueStats {
    fn from_tasks<'a>(tasks: impl Iterator<Item = &'a Task>) -> Self {
        let mut stats = QueueStats::default();
        let mut wait_total = 0i64;
        let mut wait_count = 0usize;
        let mut exec_total = 0i64;
        let mut exec_count = 0usize;

        for task in tasks {
            stats.total += 1;
            match task.status {
                TaskStatus::Blocked => stats.blocked += 1,
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
            if let Some(wait) = task.wait_time_ms() {
                wait_total += wait;
                wait_count += 1;
            }
            if task.status == TaskStatus::Completed {
                if let Some(exec) = task.execution_time_ms() {
                    exec_total += exec;
                    exec_count += 1;
                }
            }
        }

        if wait_count > 0 {
            stats.average_wait_ms = wait_total as f64 / wait_count as f64;
        }
        if exec_count > 0 {
            stats.average_execution_ms = exec_total as f64 / exec_count as f64;
        }
        stats
    }
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<String, Task>,
    /// Insertion sequence, FIFO tie-breaker for equal timestamps
    sequence: HashMap<String, u64>,
    next_sequence: u64,
    /// Reverse edges: task id -> tasks that list it as a dependency
    dependents: HashMap<String, Vec<String>>,
    /// Per-session multiplier on the task timeout
    timeout_factors: HashMap<String, f64>,
}

impl QueueState {
    fn dispatch_key(&self, task: &Task) -> (u8, DateTime<Utc>, u64) {
        (
            task.priority.rank(),
            task.enqueued_at,
            self.sequence.get(&task.id).copied().unwrap_or(u64::MAX),
        )
    }

    fn in_progress_count(&self, session_id: Option<&str>) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .filter(|t| session_id.map_or(true, |s| t.session_id == s))
            .count()
    }

    fn dependencies_met(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .map_or(false, |d| d.status == TaskStatus::Completed)
        })
    }

    fn queue_position(&self, task_id: &str) -> usize {
        let Some(task) = self.tasks.get(task_id) else {
            return 0;
        };
        let key = self.dispatch_key(task);
        1 + self
            .tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Blocked))
            .filter(|t| t.id != task_id && self.dispatch_key(t) < key)
            .count()
    }

    /// Move a task to `to`, returning the notification to emit
    fn set_status(
        &mut self,
        task_id: &str,
        to: TaskStatus,
    ) -> QueueResult<OrchestratorEvent> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))?;
        let from = task.status;
        task.status = transition_state(from, to)?;

        Ok(OrchestratorEvent::TaskStatusChanged(TaskStatusChangedPayload {
            task_id: task.id.clone(),
            session_id: task.session_id.clone(),
            agent_id: task.agent_id.clone(),
            old_status: from.to_string(),
            new_status: to.to_string(),
            error: task.result.as_ref().and_then(|r| r.error.clone()),
        }))
    }

    /// Promote blocked dependents of a completed task whose dependencies are now all met
    fn promote_dependents(
        &mut self,
        completed_id: &str,
        events: &mut Vec<OrchestratorEvent>,
    ) -> QueueResult<()> {
        let candidates = self.dependents.get(completed_id).cloned().unwrap_or_default();
        for dependent_id in candidates {
            let ready = self
                .tasks
                .get(&dependent_id)
                .map_or(false, |t| t.status == TaskStatus::Blocked && self.dependencies_met(t));
            if ready {
                events.push(self.set_status(&dependent_id, TaskStatus::Pending)?);
                log::debug!("[TaskQueue] Task {} unblocked", dependent_id);
            }
        }
        Ok(())
    }

    /// Record a failed attempt: retry after backoff while attempts remain, else fail terminally
    fn fail_attempt(
        &mut self,
        task_id: &str,
        error: String,
        result: TaskResult,
        backoff: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<OrchestratorEvent> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))?;

        task.retry_count += 1;
        task.error_history.push(error.clone());

        if task.retry_count <= task.max_retries {
            log::info!(
                "[TaskQueue] Task {} failed (attempt {}/{}), retrying after {}ms: {}",
                task_id,
                task.retry_count,
                task.max_retries,
                backoff.num_milliseconds(),
                error
            );
            task.not_before = Some(now + backoff);
            task.started_at = None;
            task.result = None;
            self.set_status(task_id, TaskStatus::Pending)
        } else {
            log::warn!(
                "[TaskQueue] Task {} failed permanently after {} retries: {}",
                task_id,
                task.max_retries,
                error
            );
            task.completed_at = Some(now);
            task.result = Some(result);
            self.set_status(task_id, TaskStatus::Failed)
        }
    }
}

/// Priority/dependency-aware task queue with retry and timeout handling
pub struct TaskQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    events: Arc<dyn EventSink>,
}

impl TaskQueue {
    pub fn new(config: QueueConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            events,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn emit_all(&self, events: Vec<OrchestratorEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }

    fn backoff(&self) -> Duration {
        Duration::milliseconds(self.config.retry_backoff_ms as i64)
    }

    fn build_task(&self, spec: NewTask, now: DateTime<Utc>) -> Task {
        let mut task = Task::from_new(spec, self.config.default_max_retries);
        task.enqueued_at = now;
        task
    }

    fn insert_locked(state: &mut QueueState, mut task: Task) -> String {
        task.status = if state.dependencies_met(&task) {
            TaskStatus::Pending
        } else {
            TaskStatus::Blocked
        };
        for dep in &task.dependencies {
            state
                .dependents
                .entry(dep.clone())
                .or_default()
                .push(task.id.clone());
        }
        let id = task.id.clone();
        state.sequence.insert(id.clone(), state.next_sequence);
        state.next_sequence += 1;
        state.tasks.insert(id.clone(), task);
        id
    }

    fn enqueued_event(task: &Task) -> OrchestratorEvent {
        OrchestratorEvent::TaskStatusChanged(TaskStatusChangedPayload {
            task_id: task.id.clone(),
            session_id: task.session_id.clone(),
            agent_id: task.agent_id.clone(),
            old_status: "new".to_string(),
            new_status: task.status.to_string(),
            error: None,
        })
    }

    /// Add one task. Dependencies must name tasks already in the queue.
    pub fn enqueue(&self, spec: NewTask) -> QueueResult<EnqueueReceipt> {
        let now = Utc::now();
        let task = self.build_task(spec, now);

        let (receipt, event) = {
            let mut state = lock_mutex_recover(&self.state);

            if let Some(missing) = task
                .dependencies
                .iter()
                .find(|dep| !state.tasks.contains_key(dep.as_str()))
            {
                return Err(QueueError::UnknownDependency(missing.clone()));
            }

            let id = Self::insert_locked(&mut state, task);
            let position = state.queue_position(&id);
            let event = state.tasks.get(&id).map(Self::enqueued_event);
            (
                EnqueueReceipt {
                    task_id: id,
                    queue_position: position,
                },
                event,
            )
        };

        log::info!(
            "[TaskQueue] Enqueued task {} at position {}",
            receipt.task_id,
            receipt.queue_position
        );
        self.emit_all(event.into_iter().collect());
        Ok(receipt)
    }

    /// Add a set of tasks atomically. Keys are resolved to task ids; the whole
    /// batch is rejected if the combined graph has a cycle or an unknown reference.
    pub fn enqueue_batch(&self, batch: Vec<BatchTask>) -> QueueResult<HashMap<String, EnqueueReceipt>> {
        let now = Utc::now();

        let mut graph = DependencyGraph::new();
        for entry in &batch {
            graph.add_node(&entry.key);
        }
        for entry in &batch {
            for dep in entry.depends_on_keys.iter().chain(entry.task.dependencies.iter()) {
                graph.add_dependency(&entry.key, dep)?;
            }
        }

        let order = {
            let state = lock_mutex_recover(&self.state);
            graph.validate(|id| state.tasks.contains_key(id))?;
            graph.execution_order()?
        };

        let mut by_key: HashMap<String, BatchTask> =
            batch.into_iter().map(|b| (b.key.clone(), b)).collect();
        let mut ids: HashMap<String, String> = HashMap::new();
        let mut receipts = HashMap::new();
        let mut events = Vec::new();

        {
            let mut state = lock_mutex_recover(&self.state);
            // Dependencies first so that every referenced key already has an id
            for key in order {
                let Some(entry) = by_key.remove(&key) else {
                    continue;
                };
                let mut spec = entry.task;
                for dep_key in &entry.depends_on_keys {
                    if let Some(id) = ids.get(dep_key) {
                        spec.dependencies.push(id.clone());
                    }
                }
                let task = self.build_task(spec, now);
                let id = Self::insert_locked(&mut state, task);
                if let Some(task) = state.tasks.get(&id) {
                    events.push(Self::enqueued_event(task));
                }
                ids.insert(key.clone(), id);
            }

            for (key, id) in &ids {
                receipts.insert(
                    key.clone(),
                    EnqueueReceipt {
                        task_id: id.clone(),
                        queue_position: state.queue_position(id),
                    },
                );
            }
        }

        log::info!("[TaskQueue] Enqueued batch of {} tasks", receipts.len());
        self.emit_all(events);
        Ok(receipts)
    }

    /// Next ready task, optionally restricted to one agent
    pub fn dequeue_next(&self, agent_id: Option<&str>) -> Option<Task> {
        let filter = DequeueFilter {
            agent_id: agent_id.map(|s| s.to_string()),
            ..Default::default()
        };
        self.dequeue_matching(&filter, 1).into_iter().next()
    }

    /// Hand out up to `max` ready tasks matching `filter`, highest priority
    /// first then FIFO. Returns fewer (possibly none) once the global cap or
    /// the filter's session limit is reached.
    pub fn dequeue_matching(&self, filter: &DequeueFilter, max: usize) -> Vec<Task> {
        let now = Utc::now();
        let mut dispatched = Vec::new();
        let mut events = Vec::new();

        {
            let mut state = lock_mutex_recover(&self.state);

            let global_running = state.in_progress_count(None);
            let global_room = self.config.max_concurrent_tasks.saturating_sub(global_running);
            let session_room = match (filter.session_limit, filter.session_id.as_deref()) {
                (Some(limit), Some(session_id)) => {
                    limit.saturating_sub(state.in_progress_count(Some(session_id)))
                }
                (Some(limit), None) => limit.saturating_sub(global_running),
                (None, _) => usize::MAX,
            };
            let room = max.min(global_room).min(session_room);
            if room == 0 {
                return Vec::new();
            }

            let mut candidates: Vec<&Task> = state
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Pending)
                .filter(|t| t.not_before.map_or(true, |nb| nb <= now))
                .filter(|t| filter.matches(t))
                .collect();
            candidates.sort_by_key(|t| state.dispatch_key(t));
            let selected: Vec<String> = candidates
                .into_iter()
                .take(room)
                .map(|t| t.id.clone())
                .collect();

            for id in selected {
                match state.set_status(&id, TaskStatus::InProgress) {
                    Ok(event) => events.push(event),
                    Err(e) => {
                        log::warn!("[TaskQueue] Could not dispatch {}: {}", id, e);
                        continue;
                    }
                }
                if let Some(task) = state.tasks.get_mut(&id) {
                    task.attempt += 1;
                    task.started_at = Some(now);
                    task.not_before = None;
                    dispatched.push(task.clone());
                }
            }
        }

        for task in &dispatched {
            log::debug!(
                "[TaskQueue] Dispatched task {} to {} (attempt {})",
                task.id,
                task.agent_id,
                task.attempt
            );
        }
        self.emit_all(events);
        dispatched
    }

    /// Record the result of the current attempt of an in-progress task
    pub fn complete(&self, task_id: &str, result: TaskResult) -> QueueResult<Task> {
        let now = Utc::now();
        let mut events = Vec::new();

        let task = {
            let mut state = lock_mutex_recover(&self.state);
            let status = state
                .tasks
                .get(task_id)
                .map(|t| t.status)
                .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))?;
            if status != TaskStatus::InProgress {
                return Err(QueueError::NotInProgress(task_id.to_string()));
            }

            if result.success {
                if let Some(task) = state.tasks.get_mut(task_id) {
                    task.completed_at = Some(now);
                    task.result = Some(result);
                }
                events.push(state.set_status(task_id, TaskStatus::Completed)?);
                // Dependents become pending before anything else can be dispatched
                state.promote_dependents(task_id, &mut events)?;
            } else {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "Task failed without an error message".to_string());
                events.push(state.fail_attempt(task_id, error, result, self.backoff(), now)?);
            }

            state
                .tasks
                .get(task_id)
                .cloned()
                .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))?
        };

        if task.status == TaskStatus::Completed {
            log::info!("[TaskQueue] Task {} completed", task_id);
        }
        self.emit_all(events);
        Ok(task)
    }

    /// Like `complete`, but ignores results from an attempt that has since
    /// timed out or been superseded. Returns None for a stale result.
    pub fn complete_attempt(
        &self,
        task_id: &str,
        attempt: u32,
        result: TaskResult,
    ) -> QueueResult<Option<Task>> {
        {
            let state = lock_mutex_recover(&self.state);
            let task = state
                .tasks
                .get(task_id)
                .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))?;
            if task.status != TaskStatus::InProgress || task.attempt != attempt {
                log::info!(
                    "[TaskQueue] Ignoring stale result for task {} (attempt {}, current {})",
                    task_id,
                    attempt,
                    task.attempt
                );
                return Ok(None);
            }
        }

        match self.complete(task_id, result) {
            Ok(task) => Ok(Some(task)),
            // Lost a race with the timeout sweep between the two lock scopes
            Err(QueueError::NotInProgress(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fail a non-terminal task with `reason`; cancellation is never retried
    pub fn cancel(&self, task_id: &str, reason: &str) -> QueueResult<Task> {
        let mut events = Vec::new();
        let task = {
            let mut state = lock_mutex_recover(&self.state);
            Self::cancel_locked(&mut state, task_id, reason, &mut events)?
        };
        self.emit_all(events);
        Ok(task)
    }

    fn cancel_locked(
        state: &mut QueueState,
        task_id: &str,
        reason: &str,
        events: &mut Vec<OrchestratorEvent>,
    ) -> QueueResult<Task> {
        let now = Utc::now();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))?;

        if task.is_terminal() {
            return Ok(task.clone());
        }

        let mut result = TaskResult::failure(reason);
        result
            .metadata
            .insert("cancelled".to_string(), serde_json::Value::Bool(true));
        task.result = Some(result);
        task.completed_at = Some(now);
        task.not_before = None;

        events.push(state.set_status(task_id, TaskStatus::Failed)?);
        log::info!("[TaskQueue] Task {} cancelled: {}", task_id, reason);

        state
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))
    }

    /// Cancel every non-terminal task of a session; returns the cancelled ids
    pub fn cancel_session(&self, session_id: &str, reason: &str) -> Vec<String> {
        let mut events = Vec::new();
        let mut cancelled = Vec::new();
        {
            let mut state = lock_mutex_recover(&self.state);
            let ids: Vec<String> = state
                .tasks
                .values()
                .filter(|t| t.session_id == session_id && !t.is_terminal())
                .map(|t| t.id.clone())
                .collect();
            for id in ids {
                match Self::cancel_locked(&mut state, &id, reason, &mut events) {
                    Ok(_) => cancelled.push(id),
                    Err(e) => log::warn!("[TaskQueue] Failed to cancel {}: {}", id, e),
                }
            }
        }
        self.emit_all(events);
        cancelled
    }

    /// Fail in-progress tasks that exceeded their timeout; returns the affected ids
    pub fn sweep_timeouts(&self, now: DateTime<Utc>) -> Vec<String> {
        let base_timeout = self.config.task_timeout_secs as f64;
        let mut events = Vec::new();
        let mut timed_out = Vec::new();

        {
            let mut state = lock_mutex_recover(&self.state);
            let expired: Vec<(String, f64)> = state
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::InProgress)
                .filter_map(|t| {
                    let factor = state.timeout_factors.get(&t.session_id).copied().unwrap_or(1.0);
                    let limit = base_timeout * factor;
                    let started = t.started_at?;
                    let elapsed = (now - started).num_milliseconds() as f64 / 1000.0;
                    (elapsed > limit).then(|| (t.id.clone(), limit))
                })
                .collect();

            for (id, limit) in expired {
                let error = format!("Task timed out after {}s", limit.round() as u64);
                let result = TaskResult::failure(error.clone());
                // Backoff runs from wall-clock time, not the sweep's reference instant
                match state.fail_attempt(&id, error, result, self.backoff(), Utc::now()) {
                    Ok(event) => {
                        events.push(event);
                        timed_out.push(id);
                    }
                    Err(e) => log::warn!("[TaskQueue] Timeout sweep failed for {}: {}", id, e),
                }
            }
        }

        if !timed_out.is_empty() {
            log::warn!("[TaskQueue] Timed out {} task(s): {:?}", timed_out.len(), timed_out);
        }
        self.emit_all(events);
        timed_out
    }

    /// Give a terminally failed task a fresh retry budget, optionally on another agent
    pub fn requeue_failed(&self, task_id: &str, reassign_to: Option<&str>) -> QueueResult<Task> {
        self.requeue_failed_after(task_id, reassign_to, Duration::zero())
    }

    /// Re-queue a failed task that may not be dequeued until `delay` has passed
    pub fn requeue_failed_after(
        &self,
        task_id: &str,
        reassign_to: Option<&str>,
        delay: Duration,
    ) -> QueueResult<Task> {
        let now = Utc::now();
        let mut events = Vec::new();
        let task = {
            let mut state = lock_mutex_recover(&self.state);
            let ready = {
                let task = state
                    .tasks
                    .get(task_id)
                    .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))?;
                if task.status != TaskStatus::Failed {
                    return Err(QueueError::InvalidTransition(
                        StateTransitionError::InvalidTransition {
                            from: task.status,
                            to: TaskStatus::Pending,
                        },
                    ));
                }
                state.dependencies_met(task)
            };

            if let Some(task) = state.tasks.get_mut(task_id) {
                task.retry_count = 0;
                task.result = None;
                task.completed_at = None;
                task.started_at = None;
                task.not_before = (delay > Duration::zero()).then(|| now + delay);
                if let Some(agent) = reassign_to {
                    log::info!(
                        "[TaskQueue] Reassigning task {} from {} to {}",
                        task_id,
                        task.agent_id,
                        agent
                    );
                    task.agent_id = agent.to_string();
                }
            }
            let mut event = state.set_status(task_id, TaskStatus::Pending)?;
            if !ready {
                // Failed -> Pending -> Blocked is not a valid path; set directly
                if let Some(task) = state.tasks.get_mut(task_id) {
                    task.status = TaskStatus::Blocked;
                }
                if let OrchestratorEvent::TaskStatusChanged(payload) = &mut event {
                    payload.new_status = TaskStatus::Blocked.to_string();
                }
            }
            events.push(event);
            state
                .tasks
                .get(task_id)
                .cloned()
                .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))?
        };
        self.emit_all(events);
        Ok(task)
    }

    /// Scale the timeout for one session's tasks
    pub fn set_timeout_factor(&self, session_id: &str, factor: f64) {
        let mut state = lock_mutex_recover(&self.state);
        state
            .timeout_factors
            .insert(session_id.to_string(), factor.max(0.1));
    }

    pub fn timeout_factor(&self, session_id: &str) -> f64 {
        let state = lock_mutex_recover(&self.state);
        state.timeout_factors.get(session_id).copied().unwrap_or(1.0)
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        let state = lock_mutex_recover(&self.state);
        state.tasks.get(task_id).cloned()
    }

    /// All tasks of a session, in enqueue order
    pub fn tasks_for_session(&self, session_id: &str) -> Vec<Task> {
        let state = lock_mutex_recover(&self.state);
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| state.sequence.get(&t.id).copied().unwrap_or(u64::MAX));
        tasks
    }

    /// Ids of tasks that list `task_id` as a dependency
    pub fn dependents_of(&self, task_id: &str) -> Vec<String> {
        let state = lock_mutex_recover(&self.state);
        state.dependents.get(task_id).cloned().unwrap_or_default()
    }

    pub fn stats(&self) -> QueueStats {
        let state = lock_mutex_recover(&self.state);
        QueueStats::from_tasks(state.tasks.values())
    }

    pub fn session_stats(&self, session_id: &str) -> QueueStats {
        let state = lock_mutex_recover(&self.state);
        QueueStats::from_tasks(state.tasks.values().filter(|t| t.session_id == session_id))
    }

    /// Drop every task of a session (after its results have been collected)
    pub fn forget_session(&self, session_id: &str) -> usize {
        let mut state = lock_mutex_recover(&self.state);
        let ids: Vec<String> = state
            .tasks
            .values()
            .filter(|t| t.session_id == session_id)
            .map(|t| t.id.clone())
            .collect();
        for id in &ids {
            state.tasks.remove(id);
            state.sequence.remove(id);
            state.dependents.remove(id);
        }
        state.timeout_factors.remove(session_id);
        ids.len()
    }
}
