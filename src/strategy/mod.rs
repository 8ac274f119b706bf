//! Coordination strategy engine
//!
//! The `Coordinator` drives a session end to end: it creates the workspaces,
//! enqueues the decomposed plan, and then runs a dispatch loop that pulls
//! ready tasks from the queue at a pace set by the active strategy. Adaptive
//! sessions re-evaluate live metrics on a fixed interval and may switch
//! strategy mid-flight. On a terminal state successful agents are merged
//! back and workspace cleanup is scheduled after a grace period.

pub mod adaptive;
pub mod consensus;
pub mod pipeline;
pub mod recovery;
pub mod selection;

pub use selection::{select_optimal_strategy, StrategyContext};

use crate::backend::{AgentHandle, BackendError, ExecutionBackend, ResourceProbe, Voter};
use crate::config::OrchestratorConfig;
use crate::conflicts::{ConflictError, ConflictManager};
use crate::events::{
    ConsensusDecidedPayload, EventSink, OrchestratorEvent, RecoveryEscalatedPayload,
    StrategyChangedPayload, StrategyFailedPayload,
};
use crate::isolation::{WorkspaceError, WorkspaceManager};
use crate::models::{
    CoordinationStrategy, ExecutionProgress, FailedTaskSummary, NewTask, OrchestrationPlan,
    PipelineStage, SessionResult, SessionStatus, StrategyDecision, StrategyTransition, Task,
    TaskResult, TaskStatus, WorkspaceStatus,
};
use crate::queue::{BatchTask, DequeueFilter, QueueError, TaskQueue};
use crate::shutdown::{ShutdownResult, ShutdownState};
use crate::utils::lock_mutex_recover;
use chrono::Utc;
use recovery::RemediationAction;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

/// Recovery rounds a session may run before its outcome is judged
const MAX_RECOVERY_ROUNDS: u32 = 1;
/// Consecutive idle ticks before a session with undispatchable work is halted
const STALL_TICKS: u32 = 3;
/// How long `shutdown` waits for dispatch loops to wind down
const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Session {0} is already executing")]
    AlreadyRunning(String),

    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type StrategyResult<T> = Result<T, StrategyError>;

/// Everything the coordinator talks to
pub struct CoordinatorDeps {
    pub config: OrchestratorConfig,
    pub queue: Arc<TaskQueue>,
    pub workspaces: Arc<WorkspaceManager>,
    pub conflicts: Arc<ConflictManager>,
    pub backend: Arc<dyn ExecutionBackend>,
    pub voter: Arc<dyn Voter>,
    pub probe: Arc<dyn ResourceProbe>,
    pub events: Arc<dyn EventSink>,
    pub shutdown: ShutdownState,
}

/// Blocked tasks that can never run: a dependency failed, directly or
/// through another such task
pub fn stuck_tasks(tasks: &[Task]) -> HashSet<String> {
    let status: HashMap<&str, TaskStatus> =
        tasks.iter().map(|t| (t.id.as_str(), t.status)).collect();
    let mut stuck: HashSet<String> = HashSet::new();

    loop {
        let newly: Vec<String> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Blocked && !stuck.contains(&t.id))
            .filter(|t| {
                t.dependencies.iter().any(|d| {
                    status.get(d.as_str()) == Some(&TaskStatus::Failed) || stuck.contains(d)
                })
            })
            .map(|t| t.id.clone())
            .collect();
        if newly.is_empty() {
            return stuck;
        }
        stuck.extend(newly);
    }
}

/// Lowest phase that still has live work; later phases wait for it
pub fn current_phase(tasks: &[Task]) -> Option<u32> {
    let stuck = stuck_tasks(tasks);
    tasks
        .iter()
        .filter(|t| !t.is_terminal() && !stuck.contains(&t.id))
        .filter_map(|t| t.phase)
        .min()
}

/// Per-session execution state kept alongside the persisted session
struct RunState {
    strategy: CoordinationStrategy,
    /// Started as adaptive: metrics are re-evaluated on a fixed interval
    supervised: bool,
    running: bool,
    cancelled: Option<String>,
    stage_index: usize,
    retried_stages: HashSet<PipelineStage>,
    recovery_rounds: u32,
    phase_label: String,
}

impl RunState {
    fn new(strategy: CoordinationStrategy) -> Self {
        Self {
            strategy,
            supervised: strategy == CoordinationStrategy::Adaptive,
            running: false,
            cancelled: None,
            stage_index: 0,
            retried_stages: HashSet::new(),
            recovery_rounds: 0,
            phase_label: String::new(),
        }
    }
}

/// Result of one dispatch tick
enum Tick {
    Dispatched(usize),
    Halted(String),
}

/// Runs a single task, behind a consensus vote when one is required.
/// Cloned into each spawned task.
#[derive(Clone)]
struct TaskRunner {
    queue: Arc<TaskQueue>,
    backend: Arc<dyn ExecutionBackend>,
    voter: Arc<dyn Voter>,
    events: Arc<dyn EventSink>,
    timeout: Duration,
    voting_timeout: Duration,
    consensus_threshold: f64,
}

impl TaskRunner {
    async fn run(self, task: Task, handle: Option<AgentHandle>, voters: Option<Vec<AgentHandle>>) {
        if let Some(voters) = voters {
            let decision = consensus::collect_votes(
                self.voter.as_ref(),
                &voters,
                &task,
                self.consensus_threshold,
                self.voting_timeout,
            )
            .await;
            self.events
                .emit(OrchestratorEvent::ConsensusDecided(ConsensusDecidedPayload {
                    session_id: task.session_id.clone(),
                    task_id: task.id.clone(),
                    approvals: decision.approvals,
                    rejections: decision.rejections,
                    respondents: decision.respondents,
                    approved: decision.approved(),
                }));

            if !decision.approved() {
                let reason = format!(
                    "Rejected by consensus ({} approve, {} reject, {} of {} responded)",
                    decision.approvals,
                    decision.rejections,
                    decision.respondents,
                    voters.len()
                );
                log::info!("[Coordinator] Task {}: {}", task.id, reason);
                if let Err(e) = self.queue.cancel(&task.id, &reason) {
                    log::warn!("[Coordinator] Could not reject task {}: {}", task.id, e);
                }
                return;
            }
        }

        let result = match handle {
            Some(handle) => match self.backend.run_task(&handle, &task.description, self.timeout).await {
                Ok(outcome) => outcome.into_task_result(),
                Err(e) => TaskResult::failure(e.to_string()),
            },
            None => TaskResult::failure(format!("No running agent {}", task.agent_id)),
        };

        if let Err(e) = self.queue.complete_attempt(&task.id, task.attempt, result) {
            log::warn!("[Coordinator] Could not record result of {}: {}", task.id, e);
        }
    }
}

pub struct Coordinator {
    config: OrchestratorConfig,
    queue: Arc<TaskQueue>,
    workspaces: Arc<WorkspaceManager>,
    conflicts: Arc<ConflictManager>,
    backend: Arc<dyn ExecutionBackend>,
    voter: Arc<dyn Voter>,
    probe: Arc<dyn ResourceProbe>,
    events: Arc<dyn EventSink>,
    shutdown: ShutdownState,
    runs: Arc<Mutex<HashMap<String, RunState>>>,
    results: Mutex<HashMap<String, SessionResult>>,
}

impl Coordinator {
    pub fn new(deps: CoordinatorDeps) -> Self {
        Self {
            config: deps.config,
            queue: deps.queue,
            workspaces: deps.workspaces,
            conflicts: deps.conflicts,
            backend: deps.backend,
            voter: deps.voter,
            probe: deps.probe,
            events: deps.events,
            shutdown: deps.shutdown,
            runs: Arc::new(Mutex::new(HashMap::new())),
            results: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn workspaces(&self) -> &Arc<WorkspaceManager> {
        &self.workspaces
    }

    pub fn conflicts(&self) -> &Arc<ConflictManager> {
        &self.conflicts
    }

    fn with_run<R>(&self, session_id: &str, f: impl FnOnce(&mut RunState) -> R) -> Option<R> {
        let mut runs = lock_mutex_recover(&self.runs);
        runs.get_mut(session_id).map(f)
    }

    fn active_strategy(&self, session_id: &str) -> Option<CoordinationStrategy> {
        self.with_run(session_id, |run| run.strategy).or_else(|| {
            self.workspaces
                .get_session(session_id)
                .map(|s| s.strategy)
        })
    }

    fn validate_plan(plan: &OrchestrationPlan) -> StrategyResult<()> {
        if plan.agents.is_empty() {
            return Err(StrategyError::InvalidPlan("no agents".to_string()));
        }
        let mut keys = HashSet::new();
        for task in &plan.tasks {
            if !plan.agents.contains(&task.agent_id) {
                return Err(StrategyError::InvalidPlan(format!(
                    "task '{}' is assigned to unknown agent '{}'",
                    task.key, task.agent_id
                )));
            }
            if !keys.insert(task.key.as_str()) {
                return Err(StrategyError::InvalidPlan(format!(
                    "duplicate task key '{}'",
                    task.key
                )));
            }
        }
        Ok(())
    }

    /// Create the session's workspaces and enqueue its tasks. Any failure
    /// rolls the workspaces back.
    pub async fn create_session(&self, plan: &OrchestrationPlan) -> StrategyResult<String> {
        Self::validate_plan(plan)?;

        let session_id = self
            .workspaces
            .create_session(&plan.description, &plan.agents, plan.strategy)
            .await?;

        let batch: Vec<BatchTask> = plan
            .decompose()
            .into_iter()
            .map(|pt| BatchTask {
                task: NewTask {
                    session_id: session_id.clone(),
                    agent_id: pt.agent_id,
                    stage: Some(pt.stage.unwrap_or_else(|| pipeline::infer_stage(&pt.description))),
                    description: pt.description,
                    priority: pt.priority,
                    dependencies: Vec::new(),
                    max_retries: pt.max_retries,
                    phase: pt.phase,
                },
                key: pt.key,
                depends_on_keys: pt.depends_on,
            })
            .collect();

        if let Err(e) = self.queue.enqueue_batch(batch) {
            log::error!(
                "[Coordinator] Rejected plan for session {}: {}",
                session_id,
                e
            );
            if let Err(cleanup) = self.workspaces.cleanup_session(&session_id).await {
                log::warn!("[Coordinator] Rollback of {} failed: {}", session_id, cleanup);
            }
            return Err(e.into());
        }

        let decision = self.recommend_strategy(&session_id)?;
        log::info!(
            "[Coordinator] Session {} created with {} agent(s), strategy {} (advisor: {} at {:.2})",
            session_id,
            plan.agents.len(),
            plan.strategy,
            decision.strategy,
            decision.confidence
        );
        self.workspaces.update_session(&session_id, |session| {
            session.state.active_agents = plan.agents.clone();
            session.state.current_phase = "planning".to_string();
            session.state.shared_context.insert(
                "strategyDecision".to_string(),
                serde_json::to_value(&decision).unwrap_or_default(),
            );
        })?;

        lock_mutex_recover(&self.runs).insert(session_id.clone(), RunState::new(plan.strategy));
        Ok(session_id)
    }

    /// Live signals for the selector
    pub fn strategy_context(&self, session_id: &str) -> StrategyResult<StrategyContext> {
        let session = self
            .workspaces
            .get_session(session_id)
            .ok_or_else(|| StrategyError::SessionNotFound(session_id.to_string()))?;
        let tasks = self.queue.tasks_for_session(session_id);
        let elapsed = (Utc::now() - session.started_at).num_milliseconds() as f64 / 1000.0;

        let mut ctx = StrategyContext::from_tasks(&tasks, session.agents.len(), elapsed.max(0.0));
        ctx.resource_pressure = self.probe.pressure();
        Ok(ctx)
    }

    pub fn recommend_strategy(&self, session_id: &str) -> StrategyResult<StrategyDecision> {
        Ok(select_optimal_strategy(&self.strategy_context(session_id)?))
    }

    /// Run `execute_session` on the runtime
    pub fn start_session(
        self: &Arc<Self>,
        session_id: &str,
    ) -> tokio::task::JoinHandle<StrategyResult<SessionResult>> {
        let coordinator = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move { coordinator.execute_session(&session_id).await })
    }

    /// Drive a session to a terminal state
    pub async fn execute_session(&self, session_id: &str) -> StrategyResult<SessionResult> {
        let session = self
            .workspaces
            .get_session(session_id)
            .ok_or_else(|| StrategyError::SessionNotFound(session_id.to_string()))?;
        if session.status.is_terminal() {
            return self
                .get_session_result(session_id)
                .ok_or_else(|| StrategyError::SessionNotFound(session_id.to_string()));
        }

        {
            let mut runs = lock_mutex_recover(&self.runs);
            let run = runs
                .entry(session_id.to_string())
                .or_insert_with(|| RunState::new(session.strategy));
            if run.running {
                return Err(StrategyError::AlreadyRunning(session_id.to_string()));
            }
            run.running = true;
        }

        self.workspaces
            .set_session_status(session_id, SessionStatus::Executing)?;

        let handles = match self.start_agents(session_id).await {
            Ok(handles) => handles,
            Err(e) => {
                log::error!("[Coordinator] Could not start agents for {}: {}", session_id, e);
                return self
                    .finalize(session_id, &HashMap::new(), Some(e.to_string()))
                    .await;
            }
        };

        let failure = self.drive(session_id, &handles).await;
        self.finalize(session_id, &handles, failure).await
    }

    async fn start_agents(&self, session_id: &str) -> StrategyResult<HashMap<String, AgentHandle>> {
        let mut handles = HashMap::new();
        for ws in self.workspaces.workspaces(session_id) {
            if ws.status != WorkspaceStatus::Active {
                continue;
            }
            match self.backend.start_agent(&ws.agent_id, &ws.path).await {
                Ok(handle) => {
                    handles.insert(ws.agent_id.clone(), handle);
                }
                Err(e) => {
                    self.terminate_agents(&handles).await;
                    return Err(e.into());
                }
            }
        }
        Ok(handles)
    }

    async fn terminate_agents(&self, handles: &HashMap<String, AgentHandle>) {
        for handle in handles.values() {
            if let Err(e) = self.backend.terminate(handle).await {
                log::warn!("[Coordinator] Failed to terminate {}: {}", handle.agent_id, e);
            }
        }
    }

    fn runner(&self, session_id: &str) -> TaskRunner {
        let factor = self.queue.timeout_factor(session_id);
        TaskRunner {
            queue: Arc::clone(&self.queue),
            backend: Arc::clone(&self.backend),
            voter: Arc::clone(&self.voter),
            events: Arc::clone(&self.events),
            timeout: Duration::from_secs_f64(self.config.queue.task_timeout_secs as f64 * factor),
            voting_timeout: Duration::from_secs(self.config.strategy.voting_timeout_secs),
            consensus_threshold: self.config.strategy.consensus_threshold,
        }
    }

    /// Dispatch loop. Returns the session-fatal error, if any.
    async fn drive(&self, session_id: &str, handles: &HashMap<String, AgentHandle>) -> Option<String> {
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.strategy.tick_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let eval_every = Duration::from_secs(self.config.strategy.evaluation_interval_secs);
        let started = Instant::now();
        let mut last_eval = Instant::now();
        let mut idle_ticks = 0u32;

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => {}
                _ = ticker.tick() => {}
            }
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    log::warn!("[Coordinator] Task runner ended abnormally: {}", e);
                }
            }

            if self.shutdown.is_shutdown_requested() {
                in_flight.abort_all();
                return Some("Orchestrator shutting down".to_string());
            }
            if let Some(reason) = self.with_run(session_id, |run| run.cancelled.clone()).flatten() {
                in_flight.abort_all();
                return Some(format!("Cancelled: {}", reason));
            }

            let tasks = self.queue.tasks_for_session(session_id);

            let supervised = self.with_run(session_id, |run| run.supervised).unwrap_or(false);
            if supervised && last_eval.elapsed() >= eval_every {
                last_eval = Instant::now();
                if self.evaluate_adaptive(session_id, &tasks, started.elapsed()) {
                    // Transition: skip dispatch for this tick, resume on the next
                    continue;
                }
            }

            let busy = !in_flight.is_empty()
                || tasks
                    .iter()
                    .any(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress));

            if !busy {
                match self.at_quiescence(session_id, &tasks).await {
                    Ok(true) => continue,
                    Ok(false) => return None,
                    Err(e) => return Some(e.to_string()),
                }
            }

            let strategy = self
                .active_strategy(session_id)
                .unwrap_or(CoordinationStrategy::Parallel);
            match self.dispatch_tick(session_id, strategy, &tasks, handles, &mut in_flight) {
                Ok(Tick::Dispatched(n)) => {
                    let stalled = n == 0 && in_flight.is_empty() && self.is_stalled(&tasks);
                    idle_ticks = if stalled { idle_ticks + 1 } else { 0 };
                    if idle_ticks >= STALL_TICKS {
                        let reason = "No dispatchable work left: remaining tasks wait on work that cannot run".to_string();
                        log::error!("[Coordinator] Session {}: {}", session_id, reason);
                        return Some(reason);
                    }
                }
                Ok(Tick::Halted(reason)) => {
                    log::warn!("[Coordinator] Session {} halted: {}", session_id, reason);
                    // Let running attempts finish before the rest is cancelled
                    while in_flight.join_next().await.is_some() {}
                    return Some(reason);
                }
                Err(e) => {
                    if let Some(fatal) = self.strategy_failed(session_id, strategy, &e) {
                        in_flight.abort_all();
                        return Some(fatal);
                    }
                }
            }
        }
    }

    /// Nothing pending or running for this session and nothing that could be
    /// held back by backoff or the global cap
    fn is_stalled(&self, tasks: &[Task]) -> bool {
        let now = Utc::now();
        let backing_off = tasks
            .iter()
            .any(|t| t.status == TaskStatus::Pending && t.not_before.map_or(false, |nb| nb > now));
        let running = tasks.iter().any(|t| t.status == TaskStatus::InProgress);
        let global_full = self.queue.stats().in_progress >= self.config.queue.max_concurrent_tasks;
        !backing_off && !running && !global_full
    }

    /// Called when no task is pending or running. Returns true when a
    /// recovery round re-queued work and the loop should continue.
    async fn at_quiescence(&self, session_id: &str, tasks: &[Task]) -> StrategyResult<bool> {
        let strategy = self.active_strategy(session_id);
        if strategy != Some(CoordinationStrategy::Recovery) {
            return Ok(false);
        }
        if !tasks.iter().any(|t| t.status == TaskStatus::Failed) {
            return Ok(false);
        }
        let rounds = self.with_run(session_id, |run| run.recovery_rounds).unwrap_or(0);
        if rounds >= MAX_RECOVERY_ROUNDS {
            return Ok(false);
        }

        self.with_run(session_id, |run| run.recovery_rounds += 1);
        match self.execute_recovery(session_id).await {
            Ok(actions) => Ok(!actions.is_empty()),
            Err(e) => {
                self.escalate_recovery(session_id, &e.to_string());
                Err(e)
            }
        }
    }

    /// Re-evaluate metrics; returns true when the strategy changed
    fn evaluate_adaptive(&self, session_id: &str, tasks: &[Task], elapsed: Duration) -> bool {
        let metrics =
            adaptive::PerformanceMetrics::compute(tasks, elapsed.as_secs_f64(), self.probe.pressure());
        let Some(current) = self.active_strategy(session_id) else {
            return false;
        };
        log::debug!(
            "[Coordinator] {} metrics: efficiency {:.2}, error rate {:.2}, throughput {:.2}/min",
            session_id,
            metrics.efficiency,
            metrics.error_rate,
            metrics.throughput
        );

        match adaptive::evaluate(&metrics, current, &self.config.strategy) {
            Some(transition) => {
                self.transition(session_id, transition.to, &transition.reason);
                true
            }
            None => false,
        }
    }

    /// Switch strategy, recording it in the session history
    fn transition(&self, session_id: &str, to: CoordinationStrategy, reason: &str) {
        let Some(from) = self.with_run(session_id, |run| {
            let from = run.strategy;
            run.strategy = to;
            from
        }) else {
            return;
        };
        if from == to {
            return;
        }

        log::info!(
            "[Coordinator] Session {} strategy {} -> {}: {}",
            session_id,
            from,
            to,
            reason
        );
        let recorded = self.workspaces.update_session(session_id, |session| {
            session.strategy = to;
            session.strategy_history.push(StrategyTransition {
                from,
                to,
                reason: reason.to_string(),
                at: Utc::now(),
            });
        });
        if let Err(e) = recorded {
            log::warn!("[Coordinator] Could not record transition for {}: {}", session_id, e);
        }

        self.events
            .emit(OrchestratorEvent::StrategyChanged(StrategyChangedPayload {
                session_id: session_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
                reason: reason.to_string(),
            }));
    }

    /// Report a failed strategy step. Recovery failures escalate and are
    /// returned as session-fatal; anything else falls back to parallel.
    fn strategy_failed(
        &self,
        session_id: &str,
        strategy: CoordinationStrategy,
        error: &StrategyError,
    ) -> Option<String> {
        log::warn!(
            "[Coordinator] {} strategy step failed for {}: {}",
            strategy,
            session_id,
            error
        );
        self.events
            .emit(OrchestratorEvent::StrategyFailed(StrategyFailedPayload {
                session_id: session_id.to_string(),
                strategy: strategy.to_string(),
                error: error.to_string(),
            }));

        if strategy == CoordinationStrategy::Recovery {
            let reason = format!("Recovery strategy failed: {}", error);
            self.escalate_recovery(session_id, &reason);
            return Some(reason);
        }
        self.transition(
            session_id,
            CoordinationStrategy::Parallel,
            &format!("{} strategy failed: {}", strategy, error),
        );
        None
    }

    fn escalate_recovery(&self, session_id: &str, reason: &str) {
        let tasks = self.queue.tasks_for_session(session_id);
        let analysis = recovery::analyze(&tasks);
        log::error!("[Coordinator] Escalating session {}: {}", session_id, reason);
        self.events
            .emit(OrchestratorEvent::RecoveryEscalated(RecoveryEscalatedPayload {
                session_id: session_id.to_string(),
                failure_ratio: analysis.failure_ratio,
                reason: reason.to_string(),
            }));
    }

    fn set_phase_label(&self, session_id: &str, label: String) {
        let changed = self
            .with_run(session_id, |run| {
                if run.phase_label == label {
                    false
                } else {
                    run.phase_label = label.clone();
                    true
                }
            })
            .unwrap_or(false);
        if changed {
            log::info!("[Coordinator] Session {} entering {}", session_id, label);
            if let Err(e) = self
                .workspaces
                .update_session(session_id, |s| s.state.current_phase = label)
            {
                log::warn!("[Coordinator] Could not record phase of {}: {}", session_id, e);
            }
        }
    }

    fn dispatch_tick(
        &self,
        session_id: &str,
        strategy: CoordinationStrategy,
        tasks: &[Task],
        handles: &HashMap<String, AgentHandle>,
        in_flight: &mut JoinSet<()>,
    ) -> StrategyResult<Tick> {
        let cap = self.config.queue.max_concurrent_tasks.max(1);
        let mut filter = DequeueFilter::for_session(session_id);

        let limit = match strategy {
            CoordinationStrategy::Parallel
            | CoordinationStrategy::Consensus
            | CoordinationStrategy::Recovery => cap,
            CoordinationStrategy::Sequential => 1,
            CoordinationStrategy::PhasedParallel => {
                filter.max_phase = current_phase(tasks);
                if let Some(phase) = filter.max_phase {
                    self.set_phase_label(session_id, format!("phase {}", phase));
                }
                cap
            }
            CoordinationStrategy::Adaptive => {
                let elapsed = self
                    .workspaces
                    .get_session(session_id)
                    .map(|s| (Utc::now() - s.started_at).num_milliseconds() as f64 / 1000.0)
                    .unwrap_or(0.0);
                let metrics =
                    adaptive::PerformanceMetrics::compute(tasks, elapsed, self.probe.pressure());
                adaptive::pacing_limit(&metrics, cap, &self.config.strategy)
            }
            CoordinationStrategy::Pipeline => match self.pipeline_step(session_id, tasks)? {
                PipelineStep::Run(stage) => {
                    filter.stage = Some(stage.stage);
                    stage.limit(cap)
                }
                PipelineStep::Requeued => return Ok(Tick::Dispatched(0)),
                PipelineStep::Halt(reason) => return Ok(Tick::Halted(reason)),
                // Every stage passed; stragglers without a stage run unrestricted
                PipelineStep::Done => cap,
            },
        };

        filter.session_limit = Some(limit);
        let dispatched = self.queue.dequeue_matching(&filter, limit);
        let count = dispatched.len();
        if count == 0 {
            return Ok(Tick::Dispatched(0));
        }

        let gated = strategy == CoordinationStrategy::Consensus;
        let voters: Vec<AgentHandle> = handles.values().cloned().collect();
        let runner = self.runner(session_id);
        for task in dispatched {
            let needs_vote = gated && consensus::requires_consensus(&task, handles.len());
            let handle = handles.get(&task.agent_id).cloned();
            log::debug!(
                "[Coordinator] Dispatching {} to {}{}",
                task.id,
                task.agent_id,
                if needs_vote { " after consensus" } else { "" }
            );
            in_flight.spawn(runner.clone().run(task, handle, needs_vote.then(|| voters.clone())));
        }
        Ok(Tick::Dispatched(count))
    }

    fn pipeline_step(&self, session_id: &str, tasks: &[Task]) -> StrategyResult<PipelineStep> {
        let stages = pipeline::stage_configs(&self.config.strategy);
        let stuck = stuck_tasks(tasks);

        loop {
            let (index, retried) = self
                .with_run(session_id, |run| (run.stage_index, run.retried_stages.clone()))
                .unwrap_or_default();
            let Some(stage) = stages.get(index) else {
                return Ok(PipelineStep::Done);
            };
            self.set_phase_label(session_id, format!("{} stage", stage.stage));

            let live = tasks.iter().any(|t| {
                pipeline::stage_for(t) == stage.stage && !t.is_terminal() && !stuck.contains(&t.id)
            });
            if live {
                return Ok(PipelineStep::Run(stage.clone()));
            }

            match pipeline::stage_verdict(
                stage,
                tasks,
                self.config.strategy.quality_gate_max_failure_ratio,
                retried.contains(&stage.stage),
            ) {
                pipeline::StageVerdict::Advance => {
                    log::info!("[Coordinator] Session {}: {} stage done", session_id, stage.stage);
                    self.with_run(session_id, |run| run.stage_index += 1);
                }
                pipeline::StageVerdict::Retry(ids) => {
                    log::info!(
                        "[Coordinator] Session {}: retrying {} failed task(s) of the {} stage",
                        session_id,
                        ids.len(),
                        stage.stage
                    );
                    self.with_run(session_id, |run| run.retried_stages.insert(stage.stage));
                    for id in ids {
                        self.queue.requeue_failed(&id, None)?;
                    }
                    return Ok(PipelineStep::Requeued);
                }
                pipeline::StageVerdict::Halt(reason) => return Ok(PipelineStep::Halt(reason)),
            }
        }
    }

    /// Analyze the session's failures and apply the remediation plan, each
    /// action falling back to a plain re-queue when it fails
    pub async fn execute_recovery(&self, session_id: &str) -> StrategyResult<Vec<RemediationAction>> {
        let session = self
            .workspaces
            .get_session(session_id)
            .ok_or_else(|| StrategyError::SessionNotFound(session_id.to_string()))?;
        let tasks = self.queue.tasks_for_session(session_id);
        let analysis = recovery::analyze(&tasks);
        let actions = recovery::plan(&analysis, &tasks, &session.agents);

        log::info!(
            "[Coordinator] Recovery for {}: failure ratio {:.2}, {} action(s)",
            session_id,
            analysis.failure_ratio,
            actions.len()
        );

        let mut applied = 0;
        for action in &actions {
            match self.apply_remediation(session_id, action, &tasks) {
                Ok(()) => applied += 1,
                Err(e) => {
                    log::warn!(
                        "[Coordinator] {} failed for {}: {}, falling back to re-queue",
                        action.name(),
                        session_id,
                        e
                    );
                    if self.fallback_requeue(action, &tasks) > 0 {
                        applied += 1;
                    }
                }
            }
        }

        if !actions.is_empty() && applied == 0 {
            return Err(StrategyError::RecoveryFailed(format!(
                "none of {} remediation action(s) could be applied",
                actions.len()
            )));
        }

        self.workspaces.update_session(session_id, |s| {
            s.state.shared_context.insert(
                "recoveryActions".to_string(),
                serde_json::to_value(&actions).unwrap_or_default(),
            );
        })?;
        Ok(actions)
    }

    fn apply_remediation(
        &self,
        session_id: &str,
        action: &RemediationAction,
        tasks: &[Task],
    ) -> StrategyResult<()> {
        match action {
            RemediationAction::WidenTimeouts { factor } => {
                let widened = self.queue.timeout_factor(session_id) * factor;
                self.queue.set_timeout_factor(session_id, widened);
                log::info!(
                    "[Coordinator] Session {} timeout factor now {:.1}",
                    session_id,
                    widened
                );
            }
            RemediationAction::ReassignAgent { task_id, to, .. } => {
                self.queue.requeue_failed(task_id, Some(to.as_str()))?;
            }
            RemediationAction::RetryWithBackoff { task_ids, delay_ms } => {
                let delay = chrono::Duration::milliseconds(*delay_ms as i64);
                for id in task_ids {
                    self.queue.requeue_failed_after(id, None, delay)?;
                }
            }
            RemediationAction::RestartSession => {
                for task in tasks.iter().filter(|t| t.status == TaskStatus::Failed) {
                    self.queue.requeue_failed(&task.id, None)?;
                }
                self.set_phase_label(session_id, "restarted".to_string());
            }
        }
        Ok(())
    }

    /// Plain re-queue of whatever failed tasks an action covered
    fn fallback_requeue(&self, action: &RemediationAction, tasks: &[Task]) -> usize {
        let ids: Vec<String> = match action {
            RemediationAction::ReassignAgent { task_id, .. } => vec![task_id.clone()],
            RemediationAction::RetryWithBackoff { task_ids, .. } => task_ids.clone(),
            RemediationAction::RestartSession => tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Failed)
                .map(|t| t.id.clone())
                .collect(),
            RemediationAction::WidenTimeouts { .. } => Vec::new(),
        };
        ids.iter()
            .filter(|id| {
                self.queue
                    .get_task(id)
                    .map_or(false, |t| t.status == TaskStatus::Failed)
            })
            .filter(|id| self.queue.requeue_failed(id, None).is_ok())
            .count()
    }

    /// Settle the session: cancel leftovers, merge, record metrics, schedule cleanup
    async fn finalize(
        &self,
        session_id: &str,
        handles: &HashMap<String, AgentHandle>,
        failure: Option<String>,
    ) -> StrategyResult<SessionResult> {
        if let Some(ref reason) = failure {
            let cancelled = self.queue.cancel_session(session_id, reason);
            if !cancelled.is_empty() {
                log::info!(
                    "[Coordinator] Cancelled {} task(s) of {}",
                    cancelled.len(),
                    session_id
                );
            }
        }
        self.terminate_agents(handles).await;
        self.conflicts.release_session_locks(session_id);

        let session = self
            .workspaces
            .get_session(session_id)
            .ok_or_else(|| StrategyError::SessionNotFound(session_id.to_string()))?;
        let tasks = self.queue.tasks_for_session(session_id);

        let completed: Vec<String> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.clone())
            .collect();
        let failed: Vec<FailedTaskSummary> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(FailedTaskSummary::from)
            .collect();
        let blocked: Vec<String> = tasks
            .iter()
            .filter(|t| !t.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        let unresolved: Vec<String> = self
            .conflicts
            .unresolved_conflicts(session_id)
            .into_iter()
            .map(|c| c.id)
            .collect();

        let (strategy, recovery_rounds) = self
            .with_run(session_id, |run| (run.strategy, run.recovery_rounds))
            .unwrap_or((session.strategy, 0));
        let recovering = strategy == CoordinationStrategy::Recovery || recovery_rounds > 0;
        let failure_ratio = if tasks.is_empty() {
            0.0
        } else {
            failed.len() as f64 / tasks.len() as f64
        };

        let mut error = failure;
        let clean = blocked.is_empty() && unresolved.is_empty();
        let status = if error.is_some() {
            SessionStatus::Failed
        } else if failed.is_empty() && clean {
            SessionStatus::Completed
        } else if recovering && clean && failure_ratio < self.config.strategy.recovery_success_ratio {
            log::info!(
                "[Coordinator] Session {} recovered ({:.0}% failed)",
                session_id,
                failure_ratio * 100.0
            );
            SessionStatus::Completed
        } else {
            if recovering {
                let reason = format!(
                    "failure ratio {:.2} still at or above {:.2} after recovery",
                    failure_ratio, self.config.strategy.recovery_success_ratio
                );
                self.escalate_recovery(session_id, &reason);
                error = Some(reason);
            }
            SessionStatus::Failed
        };

        // Only agents whose every task completed are merged back
        let mergeable: Vec<String> = if error.is_none() || status == SessionStatus::Completed {
            session
                .agents
                .iter()
                .filter(|agent| {
                    let mut own = tasks.iter().filter(|t| &t.agent_id == *agent).peekable();
                    own.peek().is_some() && own.all(|t| t.status == TaskStatus::Completed)
                })
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        let merges = if mergeable.is_empty() {
            Vec::new()
        } else {
            self.workspaces.merge_session(session_id, &mergeable).await?
        };

        let elapsed_ms = (Utc::now() - session.started_at).num_milliseconds().max(1);
        let merged_agents: Vec<String> = merges
            .iter()
            .filter(|m| m.success)
            .map(|m| m.agent_id.clone())
            .collect();
        let failed_count = failed.len();
        let completed_count = completed.len();
        self.workspaces.update_session(session_id, |s| {
            s.metrics.tasks_completed = completed_count;
            s.metrics.tasks_failed = failed_count;
            s.metrics.total_execution_ms = tasks.iter().filter_map(|t| t.execution_time_ms()).sum();
            s.metrics.agent_utilization = s
                .agents
                .iter()
                .map(|agent| {
                    let busy: i64 = tasks
                        .iter()
                        .filter(|t| &t.agent_id == agent)
                        .filter_map(|t| t.execution_time_ms())
                        .sum();
                    (agent.clone(), (busy as f64 / elapsed_ms as f64).min(1.0))
                })
                .collect();
            s.state.active_agents.clear();
            s.state.completed_agents = merged_agents;
            s.state.current_phase = "finished".to_string();
        })?;
        let session = self.workspaces.set_session_status(session_id, status)?;

        let result = SessionResult {
            session_id: session_id.to_string(),
            status,
            completed_tasks: completed,
            failed_tasks: failed,
            blocked_tasks: blocked,
            unresolved_conflicts: unresolved,
            merges,
            strategy_history: session.strategy_history,
            error,
        };
        match status {
            SessionStatus::Completed => log::info!("[Coordinator] Session {} completed", session_id),
            _ => log::error!(
                "[Coordinator] Session {} failed: {} failed task(s), {} blocked, {} unresolved conflict(s)",
                session_id,
                result.failed_tasks.len(),
                result.blocked_tasks.len(),
                result.unresolved_conflicts.len()
            ),
        }

        lock_mutex_recover(&self.results).insert(session_id.to_string(), result.clone());
        self.with_run(session_id, |run| run.running = false);
        self.schedule_cleanup(session_id);
        Ok(result)
    }

    /// Tear down workspaces after the grace period, then forget the session
    fn schedule_cleanup(&self, session_id: &str) {
        if self.shutdown.is_shutdown_requested() {
            // `shutdown` decides what to keep
            return;
        }
        let grace = Duration::from_secs(self.workspaces.config().cleanup_grace_secs);
        let cleanup = self.workspaces.schedule_cleanup(session_id, grace);
        let queue = Arc::clone(&self.queue);
        let conflicts = Arc::clone(&self.conflicts);
        let runs = Arc::clone(&self.runs);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if cleanup.await.is_err() {
                return;
            }
            queue.forget_session(&session_id);
            conflicts.forget_session(&session_id);
            lock_mutex_recover(&runs).remove(&session_id);
        });
    }

    pub fn get_session_result(&self, session_id: &str) -> Option<SessionResult> {
        lock_mutex_recover(&self.results).get(session_id).cloned()
    }

    pub fn get_execution_progress(&self, session_id: &str) -> StrategyResult<ExecutionProgress> {
        let session = self
            .workspaces
            .get_session(session_id)
            .ok_or_else(|| StrategyError::SessionNotFound(session_id.to_string()))?;
        let stats = self.queue.session_stats(session_id);
        let finished = stats.completed + stats.failed;
        let percent = if stats.total == 0 {
            0.0
        } else {
            finished as f64 / stats.total as f64 * 100.0
        };

        Ok(ExecutionProgress {
            session_id: session_id.to_string(),
            status: session.status,
            strategy: self.active_strategy(session_id).unwrap_or(session.strategy),
            phase: session.state.current_phase,
            total: stats.total,
            completed: stats.completed,
            failed: stats.failed,
            in_progress: stats.in_progress,
            pending: stats.pending,
            blocked: stats.blocked,
            percent,
        })
    }

    /// Cancel every live task, release the session's locks and schedule
    /// cleanup. Returns the number of cancelled tasks. Not retried.
    pub async fn cancel_orchestration(&self, session_id: &str, reason: &str) -> StrategyResult<usize> {
        let session = self
            .workspaces
            .get_session(session_id)
            .ok_or_else(|| StrategyError::SessionNotFound(session_id.to_string()))?;

        let running = {
            let mut runs = lock_mutex_recover(&self.runs);
            let run = runs
                .entry(session_id.to_string())
                .or_insert_with(|| RunState::new(session.strategy));
            run.cancelled = Some(reason.to_string());
            run.running
        };

        let cancelled = self.queue.cancel_session(session_id, reason);
        let released = self.conflicts.release_session_locks(session_id);
        log::info!(
            "[Coordinator] Cancelled session {}: {} task(s), {} lock(s) released ({})",
            session_id,
            cancelled.len(),
            released,
            reason
        );

        // A running loop finalizes on its next tick; otherwise settle here
        if !running && !session.status.is_terminal() {
            self.finalize(session_id, &HashMap::new(), Some(format!("Cancelled: {}", reason)))
                .await?;
        }
        Ok(cancelled.len())
    }

    /// Stop every dispatch loop, then tear down sessions whose work is
    /// merged and keep the branches of everything else
    pub async fn shutdown(&self) -> ShutdownResult {
        let running: Vec<String> = lock_mutex_recover(&self.runs)
            .iter()
            .filter(|(_, run)| run.running)
            .map(|(id, _)| id.clone())
            .collect();
        self.shutdown.request_shutdown();

        let deadline = Instant::now() + SHUTDOWN_WAIT;
        while Instant::now() < deadline
            && lock_mutex_recover(&self.runs).values().any(|run| run.running)
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut result = ShutdownResult {
            sessions_cancelled: running.len(),
            ..Default::default()
        };
        for session in self.workspaces.list_sessions() {
            let workspaces = self.workspaces.workspaces(&session.id);
            let unmerged: Vec<String> = workspaces
                .iter()
                .filter(|ws| matches!(ws.status, WorkspaceStatus::Active | WorkspaceStatus::Error))
                .map(|ws| ws.branch.clone())
                .collect();

            if !session.status.is_terminal() || !unmerged.is_empty() {
                result.preserved_branches.extend(unmerged);
                continue;
            }
            match self.workspaces.cleanup_session(&session.id).await {
                Ok(cleaned) => result.workspaces_cleaned += cleaned,
                Err(e) => result.errors.push(format!("{}: {}", session.id, e)),
            }
        }
        result
    }
}

enum PipelineStep {
    Run(pipeline::StageConfig),
    Requeued,
    Halt(String),
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, status: TaskStatus, deps: &[&str], phase: Option<u32>) -> Task {
        let mut task = Task::from_new(NewTask::new("s1", "a", id), 0);
        task.id = id.to_string();
        task.status = status;
        task.dependencies = deps.iter().map(|d| d.to_string()).collect();
        task.phase = phase;
        task
    }

    #[test]
    fn test_stuck_tasks_follow_failed_dependencies() {
        let tasks = vec![
            task("a", TaskStatus::Failed, &[], None),
            task("b", TaskStatus::Blocked, &["a"], None),
            task("c", TaskStatus::Blocked, &["b"], None),
            task("d", TaskStatus::InProgress, &[], None),
            task("e", TaskStatus::Blocked, &["d"], None),
        ];
        let stuck = stuck_tasks(&tasks);
        assert!(stuck.contains("b"));
        assert!(stuck.contains("c"));
        assert!(!stuck.contains("e"));
    }

    #[test]
    fn test_current_phase_skips_finished_and_stuck() {
        let tasks = vec![
            task("p1", TaskStatus::Completed, &[], Some(1)),
            task("p2-dead", TaskStatus::Failed, &[], Some(2)),
            task("p2-stuck", TaskStatus::Blocked, &["p2-dead"], Some(2)),
            task("p3", TaskStatus::Pending, &[], Some(3)),
            task("free", TaskStatus::Pending, &[], None),
        ];
        assert_eq!(current_phase(&tasks), Some(3));
        assert_eq!(current_phase(&tasks[..1]), None);
    }

    #[test]
    fn test_validate_plan() {
        use crate::models::{PlanTask, TaskPriority};
        let mut plan = OrchestrationPlan {
            description: "build".to_string(),
            agents: vec!["a".to_string()],
            strategy: CoordinationStrategy::Parallel,
            tasks: vec![PlanTask {
                key: "t1".to_string(),
                agent_id: "ghost".to_string(),
                description: "x".to_string(),
                priority: TaskPriority::Medium,
                depends_on: vec![],
                max_retries: None,
                phase: None,
                stage: None,
            }],
        };
        assert!(matches!(
            Coordinator::validate_plan(&plan),
            Err(StrategyError::InvalidPlan(_))
        ));

        plan.tasks[0].agent_id = "a".to_string();
        assert!(Coordinator::validate_plan(&plan).is_ok());

        plan.tasks.push(plan.tasks[0].clone());
        assert!(Coordinator::validate_plan(&plan).is_err());

        plan.agents.clear();
        assert!(Coordinator::validate_plan(&plan).is_err());
    }
}
