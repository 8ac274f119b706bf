//! Workspace isolation
//!
//! One branch plus one worktree per agent per session. Sessions and their
//! workspaces are persisted to the session store after every mutation so a
//! restarted orchestrator can pick up in-flight sessions.

use crate::config::WorkspaceConfig;
use crate::events::{
    EventSink, MergeAttemptedPayload, OrchestratorEvent, SessionStatusChangedPayload,
    WorkspaceStatusChangedPayload,
};
use crate::file_storage::sessions::{load_sessions, save_sessions, SessionRecord};
use crate::file_storage::StorageError;
use crate::git::{Vcs, VcsError};
use crate::models::{
    CoordinationStrategy, MergeOutcome, Session, SessionMetrics, SessionState, SessionStatus,
    Workspace, WorkspaceStatus,
};
use crate::utils::{generate_id, lock_mutex_recover, resolve_project_path};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("No workspace for agent {agent_id} in session {session_id}")]
    WorkspaceNotFound { session_id: String, agent_id: String },

    #[error("Agent {agent_id} already has a workspace in session {session_id}")]
    AlreadyExists { session_id: String, agent_id: String },

    #[error("Invalid agent id '{0}': use letters, digits, '.', '_' or '-'")]
    InvalidAgentId(String),

    #[error("A session needs at least one agent")]
    NoAgents,

    #[error("Cleanup of session {session_id} failed for agent(s) {}", .agents.join(", "))]
    CleanupFailed { session_id: String, agents: Vec<String> },

    #[error("Failed to create workspace for agent {agent_id}: {source}")]
    CreateFailed {
        agent_id: String,
        #[source]
        source: VcsError,
    },

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

/// Result of `health_check`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy_sessions: Vec<String>,
    pub unhealthy_sessions: Vec<String>,
    /// Worktree paths that should exist but don't
    pub missing_paths: Vec<PathBuf>,
    /// Worktree directories on disk that no session owns
    pub orphaned_workspaces: Vec<PathBuf>,
}

fn validate_agent_id(agent_id: &str) -> WorkspaceResult<()> {
    let valid = !agent_id.is_empty()
        && !agent_id.starts_with('.')
        && agent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(WorkspaceError::InvalidAgentId(agent_id.to_string()))
    }
}

/// Owns sessions and their per-agent workspaces
pub struct WorkspaceManager {
    repo_path: PathBuf,
    config: WorkspaceConfig,
    vcs: Arc<dyn Vcs>,
    events: Arc<dyn EventSink>,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    /// Serializes checkout/commit/merge for a single (session, agent)
    agent_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkspaceManager {
    pub fn new(
        repo_path: &Path,
        config: WorkspaceConfig,
        vcs: Arc<dyn Vcs>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            config,
            vcs,
            events,
            sessions: Mutex::new(HashMap::new()),
            agent_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn worktree_root(&self) -> PathBuf {
        resolve_project_path(&self.repo_path, &self.config.worktree_dir)
    }

    pub fn state_file(&self) -> PathBuf {
        resolve_project_path(&self.repo_path, &self.config.state_file)
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    fn workspace_path(&self, session_id: &str, agent_id: &str) -> PathBuf {
        self.worktree_root().join(session_id).join(agent_id)
    }

    /// Branch agents fork from and merge into
    pub fn base_branch(&self) -> WorkspaceResult<String> {
        match &self.config.base_branch {
            Some(branch) => Ok(branch.clone()),
            None => Ok(self.vcs.default_branch()?),
        }
    }

    fn persist(&self, sessions: &HashMap<String, SessionRecord>) -> WorkspaceResult<()> {
        save_sessions(&self.state_file(), sessions.values().cloned().collect())?;
        Ok(())
    }

    fn agent_lock(&self, session_id: &str, agent_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = lock_mutex_recover(&self.agent_locks);
        locks
            .entry(format!("{}/{}", session_id, agent_id))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn emit_workspace_status(&self, ws: &Workspace, old: &str) {
        self.events
            .emit(OrchestratorEvent::WorkspaceStatusChanged(WorkspaceStatusChangedPayload {
                session_id: ws.session_id.clone(),
                agent_id: ws.agent_id.clone(),
                workspace_id: ws.id.clone(),
                old_status: old.to_string(),
                new_status: ws.status.to_string(),
            }));
    }

    /// Restore sessions from the session store. Workspaces whose directory
    /// has disappeared are marked `error`, never re-created.
    pub fn load(&self) -> WorkspaceResult<usize> {
        let file = load_sessions(&self.state_file())?;
        let mut sessions = lock_mutex_recover(&self.sessions);
        sessions.clear();

        for mut record in file.sessions {
            for ws in record.workspaces.iter_mut() {
                if ws.status == WorkspaceStatus::Active && !ws.path.exists() {
                    log::warn!(
                        "[WorkspaceManager] Workspace {} for agent {} is missing at {:?}",
                        ws.id,
                        ws.agent_id,
                        ws.path
                    );
                    ws.status = WorkspaceStatus::Error;
                    ws.error = Some("Workspace path missing after restart".to_string());
                }
            }
            sessions.insert(record.session.id.clone(), record);
        }

        let count = sessions.len();
        self.persist(&sessions)?;
        log::info!("[WorkspaceManager] Restored {} session(s)", count);
        Ok(count)
    }

    /// Create a session with one forked branch and worktree per agent.
    /// Any failure rolls back what was already created.
    pub async fn create_session(
        &self,
        task_description: &str,
        agents: &[String],
        strategy: CoordinationStrategy,
    ) -> WorkspaceResult<String> {
        if agents.is_empty() {
            return Err(WorkspaceError::NoAgents);
        }
        let mut seen = HashSet::new();
        for agent in agents {
            validate_agent_id(agent)?;
            if !seen.insert(agent.as_str()) {
                return Err(WorkspaceError::AlreadyExists {
                    session_id: "(new)".to_string(),
                    agent_id: agent.clone(),
                });
            }
        }

        let session_id = generate_id("session");
        let base = self.base_branch()?;
        log::info!(
            "[WorkspaceManager] Creating session {} with {} agent(s) from {}",
            session_id,
            agents.len(),
            base
        );

        let mut created: Vec<Workspace> = Vec::new();
        for agent in agents {
            match self.create_workspace(&session_id, agent, &base).await {
                Ok(ws) => created.push(ws),
                Err(e) => {
                    log::error!(
                        "[WorkspaceManager] Workspace creation failed for {}: {}; rolling back session {}",
                        agent,
                        e,
                        session_id
                    );
                    self.rollback(&session_id, &created);
                    return Err(e);
                }
            }
        }

        let now = Utc::now();
        let session = Session {
            id: session_id.clone(),
            task_description: task_description.to_string(),
            agents: agents.to_vec(),
            strategy,
            status: SessionStatus::Planning,
            started_at: now,
            ended_at: None,
            workspaces: created.iter().map(|ws| ws.id.clone()).collect(),
            state: SessionState {
                current_phase: "planning".to_string(),
                ..Default::default()
            },
            metrics: SessionMetrics::default(),
            strategy_history: Vec::new(),
        };

        let persisted = {
            let mut sessions = lock_mutex_recover(&self.sessions);
            sessions.insert(
                session_id.clone(),
                SessionRecord {
                    session,
                    workspaces: created.clone(),
                },
            );
            let persisted = self.persist(&sessions);
            if persisted.is_err() {
                sessions.remove(&session_id);
            }
            persisted
        };
        if let Err(e) = persisted {
            log::error!(
                "[WorkspaceManager] Could not persist session {}: {}; rolling back",
                session_id,
                e
            );
            self.rollback(&session_id, &created);
            return Err(e);
        }

        for ws in &created {
            self.emit_workspace_status(ws, "new");
        }
        Ok(session_id)
    }

    async fn create_workspace(
        &self,
        session_id: &str,
        agent_id: &str,
        base: &str,
    ) -> WorkspaceResult<Workspace> {
        let lock = self.agent_lock(session_id, agent_id);
        let _guard = lock.lock().await;

        let branch = Workspace::branch_name(session_id, agent_id);
        let path = self.workspace_path(session_id, agent_id);

        self.vcs
            .fork_branch(base, &branch)
            .map_err(|source| WorkspaceError::CreateFailed {
                agent_id: agent_id.to_string(),
                source,
            })?;

        if let Err(source) = self.vcs.create_worktree(&path, &branch) {
            if let Err(e) = self.vcs.delete_branch(&branch) {
                log::warn!("[WorkspaceManager] Failed to delete branch {}: {}", branch, e);
            }
            return Err(WorkspaceError::CreateFailed {
                agent_id: agent_id.to_string(),
                source,
            });
        }

        log::info!(
            "[WorkspaceManager] Workspace for {} on {} at {:?}",
            agent_id,
            branch,
            path
        );
        Ok(Workspace {
            id: generate_id("ws"),
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            path,
            branch,
            created_at: Utc::now(),
            status: WorkspaceStatus::Active,
            error: None,
        })
    }

    /// Best-effort removal of a workspace's worktree and branch; both are
    /// attempted and every failure is reported
    fn teardown(&self, ws: &Workspace) -> Result<(), String> {
        let mut errors = Vec::new();
        if let Err(e) = self.vcs.remove_worktree(&ws.path) {
            log::warn!("[WorkspaceManager] Failed to remove worktree {:?}: {}", ws.path, e);
            errors.push(format!("worktree {}: {}", ws.path.display(), e));
        }
        if self.vcs.branch_exists(&ws.branch) {
            if let Err(e) = self.vcs.delete_branch(&ws.branch) {
                log::warn!("[WorkspaceManager] Failed to delete branch {}: {}", ws.branch, e);
                errors.push(format!("branch {}: {}", ws.branch, e));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }

    /// Undo a half-created session: its workspaces and its directory
    fn rollback(&self, session_id: &str, created: &[Workspace]) {
        for ws in created {
            let _ = self.teardown(ws);
        }
        self.remove_session_dir(session_id);
    }

    fn remove_session_dir(&self, session_id: &str) {
        let session_dir = self.worktree_root().join(session_id);
        if session_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&session_dir) {
                log::warn!("[WorkspaceManager] Failed to remove {:?}: {}", session_dir, e);
            }
        }
    }

    pub fn get_workspace(&self, session_id: &str, agent_id: &str) -> Option<Workspace> {
        let sessions = lock_mutex_recover(&self.sessions);
        sessions
            .get(session_id)?
            .workspaces
            .iter()
            .find(|ws| ws.agent_id == agent_id)
            .cloned()
    }

    pub fn workspaces(&self, session_id: &str) -> Vec<Workspace> {
        let sessions = lock_mutex_recover(&self.sessions);
        sessions
            .get(session_id)
            .map(|r| r.workspaces.clone())
            .unwrap_or_default()
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        let sessions = lock_mutex_recover(&self.sessions);
        sessions.get(session_id).map(|r| r.session.clone())
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        let sessions = lock_mutex_recover(&self.sessions);
        let mut list: Vec<Session> = sessions.values().map(|r| r.session.clone()).collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }

    /// Mutate a session record and persist it
    pub fn update_session<F>(&self, session_id: &str, update: F) -> WorkspaceResult<Session>
    where
        F: FnOnce(&mut Session),
    {
        let mut sessions = lock_mutex_recover(&self.sessions);
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| WorkspaceError::SessionNotFound(session_id.to_string()))?;
        update(&mut record.session);
        let session = record.session.clone();
        self.persist(&sessions)?;
        Ok(session)
    }

    /// Move a session to `status`, stamping the end time for terminal states
    pub fn set_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> WorkspaceResult<Session> {
        let mut old = status;
        let session = self.update_session(session_id, |session| {
            old = session.status;
            session.status = status;
            if status.is_terminal() && session.ended_at.is_none() {
                session.ended_at = Some(Utc::now());
            }
        })?;

        if old != status {
            log::info!(
                "[WorkspaceManager] Session {} {} -> {}",
                session_id,
                old,
                status
            );
            self.events
                .emit(OrchestratorEvent::SessionStatusChanged(SessionStatusChangedPayload {
                    session_id: session_id.to_string(),
                    old_status: old.to_string(),
                    new_status: status.to_string(),
                }));
        }
        Ok(session)
    }

    fn set_workspace_status(
        &self,
        session_id: &str,
        agent_id: &str,
        status: WorkspaceStatus,
        error: Option<String>,
    ) -> WorkspaceResult<Workspace> {
        let (ws, old) = {
            let mut sessions = lock_mutex_recover(&self.sessions);
            let record = sessions
                .get_mut(session_id)
                .ok_or_else(|| WorkspaceError::SessionNotFound(session_id.to_string()))?;
            let ws = record
                .workspaces
                .iter_mut()
                .find(|ws| ws.agent_id == agent_id)
                .ok_or_else(|| WorkspaceError::WorkspaceNotFound {
                    session_id: session_id.to_string(),
                    agent_id: agent_id.to_string(),
                })?;
            let old = ws.status;
            ws.status = status;
            ws.error = error;
            let ws = ws.clone();
            self.persist(&sessions)?;
            (ws, old)
        };
        if old != status {
            self.emit_workspace_status(&ws, old.as_str());
        }
        Ok(ws)
    }

    /// Commit the agent's outstanding changes and merge its branch into the
    /// base branch. A failed merge marks the workspace `error` and is reported
    /// in the outcome rather than returned as an error.
    pub async fn merge_agent_work(
        &self,
        session_id: &str,
        agent_id: &str,
    ) -> WorkspaceResult<MergeOutcome> {
        let lock = self.agent_lock(session_id, agent_id);
        let _guard = lock.lock().await;

        let ws = self
            .get_workspace(session_id, agent_id)
            .ok_or_else(|| WorkspaceError::WorkspaceNotFound {
                session_id: session_id.to_string(),
                agent_id: agent_id.to_string(),
            })?;

        let failed = |message: String| MergeOutcome {
            agent_id: agent_id.to_string(),
            branch: ws.branch.clone(),
            success: false,
            fast_forward: false,
            commit_id: None,
            conflict_files: Vec::new(),
            message,
        };

        match ws.status {
            WorkspaceStatus::Merged => {
                return Ok(MergeOutcome {
                    success: true,
                    ..failed("Already merged".to_string())
                });
            }
            WorkspaceStatus::Cleaned => {
                return Ok(failed("Workspace was already cleaned up".to_string()));
            }
            WorkspaceStatus::Active | WorkspaceStatus::Error => {}
        }

        let base = self.base_branch()?;
        let message = format!("Agent {} work for session {}", agent_id, session_id);

        let outcome = match self.vcs.commit_all(&ws.path, &message) {
            Err(e) => failed(format!("Commit failed: {}", e)),
            Ok(commit) => {
                if let Some(id) = commit {
                    log::debug!("[WorkspaceManager] Committed {} in {:?}", id, ws.path);
                }
                match self.vcs.merge_branch(&ws.branch, &base) {
                    Ok(result) => MergeOutcome {
                        agent_id: agent_id.to_string(),
                        branch: ws.branch.clone(),
                        success: result.success,
                        fast_forward: result.fast_forward,
                        commit_id: result.commit_id,
                        conflict_files: result.conflict_files,
                        message: result.message,
                    },
                    Err(e) => failed(format!("Merge failed: {}", e)),
                }
            }
        };

        if outcome.success {
            log::info!("[WorkspaceManager] Merged {} into {}", ws.branch, base);
            self.set_workspace_status(session_id, agent_id, WorkspaceStatus::Merged, None)?;
        } else {
            log::warn!(
                "[WorkspaceManager] Merge of {} failed: {}",
                ws.branch,
                outcome.message
            );
            self.set_workspace_status(
                session_id,
                agent_id,
                WorkspaceStatus::Error,
                Some(outcome.message.clone()),
            )?;
        }

        self.events
            .emit(OrchestratorEvent::MergeAttempted(MergeAttemptedPayload {
                session_id: session_id.to_string(),
                agent_id: agent_id.to_string(),
                branch: ws.branch.clone(),
                success: outcome.success,
                conflict_files: outcome.conflict_files.clone(),
            }));
        Ok(outcome)
    }

    /// Merge each agent in turn; one failure never stops the rest
    pub async fn merge_session(
        &self,
        session_id: &str,
        agents: &[String],
    ) -> WorkspaceResult<Vec<MergeOutcome>> {
        if self.get_session(session_id).is_none() {
            return Err(WorkspaceError::SessionNotFound(session_id.to_string()));
        }

        let mut outcomes = Vec::with_capacity(agents.len());
        for agent in agents {
            match self.merge_agent_work(session_id, agent).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    log::warn!("[WorkspaceManager] Merge for {} failed: {}", agent, e);
                    outcomes.push(MergeOutcome {
                        agent_id: agent.clone(),
                        branch: Workspace::branch_name(session_id, agent),
                        success: false,
                        fast_forward: false,
                        commit_id: None,
                        conflict_files: Vec::new(),
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(outcomes)
    }

    /// Remove every worktree and branch of a session and drop its record.
    /// Returns the number of workspaces torn down. If any teardown fails the
    /// record is kept with those workspaces in `Error` so `health_check`
    /// reports them and a later cleanup can retry.
    pub async fn cleanup_session(&self, session_id: &str) -> WorkspaceResult<usize> {
        let workspaces = {
            let sessions = lock_mutex_recover(&self.sessions);
            sessions
                .get(session_id)
                .map(|r| r.workspaces.clone())
                .ok_or_else(|| WorkspaceError::SessionNotFound(session_id.to_string()))?
        };

        let mut outcomes: HashMap<String, Result<(), String>> = HashMap::new();
        for ws in workspaces.iter().filter(|ws| ws.status.is_live()) {
            let lock = self.agent_lock(session_id, &ws.agent_id);
            let _guard = lock.lock().await;
            outcomes.insert(ws.id.clone(), self.teardown(ws));
        }
        let cleaned = outcomes.values().filter(|r| r.is_ok()).count();
        let failed: Vec<String> = workspaces
            .iter()
            .filter(|ws| matches!(outcomes.get(&ws.id), Some(Err(_))))
            .map(|ws| ws.agent_id.clone())
            .collect();

        let mut changed = Vec::new();
        {
            let mut sessions = lock_mutex_recover(&self.sessions);
            if failed.is_empty() {
                sessions.remove(session_id);
            } else if let Some(record) = sessions.get_mut(session_id) {
                for ws in record.workspaces.iter_mut() {
                    let old = ws.status;
                    match outcomes.get(&ws.id) {
                        Some(Ok(())) => {
                            ws.status = WorkspaceStatus::Cleaned;
                            ws.error = None;
                        }
                        Some(Err(e)) => {
                            ws.status = WorkspaceStatus::Error;
                            ws.error = Some(format!("Cleanup failed: {}", e));
                        }
                        None => continue,
                    }
                    changed.push((ws.clone(), old));
                }
            }
            self.persist(&sessions)?;
        }

        if !failed.is_empty() {
            for (ws, old) in &changed {
                self.emit_workspace_status(ws, old.as_str());
            }
            log::error!(
                "[WorkspaceManager] Cleanup of session {} left {} workspace(s) behind: {}",
                session_id,
                failed.len(),
                failed.join(", ")
            );
            return Err(WorkspaceError::CleanupFailed {
                session_id: session_id.to_string(),
                agents: failed,
            });
        }

        for ws in workspaces.iter().filter(|ws| ws.status.is_live()) {
            let mut done = ws.clone();
            done.status = WorkspaceStatus::Cleaned;
            self.emit_workspace_status(&done, ws.status.as_str());
        }
        self.remove_session_dir(session_id);
        {
            let prefix = format!("{}/", session_id);
            let mut locks = lock_mutex_recover(&self.agent_locks);
            locks.retain(|key, _| !key.starts_with(&prefix));
        }

        log::info!(
            "[WorkspaceManager] Cleaned up session {} ({} workspace(s))",
            session_id,
            cleaned
        );
        Ok(cleaned)
    }

    /// Tear the session down after `grace`, leaving time for result retrieval
    pub fn schedule_cleanup(
        self: &Arc<Self>,
        session_id: &str,
        grace: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let session_id = session_id.to_string();
        log::info!(
            "[WorkspaceManager] Cleanup of {} scheduled in {}s",
            session_id,
            grace.as_secs()
        );
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if manager.get_session(&session_id).is_none() {
                return;
            }
            if let Err(e) = manager.cleanup_session(&session_id).await {
                log::warn!("[WorkspaceManager] Scheduled cleanup of {} failed: {}", session_id, e);
            }
        })
    }

    /// Compare session records against the filesystem
    pub fn health_check(&self) -> HealthReport {
        let mut report = HealthReport::default();
        let sessions = lock_mutex_recover(&self.sessions);

        for (id, record) in sessions.iter() {
            let missing: Vec<PathBuf> = record
                .workspaces
                .iter()
                .filter(|ws| ws.status.is_live() && !ws.path.exists())
                .map(|ws| ws.path.clone())
                .collect();
            let errored = record
                .workspaces
                .iter()
                .any(|ws| ws.status == WorkspaceStatus::Error);
            if missing.is_empty() && !errored {
                report.healthy_sessions.push(id.clone());
            } else {
                report.unhealthy_sessions.push(id.clone());
                report.missing_paths.extend(missing);
            }
        }

        let root = self.worktree_root();
        if let Ok(entries) = std::fs::read_dir(&root) {
            for session_dir in entries.flatten().map(|e| e.path()).filter(|p| p.is_dir()) {
                let session_id = session_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let owned: HashSet<PathBuf> = sessions
                    .get(&session_id)
                    .map(|r| {
                        r.workspaces
                            .iter()
                            .filter(|ws| ws.status.is_live())
                            .map(|ws| ws.path.clone())
                            .collect()
                    })
                    .unwrap_or_default();

                if let Ok(agent_dirs) = std::fs::read_dir(&session_dir) {
                    for path in agent_dirs.flatten().map(|e| e.path()).filter(|p| p.is_dir()) {
                        if !owned.contains(&path) {
                            report.orphaned_workspaces.push(path);
                        }
                    }
                }
            }
        }

        report.healthy_sessions.sort();
        report.unhealthy_sessions.sort();
        report.orphaned_workspaces.sort();
        report
    }
}
