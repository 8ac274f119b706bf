//! Execution backend boundary
//!
//! The orchestrator only starts an agent, feeds it task text and waits for a
//! pass/fail answer within a deadline. How the agent runs is up to the
//! backend; `ProcessBackend` spawns a configured command per task.

use crate::config::BackendConfig;
use crate::models::{Task, TaskResult};
use crate::utils::{generate_id, lock_mutex_recover};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use sysinfo::System;
use thiserror::Error;
use tokio::process::Command;

/// How long `start_agent` waits for a worktree to appear on disk
const WORKSPACE_WAIT: Duration = Duration::from_secs(5);
const WORKSPACE_POLL: Duration = Duration::from_millis(50);

/// Output kept from a task run, in bytes
const MAX_OUTPUT_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Workspace path does not exist: {0:?}")]
    MissingWorkspace(PathBuf),

    #[error("Unknown agent handle: {0}")]
    UnknownHandle(String),

    #[error("Backend failure: {0}")]
    Other(String),
}

/// A started agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHandle {
    pub id: String,
    pub agent_id: String,
    pub workspace_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendOutcome {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl BackendOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn into_task_result(self) -> TaskResult {
        TaskResult {
            success: self.success,
            output: self.output,
            error: self.error,
            metadata: Default::default(),
        }
    }
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn start_agent(&self, agent_id: &str, workspace_path: &Path) -> Result<AgentHandle, BackendError>;

    /// Run one task. A failed or timed-out run is an `Ok` outcome with
    /// `success == false`; `Err` is reserved for the backend itself breaking.
    async fn run_task(
        &self,
        handle: &AgentHandle,
        task_text: &str,
        timeout: Duration,
    ) -> Result<BackendOutcome, BackendError>;

    async fn terminate(&self, handle: &AgentHandle) -> Result<(), BackendError>;
}

/// Wait for a directory that another component is still creating
pub async fn wait_for_path(path: &Path, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if path.exists() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(WORKSPACE_POLL).await;
    }
}

fn truncate_output(mut text: String) -> String {
    if text.len() > MAX_OUTPUT_LEN {
        let mut cut = MAX_OUTPUT_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n[output truncated]");
    }
    text
}

/// Runs `config.command` once per task inside the agent's workspace
pub struct ProcessBackend {
    config: BackendConfig,
    handles: Mutex<HashSet<String>>,
}

impl ProcessBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            handles: Mutex::new(HashSet::new()),
        }
    }

    /// Arguments with `{task}` and `{workspace}` substituted
    pub fn build_args(&self, task_text: &str, workspace: &Path) -> Vec<String> {
        let workspace = workspace.to_string_lossy();
        self.config
            .args
            .iter()
            .map(|arg| arg.replace("{task}", task_text).replace("{workspace}", &workspace))
            .collect()
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    async fn start_agent(&self, agent_id: &str, workspace_path: &Path) -> Result<AgentHandle, BackendError> {
        if !wait_for_path(workspace_path, WORKSPACE_WAIT).await {
            return Err(BackendError::MissingWorkspace(workspace_path.to_path_buf()));
        }

        let handle = AgentHandle {
            id: generate_id("agent"),
            agent_id: agent_id.to_string(),
            workspace_path: workspace_path.to_path_buf(),
        };
        lock_mutex_recover(&self.handles).insert(handle.id.clone());
        log::info!(
            "[ProcessBackend] Started agent {} in {:?}",
            agent_id,
            workspace_path
        );
        Ok(handle)
    }

    async fn run_task(
        &self,
        handle: &AgentHandle,
        task_text: &str,
        timeout: Duration,
    ) -> Result<BackendOutcome, BackendError> {
        if !lock_mutex_recover(&self.handles).contains(&handle.id) {
            return Err(BackendError::UnknownHandle(handle.id.clone()));
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.args(self.build_args(task_text, &handle.workspace_path))
            .envs(&self.config.env)
            .current_dir(&handle.workspace_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| BackendError::Spawn {
            program: self.config.command.clone(),
            source: e,
        })?;

        // Dropping the future on timeout drops the child, which kills it
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Ok(BackendOutcome::failure(format!("Failed to wait for agent: {}", e))),
            Err(_) => {
                log::warn!(
                    "[ProcessBackend] Agent {} timed out after {}s",
                    handle.agent_id,
                    timeout.as_secs()
                );
                return Ok(BackendOutcome::failure(format!(
                    "Task timed out after {}s",
                    timeout.as_secs()
                )));
            }
        };

        let stdout = truncate_output(String::from_utf8_lossy(&output.stdout).trim().to_string());
        if output.status.success() {
            return Ok(BackendOutcome::success(stdout));
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let error = if stderr.is_empty() {
            format!("Agent exited with {}", output.status)
        } else {
            truncate_output(stderr)
        };
        Ok(BackendOutcome {
            success: false,
            output: (!stdout.is_empty()).then_some(stdout),
            error: Some(error),
        })
    }

    async fn terminate(&self, handle: &AgentHandle) -> Result<(), BackendError> {
        if !lock_mutex_recover(&self.handles).remove(&handle.id) {
            return Err(BackendError::UnknownHandle(handle.id.clone()));
        }
        log::info!("[ProcessBackend] Terminated agent {}", handle.agent_id);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    Approve,
    Reject,
}

/// Source of consensus votes; `None` is an abstention
#[async_trait]
pub trait Voter: Send + Sync {
    async fn cast_vote(&self, handle: &AgentHandle, task: &Task) -> Option<Vote>;
}

/// First APPROVE or REJECT token in an agent's answer
pub fn parse_vote(answer: &str) -> Option<Vote> {
    static VOTE_RE: OnceLock<Option<regex::Regex>> = OnceLock::new();
    let re = VOTE_RE
        .get_or_init(|| regex::Regex::new(r"\b(APPROVE|REJECT)\b").ok())
        .as_ref()?;
    match re.captures(answer)?.get(1)?.as_str() {
        "APPROVE" => Some(Vote::Approve),
        "REJECT" => Some(Vote::Reject),
        _ => None,
    }
}

pub fn review_prompt(task: &Task) -> String {
    format!(
        "Review the following task before it is executed.\n\
         Task ({} priority): {}\n\n\
         Answer with a single word: APPROVE if it is safe to proceed, REJECT otherwise.",
        task.priority, task.description
    )
}

/// Asks each agent for its vote through the execution backend
pub struct BackendVoter {
    backend: Arc<dyn ExecutionBackend>,
    timeout: Duration,
}

impl BackendVoter {
    pub fn new(backend: Arc<dyn ExecutionBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }
}

#[async_trait]
impl Voter for BackendVoter {
    async fn cast_vote(&self, handle: &AgentHandle, task: &Task) -> Option<Vote> {
        match self.backend.run_task(handle, &review_prompt(task), self.timeout).await {
            Ok(outcome) if outcome.success => {
                let vote = parse_vote(outcome.output.as_deref().unwrap_or_default());
                if vote.is_none() {
                    log::debug!("[Consensus] {} gave no clear vote, abstaining", handle.agent_id);
                }
                vote
            }
            Ok(outcome) => {
                log::debug!(
                    "[Consensus] {} could not vote: {}",
                    handle.agent_id,
                    outcome.error.unwrap_or_default()
                );
                None
            }
            Err(e) => {
                log::warn!("[Consensus] Vote request to {} failed: {}", handle.agent_id, e);
                None
            }
        }
    }
}

/// Live resource pressure in [0, 1]; `None` means unmeasured
pub trait ResourceProbe: Send + Sync {
    fn pressure(&self) -> Option<f64>;
}

/// Reports the larger of global CPU usage and memory used/total
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn pressure(&self) -> Option<f64> {
        let mut system = lock_mutex_recover(&self.system);
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            return None;
        }
        let memory = system.used_memory() as f64 / total as f64;
        let cpu = (system.global_cpu_usage() as f64 / 100.0).clamp(0.0, 1.0);
        Some(memory.max(cpu))
    }
}

/// Fixed reading, for environments without measurement
pub struct StaticProbe(pub Option<f64>);

impl ResourceProbe for StaticProbe {
    fn pressure(&self) -> Option<f64> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewTask;
    use tempfile::TempDir;

    #[test]
    fn test_parse_vote() {
        assert_eq!(parse_vote("APPROVE"), Some(Vote::Approve));
        assert_eq!(parse_vote("After review: REJECT.\nToo risky"), Some(Vote::Reject));
        assert_eq!(parse_vote("I think this is fine"), None);
        assert_eq!(parse_vote("DISAPPROVED"), None);
    }

    #[test]
    fn test_build_args_substitutes_placeholders() {
        let backend = ProcessBackend::new(BackendConfig {
            command: "agent".to_string(),
            args: vec!["--cwd".to_string(), "{workspace}".to_string(), "{task}".to_string()],
            env: Default::default(),
        });
        let args = backend.build_args("fix the bug", Path::new("/tmp/ws"));
        assert_eq!(args, vec!["--cwd", "/tmp/ws", "fix the bug"]);
    }

    #[test]
    fn test_outcome_into_task_result() {
        let result = BackendOutcome::failure("boom").into_task_result();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_review_prompt_mentions_task() {
        let task = Task::from_new(NewTask::new("s", "a", "drop the users table"), 3);
        assert!(review_prompt(&task).contains("drop the users table"));
    }

    #[tokio::test]
    async fn test_start_agent_requires_workspace() {
        let backend = ProcessBackend::new(BackendConfig::default());
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope");
        let err = tokio::time::timeout(Duration::from_secs(10), backend.start_agent("a", &missing))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BackendError::MissingWorkspace(_)));
    }

    #[cfg(unix)]
    fn shell_backend(script: &str) -> ProcessBackend {
        ProcessBackend::new(BackendConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: Default::default(),
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_backend_success_and_failure() {
        let tmp = TempDir::new().unwrap();

        let ok = shell_backend("echo done: {task}");
        let handle = ok.start_agent("a", tmp.path()).await.unwrap();
        let outcome = ok
            .run_task(&handle, "write docs", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output.as_deref(), Some("done: write docs"));
        ok.terminate(&handle).await.unwrap();
        assert!(matches!(
            ok.run_task(&handle, "x", Duration::from_secs(1)).await,
            Err(BackendError::UnknownHandle(_))
        ));

        let failing = shell_backend("echo permission denied >&2; exit 3");
        let handle = failing.start_agent("b", tmp.path()).await.unwrap();
        let outcome = failing
            .run_task(&handle, "x", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("permission denied"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_backend_timeout() {
        let tmp = TempDir::new().unwrap();
        let slow = shell_backend("sleep 5");
        let handle = slow.start_agent("a", tmp.path()).await.unwrap();
        let outcome = slow
            .run_task(&handle, "x", Duration::from_millis(200))
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[test]
    fn test_static_probe() {
        assert_eq!(StaticProbe(None).pressure(), None);
        assert_eq!(StaticProbe(Some(0.5)).pressure(), Some(0.5));
    }

    #[test]
    fn test_sysinfo_probe_in_range() {
        if let Some(p) = SysinfoProbe::new().pressure() {
            assert!((0.0..=1.0).contains(&p));
        }
    }
}
