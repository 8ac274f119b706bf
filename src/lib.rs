#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types
#![allow(clippy::unnecessary_map_or)] // map_or can be clearer than alternatives
#![allow(clippy::too_many_arguments)]

// Module declarations
pub mod backend;
pub mod config;
pub mod conflicts;
pub mod events;
pub mod file_storage;
pub mod git;
pub mod isolation;
pub mod models;
pub mod queue;
pub mod shutdown;
pub mod strategy;
pub mod sweeper;
pub mod utils;

pub use models::*;

use backend::{BackendVoter, ExecutionBackend, ProcessBackend, ResourceProbe, SysinfoProbe, Voter};
use config::OrchestratorConfig;
use conflicts::ConflictManager;
use events::EventSink;
use git::GitVcs;
use isolation::WorkspaceManager;
use queue::TaskQueue;
use shutdown::ShutdownState;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use strategy::{Coordinator, CoordinatorDeps};

/// Wire the default components for a repository: git worktrees, the
/// configured agent command, and system resource readings
pub fn build_coordinator(
    repo_path: &Path,
    config: OrchestratorConfig,
    events: Arc<dyn EventSink>,
    shutdown: ShutdownState,
) -> anyhow::Result<Arc<Coordinator>> {
    file_storage::init_orchestrator_dir(repo_path)?;

    let vcs = Arc::new(GitVcs::new(
        repo_path,
        &config.workspace.commit_author_name,
        &config.workspace.commit_author_email,
    ));
    let workspaces = Arc::new(WorkspaceManager::new(
        repo_path,
        config.workspace.clone(),
        vcs,
        Arc::clone(&events),
    ));
    workspaces.load()?;

    let backend: Arc<dyn ExecutionBackend> = Arc::new(ProcessBackend::new(config.backend.clone()));
    let voter: Arc<dyn Voter> = Arc::new(BackendVoter::new(
        Arc::clone(&backend),
        Duration::from_secs(config.strategy.voting_timeout_secs),
    ));
    let probe: Arc<dyn ResourceProbe> = Arc::new(SysinfoProbe::new());

    Ok(Arc::new(Coordinator::new(CoordinatorDeps {
        queue: Arc::new(TaskQueue::new(config.queue.clone(), Arc::clone(&events))),
        conflicts: Arc::new(ConflictManager::new(
            repo_path,
            config.conflicts.clone(),
            Arc::clone(&events),
        )),
        config,
        workspaces,
        backend,
        voter,
        probe,
        events,
        shutdown,
    })))
}
