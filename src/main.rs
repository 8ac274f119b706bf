use agent_orchestrator_lib::config::{self, PartialConfig, PartialQueueConfig, PartialStrategyConfig};
use agent_orchestrator_lib::events::{ChannelEventSink, EventSink, OrchestratorEvent};
use agent_orchestrator_lib::git::GitVcs;
use agent_orchestrator_lib::isolation::WorkspaceManager;
use agent_orchestrator_lib::shutdown::{register_signal_handlers, ShutdownHandler, ShutdownState};
use agent_orchestrator_lib::sweeper::{SweepConfig, Sweeper};
use agent_orchestrator_lib::{build_coordinator, CoordinationStrategy, OrchestrationPlan, SessionStatus};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Agent Orchestrator - run a plan across isolated agent workspaces
#[derive(Parser, Debug)]
#[command(name = "agent-orchestrator")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Repository the agents work in
    #[arg(long, short = 'C', default_value = ".", env = "ORCHESTRATOR_REPO")]
    repo: PathBuf,

    /// Maximum number of tasks in progress at once
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Per-task timeout in seconds
    #[arg(long)]
    task_timeout: Option<u64>,

    /// Dispatch tick in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute an orchestration plan (JSON) and print the session result
    Run {
        plan: PathBuf,

        /// Override the plan's coordination strategy
        #[arg(long)]
        strategy: Option<CoordinationStrategy>,
    },
    /// List persisted sessions
    Sessions,
    /// Compare persisted sessions against the worktrees on disk
    Health,
    /// Print the merged configuration and where it was loaded from
    Config,
}

impl Cli {
    fn overrides(&self) -> Option<PartialConfig> {
        if self.max_concurrent.is_none() && self.task_timeout.is_none() && self.tick_ms.is_none() {
            return None;
        }
        Some(PartialConfig {
            queue: Some(PartialQueueConfig {
                max_concurrent_tasks: self.max_concurrent,
                task_timeout_secs: self.task_timeout,
                ..Default::default()
            }),
            strategy: Some(PartialStrategyConfig {
                tick_ms: self.tick_ms,
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    match rt.block_on(run(cli)) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let repo = cli
        .repo
        .canonicalize()
        .with_context(|| format!("Repository not found: {}", cli.repo.display()))?;
    let config = config::load_merged_config(Some(&repo), cli.overrides())?;

    match cli.command {
        Command::Run { ref plan, strategy } => run_plan(&repo, config, plan, strategy).await,
        Command::Sessions => {
            let workspaces = open_workspaces(&repo, &config)?;
            for session in workspaces.list_sessions() {
                println!(
                    "{}  {:<9}  {:<15}  {} agent(s)  {}",
                    session.id,
                    session.status.as_str(),
                    session.strategy.as_str(),
                    session.agents.len(),
                    session.task_description
                );
            }
            Ok(0)
        }
        Command::Health => {
            let workspaces = open_workspaces(&repo, &config)?;
            let report = workspaces.health_check();
            println!("{}", serde_json::to_string_pretty(&report)?);
            let healthy = report.unhealthy_sessions.is_empty() && report.orphaned_workspaces.is_empty();
            Ok(if healthy { 0 } else { 1 })
        }
        Command::Config => {
            let (global, project) = config::get_config_paths(Some(&repo));
            println!("# global:  {}", describe_path(global.as_deref()));
            println!("# project: {}", describe_path(project.as_deref()));
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(0)
        }
    }
}

fn describe_path(path: Option<&Path>) -> String {
    match path {
        Some(p) if p.exists() => p.display().to_string(),
        Some(p) => format!("{} (absent)", p.display()),
        None => "-".to_string(),
    }
}

fn open_workspaces(repo: &Path, config: &config::OrchestratorConfig) -> anyhow::Result<WorkspaceManager> {
    let vcs = Arc::new(GitVcs::new(
        repo,
        &config.workspace.commit_author_name,
        &config.workspace.commit_author_email,
    ));
    let (sink, _rx) = ChannelEventSink::channel();
    let workspaces = WorkspaceManager::new(repo, config.workspace.clone(), vcs, Arc::new(sink));
    workspaces.load()?;
    Ok(workspaces)
}

async fn run_plan(
    repo: &Path,
    config: config::OrchestratorConfig,
    plan_path: &Path,
    strategy: Option<CoordinationStrategy>,
) -> anyhow::Result<i32> {
    let content = std::fs::read_to_string(plan_path)
        .with_context(|| format!("Failed to read plan {}", plan_path.display()))?;
    let mut plan: OrchestrationPlan = serde_json::from_str(&content)
        .with_context(|| format!("Invalid plan {}", plan_path.display()))?;
    if let Some(strategy) = strategy {
        plan.strategy = strategy;
    }

    let shutdown_state = ShutdownState::new();
    if let Err(e) = register_signal_handlers(shutdown_state.clone()) {
        log::warn!("Failed to register signal handlers: {}", e);
    }

    let (sink, events_rx) = ChannelEventSink::channel();
    let events: Arc<dyn EventSink> = Arc::new(sink);
    tokio::spawn(forward_events(events_rx));

    let sweep = SweepConfig::from_config(&config);
    let coordinator = build_coordinator(repo, config, events, shutdown_state.clone())?;
    let sweeper = Sweeper::spawn(
        Arc::clone(coordinator.queue()),
        Arc::clone(coordinator.conflicts()),
        sweep,
        shutdown_state.clone(),
    );

    let session_id = coordinator.create_session(&plan).await?;
    println!("Session {} started ({})", session_id, plan.strategy);

    let outcome = coordinator.start_session(&session_id).await;

    let handler = ShutdownHandler::with_state(shutdown_state);
    let cleanup = Arc::clone(&coordinator);
    handler
        .handle_shutdown(|| async move { Ok(cleanup.shutdown().await) })
        .await?;
    sweeper.join().await;

    let result = outcome.context("Session task panicked")??;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(if result.status == SessionStatus::Completed { 0 } else { 1 })
}

/// Log orchestrator events as they arrive
async fn forward_events(mut rx: UnboundedReceiver<OrchestratorEvent>) {
    log::debug!("Event forwarder started");

    while let Some(event) = rx.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => log::debug!("[Event] {}", json),
            Err(_) => log::debug!("[Event] {}", event.name()),
        }
    }

    log::debug!("Event forwarder stopped");
}
