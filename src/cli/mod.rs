//! Command-line interface for shipgate.
//!
//! Provides commands for serving the trigger endpoint, running the pipeline
//! for one commit, and inspecting recorded runs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::{Collaborators, DockerBuilder, DockerRuntime, GitCheckout, TrivyScanner};
use crate::config::{self, ResolvedConfig};
use crate::core::{Dispatcher, PipelineEngine, RunStore, RunTracker, TargetLock};
use crate::domain::{PipelineRun, RunOrigin, RunState};
use crate::server::{self, runs::RunView, AppState};
use crate::trigger::TriggerReceiver;

/// shipgate - push-triggered build, scan and staging deployment pipeline
#[derive(Parser, Debug)]
#[command(name = "shipgate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: discover .shipgate/config.yaml upwards)
    #[arg(short, long, global = true, env = "SHIPGATE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the trigger endpoint and run the target's worker
    Serve {
        /// Address to bind to (overrides server.bind)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Run the pipeline for one commit in-process (refused while `serve` holds the target)
    Run {
        /// Commit SHA to build
        commit: String,

        /// Branch the commit belongs to
        #[arg(short, long, default_value = "main")]
        branch: String,

        /// Repository clone URL
        #[arg(short, long)]
        repository: String,
    },

    /// Show one run with its stage history
    Status {
        /// Run ID (UUID)
        run_id: String,

        /// Print the raw JSON record
        #[arg(long)]
        json: bool,
    },

    /// List recent runs
    Runs {
        /// Only runs for this commit (full SHA or prefix of 7+ characters)
        #[arg(short, long)]
        commit: Option<String>,

        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = match self.config {
            Some(ref path) => config::load_from(path)?,
            None => config::load()?,
        };

        match self.command {
            Commands::Serve { bind } => serve(config, bind).await,
            Commands::Run {
                commit,
                branch,
                repository,
            } => run_once(config, commit, branch, repository).await,
            Commands::Status { run_id, json } => show_status(&config, &run_id, json).await,
            Commands::Runs { commit, limit } => list_runs(&config, commit, limit).await,
            Commands::Config => show_config(&config),
        }
    }
}

/// Production collaborators described by the config
fn collaborators(config: &ResolvedConfig) -> Collaborators {
    Collaborators {
        source: Arc::new(GitCheckout::new(config.workspaces.clone())),
        builder: Arc::new(DockerBuilder::new()),
        scanner: Arc::new(TrivyScanner::new()),
        runtime: Arc::new(DockerRuntime::new(
            config.target.project.clone(),
            config.compose_file.clone(),
        )),
    }
}

async fn open_store(config: &ResolvedConfig) -> Result<Arc<RunStore>> {
    let store = RunStore::open(config.runs_dir()).await?;
    Ok(Arc::new(store))
}

fn build_engine(config: &ResolvedConfig, store: Arc<RunStore>) -> PipelineEngine {
    PipelineEngine::new(
        store,
        collaborators(config),
        config.pipeline.clone(),
        config.notify.build(),
    )
}

/// Start the HTTP server and the target's worker
async fn serve(config: ResolvedConfig, bind: Option<String>) -> Result<()> {
    let secret = config.webhook_secret()?;
    let _lock = TargetLock::acquire(&config.home, &config.target.name)?;
    let store = open_store(&config).await?;
    let engine = Arc::new(build_engine(&config, Arc::clone(&store)));

    let closed = engine.close_interrupted().await?;
    if !closed.is_empty() {
        tracing::warn!("Closed {} run(s) interrupted by the last shutdown", closed.len());
    }

    let served = store.served_images(&config.target.name).await;
    let target = config.deployment_target().with_current(served);

    let receiver = TriggerReceiver::new(&config.trigger, secret)
        .with_context(|| format!("Invalid branch pattern: {}", config.trigger.branch))?;

    let (dispatcher, worker) = Dispatcher::spawn(engine, target, config.server.queue_capacity);

    let state = AppState {
        receiver: Arc::new(receiver),
        dispatcher,
        store,
    };

    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    tokio::select! {
        result = server::serve(&bind, state) => result,
        _ = worker => anyhow::bail!("Worker for target '{}' stopped", config.target.name),
    }
}

/// Run the pipeline once for a commit, bypassing the trigger endpoint
async fn run_once(
    config: ResolvedConfig,
    commit: String,
    branch: String,
    repository: String,
) -> Result<()> {
    if !crate::adapters::git::is_valid_revision(&commit) {
        anyhow::bail!("Invalid commit: {} (expected 7-40 hex characters)", commit);
    }

    // Fails while `serve` (or another `run`) drives the same target
    let _lock = TargetLock::acquire(&config.home, &config.target.name)?;
    let store = open_store(&config).await?;
    let served = store.served_images(&config.target.name).await;
    let mut target = config.deployment_target().with_current(served);

    let run = PipelineRun::new(RunOrigin {
        commit_ref: commit.to_lowercase(),
        branch,
        repository,
        delivery_id: None,
        target: target.name.clone(),
    });
    store.create(&run).await?;
    eprintln!("[Run {} started]", run.id);

    let engine = build_engine(&config, store);
    let tracker = RunTracker::new(&config.pipeline.budget, None);
    let run = match engine.execute(run.id, &mut target, tracker).await {
        Ok(run) => run,
        Err(e) => {
            engine.abort(run.id, &e).await;
            return Err(e);
        }
    };

    print_run(&run);

    match run.state {
        RunState::Succeeded => {
            eprintln!("\n[Run {} succeeded]", run.id);
            Ok(())
        }
        state => {
            eprintln!("\n[Run {} finished: {}]", run.id, state);
            std::process::exit(1);
        }
    }
}

/// Show the status of a run
async fn show_status(config: &ResolvedConfig, run_id_str: &str, json: bool) -> Result<()> {
    let run_id = Uuid::parse_str(run_id_str)
        .with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let store = open_store(config).await?;
    let run = store.get(run_id).await?;

    if json {
        let view = RunView::from(run);
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    print_run(&run);
    Ok(())
}

fn print_run(run: &PipelineRun) {
    println!("Run ID: {}", run.id);
    println!("Commit: {} ({})", run.commit_ref, run.branch);
    println!("Target: {}", run.target);
    println!("State: {}", run.state);
    println!("Created: {}", run.created_at);
    if let Some(finished) = run.finished_at {
        println!("Finished: {}", finished);
    }
    if let Some(stage) = run.stopped_at() {
        println!("Stopped at: {}", stage);
    }
    if let Some(ref failure) = run.failure {
        println!("Failure: {} ({})", failure.message, failure.class);
    }
    if let Some(ref alarm) = run.alarm {
        println!("ALARM: {}", alarm);
    }

    println!("\nStages:");
    for stage in &run.stages {
        let note = stage.error_message().unwrap_or_default();
        println!(
            "  {:<16} {:<9} attempt {} {:>7}ms  {}",
            stage.name.to_string(),
            stage.outcome.to_string(),
            stage.attempt,
            stage.duration_ms,
            note
        );
    }
    if let Some(ref rollback) = run.rollback {
        println!(
            "  {:<16} {:<9} attempt {} {:>7}ms",
            "rollback",
            rollback.outcome.to_string(),
            rollback.attempt,
            rollback.duration_ms
        );
    }
}

/// List recent runs
async fn list_runs(config: &ResolvedConfig, commit: Option<String>, limit: usize) -> Result<()> {
    let store = open_store(config).await?;

    let runs = match commit {
        Some(commit) => {
            let mut runs = store.find_by_commit(&commit).await;
            runs.truncate(limit);
            runs
        }
        None => store.list(limit).await,
    };

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<12} {:<12} {:<16}", "RUN ID", "COMMIT", "STATE", "STOPPED AT");
    println!("{}", "-".repeat(80));

    for run in runs {
        let stopped = run
            .stopped_at()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        let commit: String = run.commit_ref.chars().take(10).collect();
        println!(
            "{:<38} {:<12} {:<12} {:<16}",
            run.id,
            commit,
            run.state.to_string(),
            stopped
        );
    }

    Ok(())
}

/// Show resolved configuration
fn show_config(config: &ResolvedConfig) -> Result<()> {
    println!("Config file: {}", match config.config_file {
        Some(ref path) => path.display().to_string(),
        None => "(none, using defaults)".to_string(),
    });
    println!("Home: {}", config.home.display());
    println!("Runs: {}", config.runs_dir().display());
    println!("Workspaces: {}", config.workspaces.display());
    println!("Bind: {}", config.server.bind);
    println!("Queue capacity: {}", config.server.queue_capacity);
    println!("Branch: {}", config.trigger.branch);
    println!(
        "Webhook secret: ${} ({})",
        config.trigger.secret_env,
        if config.webhook_secret().is_ok() { "set" } else { "not set" }
    );
    println!("Target: {} (compose project {})", config.target.name, config.target.project);
    for service in &config.target.services {
        let component = service
            .component
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<12} component={:<9} health={}",
            service.name,
            component,
            service.health_endpoint.as_deref().unwrap_or("-")
        );
    }
    println!("\nPipeline:");
    print!("{}", serde_yaml::to_string(&config.pipeline)?);
    Ok(())
}
