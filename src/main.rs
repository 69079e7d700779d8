use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use triagent_core::config::{CheckpointConfig, OrchestratorConfig};
use triagent_core::event::EventBus;
use triagent_core::types::{CancelReason, Email, ExecutionId, TriageHint};

use triagent_agent::run_log::read_log;
use triagent_agent::{
    replay, ActionStore, AgentRegistry, CancelHandle, CheckpointRecorder, CheckpointStore,
    DagBuilder, MemoryActionStore, Pipeline, RunLogger, SqliteActionStore,
};
use triagent_tools::ActionToolRegistry;

#[derive(Parser)]
#[command(name = "triagent", version, about = "Email triage orchestration core")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "triagent.toml", env = "TRIAGENT_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and print the execution graph for an email
    Graph {
        /// Email as JSON
        email: PathBuf,
        /// Triage hint as JSON
        #[arg(long)]
        hint: Option<PathBuf>,
    },
    /// Process one email end to end against the configured endpoints
    Run {
        /// Email as JSON
        email: PathBuf,
        /// Triage hint as JSON
        #[arg(long)]
        hint: Option<PathBuf>,
    },
    /// Replay the checkpoints of a past execution
    Replay {
        execution_id: String,
        /// Read a JSONL checkpoint log instead of the checkpoint database
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("triagent=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        OrchestratorConfig::load(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "No config file found, using defaults");
        OrchestratorConfig::default()
    };
    let config = Arc::new(config);

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(config.as_ref())?);
        }
        Commands::Graph { email, hint } => {
            let email: Email = read_json(&email)?;
            let hint: Option<TriageHint> = hint.as_deref().map(read_json).transpose()?;
            let graph = DagBuilder::new(&config.orchestrator)?.build(ExecutionId::new(), &email, hint.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&graph.snapshot())?);
        }
        Commands::Run { email, hint } => {
            let email: Email = read_json(&email)?;
            let hint: Option<TriageHint> = hint.as_deref().map(read_json).transpose()?;
            run_email(config, email, hint).await?;
        }
        Commands::Replay { execution_id, log } => {
            let id = ExecutionId(execution_id);
            let events = match log {
                Some(path) => read_log(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let checkpoint = config.checkpoint.clone().unwrap_or_default();
                    CheckpointStore::open(Path::new(&checkpoint.db_path))?.load(&id)?
                }
            };
            if events.is_empty() {
                anyhow::bail!("no checkpoints recorded for execution {}", id);
            }
            println!("{}", serde_json::to_string_pretty(&replay(&events))?);
        }
    }

    Ok(())
}

async fn run_email(config: Arc<OrchestratorConfig>, email: Email, hint: Option<TriageHint>) -> anyhow::Result<()> {
    let event_bus = Arc::new(EventBus::default());

    let checkpoint = config.checkpoint.clone().unwrap_or_default();
    let (checkpoint_store, action_store) = open_stores(&checkpoint)?;

    // Spawn RunLogger if logging is enabled
    let log_config = config.log.clone().unwrap_or_default();
    let logger = if log_config.enabled {
        let logger = RunLogger::new(log_config.dir());
        Some(logger.spawn(&event_bus, tokio_util::sync::CancellationToken::new()))
    } else {
        None
    };

    let (recorder, recorder_worker) =
        CheckpointRecorder::spawn_with_retention(event_bus.clone(), checkpoint_store, checkpoint.retain_executions);
    drop(event_bus);

    let registry = AgentRegistry::from_config(&config.agents)?;
    if registry.registered_types().is_empty() {
        warn!("No agent endpoints configured; every stage will fail");
    }
    let tools = ActionToolRegistry::from_config(&config.tools)?;

    let pipeline = Pipeline::new(
        config.clone(),
        Arc::new(registry),
        Arc::new(tools),
        action_store,
        recorder.clone(),
    )?;

    let cancel = CancelHandle::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Interrupted, cancelling execution");
        ctrl_c.cancel(CancelReason::Requested { by: "ctrl-c".into() });
    });

    let result = pipeline.process_with_cancel(&email, hint.as_ref(), cancel).await;

    // Let the recorder and logger drain before exiting.
    recorder.flush().await;
    drop(pipeline);
    drop(recorder);
    recorder_worker.await.ok();
    if let Some(handle) = logger {
        handle.await.ok();
    }

    match result {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Err(e) if e.is_critical() => {
            error!(error = %e, "Critical failure, no actions were routed");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

type Stores = (Option<Arc<CheckpointStore>>, Arc<dyn ActionStore>);

fn open_stores(checkpoint: &CheckpointConfig) -> anyhow::Result<Stores> {
    if !checkpoint.enabled {
        return Ok((None, Arc::new(MemoryActionStore::new())));
    }
    let path = Path::new(&checkpoint.db_path);
    let checkpoints = CheckpointStore::open(path)
        .with_context(|| format!("opening checkpoint store at {}", path.display()))?;
    let actions = SqliteActionStore::open(path)?;
    Ok((Some(Arc::new(checkpoints)), Arc::new(actions)))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}
