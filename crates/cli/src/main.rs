//! `process-engine` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` — check a process model JSON file and print its node order.
//! - `run`      — run a model to completion against an in-memory task list,
//!   working every task as the configured default user.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use auth::{AuthService, PermissionScope, Principal, ServiceId, ServiceRegistry};
use engine::{validate_model, EngineConfig, ModelDefinition, NodeInstanceState, ProcessEngine, ProcessModel};
use messaging::{ProcessData, TaskList};

#[derive(Parser)]
#[command(name = "process-engine", about = "Process workflow engine", version)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a process model JSON file.
    Validate {
        /// Path to the model JSON file.
        path: PathBuf,
    },
    /// Run a process model with an in-memory task list.
    ///
    /// Activities must address the task list as `tasklist-1`.
    Run {
        /// Path to the model JSON file.
        path: PathBuf,
        /// Engine configuration JSON file.
        #[arg(long, env = "PROCESS_ENGINE_CONFIG")]
        config: Option<PathBuf>,
        /// User that works every task; overrides the configured default.
        #[arg(long, env = "PROCESS_ENGINE_USER")]
        user: Option<String>,
        /// Instance input as `name=value`; may be repeated.
        #[arg(long = "input", value_name = "NAME=VALUE")]
        inputs: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Validate { path } => {
            let checked = load_model(&path).and_then(|model| Ok((validate_model(&model)?, model)));
            match checked {
                Ok((order, model)) => {
                    println!("✅ Model '{}' is valid. Node order: {order:?}", model.name);
                    Ok(())
                }
                Err(e) => {
                    eprintln!("❌ Validation failed: {e:#}");
                    std::process::exit(1);
                }
            }
        }
        Command::Run { path, config, user, inputs } => {
            let mut config = match config {
                Some(path) => load_config(&path)?,
                None => EngineConfig::default(),
            };
            if let Some(user) = user {
                config.default_user = user;
            }
            let inputs = inputs.iter().map(|s| parse_input(s)).collect::<Result<Vec<_>>>()?;
            run(load_model(&path)?, config, inputs).await
        }
    }
}

fn load_model(path: &Path) -> Result<ProcessModel> {
    let content = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    let definition: ModelDefinition =
        serde_json::from_str(&content).with_context(|| format!("invalid model JSON in {}", path.display()))?;
    Ok(definition.build()?)
}

fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid config JSON in {}", path.display()))
}

fn parse_input(raw: &str) -> Result<ProcessData> {
    let Some((name, value)) = raw.split_once('=') else {
        bail!("input '{raw}' is not NAME=VALUE");
    };
    Ok(ProcessData::text(name.trim(), value))
}

/// Run `model` until the instance is final or no task is left to work.
async fn run(model: ProcessModel, config: EngineConfig, inputs: Vec<ProcessData>) -> Result<()> {
    let services = Arc::new(ServiceRegistry::new());
    let auth = Arc::new(AuthService::new(config.auth_config(), services));
    let tasklist = Arc::new(TaskList::register(Arc::clone(&auth))?);
    let engine = ProcessEngine::new(config.clone(), Arc::clone(&auth), tasklist.clone())?;
    let user = Principal::new(config.default_user.as_str());

    let host = auth.grant(
        user.clone(),
        ServiceId::new("cli"),
        engine.service_id().clone(),
        PermissionScope::start_process(None).union(&PermissionScope::cancel_process(None)),
        None,
    )?;

    let mut tx = engine.begin();
    let model_h = engine.add_process_model(&mut tx, model)?;
    let instance = engine.start_process(&mut tx, &host, model_h, "cli", inputs).await?;
    engine.commit(tx)?;

    loop {
        let mut tx = engine.begin();
        if engine.process_instance(&mut tx, instance)?.state.is_final() {
            engine.rollback(tx);
            break;
        }
        let tasks = tasklist.open_tasks()?;
        let Some(task) = tasks.first() else {
            engine.rollback(tx);
            warn!("no open tasks left but the instance is not final");
            break;
        };

        let node = task.node_instance.into();
        let token = tasklist.accept_task(&user, task.node_instance)?;
        engine.accept_task(&mut tx, &token, node)?;
        engine.start_task(&mut tx, &token, node)?;
        engine.finish_task(&mut tx, &token, node, Vec::new()).await?;
        engine.commit(tx)?;
        tasklist.close_task(task.node_instance)?;
        info!(node = %task.node_id, operation = %task.operation, "task worked");
    }

    let mut tx = engine.begin();
    let state = engine.process_instance(&mut tx, instance)?.state;
    println!("Instance {instance} ended {state}");
    for node in engine.node_instances(&mut tx, instance)? {
        let marker = if node.state == NodeInstanceState::Complete { "✔" } else { "·" };
        println!("  {marker} {:<16} {}", node.node, node.state);
    }
    engine.rollback(tx);
    Ok(())
}
