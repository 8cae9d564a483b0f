mod local;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use waypoint_core::ConfigStore;
use waypoint_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use waypoint_orchestrator::{ExecutorRegistry, PlanningFlow, TaskManager};
use waypoint_types::names;

use crate::local::{EchoExecutor, InteractiveExecutor, StaticPlanner};

#[derive(Parser, Debug)]
#[command(name = "waypoint-engine")]
#[command(about = "Plan orchestration with human-in-the-loop steps")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Plan and execute a request, printing task events as JSON lines.
    Run {
        prompt: String,
        #[arg(long)]
        config: Option<String>,
        /// Plan step; repeat for more. Steps tagged `[ASK]` wait for an answer on stdin.
        #[arg(long = "step")]
        steps: Vec<String>,
        #[arg(long)]
        plan_id: Option<String>,
        #[arg(long, env = "WAYPOINT_MAX_RETRIES")]
        max_retries: Option<u32>,
        #[arg(long, env = "WAYPOINT_EXECUTION_TIMEOUT_SECS")]
        timeout_secs: Option<u64>,
        #[arg(long)]
        todo: Option<String>,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Print the effective configuration and its layers.
    Config {
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            prompt,
            config,
            steps,
            plan_id,
            max_retries,
            timeout_secs,
            todo,
            state_dir,
        } => {
            if prompt.trim().is_empty() {
                anyhow::bail!("prompt cannot be empty");
            }
            let overrides = build_cli_overrides(plan_id, max_retries, timeout_secs, todo);
            let store = ConfigStore::new(config.map(PathBuf::from), overrides)
                .await
                .context("failed to load configuration")?;
            let app_config = store.get().await;

            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = app_config
                .logging
                .logs_dir
                .as_deref()
                .map(PathBuf::from)
                .unwrap_or_else(|| canonical_logs_dir_from_root(&state_dir));
            let (_log_guard, log_info) = init_process_logging(
                ProcessKind::Cli,
                &logs_dir,
                app_config.logging.retention_days,
            )
            .context("failed to initialize logging")?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Cli,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    status: Some("ok"),
                    detail: Some("cli jsonl logging initialized"),
                    ..ObservabilityEvent::default()
                },
            );
            info!("logging initialized: {:?}", log_info);

            let executors = ExecutorRegistry::new()
                .with("general", Arc::new(EchoExecutor::default()))
                .with("ask", Arc::new(InteractiveExecutor::default()));
            let flow = PlanningFlow::new(executors)
                .with_config(&app_config.flow)
                .with_planner(Arc::new(StaticPlanner::new(plan_title(&prompt), steps)))
                .with_process(ProcessKind::Cli);

            let manager = TaskManager::new();
            let task_id = manager.start(flow, &prompt).await;
            drive_task(&manager, &task_id).await?;

            let result = manager
                .result(&task_id)
                .await
                .context("task finished without a result")?;
            manager.remove(&task_id).await;
            println!("{result}");
        }
        Command::Config { config } => {
            let store = ConfigStore::new(config.map(PathBuf::from), None)
                .await
                .context("failed to load configuration")?;
            let output = json!({
                "effective": store.get().await,
                "layers": store.get_layers_value().await,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Prints every event of the task and answers questions from stdin until the run completes.
async fn drive_task(manager: &TaskManager, task_id: &str) -> anyhow::Result<()> {
    let stream = manager
        .subscribe(task_id)
        .await
        .context("task has no event stream")?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    while let Some(event) = stream.next().await {
        println!("{}", serde_json::to_string(&event)?);
        if event.event_name == names::ASK_HUMAN {
            let query = event.content["query"].as_str().unwrap_or_default();
            let correlation = event.content["interaction_id"].as_str();
            eprintln!("question: {query}");
            let answer = stdin
                .next_line()
                .await
                .context("failed to read answer from stdin")?
                .unwrap_or_else(|| "(No input provided)".to_string());
            if let Err(err) = manager.respond(task_id, correlation, answer.trim()).await {
                tracing::warn!(task_id, "answer was not delivered: {err}");
            }
        }
        if event.is_lifecycle_complete() {
            break;
        }
    }

    manager.wait(task_id).await;
    Ok(())
}

fn build_cli_overrides(
    plan_id: Option<String>,
    max_retries: Option<u32>,
    timeout_secs: Option<u64>,
    todo: Option<String>,
) -> Option<Value> {
    let mut flow = Map::new();
    if let Some(plan_id) = plan_id {
        flow.insert("plan_id".to_string(), Value::String(plan_id));
    }
    if let Some(max_retries) = max_retries {
        flow.insert("max_retries_per_step".to_string(), json!(max_retries));
    }
    if let Some(timeout_secs) = timeout_secs {
        flow.insert("execution_timeout_secs".to_string(), json!(timeout_secs));
    }
    if let Some(todo) = todo {
        flow.insert("todo_path".to_string(), Value::String(todo));
    }
    if flow.is_empty() {
        return None;
    }
    Some(json!({ "flow": flow }))
}

fn plan_title(prompt: &str) -> String {
    prompt.trim().chars().take(60).collect()
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("WAYPOINT_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_local_dir()
        .map(|dir| dir.join("waypoint"))
        .unwrap_or_else(|| PathBuf::from(".waypoint"))
}
