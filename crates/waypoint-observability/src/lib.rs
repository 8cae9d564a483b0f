use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Engine,
    Cli,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Cli => "cli",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// One structured record about the orchestration lifecycle. Optional fields are logged as
/// empty strings so every record has the same shape in the JSONL file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub task_id: Option<&'a str>,
    pub plan_id: Option<&'a str>,
    pub step_index: Option<usize>,
    pub correlation_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!(
        "[redacted len={} hash={}]",
        trimmed.len(),
        short_hash(trimmed)
    )
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Expands to one `tracing` macro call carrying every field of an [`ObservabilityEvent`].
macro_rules! obs_record {
    ($macro:ident, $process:expr, $event:expr, $step_index:expr) => {
        tracing::$macro!(
            target: "waypoint.obs",
            process = $process.as_str(),
            component = $event.component,
            event = $event.event,
            task_id = $event.task_id.unwrap_or(""),
            plan_id = $event.plan_id.unwrap_or(""),
            step_index = $step_index,
            correlation_id = $event.correlation_id.unwrap_or(""),
            status = $event.status.unwrap_or(""),
            error_code = $event.error_code.unwrap_or(""),
            detail = $event.detail.unwrap_or(""),
            "observability_event"
        )
    };
}

/// Logs the event under the `waypoint.obs` target. Levels below INFO are raised to INFO.
pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    let step_index = event
        .step_index
        .map(|index| index.to_string())
        .unwrap_or_default();
    let step_index = step_index.as_str();
    if level == Level::ERROR {
        obs_record!(error, process, event, step_index);
    } else if level == Level::WARN {
        obs_record!(warn, process, event, step_index);
    } else {
        obs_record!(info, process, event, step_index);
    }
}

pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, process.as_str(), retention_days)?;

    let prefix = log_file_prefix(process);
    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(&prefix)
        .filename_suffix("jsonl")
        .build(logs_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    // stdout carries the event stream in the CLI, so console logs go to stderr
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true)
        .with_writer(std::io::stderr);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        process: process.as_str().to_string(),
        logs_dir: logs_dir.display().to_string(),
        prefix,
        retention_days,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

fn log_file_prefix(process: ProcessKind) -> String {
    log_file_prefix_for(process.as_str())
}

fn log_file_prefix_for(process: &str) -> String {
    format!("waypoint.{process}")
}

/// Date stamp of a rolled file named `waypoint.<process>.YYYY-MM-DD.jsonl`.
fn rolled_file_date(name: &str, prefix: &str) -> Option<NaiveDate> {
    let stamp = name.strip_prefix(prefix)?.strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(stamp, "%Y-%m-%d").ok()
}

/// Deletes this process's rolled files older than the retention window and returns how many
/// were removed. Files of other processes and unparseable names are left alone.
fn cleanup_old_jsonl(
    logs_dir: &Path,
    process: &str,
    retention_days: u64,
) -> anyhow::Result<usize> {
    let oldest_kept = Utc::now().date_naive() - chrono::Duration::days(retention_days as i64);
    let prefix = format!("{}.", log_file_prefix_for(process));

    let mut removed = 0;
    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        let expired = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| rolled_file_date(name, &prefix))
            .is_some_and(|date| date < oldest_kept);
        if expired && path.is_file() && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}
