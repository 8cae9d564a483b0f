use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

pub const DEFAULT_MAX_RETRIES_PER_STEP: u32 = 3;
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 60 * 60;
pub const DEFAULT_PLANNER_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_LOG_RETENTION_DAYS: u64 = 14;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Consecutive attempts allowed on one step index before the whole flow aborts.
    #[serde(default = "default_max_retries_per_step")]
    pub max_retries_per_step: u32,
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
    #[serde(default = "default_planner_timeout_secs")]
    pub planner_timeout_secs: u64,
    /// Preferred executor keys, in order, for steps without a matching type tag.
    #[serde(default)]
    pub executor_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todo_path: Option<String>,
}

fn default_max_retries_per_step() -> u32 {
    DEFAULT_MAX_RETRIES_PER_STEP
}

fn default_execution_timeout_secs() -> u64 {
    DEFAULT_EXECUTION_TIMEOUT_SECS
}

fn default_planner_timeout_secs() -> u64 {
    DEFAULT_PLANNER_TIMEOUT_SECS
}

fn default_log_retention_days() -> u64 {
    DEFAULT_LOG_RETENTION_DAYS
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_retries_per_step: DEFAULT_MAX_RETRIES_PER_STEP,
            execution_timeout_secs: DEFAULT_EXECUTION_TIMEOUT_SECS,
            planner_timeout_secs: DEFAULT_PLANNER_TIMEOUT_SECS,
            executor_keys: Vec::new(),
            plan_id: None,
            todo_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_dir: Option<String>,
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            logs_dir: None,
            retention_days: DEFAULT_LOG_RETENTION_DAYS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

/// Layered JSON configuration: global < project < env < runtime < cli.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: Option<PathBuf>,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(
        project_path: Option<PathBuf>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let global = match resolve_global_config_path() {
            Some(path) => read_json_file(&path).await?,
            None => empty_object(),
        };
        let project = match project_path.as_deref() {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };
        Ok(Self::from_layers(
            project_path,
            ConfigLayers {
                global,
                project,
                env: env_layer(),
                runtime: empty_object(),
                cli: cli_overrides.unwrap_or_else(empty_object),
            },
        ))
    }

    /// Store with no file or environment layers, for embedding and tests.
    pub fn in_memory(overrides: Option<Value>) -> Self {
        Self::from_layers(
            None,
            ConfigLayers {
                global: empty_object(),
                project: empty_object(),
                env: empty_object(),
                runtime: empty_object(),
                cli: overrides.unwrap_or_else(empty_object),
            },
        )
    }

    fn from_layers(project_path: Option<PathBuf>, layers: ConfigLayers) -> Self {
        Self {
            project_path,
            layers: Arc::new(RwLock::new(layers)),
        }
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("invalid configuration, using defaults: {err}");
                AppConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": layers.env,
            "runtime": layers.runtime,
            "cli": layers.cli
        })
    }

    /// Applies a patch that lives for the lifetime of this process only.
    pub async fn patch_runtime(&self, patch: Value) -> Value {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        self.get_effective_value().await
    }

    /// Applies a patch to the project layer and writes it back to the project file.
    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        let snapshot = {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
            layers.project.clone()
        };
        if let Some(path) = self.project_path.as_deref() {
            write_json_file(path, &snapshot).await?;
        }
        Ok(self.get_effective_value().await)
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|err| {
        tracing::warn!("ignoring unreadable config {}: {err}", path.display());
        empty_object()
    }))
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

fn resolve_global_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("WAYPOINT_GLOBAL_CONFIG") {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::config_dir().map(|dir| dir.join("waypoint").join("config.json"))
}

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();

    if let Some(v) = lookup("WAYPOINT_MAX_RETRIES").and_then(|v| v.trim().parse::<u32>().ok()) {
        deep_merge(&mut root, &json!({ "flow": { "max_retries_per_step": v } }));
    }
    if let Some(v) =
        lookup("WAYPOINT_EXECUTION_TIMEOUT_SECS").and_then(|v| v.trim().parse::<u64>().ok())
    {
        deep_merge(&mut root, &json!({ "flow": { "execution_timeout_secs": v } }));
    }
    if let Some(v) =
        lookup("WAYPOINT_PLANNER_TIMEOUT_SECS").and_then(|v| v.trim().parse::<u64>().ok())
    {
        deep_merge(&mut root, &json!({ "flow": { "planner_timeout_secs": v } }));
    }
    if let Some(raw) = lookup("WAYPOINT_EXECUTORS") {
        let keys = parse_csv(&raw);
        if !keys.is_empty() {
            deep_merge(&mut root, &json!({ "flow": { "executor_keys": keys } }));
        }
    }
    if let Some(path) = lookup("WAYPOINT_TODO_PATH").filter(|p| !p.trim().is_empty()) {
        deep_merge(&mut root, &json!({ "flow": { "todo_path": path } }));
    }
    if let Some(dir) = lookup("WAYPOINT_LOGS_DIR").filter(|p| !p.trim().is_empty()) {
        deep_merge(&mut root, &json!({ "logging": { "logs_dir": dir } }));
    }
    if let Some(v) =
        lookup("WAYPOINT_LOG_RETENTION_DAYS").and_then(|v| v.trim().parse::<u64>().ok())
    {
        deep_merge(&mut root, &json!({ "logging": { "retention_days": v } }));
    }

    root
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
