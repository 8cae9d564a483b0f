use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event names emitted while a task runs. Every name lives under the `agent:` namespace so a
/// single `agent:.*` subscription sees the whole lifecycle.
pub mod names {
    pub const LIFECYCLE_START: &str = "agent:lifecycle:start";
    /// Contractual last event of a task that was not torn down abnormally.
    pub const LIFECYCLE_COMPLETE: &str = "agent:lifecycle:complete";
    pub const PLAN_CREATED: &str = "agent:plan:created";
    pub const PLAN_FINALIZED: &str = "agent:plan:finalized";
    pub const STEP_START: &str = "agent:step:start";
    pub const STEP_COMPLETE: &str = "agent:step:complete";
    pub const STEP_ERROR: &str = "agent:step:error";
    pub const STEP_BLOCKED: &str = "agent:step:blocked";
    pub const ASK_HUMAN: &str = "agent:tool:ask_human";
    pub const MESSAGE: &str = "agent:message";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    /// Position in the task's emission order, assigned by the event bus.
    pub seq: u64,
    pub event_name: String,
    pub step: u64,
    pub content: Value,
    pub timestamp_ms: u64,
}

impl TaskEvent {
    pub fn new(
        task_id: impl Into<String>,
        event_name: impl Into<String>,
        step: u64,
        content: Value,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            seq: 0,
            event_name: event_name.into(),
            step,
            content,
            timestamp_ms: now_ms(),
        }
    }

    pub fn is_lifecycle_complete(&self) -> bool {
        self.event_name == names::LIFECYCLE_COMPLETE
    }
}

pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
