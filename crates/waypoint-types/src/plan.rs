use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PLAN_STEPS: [&str; 3] = ["Analyze request", "Execute task", "Verify results"];

const DEFAULT_TITLE_CHARS: usize = 50;

static STEP_TYPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\[([A-Za-z][A-Za-z0-9_]*)\]").expect("valid step type regex")
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Blocked,
}

impl StepStatus {
    pub const ALL: [StepStatus; 4] = [
        StepStatus::NotStarted,
        StepStatus::InProgress,
        StepStatus::Completed,
        StepStatus::Blocked,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::NotStarted => "not_started",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Blocked => "blocked",
        }
    }

    /// Active steps are still eligible for selection.
    pub fn is_active(self) -> bool {
        matches!(self, StepStatus::NotStarted | StepStatus::InProgress)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn mark(self) -> &'static str {
        match self {
            StepStatus::Completed => "[✓]",
            StepStatus::InProgress => "[→]",
            StepStatus::Blocked => "[!]",
            StepStatus::NotStarted => "[ ]",
        }
    }

    fn can_transition_to(self, next: StepStatus) -> bool {
        match (self, next) {
            (StepStatus::NotStarted | StepStatus::InProgress, StepStatus::InProgress) => true,
            (StepStatus::InProgress, StepStatus::Completed) => true,
            (StepStatus::NotStarted | StepStatus::InProgress, StepStatus::Blocked) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = PlanError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "not_started" | "pending" => Ok(StepStatus::NotStarted),
            "in_progress" | "running" => Ok(StepStatus::InProgress),
            "completed" | "done" => Ok(StepStatus::Completed),
            "blocked" => Ok(StepStatus::Blocked),
            other => Err(PlanError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("plan `{0}` not found")]
    NotFound(String),
    #[error("step {index} out of range (plan has {len} steps)")]
    StepOutOfRange { index: usize, len: usize },
    #[error("step {index} cannot move from {from} to {to}")]
    InvalidTransition {
        index: usize,
        from: StepStatus,
        to: StepStatus,
    },
    #[error("override to {0} is not allowed; only completed or blocked")]
    InvalidOverride(StepStatus),
    #[error("unknown step status `{0}`")]
    UnknownStatus(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub text: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
}

impl Step {
    /// Builds a step, taking the type tag from a leading `[TAG]` token when present.
    pub fn new(text: impl Into<String>) -> Self {
        Self::with_type(text, None)
    }

    /// An explicit type wins over a leading `[TAG]` token in the text.
    pub fn with_type(text: impl Into<String>, step_type: Option<String>) -> Self {
        let text = text.into();
        let step_type = step_type
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .or_else(|| parse_step_type(&text));
        Self {
            text,
            step_type,
            status: StepStatus::NotStarted,
            notes: String::new(),
        }
    }
}

pub fn parse_step_type(text: &str) -> Option<String> {
    STEP_TYPE_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
}

/// Planner output before ingestion. Steps may be plain strings or `{text, type}` objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedPlan {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub steps: Vec<ProposedStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProposedStep {
    Text(String),
    Structured {
        text: String,
        #[serde(default, rename = "type")]
        step_type: Option<String>,
    },
}

impl ProposedStep {
    pub fn text(&self) -> &str {
        match self {
            ProposedStep::Text(text) => text,
            ProposedStep::Structured { text, .. } => text,
        }
    }
}

impl From<ProposedStep> for Step {
    fn from(value: ProposedStep) -> Self {
        match value {
            ProposedStep::Text(text) => Step::new(text),
            ProposedStep::Structured { text, step_type } => Step::with_type(text, step_type),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub not_started: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub blocked: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.not_started + self.in_progress + self.completed + self.blocked
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub title: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(plan_id: impl Into<String>, title: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            plan_id: plan_id.into(),
            title: title.into(),
            steps,
            created_at: Utc::now(),
        }
    }

    /// Returns `None` when the proposal carries no usable step.
    pub fn from_proposal(plan_id: impl Into<String>, proposal: ProposedPlan) -> Option<Self> {
        let steps: Vec<Step> = proposal
            .steps
            .into_iter()
            .filter(|step| !step.text().trim().is_empty())
            .map(Step::from)
            .collect();
        if steps.is_empty() {
            return None;
        }
        let title = if proposal.title.trim().is_empty() {
            "Untitled Plan".to_string()
        } else {
            proposal.title.trim().to_string()
        };
        Some(Self::new(plan_id, title, steps))
    }

    pub fn default_for_request(plan_id: impl Into<String>, request: &str) -> Self {
        let truncated: String = request.chars().take(DEFAULT_TITLE_CHARS).collect();
        let ellipsis = if request.chars().count() > DEFAULT_TITLE_CHARS {
            "..."
        } else {
            ""
        };
        Self::new(
            plan_id,
            format!("Plan for: {truncated}{ellipsis}"),
            DEFAULT_PLAN_STEPS.iter().map(|s| Step::new(*s)).collect(),
        )
    }

    /// Lowest-index step whose status is still active.
    pub fn current_step(&self) -> Option<(usize, &Step)> {
        self.steps
            .iter()
            .enumerate()
            .find(|(_, step)| step.status.is_active())
    }

    pub fn is_done(&self) -> bool {
        self.current_step().is_none()
    }

    pub fn step(&self, index: usize) -> Result<&Step, PlanError> {
        let len = self.steps.len();
        self.steps
            .get(index)
            .ok_or(PlanError::StepOutOfRange { index, len })
    }

    fn step_mut(&mut self, index: usize) -> Result<&mut Step, PlanError> {
        let len = self.steps.len();
        self.steps
            .get_mut(index)
            .ok_or(PlanError::StepOutOfRange { index, len })
    }

    /// Applies a state-machine transition. Notes replace the previous notes when given.
    pub fn transition(
        &mut self,
        index: usize,
        to: StepStatus,
        notes: Option<&str>,
    ) -> Result<(), PlanError> {
        let step = self.step_mut(index)?;
        if !step.status.can_transition_to(to) {
            return Err(PlanError::InvalidTransition {
                index,
                from: step.status,
                to,
            });
        }
        step.status = to;
        if let Some(notes) = notes {
            step.notes = notes.to_string();
        }
        Ok(())
    }

    /// Out-of-band override used when a step is already satisfied or made irrelevant.
    pub fn override_step(
        &mut self,
        index: usize,
        to: StepStatus,
        notes: Option<&str>,
    ) -> Result<(), PlanError> {
        if to.is_active() {
            return Err(PlanError::InvalidOverride(to));
        }
        let step = self.step_mut(index)?;
        step.status = to;
        if let Some(notes) = notes {
            step.notes = notes.to_string();
        }
        Ok(())
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for step in &self.steps {
            match step.status {
                StepStatus::NotStarted => counts.not_started += 1,
                StepStatus::InProgress => counts.in_progress += 1,
                StepStatus::Completed => counts.completed += 1,
                StepStatus::Blocked => counts.blocked += 1,
            }
        }
        counts
    }

    pub fn render(&self) -> String {
        let counts = self.status_counts();
        let total = self.steps.len();
        let progress = if total > 0 {
            counts.completed as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        let header = format!("Plan: {} (ID: {})\n", self.title, self.plan_id);
        let mut out = String::new();
        out.push_str(&header);
        out.push_str(&"=".repeat(header.chars().count()));
        out.push_str("\n\n");
        let _ = writeln!(
            out,
            "Progress: {}/{} steps completed ({:.1}%)",
            counts.completed, total, progress
        );
        let _ = writeln!(
            out,
            "Status: {} completed, {} in progress, {} blocked, {} not started",
            counts.completed, counts.in_progress, counts.blocked, counts.not_started
        );
        out.push_str("\nSteps:\n");
        for (index, step) in self.steps.iter().enumerate() {
            let _ = writeln!(out, "{}. {} {}", index, step.status.mark(), step.text);
            if !step.notes.is_empty() {
                let _ = writeln!(out, "   Notes: {}", step.notes);
            }
        }
        out
    }
}
