//! Deterministic collaborators for driving a flow from the terminal without any model backend.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use waypoint_orchestrator::{Executor, ExecutorState, MemoryEntry, MemoryRole, Planner, StepOutcome};
use waypoint_types::{ProposedPlan, ProposedStep};

const TASK_LINE_PREFIX: &str = "You are now working on step ";

/// Picks the step instruction line out of an execution context.
fn task_line(context: &str) -> Option<&str> {
    context
        .lines()
        .find(|line| line.starts_with(TASK_LINE_PREFIX))
        .map(|line| line.trim_start_matches(TASK_LINE_PREFIX))
}

/// Plan made of the `--step` arguments. With no steps it declines, so the flow falls back to
/// the default plan.
pub struct StaticPlanner {
    title: String,
    steps: Vec<String>,
}

impl StaticPlanner {
    pub fn new(title: impl Into<String>, steps: Vec<String>) -> Self {
        Self {
            title: title.into(),
            steps,
        }
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn propose(
        &self,
        _request: &str,
        _schema: &Value,
    ) -> anyhow::Result<Option<ProposedPlan>> {
        if self.steps.is_empty() {
            return Ok(None);
        }
        Ok(Some(ProposedPlan {
            title: self.title.clone(),
            steps: self
                .steps
                .iter()
                .map(|step| ProposedStep::Text(step.clone()))
                .collect(),
        }))
    }
}

/// Reports every step as done. Also serves as the summarizer of last resort.
#[derive(Default)]
pub struct EchoExecutor {
    state: Mutex<ExecutorState>,
    terminated: AtomicBool,
}

#[async_trait]
impl Executor for EchoExecutor {
    fn name(&self) -> &str {
        "echo"
    }

    async fn run(&self, context: &str) -> StepOutcome {
        if self.terminated.load(Ordering::SeqCst) {
            return StepOutcome::Failure("executor was terminated".to_string());
        }
        *self.state.lock().await = ExecutorState::Running;
        let outcome = match task_line(context) {
            Some(task) => StepOutcome::Success(format!("Done: step {task}")),
            None => StepOutcome::Success(format!(
                "{} step(s) completed, {} blocked, all executed locally.",
                context.matches("[✓]").count(),
                context.matches("[!]").count()
            )),
        };
        *self.state.lock().await = ExecutorState::Idle;
        outcome
    }

    fn current_state(&self) -> ExecutorState {
        if self.terminated.load(Ordering::SeqCst) {
            ExecutorState::Finished
        } else {
            self.state
                .try_lock()
                .map(|state| *state)
                .unwrap_or(ExecutorState::Running)
        }
    }

    async fn request_termination(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    async fn record_memory(&self, _entry: MemoryEntry) {}
}

/// Handles `[ASK]` steps: pauses once per step and completes with the human's answer.
#[derive(Default)]
pub struct InteractiveExecutor {
    answer: Mutex<Option<String>>,
    terminated: AtomicBool,
}

#[async_trait]
impl Executor for InteractiveExecutor {
    fn name(&self) -> &str {
        "ask"
    }

    async fn run(&self, context: &str) -> StepOutcome {
        if self.terminated.load(Ordering::SeqCst) {
            return StepOutcome::Failure("executor was terminated".to_string());
        }
        if let Some(answer) = self.answer.lock().await.take() {
            return StepOutcome::Success(answer);
        }
        let task = task_line(context).unwrap_or("the current step");
        StepOutcome::Pause {
            question: format!("Input needed for step {task}"),
            correlation_id: Some(format!("call_{}", Uuid::new_v4().simple())),
        }
    }

    fn current_state(&self) -> ExecutorState {
        if self.terminated.load(Ordering::SeqCst) {
            ExecutorState::Finished
        } else {
            ExecutorState::Idle
        }
    }

    async fn request_termination(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    async fn record_memory(&self, entry: MemoryEntry) {
        if entry.role == MemoryRole::User {
            *self.answer.lock().await = Some(entry.content);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_orchestrator::prompts;

    #[tokio::test]
    async fn interactive_executor_pauses_then_uses_the_answer() {
        let executor = InteractiveExecutor::default();
        let context = prompts::step_context("Plan: t (ID: p)\n", 1, "[ASK] pick a name");

        let StepOutcome::Pause {
            question,
            correlation_id,
        } = executor.run(&context).await
        else {
            panic!("expected a pause");
        };
        assert_eq!(question, "Input needed for step 1: \"[ASK] pick a name\"");
        assert!(correlation_id.unwrap().starts_with("call_"));

        executor
            .record_memory(MemoryEntry::user("Regarding your question: waypoint", None))
            .await;
        assert_eq!(
            executor.run(&context).await,
            StepOutcome::Success("Regarding your question: waypoint".to_string())
        );
    }

    #[tokio::test]
    async fn echo_executor_reports_the_step() {
        let executor = EchoExecutor::default();
        let context = prompts::step_context("Plan", 0, "Analyze request");
        assert_eq!(
            executor.run(&context).await,
            StepOutcome::Success("Done: step 0: \"Analyze request\"".to_string())
        );

        let summary = executor
            .run(&prompts::summary_prompt("0. [✓] a\n1. [!] b\n"))
            .await;
        assert_eq!(
            summary,
            StepOutcome::Success("1 step(s) completed, 1 blocked, all executed locally.".to_string())
        );

        executor.request_termination().await;
        assert_eq!(executor.current_state(), ExecutorState::Finished);
    }

    #[tokio::test]
    async fn static_planner_declines_without_steps() {
        let empty = StaticPlanner::new("t", Vec::new());
        assert!(empty.propose("r", &Value::Null).await.unwrap().is_none());

        let planner = StaticPlanner::new("t", vec!["[ASK] one".to_string()]);
        let plan = planner.propose("r", &Value::Null).await.unwrap().unwrap();
        assert_eq!(plan.steps.len(), 1);
    }
}
