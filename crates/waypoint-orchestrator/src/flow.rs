use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use waypoint_core::{
    DurableSink, FileSink, FlowConfig, HumanQueue, NullSink, PlanStore, QuestionError,
    TaskEventBus, DEFAULT_EXECUTION_TIMEOUT_SECS, DEFAULT_MAX_RETRIES_PER_STEP,
    DEFAULT_PLANNER_TIMEOUT_SECS,
};
use waypoint_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use waypoint_types::{names, Plan, StepStatus};

use crate::collaborators::{plan_schema, Planner, Summarizer};
use crate::error::FlowError;
use crate::executor::{Executor, ExecutorRegistry, MemoryEntry, StepOutcome};
use crate::prompts;

const COMPONENT: &str = "planning_flow";

/// How a run ended. Carried as `status` on the lifecycle-complete event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowOutcome {
    Completed,
    Aborted,
    Stopped,
    TimedOut,
    Failed,
}

impl FlowOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowOutcome::Completed => "completed",
            FlowOutcome::Aborted => "aborted",
            FlowOutcome::Stopped => "stopped",
            FlowOutcome::TimedOut => "timed_out",
            FlowOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowReport {
    pub task_id: String,
    pub plan_id: String,
    pub outcome: FlowOutcome,
    pub output: String,
}

/// Counts consecutive selections of the same step index.
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    last: Option<Option<usize>>,
    retries: u32,
}

impl RetryTracker {
    /// Records the selected index and returns its retry count: 0 when the index changed
    /// since the previous selection, previous count + 1 otherwise.
    pub fn observe(&mut self, index: Option<usize>) -> u32 {
        if self.last == Some(index) {
            self.retries += 1;
        } else {
            self.last = Some(index);
            self.retries = 0;
        }
        self.retries
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}

/// Plans a request, then drives its steps through executors one at a time, pausing for human
/// answers and retrying a step until its budget runs out.
pub struct PlanningFlow {
    task_id: String,
    plan_id: String,
    executors: ExecutorRegistry,
    planner: Option<Arc<dyn Planner>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    sink: Arc<dyn DurableSink>,
    plans: PlanStore,
    questions: HumanQueue,
    events: TaskEventBus,
    cancel: CancellationToken,
    max_retries_per_step: u32,
    execution_timeout: Duration,
    planner_timeout: Duration,
    process: ProcessKind,
    step_counter: AtomicU64,
}

impl PlanningFlow {
    pub fn new(executors: ExecutorRegistry) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            plan_id: format!("plan_{}", chrono::Utc::now().timestamp()),
            executors,
            planner: None,
            summarizer: None,
            sink: Arc::new(NullSink),
            plans: PlanStore::new(),
            questions: HumanQueue::new(),
            events: TaskEventBus::new(),
            cancel: CancellationToken::new(),
            max_retries_per_step: DEFAULT_MAX_RETRIES_PER_STEP,
            execution_timeout: Duration::from_secs(DEFAULT_EXECUTION_TIMEOUT_SECS),
            planner_timeout: Duration::from_secs(DEFAULT_PLANNER_TIMEOUT_SECS),
            process: ProcessKind::Engine,
            step_counter: AtomicU64::new(0),
        }
    }

    /// Applies retry budget, timeouts, executor preference, plan id and progress file.
    pub fn with_config(mut self, config: &FlowConfig) -> Self {
        self.max_retries_per_step = config.max_retries_per_step;
        self.execution_timeout = Duration::from_secs(config.execution_timeout_secs);
        self.planner_timeout = Duration::from_secs(config.planner_timeout_secs);
        if !config.executor_keys.is_empty() {
            self.executors
                .set_executor_keys(config.executor_keys.clone());
        }
        if let Some(plan_id) = config.plan_id.as_deref().filter(|id| !id.trim().is_empty()) {
            self.plan_id = plan_id.to_string();
        }
        if let Some(path) = config.todo_path.as_deref().filter(|p| !p.trim().is_empty()) {
            self.sink = Arc::new(FileSink::new(path));
        }
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_plan_id(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = plan_id.into();
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn DurableSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_plan_store(mut self, plans: PlanStore) -> Self {
        self.plans = plans;
        self
    }

    pub fn with_human_queue(mut self, questions: HumanQueue) -> Self {
        self.questions = questions;
        self
    }

    pub fn with_event_bus(mut self, events: TaskEventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_max_retries(mut self, max_retries_per_step: u32) -> Self {
        self.max_retries_per_step = max_retries_per_step;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_planner_timeout(mut self, timeout: Duration) -> Self {
        self.planner_timeout = timeout;
        self
    }

    pub fn with_process(mut self, process: ProcessKind) -> Self {
        self.process = process;
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    pub fn plans(&self) -> &PlanStore {
        &self.plans
    }

    pub fn questions(&self) -> &HumanQueue {
        &self.questions
    }

    pub fn events(&self) -> &TaskEventBus {
        &self.events
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn execution_timeout(&self) -> Duration {
        self.execution_timeout
    }

    /// Runs the request to completion and returns the result text. Never fails: internal
    /// errors are reported in the returned text.
    pub async fn execute(&self, request: &str) -> String {
        self.run(request).await.output
    }

    /// Like [`execute`](Self::execute), bounded by the configured execution timeout.
    pub async fn execute_with_timeout(&self, request: &str) -> String {
        self.run_with_timeout(request).await.output
    }

    pub async fn run(&self, request: &str) -> FlowReport {
        self.run_bounded(request, None).await
    }

    pub async fn run_with_timeout(&self, request: &str) -> FlowReport {
        self.run_bounded(request, Some(self.execution_timeout)).await
    }

    async fn run_bounded(&self, request: &str, limit: Option<Duration>) -> FlowReport {
        self.events.open(&self.task_id).await;
        self.emit(
            names::LIFECYCLE_START,
            json!({ "plan_id": self.plan_id, "request": request }),
        )
        .await;
        self.observe(Level::INFO, "flow.start", None, None, None);

        let mut output = String::new();
        let result = match limit {
            Some(limit) => {
                match tokio::time::timeout(limit, self.drive(request, &mut output)).await {
                    Ok(result) => Some(result),
                    Err(_) => None,
                }
            }
            None => Some(self.drive(request, &mut output).await),
        };

        let outcome = match result {
            Some(Ok(outcome)) => outcome,
            Some(Err(err)) => self.report_error(err, &mut output),
            None => {
                let secs = limit.map(|d| d.as_secs()).unwrap_or_default();
                tracing::error!(
                    task_id = %self.task_id,
                    plan_id = %self.plan_id,
                    "flow timed out after {secs}s"
                );
                self.questions.cancel(&self.task_id).await;
                let partial = std::mem::take(&mut output);
                output = format!("Execution timed out after {secs}s");
                if !partial.trim().is_empty() {
                    output.push_str("\n\nPartial output:\n");
                    output.push_str(&partial);
                }
                self.observe(
                    Level::ERROR,
                    "flow.timeout",
                    None,
                    Some("FLOW_TIMEOUT"),
                    None,
                );
                FlowOutcome::TimedOut
            }
        };

        self.observe(Level::INFO, "flow.finish", None, None, Some(outcome.as_str()));
        self.emit(
            names::LIFECYCLE_COMPLETE,
            json!({
                "status": outcome.as_str(),
                "result": output,
                "plan_id": self.plan_id,
            }),
        )
        .await;
        FlowReport {
            task_id: self.task_id.clone(),
            plan_id: self.plan_id.clone(),
            outcome,
            output,
        }
    }

    fn report_error(&self, err: FlowError, output: &mut String) -> FlowOutcome {
        tracing::error!(
            task_id = %self.task_id,
            plan_id = %self.plan_id,
            "flow failed: {err}"
        );
        self.observe(Level::ERROR, "flow.error", None, Some(err.code()), None);
        match err {
            FlowError::NoPlan { .. } => {
                *output = err.to_string();
                FlowOutcome::Failed
            }
            FlowError::Cancelled | FlowError::Question(QuestionError::Aborted(_)) => {
                push_line(output, &FlowError::Cancelled.to_string());
                FlowOutcome::Aborted
            }
            other => {
                push_line(output, &format!("Execution failed: {other}"));
                FlowOutcome::Failed
            }
        }
    }

    async fn drive(&self, request: &str, output: &mut String) -> Result<FlowOutcome, FlowError> {
        if self.executors.is_empty() {
            return Err(FlowError::NoExecutor);
        }
        if !request.trim().is_empty() && !self.plans.contains(&self.plan_id).await {
            self.create_initial_plan(request).await;
        }
        if !self.plans.contains(&self.plan_id).await {
            return Err(FlowError::NoPlan {
                request: request.to_string(),
            });
        }

        let mut retries = RetryTracker::default();
        loop {
            if self.cancel.is_cancelled() {
                return Err(FlowError::Cancelled);
            }
            let current = self.plans.current_step(&self.plan_id).await?;
            let attempt = retries.observe(current.as_ref().map(|(index, _)| *index));
            let Some((index, step)) = current else {
                output.push_str(&self.finalize().await);
                return Ok(FlowOutcome::Completed);
            };

            if attempt >= self.max_retries_per_step {
                tracing::error!(
                    task_id = %self.task_id,
                    plan_id = %self.plan_id,
                    step_index = index,
                    "maximum retries ({}) exceeded, aborting",
                    self.max_retries_per_step
                );
                self.mark(index, StepStatus::Blocked, Some("Max retries exceeded"))
                    .await;
                self.emit(
                    names::STEP_BLOCKED,
                    json!({ "step_index": index, "notes": "Max retries exceeded" }),
                )
                .await;
                let abort = FlowError::RetryBudgetExceeded { index };
                self.observe(
                    Level::WARN,
                    "flow.step.retry_exhausted",
                    Some(index),
                    Some(abort.code()),
                    None,
                );
                push_line(output, &abort.to_string());
                self.persist_progress().await;
                return Ok(FlowOutcome::Aborted);
            }

            let (executor_key, executor) = self
                .executors
                .resolve(step.step_type.as_deref())
                .ok_or(FlowError::NoExecutor)?;
            self.step_counter.fetch_add(1, Ordering::Relaxed);
            self.mark(index, StepStatus::InProgress, None).await;
            let plan_text = self.persist_progress().await;
            tracing::info!(
                task_id = %self.task_id,
                plan_id = %self.plan_id,
                step_index = index,
                executor = %executor_key,
                "executing step (retry {attempt})"
            );
            self.emit(
                names::STEP_START,
                json!({
                    "step_index": index,
                    "text": step.text,
                    "type": step.step_type,
                    "executor": executor_key,
                    "attempt": attempt,
                }),
            )
            .await;

            let context = prompts::step_context(&plan_text, index, &step.text);
            match self.run_executor(executor.as_ref(), &context).await? {
                StepOutcome::Success(text) => {
                    self.mark(index, StepStatus::Completed, None).await;
                    self.emit(
                        names::STEP_COMPLETE,
                        json!({ "step_index": index, "result": text }),
                    )
                    .await;
                    output.push_str(&format!("Step {index} result: {text}\n"));
                }
                StepOutcome::Pause {
                    question,
                    correlation_id,
                } => {
                    self.pause_for_human(executor.as_ref(), index, &question, correlation_id)
                        .await?;
                }
                StepOutcome::Failure(reason) => {
                    tracing::error!(
                        task_id = %self.task_id,
                        plan_id = %self.plan_id,
                        step_index = index,
                        "step failed: {reason}"
                    );
                    self.mark(
                        index,
                        StepStatus::Blocked,
                        Some(&format!("Executor error: {reason}")),
                    )
                    .await;
                    self.emit(
                        names::STEP_ERROR,
                        json!({ "step_index": index, "error": reason }),
                    )
                    .await;
                    self.observe(
                        Level::WARN,
                        "flow.step.failed",
                        Some(index),
                        Some("STEP_EXECUTION_FAILURE"),
                        None,
                    );
                    output.push_str(&format!(
                        "Error during execution of step {index}: {reason}\n"
                    ));
                }
            }

            if executor.current_state().is_terminal() {
                tracing::warn!(
                    task_id = %self.task_id,
                    executor = %executor_key,
                    "executor reached a terminal state, stopping flow"
                );
                return Ok(FlowOutcome::Stopped);
            }
        }
    }

    async fn create_initial_plan(&self, request: &str) {
        tracing::info!(plan_id = %self.plan_id, "creating initial plan");
        let proposal = match &self.planner {
            Some(planner) => {
                let schema = plan_schema();
                match tokio::time::timeout(self.planner_timeout, planner.propose(request, &schema))
                    .await
                {
                    Ok(Ok(Some(proposal))) => {
                        let plan = Plan::from_proposal(self.plan_id.clone(), proposal);
                        if plan.is_none() {
                            tracing::warn!(plan_id = %self.plan_id, "planner returned no steps");
                        }
                        plan
                    }
                    Ok(Ok(None)) => {
                        tracing::warn!(plan_id = %self.plan_id, "planner returned no plan");
                        None
                    }
                    Ok(Err(err)) => {
                        tracing::warn!(plan_id = %self.plan_id, "planner failed: {err:#}");
                        None
                    }
                    Err(_) => {
                        tracing::warn!(
                            plan_id = %self.plan_id,
                            "planner timed out after {}s",
                            self.planner_timeout.as_secs()
                        );
                        None
                    }
                }
            }
            None => None,
        };

        let fallback = proposal.is_none();
        if fallback {
            self.observe(
                Level::WARN,
                "flow.plan.default",
                None,
                Some("PLANNER_FAILURE"),
                None,
            );
        }
        let plan =
            proposal.unwrap_or_else(|| Plan::default_for_request(self.plan_id.clone(), request));
        let steps: Vec<&str> = plan.steps.iter().map(|step| step.text.as_str()).collect();
        let content = json!({
            "plan_id": plan.plan_id,
            "title": plan.title,
            "steps": steps,
            "default": fallback,
        });
        self.plans.insert(plan).await;
        self.emit(names::PLAN_CREATED, content).await;
    }

    /// Waits for the human answer. A question cancelled from outside returns without an
    /// answer, so the loop selects the same step again.
    async fn pause_for_human(
        &self,
        executor: &dyn Executor,
        index: usize,
        question: &str,
        correlation_id: Option<String>,
    ) -> Result<(), FlowError> {
        tracing::info!(
            task_id = %self.task_id,
            step_index = index,
            "executor requested human input"
        );
        executor
            .record_memory(MemoryEntry::tool(
                "ask_human",
                prompts::interrupted_note(question),
                correlation_id.clone(),
            ))
            .await;
        let ticket = self
            .questions
            .ask(&self.task_id, question, correlation_id.clone())
            .await;
        self.emit(
            names::ASK_HUMAN,
            json!({
                "query": question,
                "interaction_id": correlation_id,
                "step_index": index,
            }),
        )
        .await;
        emit_event(
            Level::INFO,
            self.process,
            ObservabilityEvent {
                event: "flow.ask_human",
                component: COMPONENT,
                task_id: Some(&self.task_id),
                plan_id: Some(&self.plan_id),
                step_index: Some(index),
                correlation_id: correlation_id.as_deref(),
                status: Some("awaiting_human"),
                ..ObservabilityEvent::default()
            },
        );

        let answer = match ticket.wait_or_cancel(&self.cancel).await {
            Ok(answer) => answer,
            Err(QuestionError::Cancelled(_)) if self.cancel.is_cancelled() => {
                return Err(FlowError::Cancelled);
            }
            Err(QuestionError::Cancelled(_)) => {
                tracing::warn!(
                    task_id = %self.task_id,
                    step_index = index,
                    "question was cancelled before an answer arrived, retrying step"
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        tracing::info!(
            task_id = %self.task_id,
            step_index = index,
            answer = %redact_text(&answer),
            "human answered"
        );
        executor
            .record_memory(MemoryEntry::user(
                prompts::human_answer_note(question, &answer),
                correlation_id.clone(),
            ))
            .await;
        self.emit(
            names::MESSAGE,
            json!({
                "role": "user",
                "content": answer,
                "human_response": true,
                "interaction_id": correlation_id,
            }),
        )
        .await;
        Ok(())
    }

    /// Runs one executor call. Panics become failures; cancellation aborts the call.
    async fn run_executor(
        &self,
        executor: &dyn Executor,
        context: &str,
    ) -> Result<StepOutcome, FlowError> {
        let call = AssertUnwindSafe(executor.run(context)).catch_unwind();
        tokio::select! {
            _ = self.cancel.cancelled() => Err(FlowError::Cancelled),
            result = call => Ok(result.unwrap_or_else(|payload| {
                StepOutcome::Failure(format!("executor panicked: {}", panic_message(payload.as_ref())))
            })),
        }
    }

    async fn finalize(&self) -> String {
        let plan_text = match self.plans.render(&self.plan_id).await {
            Ok(text) => text,
            Err(err) => format!("Error: {err}"),
        };
        let (result, persisted, summarized) = match self.summarize(&plan_text).await {
            Ok(summary) => {
                let result = format!("Plan completed:\n\n{summary}");
                let persisted = format!("{plan_text}\n\n{result}");
                (result, persisted, true)
            }
            Err(err) => {
                tracing::error!(plan_id = %self.plan_id, "summary failed: {err:#}");
                self.observe(
                    Level::WARN,
                    "flow.summary.failed",
                    None,
                    Some("SUMMARIZER_FAILURE"),
                    None,
                );
                let result = format!("{plan_text}\n\nPlan completed. Error generating summary: {err}");
                (result.clone(), result, false)
            }
        };
        self.persist(&persisted).await;
        self.emit(
            names::PLAN_FINALIZED,
            json!({ "plan_id": self.plan_id, "summarized": summarized }),
        )
        .await;
        result
    }

    /// Summarizer first, then the primary executor with an equivalent prompt.
    async fn summarize(&self, plan_text: &str) -> anyhow::Result<String> {
        let mut last_error = None;
        if let Some(summarizer) = &self.summarizer {
            match summarizer.summarize(plan_text).await {
                Ok(summary) => return Ok(summary),
                Err(err) => {
                    tracing::warn!(
                        plan_id = %self.plan_id,
                        "summarizer failed, falling back to primary executor: {err:#}"
                    );
                    last_error = Some(err);
                }
            }
        }
        let Some((_, primary)) = self.executors.primary() else {
            return Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no executor available")));
        };
        match self
            .run_executor(primary.as_ref(), &prompts::summary_prompt(plan_text))
            .await?
        {
            StepOutcome::Success(summary) => Ok(summary),
            StepOutcome::Pause { question, .. } => Err(anyhow::anyhow!(
                "primary executor asked a question instead of summarizing: {question}"
            )),
            StepOutcome::Failure(reason) => Err(anyhow::anyhow!(reason)),
        }
    }

    async fn mark(&self, index: usize, to: StepStatus, notes: Option<&str>) {
        if let Err(err) = self.plans.transition(&self.plan_id, index, to, notes).await {
            tracing::warn!(
                plan_id = %self.plan_id,
                step_index = index,
                "failed to mark step {to}: {err}"
            );
        }
    }

    /// Renders the plan and writes it to the sink. Returns the rendered text.
    async fn persist_progress(&self) -> String {
        match self.plans.render(&self.plan_id).await {
            Ok(text) => {
                self.persist(&text).await;
                text
            }
            Err(err) => format!("Error: {err}"),
        }
    }

    async fn persist(&self, text: &str) {
        if let Err(err) = self.sink.persist(text).await {
            tracing::warn!(plan_id = %self.plan_id, "failed to persist plan: {err:#}");
            self.observe(
                Level::WARN,
                "flow.persist.failed",
                None,
                Some("PERSISTENCE_FAILURE"),
                None,
            );
        }
    }

    async fn emit(&self, event_name: &str, content: Value) {
        let step = self.step_counter.load(Ordering::Relaxed);
        self.events
            .emit(&self.task_id, event_name, step, content)
            .await;
    }

    fn observe(
        &self,
        level: Level,
        event: &str,
        step_index: Option<usize>,
        error_code: Option<&str>,
        status: Option<&str>,
    ) {
        emit_event(
            level,
            self.process,
            ObservabilityEvent {
                event,
                component: COMPONENT,
                task_id: Some(&self.task_id),
                plan_id: Some(&self.plan_id),
                step_index,
                error_code,
                status,
                ..ObservabilityEvent::default()
            },
        );
    }
}

fn push_line(output: &mut String, line: &str) {
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(line);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
