use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use waypoint_core::{EventBusError, HumanQueue, PlanStore, StreamEnd, TaskEventBus, TaskEventStream};
use waypoint_types::{Plan, TaskEvent};

use crate::error::RespondError;
use crate::executor::ExecutorRegistry;
use crate::flow::{FlowOutcome, FlowReport, PlanningFlow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    AwaitingHuman,
    Completed,
    Aborted,
}

impl TaskStatus {
    fn from_outcome(outcome: FlowOutcome) -> Self {
        match outcome {
            FlowOutcome::Completed | FlowOutcome::Stopped => TaskStatus::Completed,
            FlowOutcome::Aborted | FlowOutcome::TimedOut | FlowOutcome::Failed => {
                TaskStatus::Aborted
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub prompt: String,
    pub plan_id: String,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<FlowOutcome>,
}

struct TaskRecord {
    prompt: String,
    plan_id: String,
    created_at: DateTime<Utc>,
    seq: u64,
    cancel: CancellationToken,
    executors: ExecutorRegistry,
    plans: PlanStore,
    report: watch::Receiver<Option<FlowReport>>,
}

/// Registry of running and finished tasks. Each task owns one event queue and at most one
/// pending question; both live in registries shared by handle.
#[derive(Clone, Default)]
pub struct TaskManager {
    tasks: Arc<RwLock<HashMap<String, TaskRecord>>>,
    questions: HumanQueue,
    events: TaskEventBus,
    next_seq: Arc<AtomicU64>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn questions(&self) -> &HumanQueue {
        &self.questions
    }

    pub fn events(&self) -> &TaskEventBus {
        &self.events
    }

    /// Opens the task's event queue and spawns the flow. Returns the task id.
    pub async fn start(&self, flow: PlanningFlow, prompt: &str) -> String {
        let flow = flow
            .with_event_bus(self.events.clone())
            .with_human_queue(self.questions.clone());
        let task_id = flow.task_id().to_string();
        self.events.open(&task_id).await;

        let (report_tx, report_rx) = watch::channel(None);
        let record = TaskRecord {
            prompt: prompt.to_string(),
            plan_id: flow.plan_id().to_string(),
            created_at: Utc::now(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            cancel: flow.cancellation_token(),
            executors: flow.executors().clone(),
            plans: flow.plans().clone(),
            report: report_rx,
        };
        self.tasks.write().await.insert(task_id.clone(), record);
        tracing::info!(task_id = %task_id, "task started");

        let prompt = prompt.to_string();
        tokio::spawn(async move {
            let report = flow.run_with_timeout(&prompt).await;
            tracing::info!(
                task_id = %report.task_id,
                status = report.outcome.as_str(),
                "task finished"
            );
            let _ = report_tx.send(Some(report));
        });
        task_id
    }

    /// Newest first.
    pub async fn list(&self) -> Vec<TaskSummary> {
        let tasks = self.tasks.read().await;
        let mut entries: Vec<(u64, TaskSummary)> = Vec::with_capacity(tasks.len());
        for (id, record) in tasks.iter() {
            entries.push((record.seq, self.summarize(id, record).await));
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        entries.into_iter().map(|(_, summary)| summary).collect()
    }

    pub async fn status(&self, task_id: &str) -> Option<TaskStatus> {
        let tasks = self.tasks.read().await;
        let record = tasks.get(task_id)?;
        Some(self.summarize(task_id, record).await.status)
    }

    pub async fn get(&self, task_id: &str) -> Option<TaskSummary> {
        let tasks = self.tasks.read().await;
        let record = tasks.get(task_id)?;
        Some(self.summarize(task_id, record).await)
    }

    /// Result text once the flow has finished.
    pub async fn result(&self, task_id: &str) -> Option<String> {
        self.report(task_id).await.map(|report| report.output)
    }

    pub async fn report(&self, task_id: &str) -> Option<FlowReport> {
        let tasks = self.tasks.read().await;
        let record = tasks.get(task_id)?;
        let report = record.report.borrow().clone();
        report
    }

    pub async fn plan(&self, task_id: &str) -> Option<Plan> {
        let (plans, plan_id) = {
            let tasks = self.tasks.read().await;
            let record = tasks.get(task_id)?;
            (record.plans.clone(), record.plan_id.clone())
        };
        plans.snapshot(&plan_id).await.ok()
    }

    /// Waits for the flow to finish. `None` for unknown tasks or a run that died without a
    /// report.
    pub async fn wait(&self, task_id: &str) -> Option<FlowReport> {
        let mut report = {
            let tasks = self.tasks.read().await;
            tasks.get(task_id)?.report.clone()
        };
        let finished = report.wait_for(Option::is_some).await.ok()?;
        finished.clone()
    }

    /// Delivers a human answer to the task's pending question.
    pub async fn respond(
        &self,
        task_id: &str,
        correlation_id: Option<&str>,
        response: &str,
    ) -> Result<(), RespondError> {
        if !self.tasks.read().await.contains_key(task_id) {
            return Err(RespondError::UnknownTask(task_id.to_string()));
        }
        self.questions
            .respond(task_id, correlation_id, response)
            .await
            .map(|_| ())
            .map_err(|reason| RespondError::Rejected {
                task_id: task_id.to_string(),
                reason,
            })
    }

    /// Cancels the run, asks every executor to stop and discards the task.
    pub async fn terminate(&self, task_id: &str) -> bool {
        let executors = {
            let tasks = self.tasks.read().await;
            let Some(record) = tasks.get(task_id) else {
                return false;
            };
            record.cancel.cancel();
            record.executors.all()
        };
        for (key, executor) in executors {
            tracing::debug!(task_id, executor = %key, "requesting executor termination");
            executor.request_termination().await;
        }
        self.remove(task_id).await;
        tracing::info!(task_id, "task terminated");
        true
    }

    /// Drops the task record with its plan, event queue and question state.
    pub async fn remove(&self, task_id: &str) -> bool {
        let record = self.tasks.write().await.remove(task_id);
        let removed = record.is_some();
        if let Some(record) = record {
            record.plans.remove(&record.plan_id).await;
        }
        self.events.close(task_id).await;
        self.questions.remove(task_id).await;
        removed
    }

    pub async fn subscribe(&self, task_id: &str) -> Option<TaskEventStream> {
        self.events.subscribe(task_id).await
    }

    /// Forwards the task's events until lifecycle-complete, closure, cancellation or
    /// `forward` returning false. The queue is torn down once the terminal event was seen;
    /// the task record and its result stay until [`remove`](Self::remove).
    pub async fn stream_events<F>(
        &self,
        task_id: &str,
        cancel: &CancellationToken,
        forward: F,
    ) -> Result<StreamEnd, EventBusError>
    where
        F: FnMut(&TaskEvent) -> bool,
    {
        let stream = self
            .events
            .subscribe(task_id)
            .await
            .ok_or_else(|| EventBusError::UnknownTask(task_id.to_string()))?;
        let end = stream.forward(cancel, forward).await;
        if end == StreamEnd::Completed {
            self.events.close(task_id).await;
            self.questions.remove(task_id).await;
        }
        Ok(end)
    }

    async fn summarize(&self, task_id: &str, record: &TaskRecord) -> TaskSummary {
        let outcome = record.report.borrow().as_ref().map(|report| report.outcome);
        let status = match outcome {
            Some(outcome) => TaskStatus::from_outcome(outcome),
            None if self.questions.has_pending_question(task_id).await => {
                TaskStatus::AwaitingHuman
            }
            None => TaskStatus::Running,
        };
        TaskSummary {
            id: task_id.to_string(),
            prompt: record.prompt.clone(),
            plan_id: record.plan_id.clone(),
            created_at: record.created_at,
            status,
            outcome,
        }
    }
}
