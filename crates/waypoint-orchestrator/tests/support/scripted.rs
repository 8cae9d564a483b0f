#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use waypoint_core::{HumanQueue, TaskEventHandler};
use waypoint_orchestrator::{
    Executor, ExecutorState, MemoryEntry, Planner, StepOutcome, Summarizer,
};
use waypoint_types::{names, ProposedPlan, ProposedStep, TaskEvent};

pub enum Action {
    Reply(StepOutcome),
    /// Replies, then reports a finished state.
    ReplyAndFinish(StepOutcome),
    Panic(&'static str),
    Sleep(Duration),
}

pub fn success(text: &str) -> Action {
    Action::Reply(StepOutcome::Success(text.to_string()))
}

pub fn failure(reason: &str) -> Action {
    Action::Reply(StepOutcome::Failure(reason.to_string()))
}

pub fn pause(question: &str, correlation_id: &str) -> Action {
    Action::Reply(StepOutcome::Pause {
        question: question.to_string(),
        correlation_id: Some(correlation_id.to_string()),
    })
}

/// Executor that plays back a script and then succeeds with `done <n>` forever.
pub struct ScriptedExecutor {
    name: String,
    script: Mutex<VecDeque<Action>>,
    contexts: Mutex<Vec<String>>,
    memory: Mutex<Vec<MemoryEntry>>,
    state: Mutex<ExecutorState>,
    terminated: AtomicBool,
}

impl ScriptedExecutor {
    pub fn new(name: &str, script: Vec<Action>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            contexts: Mutex::new(Vec::new()),
            memory: Mutex::new(Vec::new()),
            state: Mutex::new(ExecutorState::Idle),
            terminated: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }

    pub fn contexts(&self) -> Vec<String> {
        self.contexts.lock().unwrap().clone()
    }

    pub fn memory(&self) -> Vec<MemoryEntry> {
        self.memory.lock().unwrap().clone()
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, context: &str) -> StepOutcome {
        let call = {
            let mut contexts = self.contexts.lock().unwrap();
            contexts.push(context.to_string());
            contexts.len()
        };
        let next = self.script.lock().unwrap().pop_front();
        match next {
            None => StepOutcome::Success(format!("done {call}")),
            Some(Action::Reply(outcome)) => outcome,
            Some(Action::ReplyAndFinish(outcome)) => {
                *self.state.lock().unwrap() = ExecutorState::Finished;
                outcome
            }
            Some(Action::Panic(message)) => panic!("{message}"),
            Some(Action::Sleep(duration)) => {
                tokio::time::sleep(duration).await;
                StepOutcome::Success(format!("slept {call}"))
            }
        }
    }

    fn current_state(&self) -> ExecutorState {
        *self.state.lock().unwrap()
    }

    async fn request_termination(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        *self.state.lock().unwrap() = ExecutorState::Finished;
    }

    async fn record_memory(&self, entry: MemoryEntry) {
        self.memory.lock().unwrap().push(entry);
    }
}

pub enum PlannerReply {
    Plan(ProposedPlan),
    Nothing,
    Error(&'static str),
    Hang,
}

pub struct StaticPlanner {
    reply: Mutex<Option<PlannerReply>>,
    calls: AtomicUsize,
    schema: Mutex<Option<Value>>,
}

impl StaticPlanner {
    pub fn new(reply: PlannerReply) -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(Some(reply)),
            calls: AtomicUsize::new(0),
            schema: Mutex::new(None),
        })
    }

    pub fn steps(title: &str, steps: &[&str]) -> Arc<Self> {
        Self::new(PlannerReply::Plan(ProposedPlan {
            title: title.to_string(),
            steps: steps
                .iter()
                .map(|s| ProposedStep::Text(s.to_string()))
                .collect(),
        }))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn schema(&self) -> Option<Value> {
        self.schema.lock().unwrap().clone()
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn propose(&self, _request: &str, schema: &Value) -> anyhow::Result<Option<ProposedPlan>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.schema.lock().unwrap() = Some(schema.clone());
        let reply = self.reply.lock().unwrap().take();
        match reply {
            Some(PlannerReply::Plan(plan)) => Ok(Some(plan)),
            Some(PlannerReply::Nothing) | None => Ok(None),
            Some(PlannerReply::Error(message)) => Err(anyhow::anyhow!(message)),
            Some(PlannerReply::Hang) => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(None)
            }
        }
    }
}

pub struct FixedSummarizer {
    reply: Result<String, String>,
    calls: AtomicUsize,
}

impl FixedSummarizer {
    pub fn ok(summary: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(summary.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(reason.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for FixedSummarizer {
    async fn summarize(&self, _plan_text: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reply.clone().map_err(|reason| anyhow::anyhow!(reason))
    }
}

/// Answers every `agent:tool:ask_human` event as soon as it is emitted.
pub struct AutoResponder {
    questions: HumanQueue,
    answer: String,
    asked: AtomicUsize,
}

impl AutoResponder {
    pub fn new(questions: HumanQueue, answer: &str) -> Arc<Self> {
        Arc::new(Self {
            questions,
            answer: answer.to_string(),
            asked: AtomicUsize::new(0),
        })
    }

    pub fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskEventHandler for AutoResponder {
    async fn handle(&self, event: &TaskEvent) -> anyhow::Result<()> {
        if event.event_name != names::ASK_HUMAN {
            return Ok(());
        }
        self.asked.fetch_add(1, Ordering::SeqCst);
        let correlation = event.content["interaction_id"].as_str();
        self.questions
            .respond(&event.task_id, correlation, &self.answer)
            .await
            .map_err(|err| anyhow::anyhow!(err))?;
        Ok(())
    }
}
