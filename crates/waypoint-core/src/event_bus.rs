use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use futures::{FutureExt, Stream};
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use waypoint_types::TaskEvent;

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("invalid event pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("no event queue for task `{0}`")]
    UnknownTask(String),
}

/// Receives every event whose name matches the pattern it was registered with.
#[async_trait]
pub trait TaskEventHandler: Send + Sync {
    async fn handle(&self, event: &TaskEvent) -> anyhow::Result<()>;
}

/// Adapts a plain closure into a [`TaskEventHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> TaskEventHandler for FnHandler<F>
where
    F: Fn(&TaskEvent) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, event: &TaskEvent) -> anyhow::Result<()> {
        (self.0)(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct RegisteredHandler {
    id: HandlerId,
    pattern: Regex,
    handler: Arc<dyn TaskEventHandler>,
}

struct QueueCursor {
    next_seq: u64,
    last_step: u64,
}

struct TaskChannel {
    tx: mpsc::UnboundedSender<TaskEvent>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<TaskEvent>>>,
    cursor: StdMutex<QueueCursor>,
    handlers: RwLock<Vec<RegisteredHandler>>,
}

impl TaskChannel {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            cursor: StdMutex::new(QueueCursor {
                next_seq: 0,
                last_step: 0,
            }),
            handlers: RwLock::new(Vec::new()),
        }
    }
}

/// Per-task event queues plus pattern-matched handlers, keyed by task id.
#[derive(Clone, Default)]
pub struct TaskEventBus {
    channels: Arc<RwLock<HashMap<String, Arc<TaskChannel>>>>,
    next_handler_id: Arc<AtomicU64>,
}

impl TaskEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the queue for `task_id`. Returns false when one already exists; the existing
    /// queue and its backlog are kept.
    pub async fn open(&self, task_id: &str) -> bool {
        let mut channels = self.channels.write().await;
        if channels.contains_key(task_id) {
            return false;
        }
        channels.insert(task_id.to_string(), Arc::new(TaskChannel::new()));
        true
    }

    pub async fn is_open(&self, task_id: &str) -> bool {
        self.channels.read().await.contains_key(task_id)
    }

    /// Drops the queue and its handlers. Subscribers drain what is left and then see the
    /// queue as closed.
    pub async fn close(&self, task_id: &str) -> bool {
        self.channels.write().await.remove(task_id).is_some()
    }

    /// Appends an event to the task's queue, then dispatches it to matching handlers.
    /// Returns the stored event, or `None` when the task has no queue.
    pub async fn emit(
        &self,
        task_id: &str,
        event_name: &str,
        step: u64,
        content: Value,
    ) -> Option<TaskEvent> {
        let Some(channel) = self.channel(task_id).await else {
            tracing::warn!(task_id, event_name, "event dropped: no queue for task");
            return None;
        };

        let event = {
            // seq and enqueue under one lock so queue order equals seq order
            let mut cursor = channel
                .cursor
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let step = step.max(cursor.last_step);
            cursor.last_step = step;
            let mut event = TaskEvent::new(task_id, event_name, step, content);
            event.seq = cursor.next_seq;
            cursor.next_seq += 1;
            if channel.tx.send(event.clone()).is_err() {
                tracing::warn!(task_id, event_name, "event queue receiver is gone");
            }
            event
        };

        let handlers: Vec<Arc<dyn TaskEventHandler>> = channel
            .handlers
            .read()
            .await
            .iter()
            .filter(|registered| registered.pattern.is_match(&event.event_name))
            .map(|registered| registered.handler.clone())
            .collect();
        for handler in handlers {
            match AssertUnwindSafe(handler.handle(&event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(
                    task_id,
                    event_name = event.event_name.as_str(),
                    "event handler failed: {err:#}"
                ),
                Err(_) => tracing::error!(
                    task_id,
                    event_name = event.event_name.as_str(),
                    "event handler panicked"
                ),
            }
        }
        Some(event)
    }

    /// Registers `handler` for event names matching `pattern`, anchored at the start of the
    /// name (`agent:.*` matches every agent event).
    pub async fn on(
        &self,
        task_id: &str,
        pattern: &str,
        handler: Arc<dyn TaskEventHandler>,
    ) -> Result<HandlerId, EventBusError> {
        let compiled =
            Regex::new(&format!("^(?:{pattern})")).map_err(|source| EventBusError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
        let channel = self
            .channel(task_id)
            .await
            .ok_or_else(|| EventBusError::UnknownTask(task_id.to_string()))?;
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        channel.handlers.write().await.push(RegisteredHandler {
            id,
            pattern: compiled,
            handler,
        });
        Ok(id)
    }

    pub async fn off(&self, task_id: &str, id: HandlerId) -> bool {
        let Some(channel) = self.channel(task_id).await else {
            return false;
        };
        let mut handlers = channel.handlers.write().await;
        let before = handlers.len();
        handlers.retain(|registered| registered.id != id);
        handlers.len() != before
    }

    /// Attaches a consumer to the task's queue. A later subscriber continues from whatever
    /// backlog the previous one left unconsumed.
    pub async fn subscribe(&self, task_id: &str) -> Option<TaskEventStream> {
        let channel = self.channel(task_id).await?;
        Some(TaskEventStream {
            task_id: task_id.to_string(),
            rx: channel.rx.clone(),
        })
    }

    async fn channel(&self, task_id: &str) -> Option<Arc<TaskChannel>> {
        self.channels.read().await.get(task_id).cloned()
    }
}

/// Why a consumer stopped draining a task's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    Closed,
    Cancelled,
    Disconnected,
}

pub struct TaskEventStream {
    task_id: String,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<TaskEvent>>>,
}

impl TaskEventStream {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Waits for the next event; `None` once the queue is closed and drained.
    pub async fn next(&self) -> Option<TaskEvent> {
        self.rx.lock().await.recv().await
    }

    /// Drives the consumer contract: forwards events until the lifecycle-complete event, a
    /// closed queue, cancellation, or `forward` returning false.
    pub async fn forward<F>(&self, cancel: &CancellationToken, mut forward: F) -> StreamEnd
    where
        F: FnMut(&TaskEvent) -> bool,
    {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                event = self.next() => event,
            };
            let Some(event) = next else {
                return StreamEnd::Closed;
            };
            if !forward(&event) {
                return StreamEnd::Disconnected;
            }
            if event.is_lifecycle_complete() {
                return StreamEnd::Completed;
            }
        }
    }

    /// Stream view that ends after yielding the lifecycle-complete event.
    pub fn into_stream(self) -> impl Stream<Item = TaskEvent> + Send {
        futures::stream::unfold((self, false), |(stream, finished)| async move {
            if finished {
                return None;
            }
            let event = stream.next().await?;
            let finished = event.is_lifecycle_complete();
            Some((event, (stream, finished)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use waypoint_types::names;

    struct FailingHandler;

    #[async_trait]
    impl TaskEventHandler for FailingHandler {
        async fn handle(&self, _event: &TaskEvent) -> anyhow::Result<()> {
            anyhow::bail!("handler exploded")
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl TaskEventHandler for PanickingHandler {
        async fn handle(&self, _event: &TaskEvent) -> anyhow::Result<()> {
            panic!("handler panicked")
        }
    }

    fn counter() -> (Arc<AtomicUsize>, Arc<dyn TaskEventHandler>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let handler = Arc::new(FnHandler(move |_event: &TaskEvent| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        (count, handler)
    }

    #[tokio::test]
    async fn events_are_observed_in_emission_order() {
        let bus = TaskEventBus::new();
        assert!(bus.open("t1").await);
        assert!(!bus.open("t1").await);
        for step in 0..5 {
            bus.emit("t1", names::STEP_START, step, json!({ "i": step }))
                .await
                .unwrap();
        }
        let stream = bus.subscribe("t1").await.unwrap();
        for expected in 0..5u64 {
            let event = stream.next().await.unwrap();
            assert_eq!(event.seq, expected);
            assert_eq!(event.content["i"], expected);
        }
    }

    #[tokio::test]
    async fn step_counter_never_decreases() {
        let bus = TaskEventBus::new();
        bus.open("t1").await;
        bus.emit("t1", names::STEP_START, 4, json!({})).await;
        let event = bus.emit("t1", names::MESSAGE, 2, json!({})).await.unwrap();
        assert_eq!(event.step, 4);
    }

    #[tokio::test]
    async fn emit_to_unknown_task_is_not_delivered() {
        let bus = TaskEventBus::new();
        assert!(bus.emit("missing", names::MESSAGE, 0, json!({})).await.is_none());
        let (_, handler) = counter();
        assert!(matches!(
            bus.on("missing", "agent:.*", handler).await,
            Err(EventBusError::UnknownTask(_))
        ));
    }

    #[tokio::test]
    async fn handlers_only_receive_matching_events() {
        let bus = TaskEventBus::new();
        bus.open("t1").await;
        let (all, all_handler) = counter();
        let (steps, step_handler) = counter();
        bus.on("t1", "agent:.*", all_handler).await.unwrap();
        bus.on("t1", "agent:step:.*", step_handler).await.unwrap();

        bus.emit("t1", names::STEP_START, 0, json!({})).await;
        bus.emit("t1", names::ASK_HUMAN, 0, json!({})).await;
        bus.emit("t1", "system:tick", 0, json!({})).await;

        assert_eq!(all.load(Ordering::SeqCst), 2);
        assert_eq!(steps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_handlers_do_not_block_dispatch_or_queue() {
        let bus = TaskEventBus::new();
        bus.open("t1").await;
        bus.on("t1", "agent:.*", Arc::new(FailingHandler))
            .await
            .unwrap();
        bus.on("t1", "agent:.*", Arc::new(PanickingHandler))
            .await
            .unwrap();
        let (count, handler) = counter();
        bus.on("t1", "agent:.*", handler).await.unwrap();

        bus.emit("t1", names::MESSAGE, 0, json!({})).await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let stream = bus.subscribe("t1").await.unwrap();
        assert_eq!(stream.next().await.unwrap().event_name, names::MESSAGE);
    }

    #[tokio::test]
    async fn removed_handlers_stop_receiving() {
        let bus = TaskEventBus::new();
        bus.open("t1").await;
        let (count, handler) = counter();
        let id = bus.on("t1", "agent:.*", handler).await.unwrap();
        assert!(bus.off("t1", id).await);
        bus.emit("t1", names::MESSAGE, 0, json!({})).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_pattern_is_rejected() {
        let bus = TaskEventBus::new();
        bus.open("t1").await;
        let (_, handler) = counter();
        assert!(matches!(
            bus.on("t1", "agent:(", handler).await,
            Err(EventBusError::InvalidPattern { .. })
        ));
    }

    #[tokio::test]
    async fn forward_stops_after_lifecycle_complete() {
        let bus = TaskEventBus::new();
        bus.open("t1").await;
        bus.emit("t1", names::STEP_START, 0, json!({})).await;
        bus.emit("t1", names::LIFECYCLE_COMPLETE, 1, json!({})).await;
        bus.emit("t1", names::MESSAGE, 1, json!({})).await;

        let stream = bus.subscribe("t1").await.unwrap();
        let mut seen = Vec::new();
        let end = stream
            .forward(&CancellationToken::new(), |event| {
                seen.push(event.event_name.clone());
                true
            })
            .await;
        assert_eq!(end, StreamEnd::Completed);
        assert_eq!(seen, vec![names::STEP_START, names::LIFECYCLE_COMPLETE]);
    }

    #[tokio::test]
    async fn forward_reports_closed_queue_after_draining() {
        let bus = TaskEventBus::new();
        bus.open("t1").await;
        bus.emit("t1", names::STEP_START, 0, json!({})).await;
        let stream = bus.subscribe("t1").await.unwrap();
        assert!(bus.close("t1").await);

        let mut seen = 0;
        let end = stream
            .forward(&CancellationToken::new(), |_| {
                seen += 1;
                true
            })
            .await;
        assert_eq!(end, StreamEnd::Closed);
        assert_eq!(seen, 1);
    }

    #[tokio::test]
    async fn forward_honors_cancellation_and_disconnect() {
        let bus = TaskEventBus::new();
        bus.open("t1").await;
        let stream = bus.subscribe("t1").await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(stream.forward(&cancel, |_| true).await, StreamEnd::Cancelled);

        bus.emit("t1", names::STEP_START, 0, json!({})).await;
        bus.emit("t1", names::STEP_COMPLETE, 0, json!({})).await;
        let end = stream.forward(&CancellationToken::new(), |_| false).await;
        assert_eq!(end, StreamEnd::Disconnected);

        // the next subscriber picks up the backlog the first one left behind
        let resumed = bus.subscribe("t1").await.unwrap();
        assert_eq!(resumed.next().await.unwrap().event_name, names::STEP_COMPLETE);
    }

    #[tokio::test]
    async fn consumer_waits_for_events_emitted_concurrently() {
        let bus = TaskEventBus::new();
        bus.open("t1").await;
        let stream = bus.subscribe("t1").await.unwrap();
        let producer = bus.clone();
        tokio::spawn(async move {
            for step in 0..3 {
                producer.emit("t1", names::STEP_START, step, json!({})).await;
                tokio::task::yield_now().await;
            }
            producer
                .emit("t1", names::LIFECYCLE_COMPLETE, 3, json!({}))
                .await;
        });
        let events: Vec<TaskEvent> = stream.into_stream().collect().await;
        assert_eq!(events.len(), 4);
        assert!(events.last().unwrap().is_lifecycle_complete());
        assert!(events.windows(2).all(|pair| pair[0].seq < pair[1].seq));
    }
}
