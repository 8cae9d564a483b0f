use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;

use waypoint_types::now_ms;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuestionError {
    #[error("question for task `{0}` was cancelled or superseded")]
    Cancelled(String),
    #[error("wait for an answer on task `{0}` was aborted")]
    Aborted(String),
}

/// Why a response could not be delivered. The queue is left untouched in every case.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponseRejected {
    #[error("no question is pending")]
    NoQuestion,
    #[error("the pending question was already answered or cancelled")]
    AlreadyResolved,
    #[error("response targets `{got}` but the pending question is `{expected}`")]
    CorrelationMismatch { expected: String, got: String },
}

struct PendingQuestion {
    question: String,
    correlation_id: Option<String>,
    asked_at_ms: u64,
    responder: Option<oneshot::Sender<String>>,
}

impl PendingQuestion {
    fn is_unresolved(&self) -> bool {
        self.responder
            .as_ref()
            .is_some_and(|responder| !responder.is_closed())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuestionSnapshot {
    pub question: String,
    pub correlation_id: Option<String>,
    pub asked_at_ms: u64,
    pub pending: bool,
}

/// The awaiting side of a pending question.
#[derive(Debug)]
pub struct QuestionTicket {
    task_id: String,
    question: String,
    correlation_id: Option<String>,
    rx: oneshot::Receiver<String>,
}

impl QuestionTicket {
    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub async fn wait(self) -> Result<String, QuestionError> {
        self.rx
            .await
            .map_err(|_| QuestionError::Cancelled(self.task_id))
    }

    pub async fn wait_or_cancel(self, cancel: &CancellationToken) -> Result<String, QuestionError> {
        let task_id = self.task_id;
        tokio::select! {
            _ = cancel.cancelled() => Err(QuestionError::Aborted(task_id)),
            answer = self.rx => answer.map_err(|_| QuestionError::Cancelled(task_id)),
        }
    }
}

/// Holds at most one unresolved question per task and hands the answer across to whichever
/// context is awaiting it.
#[derive(Clone, Default)]
pub struct HumanQueue {
    questions: Arc<RwLock<HashMap<String, PendingQuestion>>>,
}

impl HumanQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_question(&self, task_id: &str, question: &str) -> QuestionTicket {
        self.ask(task_id, question, None).await
    }

    /// Installs a new question for the task. An unresolved earlier question is cancelled
    /// first, so its awaiter observes [`QuestionError::Cancelled`].
    pub async fn ask(
        &self,
        task_id: &str,
        question: &str,
        correlation_id: Option<String>,
    ) -> QuestionTicket {
        let (tx, rx) = oneshot::channel();
        let mut questions = self.questions.write().await;
        if let Some(previous) = questions.get_mut(task_id) {
            if previous.is_unresolved() {
                tracing::debug!(task_id, "superseding unanswered question");
            }
            previous.responder.take();
        }
        questions.insert(
            task_id.to_string(),
            PendingQuestion {
                question: question.to_string(),
                correlation_id: correlation_id.clone(),
                asked_at_ms: now_ms(),
                responder: Some(tx),
            },
        );
        QuestionTicket {
            task_id: task_id.to_string(),
            question: question.to_string(),
            correlation_id,
            rx,
        }
    }

    /// Resolves the pending question. False when none exists or it is already resolved.
    pub async fn add_response(&self, task_id: &str, response: &str) -> bool {
        self.respond(task_id, None, response).await.is_ok()
    }

    /// Resolves the pending question, optionally checking its correlation id, and returns
    /// the question text that was answered.
    pub async fn respond(
        &self,
        task_id: &str,
        correlation_id: Option<&str>,
        response: &str,
    ) -> Result<String, ResponseRejected> {
        let mut questions = self.questions.write().await;
        let pending = questions
            .get_mut(task_id)
            .ok_or(ResponseRejected::NoQuestion)?;
        if !pending.is_unresolved() {
            return Err(ResponseRejected::AlreadyResolved);
        }
        if let (Some(got), Some(expected)) = (correlation_id, pending.correlation_id.as_deref()) {
            if got != expected {
                return Err(ResponseRejected::CorrelationMismatch {
                    expected: expected.to_string(),
                    got: got.to_string(),
                });
            }
        }
        let responder = pending
            .responder
            .take()
            .ok_or(ResponseRejected::AlreadyResolved)?;
        responder
            .send(response.to_string())
            .map_err(|_| ResponseRejected::AlreadyResolved)?;
        Ok(pending.question.clone())
    }

    /// The latest question text asked for the task, answered or not.
    pub async fn get_current_question(&self, task_id: &str) -> Option<String> {
        self.questions
            .read()
            .await
            .get(task_id)
            .map(|pending| pending.question.clone())
    }

    pub async fn has_pending_question(&self, task_id: &str) -> bool {
        self.questions
            .read()
            .await
            .get(task_id)
            .is_some_and(PendingQuestion::is_unresolved)
    }

    pub async fn snapshot(&self, task_id: &str) -> Option<QuestionSnapshot> {
        self.questions
            .read()
            .await
            .get(task_id)
            .map(|pending| QuestionSnapshot {
                question: pending.question.clone(),
                correlation_id: pending.correlation_id.clone(),
                asked_at_ms: pending.asked_at_ms,
                pending: pending.is_unresolved(),
            })
    }

    /// Cancels the unresolved question, if any. The question text stays readable.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let mut questions = self.questions.write().await;
        let Some(pending) = questions.get_mut(task_id) else {
            return false;
        };
        let was_unresolved = pending.is_unresolved();
        pending.responder.take();
        was_unresolved
    }

    pub async fn remove(&self, task_id: &str) {
        self.questions.write().await.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn response_from_another_task_resolves_the_waiter() {
        let queue = HumanQueue::new();
        let ticket = queue.add_question("t1", "Which branch?").await;
        assert!(queue.has_pending_question("t1").await);

        let responder = queue.clone();
        tokio::spawn(async move {
            assert!(responder.add_response("t1", "main").await);
        });

        assert_eq!(ticket.wait().await.as_deref(), Ok("main"));
        assert!(!queue.has_pending_question("t1").await);
        assert_eq!(
            queue.get_current_question("t1").await.as_deref(),
            Some("Which branch?")
        );
    }

    #[tokio::test]
    async fn new_question_cancels_the_previous_one() {
        let queue = HumanQueue::new();
        let first = queue.add_question("t1", "first?").await;
        let second = queue.add_question("t1", "second?").await;

        assert_eq!(first.wait().await, Err(QuestionError::Cancelled("t1".into())));
        assert!(queue.has_pending_question("t1").await);
        assert!(queue.add_response("t1", "answer").await);
        assert_eq!(second.wait().await.as_deref(), Ok("answer"));
    }

    #[tokio::test]
    async fn second_response_fails_without_touching_state() {
        let queue = HumanQueue::new();
        let _ticket = queue.add_question("t1", "Proceed?").await;
        assert!(queue.add_response("t1", "yes").await);
        let before = queue.snapshot("t1").await;

        assert_eq!(
            queue.respond("t1", None, "no").await,
            Err(ResponseRejected::AlreadyResolved)
        );
        assert_eq!(queue.snapshot("t1").await, before);
    }

    #[tokio::test]
    async fn response_without_question_is_rejected() {
        let queue = HumanQueue::new();
        assert!(!queue.add_response("nobody", "hello").await);
        assert_eq!(queue.get_current_question("nobody").await, None);
        assert!(!queue.has_pending_question("nobody").await);
    }

    #[tokio::test]
    async fn correlation_mismatch_leaves_question_pending() {
        let queue = HumanQueue::new();
        let ticket = queue
            .ask("t1", "Which file?", Some("call_1".to_string()))
            .await;
        assert_eq!(ticket.correlation_id(), Some("call_1"));

        let err = queue
            .respond("t1", Some("call_0"), "a.rs")
            .await
            .unwrap_err();
        assert!(matches!(err, ResponseRejected::CorrelationMismatch { .. }));
        assert!(queue.has_pending_question("t1").await);

        let question = queue.respond("t1", Some("call_1"), "b.rs").await.unwrap();
        assert_eq!(question, "Which file?");
        assert_eq!(ticket.wait().await.as_deref(), Ok("b.rs"));
    }

    #[tokio::test]
    async fn dropped_waiter_counts_as_resolved() {
        let queue = HumanQueue::new();
        let ticket = queue.add_question("t1", "Still there?").await;
        drop(ticket);
        assert!(!queue.has_pending_question("t1").await);
        assert!(!queue.add_response("t1", "yes").await);
    }

    #[tokio::test]
    async fn cancel_and_abort_release_the_waiter() {
        let queue = HumanQueue::new();
        let ticket = queue.add_question("t1", "q").await;
        assert!(queue.cancel("t1").await);
        assert!(!queue.cancel("t1").await);
        assert_eq!(ticket.wait().await, Err(QuestionError::Cancelled("t1".into())));

        let ticket = queue.add_question("t1", "q2").await;
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(
            ticket.wait_or_cancel(&token).await,
            Err(QuestionError::Aborted("t1".into()))
        );

        queue.remove("t1").await;
        assert_eq!(queue.snapshot("t1").await, None);
    }

    #[tokio::test]
    async fn tasks_are_isolated() {
        let queue = HumanQueue::new();
        let a = queue.add_question("a", "qa").await;
        let _b = queue.add_question("b", "qb").await;
        assert!(queue.add_response("a", "ra").await);
        assert!(queue.has_pending_question("b").await);
        assert_eq!(a.wait().await.as_deref(), Ok("ra"));
    }
}
