use thiserror::Error;

use waypoint_core::{QuestionError, ResponseRejected};
use waypoint_types::PlanError;

/// Flow-scoped failures. Each one ends the run and is reported through the result text.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Failed to create plan for: {request}")]
    NoPlan { request: String },
    #[error("no executor is registered")]
    NoExecutor,
    #[error("Execution aborted: Maximum retries exceeded for step {index}.")]
    RetryBudgetExceeded { index: usize },
    #[error("waiting for a human answer failed: {0}")]
    Question(#[from] QuestionError),
    #[error("plan storage failed: {0}")]
    Plan(#[from] PlanError),
    #[error("Execution cancelled.")]
    Cancelled,
}

impl FlowError {
    pub fn code(&self) -> &'static str {
        match self {
            FlowError::NoPlan { .. } => "FLOW_NO_PLAN",
            FlowError::NoExecutor => "FLOW_NO_EXECUTOR",
            FlowError::RetryBudgetExceeded { .. } => "FLOW_RETRY_BUDGET_EXCEEDED",
            FlowError::Question(_) => "FLOW_QUESTION_ABORTED",
            FlowError::Plan(_) => "FLOW_PLAN_STORE",
            FlowError::Cancelled => "FLOW_CANCELLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RespondError {
    #[error("task `{0}` not found")]
    UnknownTask(String),
    #[error("task `{task_id}` rejected the response: {reason}")]
    Rejected {
        task_id: String,
        reason: ResponseRejected,
    },
}
