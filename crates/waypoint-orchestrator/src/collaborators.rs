use async_trait::async_trait;
use serde_json::{json, Value};

use waypoint_types::ProposedPlan;

/// Produces a structured plan for a request. `Ok(None)` means the planner chose not to
/// produce one; the flow treats it like a failure and uses the default plan.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn propose(&self, request: &str, schema: &Value)
        -> anyhow::Result<Option<ProposedPlan>>;
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, plan_text: &str) -> anyhow::Result<String>;
}

/// Action schema handed to the planner alongside the request.
pub fn plan_schema() -> Value {
    json!({
        "name": "create_plan",
        "description": "Submit an ordered, step-by-step plan that accomplishes the request.",
        "parameters": {
            "type": "object",
            "properties": {
                "title": {
                    "type": "string",
                    "description": "Concise title for the plan."
                },
                "steps": {
                    "type": "array",
                    "description": "Ordered, actionable steps. A step may start with a tag such as [CODE] to route it to a specific executor.",
                    "items": {
                        "oneOf": [
                            { "type": "string" },
                            {
                                "type": "object",
                                "properties": {
                                    "text": { "type": "string" },
                                    "type": { "type": "string" }
                                },
                                "required": ["text"]
                            }
                        ]
                    }
                }
            },
            "required": ["title", "steps"]
        }
    })
}
