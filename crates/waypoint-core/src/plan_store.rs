use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use waypoint_types::{Plan, PlanError, Step, StepStatus};

/// In-memory plan storage. Each plan sits behind its own mutex so concurrent writers to the
/// same plan id serialize instead of interleaving partial updates.
#[derive(Clone, Default)]
pub struct PlanStore {
    plans: Arc<RwLock<HashMap<String, Arc<Mutex<Plan>>>>>,
}

impl PlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the plan, replacing any plan with the same id.
    pub async fn insert(&self, plan: Plan) {
        self.plans
            .write()
            .await
            .insert(plan.plan_id.clone(), Arc::new(Mutex::new(plan)));
    }

    pub async fn contains(&self, plan_id: &str) -> bool {
        self.plans.read().await.contains_key(plan_id)
    }

    pub async fn remove(&self, plan_id: &str) -> Option<Plan> {
        let handle = self.plans.write().await.remove(plan_id)?;
        let plan = handle.lock().await.clone();
        Some(plan)
    }

    pub async fn snapshot(&self, plan_id: &str) -> Result<Plan, PlanError> {
        let handle = self.handle(plan_id).await?;
        let plan = handle.lock().await.clone();
        Ok(plan)
    }

    pub async fn render(&self, plan_id: &str) -> Result<String, PlanError> {
        let handle = self.handle(plan_id).await?;
        let text = handle.lock().await.render();
        Ok(text)
    }

    pub async fn current_step(&self, plan_id: &str) -> Result<Option<(usize, Step)>, PlanError> {
        let handle = self.handle(plan_id).await?;
        let plan = handle.lock().await;
        Ok(plan
            .current_step()
            .map(|(index, step)| (index, step.clone())))
    }

    pub async fn transition(
        &self,
        plan_id: &str,
        index: usize,
        to: StepStatus,
        notes: Option<&str>,
    ) -> Result<(), PlanError> {
        let handle = self.handle(plan_id).await?;
        let mut plan = handle.lock().await;
        plan.transition(index, to, notes)
    }

    /// Marks a step completed or blocked regardless of its current status.
    pub async fn override_step(
        &self,
        plan_id: &str,
        index: usize,
        to: StepStatus,
        notes: Option<&str>,
    ) -> Result<(), PlanError> {
        let handle = self.handle(plan_id).await?;
        let mut plan = handle.lock().await;
        plan.override_step(index, to, notes)
    }

    async fn handle(&self, plan_id: &str) -> Result<Arc<Mutex<Plan>>, PlanError> {
        self.plans
            .read()
            .await
            .get(plan_id)
            .cloned()
            .ok_or_else(|| PlanError::NotFound(plan_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Plan {
        Plan::new(
            "plan_1",
            "Sample",
            vec![Step::new("one"), Step::new("[CODE] two")],
        )
    }

    #[tokio::test]
    async fn transitions_are_visible_in_snapshots() {
        let store = PlanStore::new();
        store.insert(sample()).await;
        store
            .transition("plan_1", 0, StepStatus::InProgress, None)
            .await
            .unwrap();
        store
            .transition("plan_1", 0, StepStatus::Completed, None)
            .await
            .unwrap();

        let (index, step) = store.current_step("plan_1").await.unwrap().unwrap();
        assert_eq!(index, 1);
        assert_eq!(step.step_type.as_deref(), Some("code"));
        assert_eq!(
            store.snapshot("plan_1").await.unwrap().steps[0].status,
            StepStatus::Completed
        );
    }

    #[tokio::test]
    async fn missing_plan_is_reported() {
        let store = PlanStore::new();
        assert_eq!(
            store.render("nope").await,
            Err(PlanError::NotFound("nope".to_string()))
        );
        assert!(store
            .transition("nope", 0, StepStatus::InProgress, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn override_marks_future_step() {
        let store = PlanStore::new();
        store.insert(sample()).await;
        store
            .override_step("plan_1", 1, StepStatus::Completed, Some("User confirmed completion"))
            .await
            .unwrap();
        let text = store.render("plan_1").await.unwrap();
        assert!(text.contains("1. [✓] [CODE] two\n   Notes: User confirmed completion"));
    }

    #[tokio::test]
    async fn concurrent_writers_serialize_per_plan() {
        let store = PlanStore::new();
        store
            .insert(Plan::new(
                "p",
                "Wide",
                (0..32).map(|i| Step::new(format!("step {i}"))).collect(),
            ))
            .await;
        let mut handles = Vec::new();
        for index in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .transition("p", index, StepStatus::InProgress, None)
                    .await
                    .unwrap();
                store
                    .transition("p", index, StepStatus::Completed, None)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let counts = store.snapshot("p").await.unwrap().status_counts();
        assert_eq!(counts.completed, 32);
        assert_eq!(store.remove("p").await.map(|p| p.steps.len()), Some(32));
        assert!(!store.contains("p").await);
    }
}
