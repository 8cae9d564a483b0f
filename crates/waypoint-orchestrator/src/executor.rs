use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What one executor call produced for the step it was handed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Success(String),
    /// The executor cannot continue without a human answer.
    Pause {
        question: String,
        correlation_id: Option<String>,
    },
    Failure(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorState {
    #[default]
    Idle,
    Running,
    Finished,
    Error,
}

impl ExecutorState {
    /// A terminal executor ends the flow loop without finalizing.
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutorState::Finished | ExecutorState::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryRole {
    User,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub role: MemoryRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl MemoryEntry {
    pub fn user(content: impl Into<String>, correlation_id: Option<String>) -> Self {
        Self {
            role: MemoryRole::User,
            content: content.into(),
            correlation_id,
            name: None,
        }
    }

    pub fn tool(
        name: impl Into<String>,
        content: impl Into<String>,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            role: MemoryRole::Tool,
            content: content.into(),
            correlation_id,
            name: Some(name.into()),
        }
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, context: &str) -> StepOutcome;

    fn current_state(&self) -> ExecutorState {
        ExecutorState::Idle
    }

    async fn request_termination(&self) {}

    async fn record_memory(&self, entry: MemoryEntry);
}

/// Executors keyed by name, in registration order. The first registered executor is the
/// primary one unless another is chosen explicitly.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
    order: Vec<String>,
    preferred_keys: Vec<String>,
    primary_key: Option<String>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: impl Into<String>, executor: Arc<dyn Executor>) {
        let key = key.into();
        if !self.executors.contains_key(&key) {
            self.order.push(key.clone());
        }
        if self.primary_key.is_none() {
            self.primary_key = Some(key.clone());
        }
        self.executors.insert(key, executor);
    }

    pub fn with(mut self, key: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        self.register(key, executor);
        self
    }

    pub fn set_primary(&mut self, key: &str) -> bool {
        if self.executors.contains_key(key) {
            self.primary_key = Some(key.to_string());
            true
        } else {
            false
        }
    }

    /// Keys tried, in order, for steps whose type tag matches nothing.
    pub fn set_executor_keys(&mut self, keys: Vec<String>) {
        self.preferred_keys = keys;
    }

    pub fn executor_keys(&self) -> &[String] {
        &self.preferred_keys
    }

    pub fn keys(&self) -> &[String] {
        &self.order
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(key).cloned()
    }

    pub fn primary(&self) -> Option<(String, Arc<dyn Executor>)> {
        let key = self.primary_key.as_ref()?;
        self.executors
            .get(key)
            .map(|executor| (key.clone(), executor.clone()))
    }

    /// Type tag first, then the first registered preferred key, then the primary executor.
    pub fn resolve(&self, step_type: Option<&str>) -> Option<(String, Arc<dyn Executor>)> {
        if let Some(tag) = step_type {
            if let Some(executor) = self.executors.get(tag) {
                return Some((tag.to_string(), executor.clone()));
            }
        }
        for key in &self.preferred_keys {
            if let Some(executor) = self.executors.get(key) {
                return Some((key.clone(), executor.clone()));
            }
        }
        self.primary()
    }

    pub fn all(&self) -> Vec<(String, Arc<dyn Executor>)> {
        self.order
            .iter()
            .filter_map(|key| {
                self.executors
                    .get(key)
                    .map(|executor| (key.clone(), executor.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Executor for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn run(&self, _context: &str) -> StepOutcome {
            StepOutcome::Success(self.0.to_string())
        }

        async fn record_memory(&self, _entry: MemoryEntry) {}
    }

    fn registry() -> ExecutorRegistry {
        ExecutorRegistry::new()
            .with("general", Arc::new(Named("general")))
            .with("code", Arc::new(Named("code")))
            .with("browser", Arc::new(Named("browser")))
    }

    fn resolved(registry: &ExecutorRegistry, tag: Option<&str>) -> Option<String> {
        registry.resolve(tag).map(|(key, _)| key)
    }

    #[test]
    fn type_tag_wins_over_preferred_keys() {
        let mut registry = registry();
        registry.set_executor_keys(vec!["browser".to_string()]);
        assert_eq!(resolved(&registry, Some("code")).as_deref(), Some("code"));
        assert_eq!(
            resolved(&registry, Some("search")).as_deref(),
            Some("browser")
        );
    }

    #[test]
    fn unregistered_preferred_keys_are_skipped() {
        let mut registry = registry();
        registry.set_executor_keys(vec!["missing".to_string(), "code".to_string()]);
        assert_eq!(resolved(&registry, None).as_deref(), Some("code"));
    }

    #[test]
    fn primary_is_the_last_resort() {
        let mut registry = registry();
        assert_eq!(resolved(&registry, None).as_deref(), Some("general"));
        assert!(registry.set_primary("browser"));
        assert!(!registry.set_primary("missing"));
        assert_eq!(resolved(&registry, Some("x")).as_deref(), Some("browser"));
        assert!(ExecutorRegistry::new().resolve(None).is_none());
    }

    #[test]
    fn reregistering_keeps_order() {
        let registry = registry().with("code", Arc::new(Named("code2")));
        assert_eq!(registry.keys(), ["general", "code", "browser"]);
        let (_, executor) = registry.resolve(Some("code")).unwrap();
        assert_eq!(executor.name(), "code2");
    }
}
