//! Step executor registry.
//!
//! Maps a step type tag to the executor instance that runs it. The registry
//! is owned by a `PipelineExecutor`; custom step types are added with
//! `register`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::executors::{builtin_executors, ExecutorDeps, StepExecutor};

/// Tag -> executor table
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the six built-in step types
    pub fn with_defaults(deps: &ExecutorDeps) -> Self {
        let mut registry = Self::new();
        for executor in builtin_executors(deps) {
            let tag = executor.step_type().to_string();
            registry.register(tag, executor);
        }
        registry
    }

    /// Register an executor under `step_type`, returning any executor it replaced
    pub fn register(
        &mut self,
        step_type: impl Into<String>,
        executor: Arc<dyn StepExecutor>,
    ) -> Option<Arc<dyn StepExecutor>> {
        let step_type = step_type.into();
        debug!(%step_type, "Registering step executor");
        self.executors.insert(step_type, executor)
    }

    /// Executor for a tag
    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(step_type).cloned()
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.executors.contains_key(step_type)
    }

    /// Registered tags, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::{ConditionExecutor, TransformExecutor};

    #[test]
    fn test_register_and_replace() {
        let mut registry = ExecutorRegistry::new();
        assert!(registry.get("transform").is_none());

        assert!(registry.register("transform", Arc::new(TransformExecutor)).is_none());
        assert!(registry.contains("transform"));

        let replaced = registry.register("transform", Arc::new(ConditionExecutor));
        assert!(replaced.is_some());
        assert_eq!(registry.get("transform").unwrap().step_type(), "condition");
    }

    #[test]
    fn test_types_sorted() {
        let mut registry = ExecutorRegistry::new();
        registry.register("transform", Arc::new(TransformExecutor));
        registry.register("custom", Arc::new(ConditionExecutor));
        assert_eq!(registry.types(), vec!["custom", "transform"]);
    }
}
