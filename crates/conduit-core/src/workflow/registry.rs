//! Registry of workflow definitions by type name.

use std::sync::Arc;

use dashmap::DashMap;

use super::definition::WorkflowDefinition;

/// Concurrent map of `workflow_type -> definition`.
///
/// Registering a type twice replaces the earlier definition.
#[derive(Debug, Default, Clone)]
pub struct WorkflowRegistry {
    definitions: Arc<DashMap<String, Arc<WorkflowDefinition>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, definition: WorkflowDefinition) -> Arc<WorkflowDefinition> {
        let definition = Arc::new(definition);
        if self
            .definitions
            .insert(definition.workflow_type.clone(), Arc::clone(&definition))
            .is_some()
        {
            tracing::debug!(
                workflow_type = definition.workflow_type.as_str(),
                "replaced workflow definition"
            );
        }
        definition
    }

    pub fn get(&self, workflow_type: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(workflow_type).map(|d| Arc::clone(d.value()))
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.definitions.contains_key(workflow_type)
    }

    /// Registered type names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut types: Vec<String> = self.definitions.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }
}
