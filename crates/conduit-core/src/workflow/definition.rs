//! Workflow definitions: step descriptors, the builder, and validation.
//!
//! A `WorkflowDefinition` is immutable once built. `build()` validates every
//! structural constraint up front (unique ids, known dependencies, no cycles,
//! sane limits), so the executor never sees an invalid graph.

use std::collections::HashSet;
use std::time::Duration;

use conduit_types::workflow::RetryPolicy;
use thiserror::Error;

use super::dag::{final_steps, validate_dag};
use super::worker::{BoxStepWorker, StepWorker};

/// Default step timeout (5 minutes).
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while building or resolving workflow definitions.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Two steps share an id.
    #[error("duplicate step id: '{0}'")]
    DuplicateStep(String),

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A step references an unknown dependency.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// No definition registered under this type name.
    #[error("unknown workflow type: '{0}'")]
    UnknownWorkflowType(String),

    /// Runtime bookkeeping failure (corrupt payload and the like).
    #[error("execution error: {0}")]
    ExecutionError(String),
}

// ---------------------------------------------------------------------------
// StepDescriptor
// ---------------------------------------------------------------------------

/// One node of a workflow graph.
#[derive(Clone)]
pub struct StepDescriptor {
    pub id: String,
    pub dependencies: Vec<String>,
    pub worker: BoxStepWorker,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl StepDescriptor {
    pub fn new<W: StepWorker + 'static>(id: impl Into<String>, worker: W) -> Self {
        Self::from_box(id, BoxStepWorker::new(worker))
    }

    pub fn from_box(id: impl Into<String>, worker: BoxStepWorker) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            worker,
            timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }
}

impl std::fmt::Debug for StepDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// A validated, immutable step graph.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub workflow_type: String,
    pub version: String,
    pub steps: Vec<StepDescriptor>,
    /// Maximum steps of this workflow type running at once, across instances.
    pub concurrency: usize,
}

impl WorkflowDefinition {
    pub fn builder(
        workflow_type: impl Into<String>,
        version: impl Into<String>,
    ) -> WorkflowDefinitionBuilder {
        WorkflowDefinitionBuilder {
            workflow_type: workflow_type.into(),
            version: version.into(),
            steps: Vec::new(),
            concurrency: None,
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepDescriptor> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }

    /// Steps nothing else depends on.
    pub fn final_steps(&self) -> Vec<String> {
        final_steps(&self.steps)
            .into_iter()
            .map(String::from)
            .collect()
    }
}

/// Builder for [`WorkflowDefinition`]. Validation happens in [`build`](Self::build).
pub struct WorkflowDefinitionBuilder {
    workflow_type: String,
    version: String,
    steps: Vec<StepDescriptor>,
    concurrency: Option<usize>,
}

impl WorkflowDefinitionBuilder {
    pub fn step(mut self, step: StepDescriptor) -> Self {
        self.steps.push(step);
        self
    }

    /// Defaults to the number of steps (no extra limit) when unset.
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    pub fn build(self) -> Result<WorkflowDefinition, WorkflowError> {
        let definition = WorkflowDefinition {
            concurrency: self.concurrency.unwrap_or(self.steps.len().max(1)),
            workflow_type: self.workflow_type,
            version: self.version,
            steps: self.steps,
        };
        validate_definition(&definition)?;
        Ok(definition)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Whether `name` is usable as a workflow type: alphanumeric, `-` or `_`.
pub fn is_valid_type_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Validate the structural constraints of a definition.
///
/// Checks, in order: type name, at least one step, unique non-empty step
/// ids, per-step limits, concurrency, then dependency references and
/// acyclicity.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if !is_valid_type_name(&def.workflow_type) {
        return Err(WorkflowError::ValidationError(format!(
            "workflow type '{}' must be non-empty and contain only alphanumerics, '-' or '_'",
            def.workflow_type
        )));
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for step in &def.steps {
        if step.id.is_empty() {
            return Err(WorkflowError::ValidationError(
                "step id must not be empty".to_string(),
            ));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(WorkflowError::DuplicateStep(step.id.clone()));
        }
        if step.timeout.is_zero() {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' timeout must be greater than zero",
                step.id
            )));
        }
        if step.retry.max_attempts == 0 {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' max_attempts must be at least 1",
                step.id
            )));
        }
    }

    if def.concurrency == 0 {
        return Err(WorkflowError::ValidationError(
            "concurrency must be at least 1".to_string(),
        ));
    }

    validate_dag(&def.steps)
}
