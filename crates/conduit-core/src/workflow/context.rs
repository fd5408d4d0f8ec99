//! Immutable payload snapshots handed to step workers.
//!
//! `WorkflowPayload` is the accumulated state of an instance: the submitted
//! input plus every completed step's result keyed by step id. Workers get a
//! shared, read-only snapshot through `StepContext`; only the executor
//! produces the next payload, via `with_step_result`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::definition::WorkflowError;

/// Maximum size of a single serialized step result (1 MB).
pub const MAX_STEP_RESULT_SIZE: usize = 1_048_576;

/// Accumulated payload of a workflow instance.
///
/// Serialized form: `{"input": ..., "steps": {step_id: result}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPayload {
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub steps: Map<String, Value>,
}

impl WorkflowPayload {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            steps: Map::new(),
        }
    }

    /// Return a new payload with `result` merged under `step_id`.
    pub fn with_step_result(&self, step_id: &str, result: Value) -> Self {
        let mut next = self.clone();
        next.steps.insert(step_id.to_string(), result);
        next
    }

    pub fn step_result(&self, step_id: &str) -> Option<&Value> {
        self.steps.get(step_id)
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({ "input": self.input, "steps": self.steps })
    }

    pub fn from_json(value: Value) -> Result<Self, WorkflowError> {
        serde_json::from_value(value)
            .map_err(|e| WorkflowError::ExecutionError(format!("corrupt payload: {e}")))
    }
}

/// What a step worker sees for one attempt.
#[derive(Debug, Clone)]
pub struct StepContext {
    workflow_id: Uuid,
    workflow_type: Arc<str>,
    step_id: String,
    attempt: u32,
    payload: Arc<WorkflowPayload>,
}

impl StepContext {
    pub fn new(
        workflow_id: Uuid,
        workflow_type: impl Into<Arc<str>>,
        step_id: impl Into<String>,
        attempt: u32,
        payload: Arc<WorkflowPayload>,
    ) -> Self {
        Self {
            workflow_id,
            workflow_type: workflow_type.into(),
            step_id: step_id.into(),
            attempt,
            payload,
        }
    }

    /// Same snapshot, next attempt number.
    pub fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// 1-based.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The input the instance was submitted with.
    pub fn input(&self) -> &Value {
        &self.payload.input
    }

    /// Result of a completed dependency.
    pub fn step_result(&self, step_id: &str) -> Option<&Value> {
        self.payload.step_result(step_id)
    }

    pub fn payload(&self) -> &WorkflowPayload {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn with_step_result_leaves_original_untouched() {
        let base = WorkflowPayload::new(json!({"n": 1}));
        let next = base.with_step_result("a", json!("A"));

        assert!(base.step_result("a").is_none());
        assert_eq!(next.step_result("a"), Some(&json!("A")));
        assert_eq!(next.input, json!({"n": 1}));
    }

    #[test]
    fn json_shape_matches_instance_payload() {
        let payload = WorkflowPayload::new(json!({"n": 1})).with_step_result("a", json!(2));
        let value = payload.to_json();
        assert_eq!(value, json!({"input": {"n": 1}, "steps": {"a": 2}}));

        let parsed = WorkflowPayload::from_json(value).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn from_json_tolerates_missing_fields() {
        let parsed = WorkflowPayload::from_json(json!({})).unwrap();
        assert!(parsed.steps.is_empty());
        assert!(parsed.input.is_null());
    }

    #[test]
    fn from_json_rejects_wrong_shape() {
        let err = WorkflowPayload::from_json(json!({"steps": [1, 2]})).unwrap_err();
        assert!(err.to_string().contains("corrupt payload"));
    }

    #[test]
    fn context_exposes_snapshot() {
        let payload = Arc::new(
            WorkflowPayload::new(json!({"doc": "x"})).with_step_result("parse", json!({"ok": true})),
        );
        let ctx = StepContext::new(Uuid::now_v7(), "ingest", "index", 1, payload);

        assert_eq!(ctx.input()["doc"], "x");
        assert_eq!(ctx.step_result("parse"), Some(&json!({"ok": true})));
        assert_eq!(ctx.workflow_type(), "ingest");

        let retry = ctx.for_attempt(2);
        assert_eq!(retry.attempt(), 2);
        assert_eq!(retry.step_id(), "index");
    }
}
