//! Events broadcast by the workflow executor.
//!
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.
//! Events are published only after the state they describe is persisted.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        workflow_id: Uuid,
        workflow_type: String,
        total_steps: usize,
    },

    StepStarted {
        workflow_id: Uuid,
        step_id: String,
        attempt: u32,
    },

    StepCompleted {
        workflow_id: Uuid,
        step_id: String,
        attempt: u32,
        duration_ms: u64,
    },

    /// A failed attempt that will be re-invoked after `delay_ms`.
    StepRetrying {
        workflow_id: Uuid,
        step_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    /// A step failed permanently (attempts exhausted).
    StepFailed {
        workflow_id: Uuid,
        step_id: String,
        attempt: u32,
        error_kind: ErrorKind,
        error: String,
    },

    WorkflowCompleted {
        workflow_id: Uuid,
        duration_ms: u64,
    },

    WorkflowFailed {
        workflow_id: Uuid,
        error_kind: ErrorKind,
        error: String,
        /// Steps short-circuited because an ancestor failed.
        skipped_steps: Vec<String>,
    },
}

impl WorkflowEvent {
    pub fn workflow_id(&self) -> Uuid {
        match self {
            WorkflowEvent::WorkflowStarted { workflow_id, .. }
            | WorkflowEvent::StepStarted { workflow_id, .. }
            | WorkflowEvent::StepCompleted { workflow_id, .. }
            | WorkflowEvent::StepRetrying { workflow_id, .. }
            | WorkflowEvent::StepFailed { workflow_id, .. }
            | WorkflowEvent::WorkflowCompleted { workflow_id, .. }
            | WorkflowEvent::WorkflowFailed { workflow_id, .. } => *workflow_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::WorkflowCompleted { .. } | WorkflowEvent::WorkflowFailed { .. }
        )
    }
}
