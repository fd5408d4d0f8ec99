//! Workflow domain types for Conduit.
//!
//! Persisted execution state (`WorkflowInstance`, `StepRecord`), the retry
//! policy attached to every step, and the status snapshot returned to callers.
//! The step graph itself (which holds worker callables) lives in conduit-core.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Retry policy for a single step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay schedule between attempts.
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::default(),
        }
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }
}

/// Capped exponential backoff.
///
/// `delay(n) = min(initial_ms * multiplier^(n - 1), max_ms)` where `n` is the
/// 1-based number of the attempt that just failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

fn default_initial_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_ms() -> u64 {
    30_000
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            multiplier: default_multiplier(),
            max_ms: default_max_ms(),
        }
    }
}

impl Backoff {
    /// No delay between attempts. Handy in tests.
    pub fn immediate() -> Self {
        Self {
            initial_ms: 0,
            multiplier: 1.0,
            max_ms: 0,
        }
    }

    /// Delay before the attempt following `failed_attempt`.
    pub fn delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(63) as i32;
        let raw = self.initial_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_ms as f64)
        } else {
            self.max_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle of a workflow instance: `pending -> running -> {completed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "running" => Ok(WorkflowStatus::Running),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            other => Err(format!("invalid workflow status: '{other}'")),
        }
    }
}

/// Per-step execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    Running,
    Completed,
    Failed,
    /// Never attempted because an ancestor failed permanently.
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::NotStarted => "not_started",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(StepStatus::NotStarted),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("invalid step status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted execution state
// ---------------------------------------------------------------------------

/// A single execution of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// UUIDv7, globally unique.
    pub id: Uuid,
    /// Definition type name (e.g. "consensus-review").
    pub workflow_type: String,
    pub status: WorkflowStatus,
    /// Initial input supplied at submission.
    pub input: serde_json::Value,
    /// Accumulated payload: `{"input": ..., "steps": {step_id: result}}`.
    pub payload: serde_json::Value,
    /// Final results view, set only once the instance is `completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Build a fresh `pending` instance.
    pub fn pending(id: Uuid, workflow_type: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id,
            workflow_type: workflow_type.into(),
            status: WorkflowStatus::Pending,
            payload: serde_json::json!({ "input": input.clone(), "steps": {} }),
            input,
            results: None,
            error: None,
            error_kind: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Execution record for one step of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub workflow_id: Uuid,
    pub step_id: String,
    pub status: StepStatus,
    /// Attempts started so far. Never exceeds the step's `max_attempts`.
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest instant the next retry may start (persisted so restarts honor it).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn not_started(workflow_id: Uuid, step_id: impl Into<String>) -> Self {
        Self {
            workflow_id,
            step_id: step_id.into(),
            status: StepStatus::NotStarted,
            attempt_count: 0,
            result: None,
            error: None,
            error_kind: None,
            started_at: None,
            completed_at: None,
            next_attempt_at: None,
        }
    }
}

/// Point-in-time view of an instance, as returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    pub workflow_id: Uuid,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    /// Completed steps as a share of all steps, 0..=100.
    pub progress_percent: u8,
    pub steps: BTreeMap<String, StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowStatusReport {
    /// Build a report from an instance and its step records.
    ///
    /// `total_steps` comes from the definition when known, so steps that have
    /// no record yet still count towards the denominator.
    pub fn from_records(
        instance: &WorkflowInstance,
        records: &[StepRecord],
        total_steps: Option<usize>,
    ) -> Self {
        let steps: BTreeMap<String, StepStatus> = records
            .iter()
            .map(|r| (r.step_id.clone(), r.status))
            .collect();
        let total = total_steps.unwrap_or(steps.len()).max(steps.len());
        let completed = steps
            .values()
            .filter(|s| **s == StepStatus::Completed)
            .count();

        let progress_percent = if instance.status == WorkflowStatus::Completed {
            100
        } else if total == 0 {
            0
        } else {
            ((completed * 100) / total).min(100) as u8
        };

        Self {
            workflow_id: instance.id,
            workflow_type: instance.workflow_type.clone(),
            status: instance.status,
            progress_percent,
            steps,
            error: instance.error.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
