//! The consensus review as a three-step workflow definition:
//! `prepare_context -> specialist_review -> consensus_builder`.
//!
//! The adaptive fan-out lives inside `specialist_review`; the graph itself
//! is static.

use conduit_types::consensus::{ConsensusInput, ConsensusReport, ReviewMode, SpecialistResult, TargetMetrics};
use conduit_types::workflow::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::builder::build_report;
use super::metrics::target_metrics;
use super::mode::{enabled_roles, infer_mode};
use super::review::{ReviewPlan, run_review};
use super::specialist::BoxSpecialist;
use crate::workflow::context::StepContext;
use crate::workflow::definition::{StepDescriptor, WorkflowDefinition, WorkflowError};
use crate::workflow::worker::{BoxStepWorker, StepFailure};

pub const CONSENSUS_WORKFLOW_TYPE: &str = "consensus_review";

pub const PREPARE_CONTEXT: &str = "prepare_context";
pub const SPECIALIST_REVIEW: &str = "specialist_review";
pub const CONSENSUS_BUILDER: &str = "consensus_builder";

/// Output of `prepare_context`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedContext {
    pub mode: ReviewMode,
    pub baseline_confidence: f64,
    pub enabled: Vec<String>,
    pub metrics: TargetMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl PreparedContext {
    pub fn from_input(input: &ConsensusInput) -> Self {
        let mode = infer_mode(input.mode, input.initial_confidence, input.sample_count);
        Self {
            mode,
            baseline_confidence: input.initial_confidence.clamp(0.0, 1.0),
            enabled: enabled_roles(mode).iter().map(|r| r.as_str().to_string()).collect(),
            metrics: target_metrics(&input.targets),
            subject: input.subject.clone(),
        }
    }

    fn plan(&self) -> ReviewPlan {
        ReviewPlan {
            mode: self.mode,
            baseline_confidence: self.baseline_confidence,
            metrics: self.metrics,
            subject: self.subject.clone(),
        }
    }
}

/// Build the consensus definition around `specialist`.
///
/// Neither input preparation nor the review is retried: bad input stays
/// bad, and a repeated review is charged twice.
pub fn consensus_definition(specialist: BoxSpecialist) -> Result<WorkflowDefinition, WorkflowError> {
    let prepare = BoxStepWorker::from_fn(|ctx: StepContext| async move {
        let input: ConsensusInput = serde_json::from_value(ctx.input().clone())
            .map_err(|e| StepFailure::new(format!("invalid consensus input: {e}")))?;
        let prepared = PreparedContext::from_input(&input);
        tracing::debug!(
            workflow_id = %ctx.workflow_id(),
            mode = prepared.mode.as_str(),
            targets = prepared.metrics.target_count,
            "consensus context prepared"
        );
        to_json(&prepared)
    });

    let review = BoxStepWorker::from_fn(move |ctx: StepContext| {
        let specialist = specialist.clone();
        async move {
            let prepared: PreparedContext = from_step(&ctx, PREPARE_CONTEXT)?;
            let results = run_review(&specialist, &prepared.plan()).await?;
            to_json(&results)
        }
    });

    let build = BoxStepWorker::from_fn(|ctx: StepContext| async move {
        let prepared: PreparedContext = from_step(&ctx, PREPARE_CONTEXT)?;
        let results: Vec<SpecialistResult> = from_step(&ctx, SPECIALIST_REVIEW)?;
        let report = build_report(prepared.mode, prepared.baseline_confidence, results);
        to_json(&report)
    });

    WorkflowDefinition::builder(CONSENSUS_WORKFLOW_TYPE, "1")
        .step(StepDescriptor::from_box(PREPARE_CONTEXT, prepare).retry(RetryPolicy::no_retry()))
        .step(
            StepDescriptor::from_box(SPECIALIST_REVIEW, review)
                .depends_on([PREPARE_CONTEXT])
                .retry(RetryPolicy::no_retry()),
        )
        .step(StepDescriptor::from_box(CONSENSUS_BUILDER, build).depends_on([SPECIALIST_REVIEW]))
        .build()
}

/// Pull the report out of a completed run's results.
pub fn report_from_results(results: &Value) -> Result<ConsensusReport, serde_json::Error> {
    serde_json::from_value(results.get(CONSENSUS_BUILDER).cloned().unwrap_or(Value::Null))
}

fn from_step<T: serde::de::DeserializeOwned>(ctx: &StepContext, step: &str) -> Result<T, StepFailure> {
    let value = ctx
        .step_result(step)
        .ok_or_else(|| StepFailure::new(format!("missing result of step '{step}'")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| StepFailure::new(format!("unreadable result of step '{step}': {e}")))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, StepFailure> {
    serde_json::to_value(value).map_err(|e| StepFailure::new(e.to_string()))
}
