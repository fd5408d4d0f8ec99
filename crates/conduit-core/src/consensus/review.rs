//! Sequential specialist review.
//!
//! Specialists are consulted one at a time in roster order because each
//! run/skip decision depends on the confidence of those before it.

use conduit_types::consensus::{ReviewMode, SpecialistResult, SpecialistRole, TargetMetrics};

use super::mode::{Decision, decide};
use super::specialist::{BoxSpecialist, SpecialistRequest};
use crate::workflow::worker::StepFailure;

/// Inputs of one review, as prepared by the `prepare_context` step.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewPlan {
    pub mode: ReviewMode,
    pub baseline_confidence: f64,
    pub metrics: TargetMetrics,
    pub subject: Option<String>,
}

/// Consult the roster. Returns one result per role, in roster order,
/// skipped roles included.
pub async fn run_review(
    specialist: &BoxSpecialist,
    plan: &ReviewPlan,
) -> Result<Vec<SpecialistResult>, StepFailure> {
    let mut results = Vec::with_capacity(SpecialistRole::ROSTER.len());
    let mut executed: Vec<f64> = Vec::new();

    for role in SpecialistRole::ROSTER {
        let running = mean(&executed);

        match decide(role, plan.mode, running) {
            Decision::Run => {
                let request = SpecialistRequest {
                    role,
                    mode: plan.mode,
                    baseline_confidence: plan.baseline_confidence,
                    running_confidence: running,
                    metrics: plan.metrics,
                    subject: plan.subject.clone(),
                };
                let mut result = specialist.review(&request).await?;
                result.role = role;
                result.confidence = result.confidence.clamp(0.0, 1.0);

                tracing::debug!(
                    role = role.as_str(),
                    confidence = result.confidence,
                    running_confidence = ?running,
                    "specialist executed"
                );
                executed.push(result.confidence);
                results.push(result);
            }
            Decision::Skip(reason) => {
                let confidence = running.unwrap_or(plan.baseline_confidence);
                tracing::debug!(
                    role = role.as_str(),
                    reason = reason.as_str(),
                    confidence,
                    "specialist skipped"
                );
                results.push(SpecialistResult::skipped(role, reason, confidence));
            }
        }
    }

    Ok(results)
}

pub(crate) fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
