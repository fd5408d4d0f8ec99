//! Specialist port and the deterministic default implementation.
//!
//! A specialist scores the review subject for one role. Real deployments
//! back this with a model call; `HeuristicSpecialist` derives its score
//! from target metrics only, so reviews are reproducible.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use conduit_types::consensus::{ReviewMode, SpecialistResult, SpecialistRole, TargetMetrics};

use crate::workflow::worker::StepFailure;

/// Everything a specialist sees.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecialistRequest {
    pub role: SpecialistRole,
    pub mode: ReviewMode,
    pub baseline_confidence: f64,
    /// Mean confidence of the specialists executed before this one.
    pub running_confidence: Option<f64>,
    pub metrics: TargetMetrics,
    pub subject: Option<String>,
}

pub trait Specialist: Send + Sync {
    fn review(
        &self,
        request: &SpecialistRequest,
    ) -> impl Future<Output = Result<SpecialistResult, StepFailure>> + Send;
}

/// Object-safe version of [`Specialist`] with boxed futures.
pub trait SpecialistDyn: Send + Sync {
    fn review_boxed<'a>(
        &'a self,
        request: &'a SpecialistRequest,
    ) -> Pin<Box<dyn Future<Output = Result<SpecialistResult, StepFailure>> + Send + 'a>>;
}

impl<T: Specialist> SpecialistDyn for T {
    fn review_boxed<'a>(
        &'a self,
        request: &'a SpecialistRequest,
    ) -> Pin<Box<dyn Future<Output = Result<SpecialistResult, StepFailure>> + Send + 'a>> {
        Box::pin(self.review(request))
    }
}

/// Type-erased specialist, shared by every step that needs it.
#[derive(Clone)]
pub struct BoxSpecialist {
    inner: Arc<dyn SpecialistDyn>,
}

impl BoxSpecialist {
    pub fn new<T: Specialist + 'static>(specialist: T) -> Self {
        Self {
            inner: Arc::new(specialist),
        }
    }

    pub async fn review(&self, request: &SpecialistRequest) -> Result<SpecialistResult, StepFailure> {
        self.inner.review_boxed(request).await
    }
}

impl Default for BoxSpecialist {
    fn default() -> Self {
        Self::new(HeuristicSpecialist)
    }
}

impl std::fmt::Debug for BoxSpecialist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxSpecialist")
    }
}

// ---------------------------------------------------------------------------
// HeuristicSpecialist
// ---------------------------------------------------------------------------

const BASE_TOKENS: u64 = 400;
const TOKENS_PER_TARGET: u64 = 50;
const COST_PER_TOKEN: f64 = 0.000_002;

/// Complexity above this starts lowering confidence.
const COMPLEXITY_COMFORT: f64 = 10.0;

/// Deterministic specialist scoring from target metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicSpecialist;

impl HeuristicSpecialist {
    fn role_bias(role: SpecialistRole) -> f64 {
        match role {
            SpecialistRole::Analyst => 0.0,
            SpecialistRole::Validator => 0.05,
            SpecialistRole::Critic => -0.05,
            SpecialistRole::Researcher => 0.02,
        }
    }

    /// Signed change applied to the baseline confidence.
    pub fn adjustment(role: SpecialistRole, metrics: &TargetMetrics) -> f64 {
        let complexity_penalty =
            ((metrics.average_complexity - COMPLEXITY_COMFORT).max(0.0) * 0.01).min(0.15);
        let spread_penalty = (metrics.complexity_variance.sqrt() * 0.005).min(0.05);
        let unknown_penalty = metrics.small_or_unknown_ratio * 0.10;
        Self::role_bias(role) - complexity_penalty - spread_penalty - unknown_penalty
    }

    fn insights(role: SpecialistRole, metrics: &TargetMetrics, subject: Option<&str>) -> Vec<String> {
        let mut insights = Vec::new();
        match role {
            SpecialistRole::Analyst => {
                insights.push(format!(
                    "Reviewed {} targets with average complexity {:.2}.",
                    metrics.target_count, metrics.average_complexity
                ));
                if metrics.average_complexity > COMPLEXITY_COMFORT {
                    insights.push(
                        "Recommend splitting the most complex targets before merging.".to_string(),
                    );
                }
            }
            SpecialistRole::Validator => {
                if metrics.small_or_unknown_ratio > 0.3 {
                    insights.push(format!(
                        "{:.0}% of targets are tiny or unmeasured. Recommend collecting complexity data for them.",
                        metrics.small_or_unknown_ratio * 100.0
                    ));
                } else {
                    insights.push("Target measurements look complete.".to_string());
                }
            }
            SpecialistRole::Critic => {
                if metrics.complexity_variance > 25.0 {
                    insights.push(
                        "Complexity varies widely. Recommend reviewing the outliers individually."
                            .to_string(),
                    );
                } else {
                    insights.push("Complexity is evenly spread.".to_string());
                }
            }
            SpecialistRole::Researcher => {
                let subject = subject.unwrap_or("this change");
                insights.push(format!(
                    "Recommend comparing {subject} against earlier reviews of similar code."
                ));
            }
        }
        insights
    }
}

impl Specialist for HeuristicSpecialist {
    async fn review(&self, request: &SpecialistRequest) -> Result<SpecialistResult, StepFailure> {
        let metrics = &request.metrics;
        let adjustment = Self::adjustment(request.role, metrics);
        let confidence = (request.baseline_confidence + adjustment).clamp(0.0, 1.0);
        let tokens_used = BASE_TOKENS + TOKENS_PER_TARGET * metrics.target_count as u64;

        Ok(SpecialistResult {
            role: request.role,
            confidence,
            cost: tokens_used as f64 * COST_PER_TOKEN,
            tokens_used,
            notes: format!(
                "{} adjusted baseline {:.2} by {:+.3}",
                request.role, request.baseline_confidence, adjustment
            ),
            insights: Self::insights(request.role, metrics, request.subject.as_deref()),
            skipped: false,
            reason: None,
        })
    }
}
