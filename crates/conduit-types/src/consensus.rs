//! Adaptive consensus review types.
//!
//! The review runs a fixed ordered roster of specialists; which of them
//! actually execute is decided at run time from the mode and the running
//! confidence. The rules live in `conduit-core::consensus`.

use serde::{Deserialize, Serialize};

/// Review depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewMode {
    Fast,
    Default,
    Thorough,
}

impl ReviewMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewMode::Fast => "fast",
            ReviewMode::Default => "default",
            ReviewMode::Thorough => "thorough",
        }
    }
}

impl std::fmt::Display for ReviewMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReviewMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" => Ok(ReviewMode::Fast),
            "default" => Ok(ReviewMode::Default),
            "thorough" => Ok(ReviewMode::Thorough),
            other => Err(format!("unknown review mode: '{other}'")),
        }
    }
}

/// Specialist roles, in roster order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialistRole {
    Analyst,
    Validator,
    Critic,
    Researcher,
}

impl SpecialistRole {
    /// Every role in the order the review considers them.
    pub const ROSTER: [SpecialistRole; 4] = [
        SpecialistRole::Analyst,
        SpecialistRole::Validator,
        SpecialistRole::Critic,
        SpecialistRole::Researcher,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SpecialistRole::Analyst => "analyst",
            SpecialistRole::Validator => "validator",
            SpecialistRole::Critic => "critic",
            SpecialistRole::Researcher => "researcher",
        }
    }
}

impl std::fmt::Display for SpecialistRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a specialist did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    HighConfidence,
    ModeSkip,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::HighConfidence => "high_confidence",
            SkipReason::ModeSkip => "mode_skip",
        }
    }
}

/// One unit of work under review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewTarget {
    pub name: String,
    /// Unknown when absent.
    #[serde(default)]
    pub complexity: Option<f64>,
    /// Size in lines; absent means unknown.
    #[serde(default)]
    pub size: Option<u64>,
}

/// Body of a `consensus_review` message and input of the consensus workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusInput {
    /// Inferred from `initial_confidence` and `sample_count` when absent.
    #[serde(default)]
    pub mode: Option<ReviewMode>,
    #[serde(default = "default_initial_confidence")]
    pub initial_confidence: f64,
    #[serde(default)]
    pub sample_count: u32,
    #[serde(default)]
    pub targets: Vec<ReviewTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

fn default_initial_confidence() -> f64 {
    0.5
}

impl Default for ConsensusInput {
    fn default() -> Self {
        Self {
            mode: None,
            initial_confidence: default_initial_confidence(),
            sample_count: 0,
            targets: Vec::new(),
            subject: None,
        }
    }
}

/// Aggregate metrics over the review targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetMetrics {
    pub target_count: usize,
    /// Mean over targets with a known complexity; 0 when none are known.
    pub average_complexity: f64,
    /// Population variance of the known complexities.
    pub complexity_variance: f64,
    /// Share of targets that are very small or of unknown complexity.
    pub small_or_unknown_ratio: f64,
}

/// Outcome of one specialist, executed or skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialistResult {
    pub role: SpecialistRole,
    pub confidence: f64,
    pub cost: f64,
    pub tokens_used: u64,
    pub notes: String,
    pub insights: Vec<String>,
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
}

impl SpecialistResult {
    /// Record a skipped specialist. Carries the running confidence and no cost.
    pub fn skipped(role: SpecialistRole, reason: SkipReason, running_confidence: f64) -> Self {
        Self {
            role,
            confidence: running_confidence,
            cost: 0.0,
            tokens_used: 0,
            notes: format!("skipped: {}", reason.as_str()),
            insights: Vec::new(),
            skipped: true,
            reason: Some(reason),
        }
    }
}

/// Final aggregate of a consensus review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusReport {
    pub mode: ReviewMode,
    pub baseline_confidence: f64,
    pub consensus_confidence: f64,
    /// Executed specialists only.
    pub specialists: Vec<SpecialistResult>,
    pub skipped: Vec<SpecialistResult>,
    pub decision_trace: Vec<String>,
    pub recommendations: Vec<String>,
    pub total_cost: f64,
    pub total_tokens: u64,
}
