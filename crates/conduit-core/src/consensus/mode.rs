//! Review mode inference and the per-specialist run/skip rules.

use conduit_types::consensus::{ReviewMode, SkipReason, SpecialistRole};

/// `initial_confidence` at or above this selects `fast` when no mode is given.
pub const FAST_MODE_CONFIDENCE: f64 = 0.85;

/// Running confidence at or above this skips non-researcher specialists.
pub const HIGH_CONFIDENCE_SKIP: f64 = 0.95;

/// Pick the mode: explicit wins, otherwise inferred from the inputs.
pub fn infer_mode(explicit: Option<ReviewMode>, initial_confidence: f64, sample_count: u32) -> ReviewMode {
    if let Some(mode) = explicit {
        return mode;
    }
    if initial_confidence >= FAST_MODE_CONFIDENCE {
        ReviewMode::Fast
    } else if sample_count > 5 {
        ReviewMode::Thorough
    } else if sample_count > 0 {
        ReviewMode::Default
    } else {
        ReviewMode::Fast
    }
}

/// Specialists a mode runs unconditionally, in roster order.
pub fn enabled_roles(mode: ReviewMode) -> &'static [SpecialistRole] {
    match mode {
        ReviewMode::Fast => &[SpecialistRole::Analyst],
        ReviewMode::Default => &[
            SpecialistRole::Analyst,
            SpecialistRole::Validator,
            SpecialistRole::Critic,
        ],
        ReviewMode::Thorough => &SpecialistRole::ROSTER,
    }
}

/// Running confidence below this forces the role to run. `None` for the
/// analyst, which always runs.
pub fn escalation_threshold(role: SpecialistRole) -> Option<f64> {
    match role {
        SpecialistRole::Analyst => None,
        SpecialistRole::Validator => Some(0.65),
        SpecialistRole::Critic => Some(0.60),
        SpecialistRole::Researcher => Some(0.55),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Run,
    Skip(SkipReason),
}

/// Apply the rules in order: mode-enabled, low-confidence escalation,
/// high-confidence skip (never for the researcher), mode skip.
///
/// `running_confidence` is the mean confidence of the specialists executed
/// so far; `None` before any has run.
pub fn decide(role: SpecialistRole, mode: ReviewMode, running_confidence: Option<f64>) -> Decision {
    if role == SpecialistRole::Analyst || enabled_roles(mode).contains(&role) {
        return Decision::Run;
    }

    let Some(confidence) = running_confidence else {
        return Decision::Run;
    };

    if escalation_threshold(role).is_some_and(|threshold| confidence < threshold) {
        return Decision::Run;
    }

    if confidence >= HIGH_CONFIDENCE_SKIP && role != SpecialistRole::Researcher {
        return Decision::Skip(SkipReason::HighConfidence);
    }

    Decision::Skip(SkipReason::ModeSkip)
}
