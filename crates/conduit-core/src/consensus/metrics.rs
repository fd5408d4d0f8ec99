//! Aggregate metrics over review targets.

use conduit_types::consensus::{ReviewTarget, TargetMetrics};

/// Targets at or below this many lines count as very small.
pub const SMALL_TARGET_SIZE: u64 = 10;

pub fn target_metrics(targets: &[ReviewTarget]) -> TargetMetrics {
    if targets.is_empty() {
        return TargetMetrics::default();
    }

    let known: Vec<f64> = targets.iter().filter_map(|t| t.complexity).collect();
    let (average_complexity, complexity_variance) = if known.is_empty() {
        (0.0, 0.0)
    } else {
        let n = known.len() as f64;
        let mean = known.iter().sum::<f64>() / n;
        let variance = known.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
        (mean, variance)
    };

    let small_or_unknown = targets
        .iter()
        .filter(|t| t.complexity.is_none() || t.size.is_some_and(|s| s <= SMALL_TARGET_SIZE))
        .count();

    TargetMetrics {
        target_count: targets.len(),
        average_complexity,
        complexity_variance,
        small_or_unknown_ratio: small_or_unknown as f64 / targets.len() as f64,
    }
}
