//! Aggregation of specialist results into a consensus report.

use conduit_types::consensus::{ConsensusReport, ReviewMode, SpecialistResult};

use super::review::mean;

/// Build the final report from per-role results in roster order.
pub fn build_report(
    mode: ReviewMode,
    baseline_confidence: f64,
    results: Vec<SpecialistResult>,
) -> ConsensusReport {
    let decision_trace = results.iter().map(trace_line).collect();

    let (specialists, skipped): (Vec<_>, Vec<_>) = results.into_iter().partition(|r| !r.skipped);

    let confidences: Vec<f64> = specialists.iter().map(|r| r.confidence).collect();
    let consensus_confidence = mean(&confidences).unwrap_or(baseline_confidence);

    let recommendations = extract_recommendations(
        specialists
            .iter()
            .flat_map(|r| r.insights.iter().map(String::as_str)),
    );

    ConsensusReport {
        mode,
        baseline_confidence,
        consensus_confidence,
        total_cost: specialists.iter().map(|r| r.cost).sum(),
        total_tokens: specialists.iter().map(|r| r.tokens_used).sum(),
        specialists,
        skipped,
        decision_trace,
        recommendations,
    }
}

fn trace_line(result: &SpecialistResult) -> String {
    match result.reason {
        Some(reason) if result.skipped => {
            format!("{}: skipped ({})", result.role, reason.as_str())
        }
        _ => format!("{}: executed, confidence {:.3}", result.role, result.confidence),
    }
}

/// Sentences mentioning "recommend" (any case), trimmed and de-duplicated,
/// in first-seen order.
pub fn extract_recommendations<'a>(insights: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for text in insights {
        for sentence in text.split_inclusive(['.', '!', '?']) {
            let sentence = sentence.trim();
            if sentence.is_empty() || !sentence.to_lowercase().contains("recommend") {
                continue;
            }
            if !out.iter().any(|s| s == sentence) {
                out.push(sentence.to_string());
            }
        }
    }
    out
}
