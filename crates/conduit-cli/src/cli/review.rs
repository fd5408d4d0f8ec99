//! `conduit review`: submit or run an adaptive consensus review.

use anyhow::{Context, Result, bail};
use clap::Args;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use conduit_core::consensus::{CONSENSUS_WORKFLOW_TYPE, report_from_results};
use conduit_core::workflow::WorkflowExecutor;
use conduit_core::workflow::service::DEFAULT_SUBMISSION_QUEUE;
use conduit_types::consensus::{ConsensusInput, ConsensusReport, ReviewMode, ReviewTarget};
use conduit_types::envelope::MessageEnvelope;
use conduit_types::workflow::WorkflowStatus;

use crate::state::AppState;

#[derive(Args, Debug, Clone)]
pub struct ReviewArgs {
    /// Confidence before any specialist runs (0.0 - 1.0).
    #[arg(long, default_value = "0.5")]
    pub confidence: f64,

    /// Number of samples the confidence is based on.
    #[arg(long, default_value = "0")]
    pub samples: u32,

    /// Force a mode instead of inferring it (fast, default, thorough).
    #[arg(long)]
    pub mode: Option<ReviewMode>,

    /// Target as name[:complexity[:size]] (repeatable).
    #[arg(long = "target", short = 't', value_parser = parse_target)]
    pub targets: Vec<ReviewTarget>,

    /// Free-form subject passed to every specialist.
    #[arg(long)]
    pub subject: Option<String>,

    /// Queue to submit to.
    #[arg(long, default_value = DEFAULT_SUBMISSION_QUEUE)]
    pub queue: String,

    /// Run in this process and print the report instead of enqueueing.
    #[arg(long)]
    pub local: bool,
}

impl ReviewArgs {
    fn input(&self) -> ConsensusInput {
        ConsensusInput {
            mode: self.mode,
            initial_confidence: self.confidence,
            sample_count: self.samples,
            targets: self.targets.clone(),
            subject: self.subject.clone(),
        }
    }
}

fn parse_target(raw: &str) -> Result<ReviewTarget, String> {
    let mut parts = raw.splitn(3, ':');
    let name = parts.next().unwrap_or_default().trim();
    if name.is_empty() {
        return Err("target name cannot be empty".into());
    }
    let complexity = parts
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f64>().map_err(|e| format!("bad complexity '{s}': {e}")))
        .transpose()?;
    let size = parts
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u64>().map_err(|e| format!("bad size '{s}': {e}")))
        .transpose()?;
    Ok(ReviewTarget {
        name: name.to_string(),
        complexity,
        size,
    })
}

pub async fn handle_review(state: &AppState, args: ReviewArgs, json: bool) -> Result<()> {
    if !(0.0..=1.0).contains(&args.confidence) {
        bail!("--confidence must be between 0.0 and 1.0");
    }
    let input = args.input();

    if !args.local {
        let message_id = state
            .service
            .submit_message(&args.queue, &MessageEnvelope::ConsensusReview(input))
            .await?;
        if json {
            let out = serde_json::json!({"queue": args.queue, "message_id": message_id});
            println!("{}", serde_json::to_string_pretty(&out)?);
        } else {
            println!(
                "  {} Review queued on '{}' as message {}",
                style("*").green().bold(),
                style(&args.queue).cyan(),
                style(message_id).bold()
            );
        }
        return Ok(());
    }

    let Some(definition) = state.registry.get(CONSENSUS_WORKFLOW_TYPE) else {
        bail!("consensus workflow is not registered");
    };
    let result = state
        .executor
        .execute(&definition, serde_json::to_value(&input)?)
        .await?;
    if result.status != WorkflowStatus::Completed {
        bail!(
            "review {} {}: {}",
            result.workflow_id,
            result.status,
            result.error.as_deref().unwrap_or("no error recorded")
        );
    }
    let results = result.results.unwrap_or_default();
    let report = report_from_results(&results).context("review produced no report")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &ConsensusReport) {
    println!();
    println!(
        "  Mode {}  baseline {:.2}  consensus {}",
        style(report.mode).cyan(),
        report.baseline_confidence,
        style(format!("{:.2}", report.consensus_confidence)).bold()
    );
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Specialist").fg(Color::Cyan),
            Cell::new("Confidence"),
            Cell::new("Cost"),
            Cell::new("Tokens"),
            Cell::new("Notes"),
        ]);
    for s in &report.specialists {
        table.add_row(vec![
            Cell::new(s.role.as_str()),
            Cell::new(format!("{:.2}", s.confidence)),
            Cell::new(format!("{:.4}", s.cost)),
            Cell::new(s.tokens_used),
            Cell::new(&s.notes),
        ]);
    }
    for s in &report.skipped {
        table.add_row(vec![
            Cell::new(s.role.as_str()).fg(Color::DarkGrey),
            Cell::new("-").fg(Color::DarkGrey),
            Cell::new("-").fg(Color::DarkGrey),
            Cell::new("-").fg(Color::DarkGrey),
            Cell::new(format!(
                "skipped ({})",
                s.reason.map(|r| r.as_str()).unwrap_or("unknown")
            ))
            .fg(Color::DarkGrey),
        ]);
    }
    println!("{table}");

    if !report.recommendations.is_empty() {
        println!();
        println!("  {}", style("Recommendations").bold());
        for r in &report.recommendations {
            println!("    - {r}");
        }
    }
    println!();
    println!(
        "  Total cost {:.4}, {} tokens",
        report.total_cost, report.total_tokens
    );
    if !report.decision_trace.is_empty() {
        println!();
        for line in &report.decision_trace {
            println!("  {}", style(line).dim());
        }
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;

    #[test]
    fn target_parsing() {
        let t = parse_target("auth.rs:0.8:120").unwrap();
        assert_eq!(t.name, "auth.rs");
        assert_eq!(t.complexity, Some(0.8));
        assert_eq!(t.size, Some(120));

        let bare = parse_target("lib.rs").unwrap();
        assert_eq!(bare.complexity, None);
        assert_eq!(bare.size, None);

        let no_complexity = parse_target("main.rs::40").unwrap();
        assert_eq!(no_complexity.complexity, None);
        assert_eq!(no_complexity.size, Some(40));

        assert!(parse_target("").is_err());
        assert!(parse_target("x:high").is_err());
    }

    #[test]
    fn review_args_build_input() {
        let cli = Cli::try_parse_from([
            "conduit",
            "review",
            "--confidence",
            "0.9",
            "--samples",
            "12",
            "--mode",
            "thorough",
            "-t",
            "a.rs:0.2",
            "-t",
            "b.rs",
        ])
        .unwrap();
        let Commands::Review(args) = cli.command else {
            panic!("expected review");
        };
        let input = args.input();
        assert_eq!(input.mode, Some(ReviewMode::Thorough));
        assert_eq!(input.initial_confidence, 0.9);
        assert_eq!(input.sample_count, 12);
        assert_eq!(input.targets.len(), 2);
        assert_eq!(args.queue, DEFAULT_SUBMISSION_QUEUE);
        assert!(!args.local);
    }
}
