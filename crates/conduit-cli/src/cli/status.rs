//! System status dashboard command.

use anyhow::Result;
use console::style;
use conduit_core::repository::QueueRepository;
use conduit_types::queue::{DEAD_LETTER_SUFFIX, QueueStats};
use conduit_types::workflow::WorkflowStatus;

use crate::state::AppState;

/// Instances counted per status before the dashboard shows `N+`.
const COUNT_CAP: u32 = 10_000;

const STATUSES: [WorkflowStatus; 4] = [
    WorkflowStatus::Pending,
    WorkflowStatus::Running,
    WorkflowStatus::Completed,
    WorkflowStatus::Failed,
];

/// Display the status dashboard.
///
/// Shows backlogs of every existing queue, workflow counts by status and
/// the registered workflow types.
pub async fn status(state: &AppState, json: bool) -> Result<()> {
    let mut queues = Vec::new();
    for name in state.queue.list_queues().await? {
        let stats = state.queue.stats(&name).await?;
        queues.push((name, stats));
    }

    let mut counts = Vec::with_capacity(STATUSES.len());
    for s in STATUSES {
        let n = state.service.list_workflows(Some(s), COUNT_CAP).await?.len();
        counts.push((s, n));
    }

    let types = state.registry.list();

    if json {
        let status = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "data_dir": state.data_dir.display().to_string(),
            "database_url": state.database_url,
            "queues": queues.iter().map(|(name, s)| serde_json::json!({
                "queue": name,
                "total": s.total,
                "in_flight": s.in_flight,
                "available": s.available,
            })).collect::<Vec<_>>(),
            "workflows": counts
                .iter()
                .map(|(s, n)| (s.as_str().to_string(), serde_json::json!(n)))
                .collect::<serde_json::Map<_, _>>(),
            "workflow_types": types,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Conduit v{}",
        style("*").bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!();

    println!("  {}", style("── Queues ──").dim());
    if queues.is_empty() {
        println!("  {}", style("none").dim());
    }
    for (name, s) in &queues {
        println!("  {}", queue_line(name, s));
    }
    println!();

    println!("  {}", style("── Workflows ──").dim());
    for (s, n) in &counts {
        let shown = format_count(*n);
        let value = match s {
            WorkflowStatus::Completed => style(shown).green(),
            WorkflowStatus::Failed if *n > 0 => style(shown).red(),
            WorkflowStatus::Running if *n > 0 => style(shown).yellow(),
            _ => style(shown),
        };
        println!("  {:<10} {}", format!("{}:", s.as_str()), value);
    }
    println!("  Types:     {}", style(types.join(", ")).cyan());
    println!();

    println!("  {}", style("── System ──").dim());
    println!("  Data dir: {}", style(state.data_dir.display()).dim());
    println!("  Database: {}", style(&state.database_url).dim());
    println!();

    Ok(())
}

fn queue_line(name: &str, stats: &QueueStats) -> String {
    let dlq = name.ends_with(DEAD_LETTER_SUFFIX);
    let label = if dlq && stats.total > 0 {
        style(name).red().to_string()
    } else {
        name.to_string()
    };
    format!(
        "{label:<24} total {:<6} in flight {:<6} available {}",
        stats.total, stats.in_flight, stats.available
    )
}

fn format_count(n: usize) -> String {
    if n >= COUNT_CAP as usize {
        format!("{n}+")
    } else {
        n.to_string()
    }
}
