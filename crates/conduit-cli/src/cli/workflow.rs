//! CLI workflow subcommands.
//!
//! Submit work through the queue, run a workflow in-process, and inspect
//! instances (status, results, list, registered types).

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use chrono::{DateTime, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use conduit_core::repository::WorkflowRepository;
use conduit_core::workflow::{ExecutionResult, ServiceError, WorkflowExecutor, WorkflowService};
use conduit_types::workflow::{StepStatus, WorkflowStatus};
use serde_json::Value;
use uuid::Uuid;

use super::parse_json_arg;
use crate::state::AppState;

/// Workflow subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Submit a workflow for a worker to run.
    Submit {
        /// Registered workflow type.
        workflow_type: String,

        /// JSON input payload.
        #[arg(long)]
        payload: Option<String>,

        /// Queue to submit to (default: the configured submission queue).
        #[arg(long)]
        queue: Option<String>,
    },

    /// Run a workflow in this process and wait for it.
    Run {
        /// Registered workflow type.
        workflow_type: String,

        /// JSON input payload.
        #[arg(long)]
        payload: Option<String>,
    },

    /// Continue an interrupted run in this process.
    Resume {
        /// Workflow instance UUID.
        workflow_id: Uuid,
    },

    /// Show the status and per-step progress of an instance.
    Status {
        /// Workflow instance UUID.
        workflow_id: Uuid,
    },

    /// Print the results of a completed instance.
    Results {
        /// Workflow instance UUID.
        workflow_id: Uuid,
    },

    /// List recent instances.
    List {
        /// Filter by status (pending, running, completed, failed).
        #[arg(long)]
        status: Option<WorkflowStatus>,

        /// Maximum number of instances to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// List registered workflow types.
    Types,
}

/// Handle a workflow subcommand.
pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Submit {
            workflow_type,
            payload,
            queue,
        } => handle_submit(state, &workflow_type, payload.as_deref(), queue, json).await,
        WorkflowCommand::Run {
            workflow_type,
            payload,
        } => handle_run(state, &workflow_type, payload.as_deref(), json).await,
        WorkflowCommand::Resume { workflow_id } => handle_resume(state, workflow_id, json).await,
        WorkflowCommand::Status { workflow_id } => handle_status(state, workflow_id, json).await,
        WorkflowCommand::Results { workflow_id } => handle_results(state, workflow_id, json).await,
        WorkflowCommand::List { status, limit } => handle_list(state, status, limit, json).await,
        WorkflowCommand::Types => handle_types(state, json),
    }
}

// ---------------------------------------------------------------------------
// Submit / run / resume
// ---------------------------------------------------------------------------

async fn handle_submit(
    state: &AppState,
    workflow_type: &str,
    payload: Option<&str>,
    queue: Option<String>,
    json: bool,
) -> Result<()> {
    let payload = parse_json_arg(payload)?.unwrap_or_else(|| serde_json::json!({}));

    let workflow_id = match queue {
        Some(q) => {
            let service = WorkflowService::new(
                Arc::clone(&state.queue),
                Arc::clone(&state.repo),
                state.registry.clone(),
            )
            .with_submission_queue(q);
            service.submit_workflow(workflow_type, payload).await
        }
        None => state.service.submit_workflow(workflow_type, payload).await,
    }
    .map_err(|e| match e {
        ServiceError::UnknownWorkflowType(t) => anyhow::anyhow!(
            "Unknown workflow type '{t}'. Registered: {}",
            state.registry.list().join(", ")
        ),
        other => other.into(),
    })?;

    if json {
        let out = serde_json::json!({
            "workflow_id": workflow_id.to_string(),
            "workflow_type": workflow_type,
            "status": "pending",
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Submitted workflow '{}'",
            style("*").green().bold(),
            style(workflow_type).cyan()
        );
        println!("  Workflow ID: {workflow_id}");
        println!();
        println!(
            "  Check progress: {}",
            style(format!("conduit workflow status {workflow_id}")).dim()
        );
        println!();
    }
    Ok(())
}

async fn handle_run(
    state: &AppState,
    workflow_type: &str,
    payload: Option<&str>,
    json: bool,
) -> Result<()> {
    let definition = state
        .registry
        .get(workflow_type)
        .with_context(|| format!("Unknown workflow type '{workflow_type}'"))?;
    let payload = parse_json_arg(payload)?.unwrap_or_else(|| serde_json::json!({}));

    let result = state.executor.execute(&definition, payload).await?;
    print_execution(&result, json)
}

async fn handle_resume(state: &AppState, workflow_id: Uuid, json: bool) -> Result<()> {
    let Some(instance) = state.repo.get_instance(&workflow_id).await? else {
        bail!("Workflow {workflow_id} not found");
    };
    let definition = state
        .registry
        .get(&instance.workflow_type)
        .with_context(|| format!("Workflow type '{}' is not registered", instance.workflow_type))?;

    let result = state.executor.resume(&definition, workflow_id).await?;
    print_execution(&result, json)
}

fn print_execution(result: &ExecutionResult, json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "workflow_id": result.workflow_id.to_string(),
            "workflow_type": result.workflow_type,
            "status": result.status.as_str(),
            "results": result.results,
            "final_steps": result.final_steps,
            "skipped_steps": result.skipped_steps,
            "error": result.error,
            "error_type": result.error_kind.map(|k| k.as_str()),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  Workflow {} ({}): {}",
        style(result.workflow_id).dim(),
        style(&result.workflow_type).cyan(),
        status_style(result.status)
    );
    if let Some(error) = &result.error {
        println!("  Error: {}", style(error).red());
    }
    if !result.skipped_steps.is_empty() {
        println!("  Skipped: {}", result.skipped_steps.join(", "));
    }
    if let Some(results) = &result.results {
        println!();
        println!("{}", indent(&serde_json::to_string_pretty(results)?));
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Status / results
// ---------------------------------------------------------------------------

async fn handle_status(state: &AppState, workflow_id: Uuid, json: bool) -> Result<()> {
    let report = state.service.get_status(workflow_id).await.map_err(not_found)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!(
        "  Workflow {} ({})",
        style(report.workflow_id).dim(),
        style(&report.workflow_type).cyan()
    );
    println!("  Status:   {}", status_style(report.status));
    println!("  Progress: {}%", report.progress_percent);
    if let Some(error) = &report.error {
        println!("  Error:    {}", style(error).red());
    }

    if !report.steps.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![Cell::new("Step").fg(Color::Cyan), Cell::new("Status")]);
        for (step, status) in &report.steps {
            table.add_row(vec![Cell::new(step), step_cell(*status)]);
        }
        println!();
        println!("{table}");
    }
    println!();
    Ok(())
}

async fn handle_results(state: &AppState, workflow_id: Uuid, json: bool) -> Result<()> {
    let results: Value = match state.service.get_results(workflow_id).await {
        Ok(results) => results,
        Err(ServiceError::NotCompleted { status, .. }) => {
            bail!("Workflow {workflow_id} has no results yet (status: {status})")
        }
        Err(e) => return Err(not_found(e)),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        println!();
        println!("{}", indent(&serde_json::to_string_pretty(&results)?));
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// List / types
// ---------------------------------------------------------------------------

async fn handle_list(
    state: &AppState,
    status: Option<WorkflowStatus>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let instances = state.service.list_workflows(status, limit).await?;

    if json {
        let out: Vec<_> = instances
            .iter()
            .map(|i| {
                serde_json::json!({
                    "workflow_id": i.id.to_string(),
                    "workflow_type": i.workflow_type,
                    "status": i.status.as_str(),
                    "created_at": i.created_at.to_rfc3339(),
                    "completed_at": i.completed_at.map(|t| t.to_rfc3339()),
                    "error": i.error,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if instances.is_empty() {
        println!();
        println!("  No workflow instances.");
        println!(
            "  Submit one with: {}",
            style("conduit workflow submit <type> --payload '{}'").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Workflow ID").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Status"),
            Cell::new("Created"),
            Cell::new("Elapsed"),
            Cell::new("Error"),
        ]);

    for i in &instances {
        table.add_row(vec![
            Cell::new(i.id),
            Cell::new(&i.workflow_type),
            workflow_cell(i.status),
            Cell::new(i.created_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(elapsed(i.started_at, i.completed_at, Utc::now())),
            Cell::new(i.error.as_deref().unwrap_or("-")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn handle_types(state: &AppState, json: bool) -> Result<()> {
    let types = state.registry.list();

    if json {
        let out: Vec<_> = types
            .iter()
            .filter_map(|t| state.registry.get(t))
            .map(|d| {
                serde_json::json!({
                    "workflow_type": d.workflow_type,
                    "version": d.version,
                    "steps": d.step_ids(),
                    "final_steps": d.final_steps(),
                    "concurrency": d.concurrency,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Type").fg(Color::Cyan),
            Cell::new("Version"),
            Cell::new("Steps"),
            Cell::new("Concurrency"),
        ]);
    for d in types.iter().filter_map(|t| state.registry.get(t)) {
        table.add_row(vec![
            Cell::new(&d.workflow_type),
            Cell::new(&d.version),
            Cell::new(d.step_ids().join(" -> ")),
            Cell::new(d.concurrency),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

fn not_found(e: ServiceError) -> anyhow::Error {
    match e {
        ServiceError::NotFound(id) => anyhow::anyhow!("Workflow {id} not found"),
        other => other.into(),
    }
}

fn status_style(status: WorkflowStatus) -> console::StyledObject<&'static str> {
    let s = style(status.as_str());
    match status {
        WorkflowStatus::Completed => s.green(),
        WorkflowStatus::Failed => s.red(),
        WorkflowStatus::Running => s.yellow(),
        WorkflowStatus::Pending => s.dim(),
    }
}

fn workflow_cell(status: WorkflowStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        WorkflowStatus::Completed => cell.fg(Color::Green),
        WorkflowStatus::Failed => cell.fg(Color::Red),
        WorkflowStatus::Running => cell.fg(Color::Yellow),
        WorkflowStatus::Pending => cell,
    }
}

fn step_cell(status: StepStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        StepStatus::Completed => cell.fg(Color::Green),
        StepStatus::Failed => cell.fg(Color::Red),
        StepStatus::Running => cell.fg(Color::Yellow),
        StepStatus::Skipped => cell.fg(Color::DarkGrey),
        StepStatus::NotStarted => cell,
    }
}

/// Run time so far, or total run time once finished. `-` if never started.
fn elapsed(
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> String {
    let Some(start) = started_at else {
        return "-".to_string();
    };
    let ms = (completed_at.unwrap_or(now) - start).num_milliseconds().max(0);
    if ms < 1_000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1_000)
    }
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("  {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
