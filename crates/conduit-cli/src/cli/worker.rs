//! `conduit worker`: the long-running consumer process.
//!
//! Resumes runs a previous worker left `running`, then polls the configured
//! queues until Ctrl+C or SIGTERM. The poll cycle in progress is finished
//! before exit.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use console::style;
use conduit_core::router::MultiQueueConsumer;
use conduit_core::workflow::{ExecutorError, WorkflowExecutor};
use conduit_types::config::{ConsumerConfig, ConsumerMode};
use conduit_types::workflow::WorkflowStatus;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

/// Upper bound on interrupted runs picked up at startup.
const RESUME_SCAN_LIMIT: u32 = 500;

#[derive(Args, Debug, Clone, Default)]
pub struct WorkerArgs {
    /// Queue to consume (repeatable). Defaults to the configured queues.
    #[arg(long = "queue", short = 'q')]
    pub queues: Vec<String>,

    /// Poll interval in milliseconds.
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Messages claimed per queue per cycle.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Process up to N messages concurrently (bounded-parallel mode).
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Per-message timeout in bounded-parallel mode.
    #[arg(long, default_value = "300000", requires = "parallel")]
    pub timeout_ms: u64,

    /// Run a single poll cycle and exit.
    #[arg(long)]
    pub once: bool,

    /// Do not resume interrupted runs at startup.
    #[arg(long)]
    pub no_resume: bool,
}

/// Apply command-line overrides to the configured consumer settings.
pub fn consumer_config(base: &ConsumerConfig, args: &WorkerArgs) -> ConsumerConfig {
    let mut config = base.clone();
    if !args.queues.is_empty() {
        config.queues = args.queues.clone();
    }
    if let Some(ms) = args.poll_interval_ms {
        config.poll_interval_ms = ms;
    }
    if let Some(n) = args.batch_size {
        config.batch_size = n.max(1);
    }
    if let Some(n) = args.parallel {
        config.mode = ConsumerMode::BoundedParallel {
            max_parallel_workers: n.max(1),
            timeout_ms: args.timeout_ms,
        };
    }
    config
}

pub async fn run_worker(state: &AppState, args: WorkerArgs, json: bool) -> Result<()> {
    let config = consumer_config(&state.config.consumer, &args);
    let consumer = Arc::new(MultiQueueConsumer::new(
        Arc::clone(&state.queue),
        state.handlers(),
        config.clone(),
    ));
    consumer.ensure_queues().await?;

    let shutdown = CancellationToken::new();
    let mut resumed = JoinSet::new();
    if !args.no_resume {
        resume_interrupted(state, &mut resumed, shutdown.clone()).await?;
    }

    if args.once {
        let handled = consumer.poll_once().await?;
        resumed.shutdown().await;
        if json {
            let out = serde_json::json!({
                "handled": handled,
                "metrics": consumer.metrics(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        } else {
            println!("  Handled {handled} message(s).");
        }
        return Ok(());
    }

    if !json {
        println!();
        println!(
            "  {} Conduit worker consuming {}",
            style("*").green().bold(),
            style(config.queues.join(", ")).cyan()
        );
        println!(
            "  Workflows: {}",
            style(state.registry.list().join(", ")).dim()
        );
        println!("  {}", style("Press Ctrl+C to stop").dim());
        println!();
    }

    let worker = tokio::spawn(Arc::clone(&consumer).run(shutdown.clone()));

    crate::shutdown_signal().await;
    tracing::info!("shutdown requested");
    shutdown.cancel();

    worker.await??;
    while let Some(joined) = resumed.join_next().await {
        if let Err(e) = joined {
            tracing::warn!(error = %e, "resumed run task ended abnormally");
        }
    }

    let metrics = consumer.metrics();
    if json {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
    } else {
        println!();
        println!(
            "  Worker stopped. processed={} succeeded={} failed={} dead_lettered={} deferred={}",
            metrics.processed,
            metrics.succeeded,
            metrics.failed,
            metrics.dead_lettered,
            metrics.deferred
        );
    }
    Ok(())
}

/// Spawn a resume task for every `running` instance of a registered type.
///
/// Runs finish in the background; shutdown stops waiting on them, and the
/// next worker picks them up again.
async fn resume_interrupted(
    state: &AppState,
    tasks: &mut JoinSet<()>,
    shutdown: CancellationToken,
) -> Result<()> {
    let running = state
        .service
        .list_workflows(Some(WorkflowStatus::Running), RESUME_SCAN_LIMIT)
        .await?;

    for instance in running {
        let Some(definition) = state.registry.get(&instance.workflow_type) else {
            tracing::warn!(
                workflow_id = %instance.id,
                workflow_type = instance.workflow_type.as_str(),
                "cannot resume run of unregistered workflow type"
            );
            continue;
        };

        let executor = Arc::clone(&state.executor);
        let token = shutdown.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = executor.resume(&definition, instance.id) => match result {
                    Ok(r) => tracing::info!(
                        workflow_id = %r.workflow_id,
                        status = %r.status,
                        "resumed run finished"
                    ),
                    Err(ExecutorError::AlreadyRunning(id)) => tracing::info!(
                        workflow_id = %id,
                        "run is held by a live worker, not resuming"
                    ),
                    Err(e) => tracing::error!(
                        workflow_id = %instance.id,
                        error = %e,
                        "resume failed"
                    ),
                },
            }
        });
    }

    if !tasks.is_empty() {
        tracing::info!(count = tasks.len(), "resuming interrupted runs");
    }
    Ok(())
}
