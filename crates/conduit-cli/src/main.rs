//! Conduit worker and operator CLI entry point.
//!
//! Binary name: `conduit`
//!
//! Parses CLI arguments, opens the database and wires services, then
//! dispatches to the command handler or starts the queue worker.

mod catalog;
mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use console::style;
use conduit_observe::tracing_setup::{
    LogFormat, TracingOptions, filter_for_verbosity, init_tracing, shutdown_tracing,
};
use conduit_types::envelope::MessageEnvelope;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need tracing or app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "conduit", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing(&TracingOptions {
        default_filter: filter_for_verbosity(cli.verbose, cli.quiet).to_string(),
        format: if cli.log_json {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
        enable_otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init(cli.data_dir.clone(), cli.database_url.as_deref()).await?;

    let outcome = match cli.command {
        Commands::Worker(args) => cli::worker::run_worker(&state, args, cli.json).await,

        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, cli.json).await
        }

        Commands::Queue { action } => {
            cli::queue::handle_queue_command(action, &state, cli.json).await
        }

        Commands::Review(args) => cli::review::handle_review(&state, args, cli.json).await,

        Commands::Ping { queue, echo } => ping(&state, &queue, echo.as_deref(), cli.json).await,

        Commands::Status => cli::status::status(&state, cli.json).await,

        Commands::Completions { .. } => Ok(()),
    };

    state.db_pool.close().await;
    outcome
}

async fn ping(state: &AppState, queue: &str, echo: Option<&str>, json: bool) -> anyhow::Result<()> {
    let echo = cli::parse_json_arg(echo)?;
    let message_id = state
        .service
        .submit_message(queue, &MessageEnvelope::Ping { echo })
        .await?;
    if json {
        let out = serde_json::json!({"queue": queue, "message_id": message_id});
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!(
            "  {} Ping queued on '{}' as message {}",
            style("*").green().bold(),
            style(queue).cyan(),
            style(message_id).bold()
        );
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
///
/// If a handler cannot be installed, the error is logged and that signal
/// source never fires.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
