//! CLI command definitions for the `conduit` binary.
//!
//! Uses clap derive macros for argument parsing. Commands group by the
//! resource they act on (`conduit queue stats`, `conduit workflow submit`).

pub mod queue;
pub mod review;
pub mod status;
pub mod worker;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Durable queue-driven workflow orchestration.
#[derive(Parser)]
#[command(name = "conduit", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "CONDUIT_OTEL")]
    pub otel: bool,

    /// Data directory holding config.toml and the default database.
    #[arg(long, global = true, env = "CONDUIT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// SQLite URL, overriding config.toml.
    #[arg(long, global = true, env = "CONDUIT_DATABASE_URL")]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Consume queues and run workflows until interrupted.
    Worker(worker::WorkerArgs),

    /// Submit workflows and inspect their runs.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Durable queue administration.
    #[command(alias = "q")]
    Queue {
        #[command(subcommand)]
        action: queue::QueueCommand,
    },

    /// Submit an adaptive consensus review.
    Review(review::ReviewArgs),

    /// Send a ping message through a queue.
    Ping {
        /// Queue to send the ping to.
        #[arg(long, default_value = conduit_core::workflow::service::DEFAULT_SUBMISSION_QUEUE)]
        queue: String,

        /// Optional JSON payload echoed back in the result.
        #[arg(long)]
        echo: Option<String>,
    },

    /// Show queue backlogs and workflow counts.
    Status,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Parse an optional JSON argument.
pub fn parse_json_arg(raw: Option<&str>) -> anyhow::Result<Option<serde_json::Value>> {
    use anyhow::Context;
    raw.map(|s| serde_json::from_str(s).with_context(|| format!("invalid JSON: {s}")))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_submit_with_payload() {
        let cli = Cli::try_parse_from([
            "conduit",
            "--json",
            "workflow",
            "submit",
            "echo",
            "--payload",
            "{\"n\": 1}",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Workflow {
                action: workflow::WorkflowCommand::Submit { workflow_type, payload, .. },
            } => {
                assert_eq!(workflow_type, "echo");
                assert_eq!(payload.as_deref(), Some("{\"n\": 1}"));
            }
            _ => panic!("expected workflow submit"),
        }
    }

    #[test]
    fn verbosity_counts() {
        let cli = Cli::try_parse_from(["conduit", "-vv", "status"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn json_arg_parsing() {
        assert_eq!(parse_json_arg(None).unwrap(), None);
        assert_eq!(
            parse_json_arg(Some("{\"a\": 1}")).unwrap(),
            Some(serde_json::json!({"a": 1}))
        );
        assert!(parse_json_arg(Some("{nope")).is_err());
    }
}
