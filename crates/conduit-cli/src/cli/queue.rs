//! CLI durable queue administration.

use std::time::Duration;

use anyhow::{Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use conduit_core::repository::QueueRepository;
use conduit_types::envelope::MessageEnvelope;
use conduit_types::error::QueueError;
use conduit_types::queue::AckOutcome;

use super::parse_json_arg;
use crate::state::AppState;

/// Queue subcommands.
#[derive(Subcommand)]
pub enum QueueCommand {
    /// Create a queue.
    Create {
        name: String,

        /// Fail if the queue already exists.
        #[arg(long)]
        strict: bool,
    },

    /// Enqueue a JSON message.
    Send {
        queue: String,

        /// Message body (JSON).
        body: String,

        /// Keep the message invisible for this many milliseconds.
        #[arg(long)]
        delay_ms: Option<u64>,

        /// Reject bodies that are not a known envelope.
        #[arg(long)]
        validate: bool,
    },

    /// Claim messages and print them.
    Read {
        queue: String,

        /// Maximum number of messages to claim.
        #[arg(long, default_value = "1")]
        limit: usize,

        /// Visibility timeout in seconds.
        #[arg(long, default_value = "30")]
        vt: u64,
    },

    /// Delete a message.
    Ack { queue: String, message_id: i64 },

    /// Make a claimed message visible again.
    Nack { queue: String, message_id: i64 },

    /// Move a message to the archive.
    Archive { queue: String, message_id: i64 },

    /// Show the backlog of one or all queues.
    Stats { queue: Option<String> },

    /// List queues.
    List,

    /// Show recently archived messages.
    Archived {
        queue: String,

        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Delete every live message in a queue (the archive is kept).
    Purge {
        queue: String,

        /// Required confirmation.
        #[arg(long)]
        force: bool,
    },

    /// Remove a queue, its messages and its archive.
    Drop {
        queue: String,

        /// Required confirmation.
        #[arg(long)]
        force: bool,
    },
}

/// Handle a queue subcommand.
pub async fn handle_queue_command(cmd: QueueCommand, state: &AppState, json: bool) -> Result<()> {
    let queue = &state.queue;

    match cmd {
        QueueCommand::Create { name, strict } => {
            if strict {
                queue.create_queue_strict(&name).await?;
            } else {
                queue.create_queue(&name).await?;
            }
            print_ok(json, serde_json::json!({"queue": name, "created": true}), || {
                format!("Queue '{}' ready", style(&name).cyan())
            })
        }

        QueueCommand::Send {
            queue: name,
            body,
            delay_ms,
            validate,
        } => {
            let Some(body) = parse_json_arg(Some(&body))? else {
                bail!("message body is required");
            };
            if validate {
                MessageEnvelope::decode(&body)?;
            }
            let id = match delay_ms {
                Some(ms) => queue.send_delayed(&name, &body, Duration::from_millis(ms)).await,
                None => queue.send(&name, &body).await,
            }
            .map_err(queue_hint)?;
            print_ok(json, serde_json::json!({"queue": name, "message_id": id}), || {
                format!("Enqueued message {} on '{}'", style(id).bold(), style(&name).cyan())
            })
        }

        QueueCommand::Read {
            queue: name,
            limit,
            vt,
        } => {
            let messages = queue
                .read_batch(&name, Duration::from_secs(vt), limit.max(1))
                .await
                .map_err(queue_hint)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&messages)?);
                return Ok(());
            }
            if messages.is_empty() {
                println!("  No visible messages on '{name}'.");
                return Ok(());
            }
            for m in &messages {
                println!(
                    "  #{} read_count={} {}",
                    style(m.message_id).bold(),
                    m.read_count,
                    serde_json::to_string(&m.body)?
                );
            }
            Ok(())
        }

        QueueCommand::Ack {
            queue: name,
            message_id,
        } => {
            let outcome = queue.acknowledge(&name, message_id).await.map_err(queue_hint)?;
            print_ok(
                json,
                serde_json::json!({"message_id": message_id, "outcome": outcome}),
                || match outcome {
                    AckOutcome::Deleted => format!("Deleted message {message_id}"),
                    AckOutcome::NotFound => format!("Message {message_id} was already gone"),
                },
            )
        }

        QueueCommand::Nack {
            queue: name,
            message_id,
        } => {
            let found = queue.nack(&name, message_id).await.map_err(queue_hint)?;
            print_ok(
                json,
                serde_json::json!({"message_id": message_id, "visible": found}),
                || found_text(found, message_id, "is visible again"),
            )
        }

        QueueCommand::Archive {
            queue: name,
            message_id,
        } => {
            let found = queue.archive(&name, message_id).await.map_err(queue_hint)?;
            print_ok(
                json,
                serde_json::json!({"message_id": message_id, "archived": found}),
                || found_text(found, message_id, "archived"),
            )
        }

        QueueCommand::Stats { queue: name } => {
            let names = match name {
                Some(n) => vec![n],
                None => queue.list_queues().await?,
            };
            stats_table(state, &names, json).await
        }

        QueueCommand::List => {
            let names = queue.list_queues().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&names)?);
            } else if names.is_empty() {
                println!("  No queues.");
            } else {
                for n in &names {
                    println!("  {n}");
                }
            }
            Ok(())
        }

        QueueCommand::Archived { queue: name, limit } => {
            let archived = queue.list_archived(&name, limit).await.map_err(queue_hint)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&archived)?);
                return Ok(());
            }
            if archived.is_empty() {
                println!("  Nothing archived on '{name}'.");
                return Ok(());
            }
            let mut table = Table::new();
            table
                .load_preset(presets::UTF8_FULL_CONDENSED)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    Cell::new("ID").fg(Color::Cyan),
                    Cell::new("Archived"),
                    Cell::new("Reads"),
                    Cell::new("Type"),
                ]);
            for m in &archived {
                table.add_row(vec![
                    Cell::new(m.message_id),
                    Cell::new(m.archived_at.format("%Y-%m-%d %H:%M:%S")),
                    Cell::new(m.read_count),
                    Cell::new(m.body.get("type").and_then(|t| t.as_str()).unwrap_or("-")),
                ]);
            }
            println!();
            println!("{table}");
            println!();
            Ok(())
        }

        QueueCommand::Purge { queue: name, force } => {
            if !force {
                bail!("refusing to purge '{name}' without --force");
            }
            let count = queue.purge(&name).await.map_err(queue_hint)?;
            print_ok(json, serde_json::json!({"queue": name, "purged": count}), || {
                format!("Purged {count} message(s) from '{}'", style(&name).cyan())
            })
        }

        QueueCommand::Drop { queue: name, force } => {
            if !force {
                bail!("refusing to drop '{name}' without --force");
            }
            let existed = queue.drop_queue(&name).await?;
            print_ok(json, serde_json::json!({"queue": name, "dropped": existed}), || {
                if existed {
                    format!("Dropped queue '{}'", style(&name).cyan())
                } else {
                    format!("Queue '{name}' did not exist")
                }
            })
        }
    }
}

/// Backlog table for `names`.
async fn stats_table(state: &AppState, names: &[String], json: bool) -> Result<()> {
    let mut rows = Vec::with_capacity(names.len());
    for name in names {
        let stats = state.queue.stats(name).await.map_err(queue_hint)?;
        rows.push((name.clone(), stats));
    }

    if json {
        let out: Vec<_> = rows
            .iter()
            .map(|(name, s)| {
                serde_json::json!({
                    "queue": name,
                    "total": s.total,
                    "in_flight": s.in_flight,
                    "available": s.available,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("  No queues.");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Queue").fg(Color::Cyan),
            Cell::new("Total"),
            Cell::new("In flight"),
            Cell::new("Available"),
        ]);
    for (name, s) in &rows {
        table.add_row(vec![
            Cell::new(name),
            Cell::new(s.total),
            Cell::new(s.in_flight),
            Cell::new(s.available),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn print_ok(json: bool, out: serde_json::Value, text: impl FnOnce() -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("  {} {}", style("*").green().bold(), text());
    }
    Ok(())
}

fn found_text(found: bool, message_id: i64, action: &str) -> String {
    if found {
        format!("Message {message_id} {action}")
    } else {
        format!("Message {message_id} not found")
    }
}

fn queue_hint(e: QueueError) -> anyhow::Error {
    match e {
        QueueError::QueueNotFound(name) => anyhow::anyhow!(
            "Queue '{name}' does not exist. Create it with: conduit queue create {name}"
        ),
        other => other.into(),
    }
}
