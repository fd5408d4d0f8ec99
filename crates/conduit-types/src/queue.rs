//! Durable queue domain types.
//!
//! A queue message is claimed by setting its `visible_at` into the future
//! (the visibility timeout). `read_count` grows by one per claim and doubles
//! as the poison-message counter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Suffix appended to a queue name to form its dead-letter queue.
pub const DEAD_LETTER_SUFFIX: &str = "_dlq";

/// Longest a message can be hidden, by a claim or by a send delay.
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Clamp a visibility timeout or send delay to `MAX_VISIBILITY_TIMEOUT`.
pub fn clamp_visibility(timeout: Duration) -> Duration {
    timeout.min(MAX_VISIBILITY_TIMEOUT)
}

/// A message stored in (or claimed from) a durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub queue_name: String,
    /// Monotonic, unique within the queue.
    pub message_id: i64,
    pub enqueued_at: DateTime<Utc>,
    /// The message is invisible to readers until this instant.
    pub visible_at: DateTime<Utc>,
    pub read_count: u32,
    /// Opaque structured payload.
    pub body: serde_json::Value,
}

/// A message moved to the archive table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedMessage {
    pub queue_name: String,
    pub message_id: i64,
    pub enqueued_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
    pub read_count: u32,
    pub body: serde_json::Value,
}

/// Outcome of `acknowledge`. Acknowledging twice yields `NotFound`, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    Deleted,
    NotFound,
}

/// Backlog snapshot for a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: u64,
    /// Messages currently claimed (visibility timeout not yet expired).
    pub in_flight: u64,
    /// `total - in_flight`.
    pub available: u64,
}

impl QueueStats {
    pub fn new(total: u64, in_flight: u64) -> Self {
        Self {
            total,
            in_flight,
            available: total.saturating_sub(in_flight),
        }
    }
}

/// Validate a queue name: non-empty, ASCII alphanumeric plus `_` and `-`.
pub fn is_valid_queue_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Derive the results queue for a request queue.
///
/// `foo_requests` becomes `foo_results`; any other name gets a `_results` suffix.
pub fn results_queue_for(queue_name: &str) -> String {
    match queue_name.strip_suffix("requests") {
        Some(prefix) => format!("{prefix}results"),
        None => format!("{queue_name}_results"),
    }
}

/// Derive the dead-letter queue for a queue.
pub fn dead_letter_queue_for(queue_name: &str) -> String {
    format!("{queue_name}{DEAD_LETTER_SUFFIX}")
}
