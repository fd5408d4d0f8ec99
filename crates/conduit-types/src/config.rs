//! Global configuration types for Conduit.
//!
//! `GlobalConfig` represents the top-level `config.toml` in the data
//! directory. Every field has a default so an empty file is valid.

use serde::{Deserialize, Serialize};

/// Top-level configuration.
///
/// Loaded from `~/.conduit/config.toml` (or `$CONDUIT_DATA_DIR/config.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// SQLite URL. When absent the database lives at `<data_dir>/conduit.db`.
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            consumer: ConsumerConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

/// How a consumer processes a claimed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsumerMode {
    /// One message at a time, in claim order.
    Sequential,
    /// Up to `max_parallel_workers` messages at once, each bounded by `timeout_ms`.
    BoundedParallel {
        max_parallel_workers: usize,
        timeout_ms: u64,
    },
}

impl Default for ConsumerMode {
    fn default() -> Self {
        ConsumerMode::Sequential
    }
}

/// Multi-queue consumer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Messages claimed per queue per poll cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// A message read more times than this goes to the dead-letter queue.
    #[serde(default = "default_max_read_count")]
    pub max_read_count: u32,

    #[serde(default)]
    pub mode: ConsumerMode,
}

fn default_queues() -> Vec<String> {
    vec!["workflow_requests".to_string()]
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_batch_size() -> usize {
    10
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

fn default_max_read_count() -> u32 {
    5
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queues: default_queues(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_read_count: default_max_read_count(),
            mode: ConsumerMode::default(),
        }
    }
}

/// Defaults applied to steps that do not declare their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    /// Event bus channel capacity.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Run lease on a running instance. Another worker may take the
    /// instance over only after its lease lapses.
    #[serde(default = "default_run_lease_secs")]
    pub run_lease_secs: u64,
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_event_capacity() -> usize {
    1024
}

fn default_run_lease_secs() -> u64 {
    30
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout_secs(),
            default_max_attempts: default_max_attempts(),
            event_capacity: default_event_capacity(),
            run_lease_secs: default_run_lease_secs(),
        }
    }
}
