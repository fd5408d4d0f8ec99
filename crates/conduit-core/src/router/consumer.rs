//! Multi-queue consumer.
//!
//! Polls a fixed set of queues on a timer. Each claimed message is decoded,
//! dispatched to the handler registered for its envelope kind, and its
//! outcome published to the matching results queue before the original is
//! archived. Messages redelivered too often go to the dead-letter queue
//! without reaching a handler.
//!
//! The loop never dies on a bad message: decode errors, unknown types,
//! handler failures, panics and timeouts all end as error outcomes. While a
//! handler runs, its message's visibility timeout is extended so no other
//! worker claims it.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use conduit_types::config::{ConsumerConfig, ConsumerMode};
use conduit_types::envelope::{MessageEnvelope, ResultEnvelope};
use conduit_types::error::{ErrorKind, QueueError};
use conduit_types::queue::{QueueMessage, dead_letter_queue_for, results_queue_for};
use dashmap::DashSet;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::handler::{BoxMessageHandler, HandlerError, HandlerOutput, HandlerRegistry};
use super::metrics::{ConsumerMetrics, MetricsSnapshot};
use crate::repository::queue::QueueRepository;

pub const DEAD_LETTER_REASON: &str = "max_read_count_exceeded";

/// Shortest interval between claim extensions.
const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("message task aborted: {0}")]
    TaskAborted(String),
}

/// How one claimed message ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Succeeded,
    Failed,
    TimedOut,
    Unknown,
    DeadLettered,
    /// Left claimed without an outcome; redelivered once the claim lapses.
    Deferred,
}

pub struct MultiQueueConsumer<Q: QueueRepository> {
    queue: Q,
    handlers: HandlerRegistry,
    config: ConsumerConfig,
    metrics: ConsumerMetrics,
    /// Output queues already created by this consumer.
    ensured: DashSet<String>,
}

impl<Q: QueueRepository + 'static> MultiQueueConsumer<Q> {
    pub fn new(queue: Q, handlers: HandlerRegistry, config: ConsumerConfig) -> Self {
        Self {
            queue,
            handlers,
            config,
            metrics: ConsumerMetrics::new(),
            ensured: DashSet::new(),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Create every consumed queue. Idempotent.
    pub async fn ensure_queues(&self) -> Result<(), RouterError> {
        for name in &self.config.queues {
            self.ensure_queue(name).await?;
        }
        Ok(())
    }

    async fn ensure_queue(&self, name: &str) -> Result<(), QueueError> {
        if self.ensured.contains(name) {
            return Ok(());
        }
        self.queue.create_queue(name).await?;
        self.ensured.insert(name.to_string());
        Ok(())
    }

    /// Poll until `shutdown` is cancelled. A cycle in progress is finished
    /// before returning.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), RouterError> {
        self.ensure_queues().await?;

        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            queues = ?self.config.queues,
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            mode = ?self.config.mode,
            "consumer started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(0) => {}
                        Ok(n) => tracing::debug!(processed = n, "poll cycle complete"),
                        Err(e) => tracing::error!(error = %e, "poll cycle failed"),
                    }
                }
            }
        }

        tracing::info!(metrics = ?self.metrics(), "consumer stopped");
        Ok(())
    }

    /// One poll cycle over every queue. Returns how many messages were handled.
    ///
    /// A storage error on one queue is logged and the cycle moves on; the
    /// last such error is returned once every queue was tried.
    pub async fn poll_once(self: &Arc<Self>) -> Result<usize, RouterError> {
        let mut handled = 0;
        let mut last_error = None;

        for name in &self.config.queues {
            match self.poll_queue(name).await {
                Ok(n) => handled += n,
                Err(e) => {
                    tracing::error!(queue = name.as_str(), error = %e, "failed to poll queue");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if handled == 0 => Err(e),
            _ => Ok(handled),
        }
    }

    async fn poll_queue(self: &Arc<Self>, name: &str) -> Result<usize, RouterError> {
        let visibility_timeout = Duration::from_secs(self.config.visibility_timeout_secs);
        let batch = self
            .queue
            .read_batch(name, visibility_timeout, self.config.batch_size.max(1))
            .await?;
        if batch.is_empty() {
            return Ok(0);
        }
        tracing::debug!(queue = name, claimed = batch.len(), "claimed batch");

        let count = batch.len();
        match self.config.mode {
            ConsumerMode::Sequential => {
                for message in batch {
                    if let Err(e) = self.process(&message, None).await {
                        tracing::error!(
                            queue = name,
                            message_id = message.message_id,
                            error = %e,
                            "message left for redelivery"
                        );
                    }
                }
            }
            ConsumerMode::BoundedParallel {
                max_parallel_workers,
                timeout_ms,
            } => {
                let semaphore = Arc::new(Semaphore::new(max_parallel_workers.max(1)));
                let timeout = Duration::from_millis(timeout_ms);
                let mut tasks = JoinSet::new();

                for message in batch {
                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|e| RouterError::TaskAborted(e.to_string()))?;
                    let this = Arc::clone(self);
                    tasks.spawn(async move {
                        let _permit = permit;
                        let result = this.process(&message, Some(timeout)).await;
                        (message.message_id, result)
                    });
                }

                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok((_, Ok(_))) => {}
                        Ok((message_id, Err(e))) => tracing::error!(
                            queue = name,
                            message_id,
                            error = %e,
                            "message left for redelivery"
                        ),
                        Err(e) => tracing::error!(queue = name, error = %e, "message task aborted"),
                    }
                }
            }
        }

        Ok(count)
    }

    /// Handle one claimed message end to end.
    ///
    /// The handler runs as its own task while the claim is kept alive. When
    /// `timeout` expires, a timeout outcome is published and the task is left
    /// to finish in the background, so a workflow run still reaches a
    /// terminal state.
    ///
    /// Returns `Err` only when the outcome could not be made durable; the
    /// message is then left claimed and will be redelivered.
    pub async fn process(
        &self,
        message: &QueueMessage,
        timeout: Option<Duration>,
    ) -> Result<Disposition, RouterError> {
        if message.read_count > self.config.max_read_count {
            self.dead_letter(message).await?;
            return Ok(Disposition::DeadLettered);
        }

        let started = Instant::now();
        let (handler, envelope) = match self.route(message) {
            Ok(routed) => routed,
            Err(failure) => {
                let (outcome, disposition) = settle(message, Ok(Err(failure)), started);
                return self.finish(message, outcome, disposition).await;
            }
        };
        let workflow_id = envelope.workflow_id();

        let owned = message.clone();
        let mut task = tokio::spawn(async move { handler.handle(&owned, envelope).await });
        let handled = async {
            tokio::select! {
                joined = &mut task => joined,
                never = self.keep_claimed(message) => match never {},
            }
        };

        let (outcome, disposition) = match timeout {
            Some(limit) => match tokio::time::timeout(limit, handled).await {
                Ok(joined) => settle(message, joined, started),
                Err(_) => {
                    tracing::warn!(
                        queue = message.queue_name.as_str(),
                        message_id = message.message_id,
                        workflow_id = ?workflow_id,
                        timeout_ms = limit.as_millis() as u64,
                        "handler timed out, letting it finish in the background"
                    );
                    let error = format!("message processing timed out after {}ms", limit.as_millis());
                    (
                        ResultEnvelope::failure(
                            &message.queue_name,
                            message.message_id,
                            workflow_id,
                            ErrorKind::StepTimeout,
                            error,
                            elapsed_ms(started),
                        ),
                        Disposition::TimedOut,
                    )
                }
            },
            None => settle(message, handled.await, started),
        };

        self.finish(message, outcome, disposition).await
    }

    /// Publish the outcome and archive the original, or leave a deferred
    /// message claimed for a later redelivery.
    async fn finish(
        &self,
        message: &QueueMessage,
        outcome: ResultEnvelope,
        disposition: Disposition,
    ) -> Result<Disposition, RouterError> {
        if disposition == Disposition::Deferred {
            self.metrics.record_deferred();
            tracing::info!(
                queue = message.queue_name.as_str(),
                message_id = message.message_id,
                workflow_id = ?outcome.workflow_id,
                error = outcome.error.as_deref().unwrap_or_default(),
                "message deferred until its claim lapses"
            );
            return Ok(disposition);
        }

        let results_queue = results_queue_for(&message.queue_name);
        self.ensure_queue(&results_queue).await?;
        self.queue.send(&results_queue, &outcome.to_value()).await?;
        self.queue
            .archive(&message.queue_name, message.message_id)
            .await?;

        match disposition {
            Disposition::Succeeded => self.metrics.record_success(),
            Disposition::TimedOut => self.metrics.record_timeout(),
            Disposition::Unknown => self.metrics.record_unknown(),
            _ => self.metrics.record_failure(),
        }

        if outcome.is_success() {
            tracing::info!(
                queue = message.queue_name.as_str(),
                message_id = message.message_id,
                workflow_id = ?outcome.workflow_id,
                execution_time_ms = outcome.execution_time_ms,
                "message processed"
            );
        } else {
            tracing::warn!(
                queue = message.queue_name.as_str(),
                message_id = message.message_id,
                error_type = ?outcome.error_type,
                error = outcome.error.as_deref().unwrap_or_default(),
                "message failed"
            );
        }

        Ok(disposition)
    }

    /// Decode the message and find the handler for its kind.
    fn route(
        &self,
        message: &QueueMessage,
    ) -> Result<(BoxMessageHandler, MessageEnvelope), HandlerError> {
        let envelope = MessageEnvelope::decode(&message.body)
            .map_err(|e| HandlerError::new(e.error_kind(), e.to_string()))?;
        let kind = envelope.kind();
        let handler = self.handlers.get(kind).cloned().ok_or_else(|| {
            HandlerError::new(
                ErrorKind::UnknownMessageType,
                format!("no handler registered for '{kind}' messages"),
            )
        })?;
        tracing::debug!(
            queue = message.queue_name.as_str(),
            message_id = message.message_id,
            %kind,
            "dispatching message"
        );
        Ok((handler, envelope))
    }

    /// Push the claim on `message` forward every half visibility timeout.
    /// Runs until dropped.
    async fn keep_claimed(&self, message: &QueueMessage) -> Infallible {
        let visibility_timeout = Duration::from_secs(self.config.visibility_timeout_secs);
        let every = (visibility_timeout / 2).max(MIN_HEARTBEAT);
        loop {
            tokio::time::sleep(every).await;
            match self
                .queue
                .extend_visibility(&message.queue_name, message.message_id, visibility_timeout)
                .await
            {
                Ok(true) => tracing::trace!(
                    queue = message.queue_name.as_str(),
                    message_id = message.message_id,
                    "claim extended"
                ),
                Ok(false) => tracing::warn!(
                    queue = message.queue_name.as_str(),
                    message_id = message.message_id,
                    "message vanished while its handler was running"
                ),
                Err(e) => tracing::warn!(
                    queue = message.queue_name.as_str(),
                    message_id = message.message_id,
                    error = %e,
                    "failed to extend claim"
                ),
            }
        }
    }

    async fn dead_letter(&self, message: &QueueMessage) -> Result<(), RouterError> {
        let dlq = dead_letter_queue_for(&message.queue_name);
        self.ensure_queue(&dlq).await?;

        let body = json!({
            "original": message.body,
            "source_queue": message.queue_name,
            "message_id": message.message_id,
            "read_count": message.read_count,
            "enqueued_at": message.enqueued_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "dead_lettered_at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "reason": DEAD_LETTER_REASON,
        });
        self.queue.send(&dlq, &body).await?;
        self.queue
            .archive(&message.queue_name, message.message_id)
            .await?;
        self.metrics.record_dead_letter();

        tracing::warn!(
            queue = message.queue_name.as_str(),
            message_id = message.message_id,
            read_count = message.read_count,
            max_read_count = self.config.max_read_count,
            dead_letter_queue = dlq.as_str(),
            "poison message dead-lettered"
        );
        Ok(())
    }
}

fn settle(
    message: &QueueMessage,
    joined: Result<Result<HandlerOutput, HandlerError>, JoinError>,
    started: Instant,
) -> (ResultEnvelope, Disposition) {
    let elapsed = elapsed_ms(started);
    match joined {
        Ok(Ok(output)) => (
            ResultEnvelope::success(
                &message.queue_name,
                message.message_id,
                output.workflow_id,
                output.result,
                elapsed,
            ),
            Disposition::Succeeded,
        ),
        Ok(Err(failure)) => {
            let disposition = if failure.deferred {
                Disposition::Deferred
            } else if failure.kind == ErrorKind::UnknownMessageType {
                Disposition::Unknown
            } else {
                Disposition::Failed
            };
            (
                ResultEnvelope::failure(
                    &message.queue_name,
                    message.message_id,
                    failure.workflow_id,
                    failure.kind,
                    failure.message,
                    elapsed,
                ),
                disposition,
            )
        }
        Err(join_err) => {
            let error = if join_err.is_panic() {
                "message handler panicked"
            } else {
                "message handler was cancelled"
            };
            (
                ResultEnvelope::failure(
                    &message.queue_name,
                    message.message_id,
                    None,
                    ErrorKind::ExecutorCrash,
                    error,
                    elapsed,
                ),
                Disposition::Failed,
            )
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
