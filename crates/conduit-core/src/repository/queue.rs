//! Durable queue trait definition.
//!
//! A queue is a named, persistent FIFO-ish set of messages with
//! visibility-timeout claiming. Claims must be atomic: two concurrent
//! `read`s never return the same message while its visibility timeout
//! has not expired.

use std::sync::Arc;
use std::time::Duration;

use conduit_types::error::QueueError;
use conduit_types::queue::{AckOutcome, ArchivedMessage, QueueMessage, QueueStats};
use serde_json::Value;

/// Storage port for durable queues.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait QueueRepository: Send + Sync {
    /// Create a queue. Creating an existing queue is a no-op.
    fn create_queue(
        &self,
        queue: &str,
    ) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;

    /// Create a queue, failing with `AlreadyExists` if it is already there.
    fn create_queue_strict(
        &self,
        queue: &str,
    ) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;

    /// Enqueue a message, immediately visible. Returns its message id.
    fn send(
        &self,
        queue: &str,
        body: &Value,
    ) -> impl std::future::Future<Output = Result<i64, QueueError>> + Send;

    /// Enqueue a message that becomes visible after `delay`.
    fn send_delayed(
        &self,
        queue: &str,
        body: &Value,
        delay: Duration,
    ) -> impl std::future::Future<Output = Result<i64, QueueError>> + Send;

    /// Claim at most one visible message, hiding it for `visibility_timeout`.
    fn read(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> impl std::future::Future<Output = Result<Option<QueueMessage>, QueueError>> + Send;

    /// Claim up to `limit` visible messages in message-id order.
    fn read_batch(
        &self,
        queue: &str,
        visibility_timeout: Duration,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<QueueMessage>, QueueError>> + Send;

    /// Permanently delete a message. Idempotent.
    fn acknowledge(
        &self,
        queue: &str,
        message_id: i64,
    ) -> impl std::future::Future<Output = Result<AckOutcome, QueueError>> + Send;

    /// Make a claimed message visible again now. Returns `false` if it is gone.
    fn nack(
        &self,
        queue: &str,
        message_id: i64,
    ) -> impl std::future::Future<Output = Result<bool, QueueError>> + Send;

    /// Push a claimed message's visibility deadline to now + `visibility_timeout`.
    /// Returns `false` if it is gone.
    fn extend_visibility(
        &self,
        queue: &str,
        message_id: i64,
        visibility_timeout: Duration,
    ) -> impl std::future::Future<Output = Result<bool, QueueError>> + Send;

    /// Move a message to the archive. Returns `false` if it is gone.
    fn archive(
        &self,
        queue: &str,
        message_id: i64,
    ) -> impl std::future::Future<Output = Result<bool, QueueError>> + Send;

    fn stats(
        &self,
        queue: &str,
    ) -> impl std::future::Future<Output = Result<QueueStats, QueueError>> + Send;

    /// Delete every live message in the queue. Returns how many were removed.
    fn purge(
        &self,
        queue: &str,
    ) -> impl std::future::Future<Output = Result<u64, QueueError>> + Send;

    /// Remove a queue with its messages and archive. Returns `true` if it existed.
    fn drop_queue(
        &self,
        queue: &str,
    ) -> impl std::future::Future<Output = Result<bool, QueueError>> + Send;

    fn list_queues(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<String>, QueueError>> + Send;

    /// Most recently archived messages first.
    fn list_archived(
        &self,
        queue: &str,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ArchivedMessage>, QueueError>> + Send;
}

impl<T: QueueRepository> QueueRepository for Arc<T> {
    async fn create_queue(&self, queue: &str) -> Result<(), QueueError> {
        (**self).create_queue(queue).await
    }

    async fn create_queue_strict(&self, queue: &str) -> Result<(), QueueError> {
        (**self).create_queue_strict(queue).await
    }

    async fn send(&self, queue: &str, body: &Value) -> Result<i64, QueueError> {
        (**self).send(queue, body).await
    }

    async fn send_delayed(
        &self,
        queue: &str,
        body: &Value,
        delay: Duration,
    ) -> Result<i64, QueueError> {
        (**self).send_delayed(queue, body, delay).await
    }

    async fn read(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>, QueueError> {
        (**self).read(queue, visibility_timeout).await
    }

    async fn read_batch(
        &self,
        queue: &str,
        visibility_timeout: Duration,
        limit: usize,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        (**self).read_batch(queue, visibility_timeout, limit).await
    }

    async fn acknowledge(&self, queue: &str, message_id: i64) -> Result<AckOutcome, QueueError> {
        (**self).acknowledge(queue, message_id).await
    }

    async fn nack(&self, queue: &str, message_id: i64) -> Result<bool, QueueError> {
        (**self).nack(queue, message_id).await
    }

    async fn extend_visibility(
        &self,
        queue: &str,
        message_id: i64,
        visibility_timeout: Duration,
    ) -> Result<bool, QueueError> {
        (**self)
            .extend_visibility(queue, message_id, visibility_timeout)
            .await
    }

    async fn archive(&self, queue: &str, message_id: i64) -> Result<bool, QueueError> {
        (**self).archive(queue, message_id).await
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        (**self).stats(queue).await
    }

    async fn purge(&self, queue: &str) -> Result<u64, QueueError> {
        (**self).purge(queue).await
    }

    async fn drop_queue(&self, queue: &str) -> Result<bool, QueueError> {
        (**self).drop_queue(queue).await
    }

    async fn list_queues(&self) -> Result<Vec<String>, QueueError> {
        (**self).list_queues().await
    }

    async fn list_archived(
        &self,
        queue: &str,
        limit: u32,
    ) -> Result<Vec<ArchivedMessage>, QueueError> {
        (**self).list_archived(queue, limit).await
    }
}
