//! SQLite durable queue implementation.
//!
//! Implements `QueueRepository` from `conduit-core`. Messages live in
//! `queue_messages`; claiming pushes `visible_at` into the future in a single
//! `UPDATE ... RETURNING` statement on the writer connection, which SQLite
//! serializes, so concurrent readers never receive the same message.

use std::time::Duration;

use chrono::{DateTime, Utc};
use conduit_core::repository::queue::QueueRepository;
use conduit_types::error::QueueError;
use conduit_types::queue::{
    AckOutcome, ArchivedMessage, QueueMessage, QueueStats, clamp_visibility, is_valid_queue_name,
};
use serde_json::Value;
use sqlx::Row;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime};

/// SQLite-backed implementation of `QueueRepository`.
pub struct SqliteQueueRepository {
    pool: DatabasePool,
}

impl SqliteQueueRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool, QueueError> {
        let row = sqlx::query("SELECT 1 FROM queues WHERE queue_name = ?")
            .bind(queue)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(storage)?;
        Ok(row.is_some())
    }

    async fn require_queue(&self, queue: &str) -> Result<(), QueueError> {
        if self.queue_exists(queue).await? {
            Ok(())
        } else {
            Err(QueueError::QueueNotFound(queue.to_string()))
        }
    }

    async fn enqueue(&self, queue: &str, body: &Value, delay: Duration) -> Result<i64, QueueError> {
        self.require_queue(queue).await?;

        let body_json = serde_json::to_string(body)
            .map_err(|e| QueueError::Storage(format!("serialize body: {e}")))?;
        let now = Utc::now();
        let visible_at = now.timestamp_millis() + duration_millis(delay);

        let row = sqlx::query(
            r#"INSERT INTO queue_messages (queue_name, enqueued_at, visible_at, read_count, body)
               VALUES (?, ?, ?, 0, ?)
               RETURNING msg_id"#,
        )
        .bind(queue)
        .bind(format_datetime(&now))
        .bind(visible_at)
        .bind(&body_json)
        .fetch_one(&self.pool.writer)
        .await
        .map_err(storage)?;

        let message_id: i64 = row.try_get("msg_id").map_err(storage)?;
        tracing::trace!(queue, message_id, "message enqueued");
        Ok(message_id)
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct MessageRow {
    msg_id: i64,
    queue_name: String,
    enqueued_at: String,
    visible_at: i64,
    read_count: i64,
    body: String,
}

impl MessageRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            msg_id: row.try_get("msg_id")?,
            queue_name: row.try_get("queue_name")?,
            enqueued_at: row.try_get("enqueued_at")?,
            visible_at: row.try_get("visible_at")?,
            read_count: row.try_get("read_count")?,
            body: row.try_get("body")?,
        })
    }

    fn into_message(self) -> Result<QueueMessage, QueueError> {
        Ok(QueueMessage {
            queue_name: self.queue_name,
            message_id: self.msg_id,
            enqueued_at: parse_datetime(&self.enqueued_at).map_err(QueueError::Storage)?,
            visible_at: from_millis(self.visible_at)?,
            read_count: self.read_count.max(0) as u32,
            body: parse_body(&self.body)?,
        })
    }
}

struct ArchivedRow {
    msg_id: i64,
    queue_name: String,
    enqueued_at: String,
    archived_at: String,
    read_count: i64,
    body: String,
}

impl ArchivedRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            msg_id: row.try_get("msg_id")?,
            queue_name: row.try_get("queue_name")?,
            enqueued_at: row.try_get("enqueued_at")?,
            archived_at: row.try_get("archived_at")?,
            read_count: row.try_get("read_count")?,
            body: row.try_get("body")?,
        })
    }

    fn into_archived(self) -> Result<ArchivedMessage, QueueError> {
        Ok(ArchivedMessage {
            queue_name: self.queue_name,
            message_id: self.msg_id,
            enqueued_at: parse_datetime(&self.enqueued_at).map_err(QueueError::Storage)?,
            archived_at: parse_datetime(&self.archived_at).map_err(QueueError::Storage)?,
            read_count: self.read_count.max(0) as u32,
            body: parse_body(&self.body)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn storage(e: sqlx::Error) -> QueueError {
    QueueError::Storage(e.to_string())
}

fn parse_body(s: &str) -> Result<Value, QueueError> {
    serde_json::from_str(s).map_err(|e| QueueError::Storage(format!("invalid message body: {e}")))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::Storage(format!("invalid visible_at: {ms}")))
}

/// Milliseconds of a hide duration, clamped so `now + ms` stays a valid timestamp.
fn duration_millis(d: Duration) -> i64 {
    clamp_visibility(d).as_millis() as i64
}

// ---------------------------------------------------------------------------
// QueueRepository impl
// ---------------------------------------------------------------------------

impl QueueRepository for SqliteQueueRepository {
    async fn create_queue(&self, queue: &str) -> Result<(), QueueError> {
        if !is_valid_queue_name(queue) {
            return Err(QueueError::InvalidName(queue.to_string()));
        }

        sqlx::query("INSERT INTO queues (queue_name, created_at) VALUES (?, ?) ON CONFLICT(queue_name) DO NOTHING")
            .bind(queue)
            .bind(format_datetime(&Utc::now()))
            .execute(&self.pool.writer)
            .await
            .map_err(storage)?;

        Ok(())
    }

    async fn create_queue_strict(&self, queue: &str) -> Result<(), QueueError> {
        if !is_valid_queue_name(queue) {
            return Err(QueueError::InvalidName(queue.to_string()));
        }

        let result = sqlx::query("INSERT INTO queues (queue_name, created_at) VALUES (?, ?) ON CONFLICT(queue_name) DO NOTHING")
            .bind(queue)
            .bind(format_datetime(&Utc::now()))
            .execute(&self.pool.writer)
            .await
            .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(QueueError::AlreadyExists(queue.to_string()));
        }
        Ok(())
    }

    async fn send(&self, queue: &str, body: &Value) -> Result<i64, QueueError> {
        self.enqueue(queue, body, Duration::ZERO).await
    }

    async fn send_delayed(
        &self,
        queue: &str,
        body: &Value,
        delay: Duration,
    ) -> Result<i64, QueueError> {
        self.enqueue(queue, body, delay).await
    }

    async fn read(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>, QueueError> {
        Ok(self
            .read_batch(queue, visibility_timeout, 1)
            .await?
            .into_iter()
            .next())
    }

    async fn read_batch(
        &self,
        queue: &str,
        visibility_timeout: Duration,
        limit: usize,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        self.require_queue(queue).await?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now().timestamp_millis();
        let hidden_until = now + duration_millis(visibility_timeout);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            r#"UPDATE queue_messages
               SET visible_at = ?, read_count = read_count + 1
               WHERE msg_id IN (
                   SELECT msg_id FROM queue_messages
                   WHERE queue_name = ? AND visible_at <= ?
                   ORDER BY msg_id ASC
                   LIMIT ?
               )
               RETURNING msg_id, queue_name, enqueued_at, visible_at, read_count, body"#,
        )
        .bind(hidden_until)
        .bind(queue)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool.writer)
        .await
        .map_err(storage)?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = MessageRow::from_row(row).map_err(storage)?;
            messages.push(r.into_message()?);
        }
        // RETURNING order is unspecified.
        messages.sort_by_key(|m| m.message_id);

        if !messages.is_empty() {
            tracing::debug!(queue, claimed = messages.len(), "claimed messages");
        }
        Ok(messages)
    }

    async fn acknowledge(&self, queue: &str, message_id: i64) -> Result<AckOutcome, QueueError> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE queue_name = ? AND msg_id = ?")
            .bind(queue)
            .bind(message_id)
            .execute(&self.pool.writer)
            .await
            .map_err(storage)?;

        if result.rows_affected() > 0 {
            return Ok(AckOutcome::Deleted);
        }
        self.require_queue(queue).await?;
        Ok(AckOutcome::NotFound)
    }

    async fn nack(&self, queue: &str, message_id: i64) -> Result<bool, QueueError> {
        let result =
            sqlx::query("UPDATE queue_messages SET visible_at = ? WHERE queue_name = ? AND msg_id = ?")
                .bind(Utc::now().timestamp_millis())
                .bind(queue)
                .bind(message_id)
                .execute(&self.pool.writer)
                .await
                .map_err(storage)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.require_queue(queue).await?;
        Ok(false)
    }

    async fn extend_visibility(
        &self,
        queue: &str,
        message_id: i64,
        visibility_timeout: Duration,
    ) -> Result<bool, QueueError> {
        let hidden_until = Utc::now().timestamp_millis() + duration_millis(visibility_timeout);
        let result =
            sqlx::query("UPDATE queue_messages SET visible_at = ? WHERE queue_name = ? AND msg_id = ?")
                .bind(hidden_until)
                .bind(queue)
                .bind(message_id)
                .execute(&self.pool.writer)
                .await
                .map_err(storage)?;

        if result.rows_affected() > 0 {
            tracing::trace!(queue, message_id, "visibility extended");
            return Ok(true);
        }
        self.require_queue(queue).await?;
        Ok(false)
    }

    async fn archive(&self, queue: &str, message_id: i64) -> Result<bool, QueueError> {
        let mut tx = self.pool.writer.begin().await.map_err(storage)?;

        let row = sqlx::query(
            r#"DELETE FROM queue_messages WHERE queue_name = ? AND msg_id = ?
               RETURNING msg_id, queue_name, enqueued_at, visible_at, read_count, body"#,
        )
        .bind(queue)
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?;

        let Some(row) = row else {
            drop(tx);
            self.require_queue(queue).await?;
            return Ok(false);
        };
        let r = MessageRow::from_row(&row).map_err(storage)?;

        sqlx::query(
            r#"INSERT INTO queue_archive (msg_id, queue_name, enqueued_at, archived_at, read_count, body)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(r.msg_id)
        .bind(&r.queue_name)
        .bind(&r.enqueued_at)
        .bind(format_datetime(&Utc::now()))
        .bind(r.read_count)
        .bind(&r.body)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        Ok(true)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        self.require_queue(queue).await?;

        let row = sqlx::query(
            r#"SELECT COUNT(*) AS total,
                      COALESCE(SUM(CASE WHEN visible_at > ? THEN 1 ELSE 0 END), 0) AS in_flight
               FROM queue_messages WHERE queue_name = ?"#,
        )
        .bind(Utc::now().timestamp_millis())
        .bind(queue)
        .fetch_one(&self.pool.reader)
        .await
        .map_err(storage)?;

        let total: i64 = row.try_get("total").map_err(storage)?;
        let in_flight: i64 = row.try_get("in_flight").map_err(storage)?;
        Ok(QueueStats::new(total.max(0) as u64, in_flight.max(0) as u64))
    }

    async fn purge(&self, queue: &str) -> Result<u64, QueueError> {
        self.require_queue(queue).await?;

        let result = sqlx::query("DELETE FROM queue_messages WHERE queue_name = ?")
            .bind(queue)
            .execute(&self.pool.writer)
            .await
            .map_err(storage)?;

        tracing::info!(queue, purged = result.rows_affected(), "queue purged");
        Ok(result.rows_affected())
    }

    async fn drop_queue(&self, queue: &str) -> Result<bool, QueueError> {
        // Messages and archive rows cascade.
        let result = sqlx::query("DELETE FROM queues WHERE queue_name = ?")
            .bind(queue)
            .execute(&self.pool.writer)
            .await
            .map_err(storage)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_queues(&self) -> Result<Vec<String>, QueueError> {
        let rows = sqlx::query("SELECT queue_name FROM queues ORDER BY queue_name ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(storage)?;

        rows.iter()
            .map(|row| row.try_get("queue_name").map_err(storage))
            .collect()
    }

    async fn list_archived(
        &self,
        queue: &str,
        limit: u32,
    ) -> Result<Vec<ArchivedMessage>, QueueError> {
        self.require_queue(queue).await?;

        let rows = sqlx::query(
            r#"SELECT msg_id, queue_name, enqueued_at, archived_at, read_count, body
               FROM queue_archive WHERE queue_name = ?
               ORDER BY archived_at DESC, msg_id DESC
               LIMIT ?"#,
        )
        .bind(queue)
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(storage)?;

        let mut archived = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ArchivedRow::from_row(row).map_err(storage)?;
            archived.push(r.into_archived()?);
        }
        Ok(archived)
    }
}
