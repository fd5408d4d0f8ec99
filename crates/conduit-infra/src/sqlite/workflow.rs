//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `conduit-core` using sqlx with split
//! read/write pools. Payloads and results are stored as JSON text; step
//! records are keyed by `(workflow_id, step_id)` and upserted on every
//! transition so a restarted worker can resume from them.

use chrono::{DateTime, Utc};
use conduit_core::repository::workflow::WorkflowRepository;
use conduit_types::error::{ErrorKind, RepositoryError};
use conduit_types::workflow::{StepRecord, StepStatus, WorkflowInstance, WorkflowStatus};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime};

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

const INSTANCE_COLUMNS: &str = "id, workflow_type, status, input, payload, results, error, error_kind, created_at, started_at, completed_at";

struct InstanceRow {
    id: String,
    workflow_type: String,
    status: String,
    input: String,
    payload: String,
    results: Option<String>,
    error: Option<String>,
    error_kind: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_type: row.try_get("workflow_type")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            payload: row.try_get("payload")?,
            results: row.try_get("results")?,
            error: row.try_get("error")?,
            error_kind: row.try_get("error_kind")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        Ok(WorkflowInstance {
            id: parse_uuid(&self.id)?,
            workflow_type: self.workflow_type,
            status: self
                .status
                .parse::<WorkflowStatus>()
                .map_err(RepositoryError::Query)?,
            input: parse_json(&self.input, "input")?,
            payload: parse_json(&self.payload, "payload")?,
            results: self
                .results
                .as_deref()
                .map(|s| parse_json(s, "results"))
                .transpose()?,
            error: self.error,
            error_kind: parse_kind(self.error_kind.as_deref())?,
            created_at: parse_ts(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

struct StepRow {
    workflow_id: String,
    step_id: String,
    status: String,
    attempt_count: i64,
    result: Option<String>,
    error: Option<String>,
    error_kind: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    next_attempt_at: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            workflow_id: row.try_get("workflow_id")?,
            step_id: row.try_get("step_id")?,
            status: row.try_get("status")?,
            attempt_count: row.try_get("attempt_count")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            error_kind: row.try_get("error_kind")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
        })
    }

    fn into_record(self) -> Result<StepRecord, RepositoryError> {
        Ok(StepRecord {
            workflow_id: parse_uuid(&self.workflow_id)?,
            step_id: self.step_id,
            status: self
                .status
                .parse::<StepStatus>()
                .map_err(RepositoryError::Query)?,
            attempt_count: self.attempt_count.max(0) as u32,
            result: self
                .result
                .as_deref()
                .map(|s| parse_json(s, "step result"))
                .transpose()?,
            error: self.error,
            error_kind: parse_kind(self.error_kind.as_deref())?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            next_attempt_at: self.next_attempt_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    parse_datetime(s).map_err(RepositoryError::Query)
}

fn parse_json(s: &str, what: &str) -> Result<Value, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn parse_kind(s: Option<&str>) -> Result<Option<ErrorKind>, RepositoryError> {
    s.map(|k| k.parse::<ErrorKind>().map_err(RepositoryError::Query))
        .transpose()
}

fn to_json(value: &Value) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

/// Map "no row updated" to `NotFound`.
fn expect_updated(result: sqlx::sqlite::SqliteQueryResult) -> Result<(), RepositoryError> {
    if result.rows_affected() == 0 {
        Err(RepositoryError::NotFound)
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let results = instance.results.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO workflow_instances
               (id, workflow_type, status, input, payload, results, error, error_kind,
                created_at, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(instance.id.to_string())
        .bind(&instance.workflow_type)
        .bind(instance.status.as_str())
        .bind(to_json(&instance.input)?)
        .bind(to_json(&instance.payload)?)
        .bind(&results)
        .bind(&instance.error)
        .bind(instance.error_kind.map(ErrorKind::as_str))
        .bind(format_datetime(&instance.created_at))
        .bind(instance.started_at.as_ref().map(format_datetime))
        .bind(instance.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("workflow {} already exists", instance.id))
            }
            _ => query_err(e),
        })?;

        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = InstanceRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_instance()?))
            }
            None => Ok(None),
        }
    }

    async fn claim_instance(
        &self,
        id: &Uuid,
        owner: Uuid,
        started_at: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_instances
               SET status = 'running', started_at = COALESCE(started_at, ?),
                   lease_owner = ?, lease_expires_at = ?
               WHERE id = ? AND status = 'pending'"#,
        )
        .bind(format_datetime(&started_at))
        .bind(owner.to_string())
        .bind(lease_until.timestamp_millis())
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn take_over_instance(
        &self,
        id: &Uuid,
        owner: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_instances
               SET lease_owner = ?, lease_expires_at = ?
               WHERE id = ? AND status = 'running'
                 AND (lease_expires_at IS NULL OR lease_expires_at <= ?)"#,
        )
        .bind(owner.to_string())
        .bind(lease_until.timestamp_millis())
        .bind(id.to_string())
        .bind(now.timestamp_millis())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn renew_lease(
        &self,
        id: &Uuid,
        owner: Uuid,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_instances
               SET lease_expires_at = ?
               WHERE id = ? AND status = 'running' AND lease_owner = ?"#,
        )
        .bind(lease_until.timestamp_millis())
        .bind(id.to_string())
        .bind(owner.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_payload(&self, id: &Uuid, payload: &Value) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE workflow_instances SET payload = ? WHERE id = ?")
            .bind(to_json(payload)?)
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        expect_updated(result)
    }

    async fn complete_instance(
        &self,
        id: &Uuid,
        payload: &Value,
        results: &Value,
        completed_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_instances
               SET status = 'completed', payload = ?, results = ?, completed_at = ?
               WHERE id = ?"#,
        )
        .bind(to_json(payload)?)
        .bind(to_json(results)?)
        .bind(format_datetime(&completed_at))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        expect_updated(result)
    }

    async fn fail_instance(
        &self,
        id: &Uuid,
        error: &str,
        kind: ErrorKind,
        completed_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_instances
               SET status = 'failed', error = ?, error_kind = ?, completed_at = ?
               WHERE id = ?"#,
        )
        .bind(error)
        .bind(kind.as_str())
        .bind(format_datetime(&completed_at))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        expect_updated(result)
    }

    async fn list_instances(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = match status {
            Some(s) => {
                sqlx::query(&format!(
                    "SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE status = ? ORDER BY created_at DESC, id DESC LIMIT ?"
                ))
                .bind(s.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {INSTANCE_COLUMNS} FROM workflow_instances ORDER BY created_at DESC, id DESC LIMIT ?"
                ))
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(query_err)?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = InstanceRow::from_row(row).map_err(query_err)?;
            instances.push(r.into_instance()?);
        }
        Ok(instances)
    }

    async fn save_step(&self, record: &StepRecord) -> Result<(), RepositoryError> {
        let result = record.result.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO workflow_steps
               (workflow_id, step_id, status, attempt_count, result, error, error_kind,
                started_at, completed_at, next_attempt_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(workflow_id, step_id) DO UPDATE SET
                 status = excluded.status,
                 attempt_count = excluded.attempt_count,
                 result = excluded.result,
                 error = excluded.error,
                 error_kind = excluded.error_kind,
                 started_at = excluded.started_at,
                 completed_at = excluded.completed_at,
                 next_attempt_at = excluded.next_attempt_at"#,
        )
        .bind(record.workflow_id.to_string())
        .bind(&record.step_id)
        .bind(record.status.as_str())
        .bind(record.attempt_count as i64)
        .bind(&result)
        .bind(&record.error)
        .bind(record.error_kind.map(ErrorKind::as_str))
        .bind(record.started_at.as_ref().map(format_datetime))
        .bind(record.completed_at.as_ref().map(format_datetime))
        .bind(record.next_attempt_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn list_steps(&self, workflow_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT workflow_id, step_id, status, attempt_count, result, error, error_kind,
                      started_at, completed_at, next_attempt_at
               FROM workflow_steps WHERE workflow_id = ? ORDER BY step_id ASC"#,
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepRow::from_row(row).map_err(query_err)?;
            records.push(r.into_record()?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn sample_instance() -> WorkflowInstance {
        WorkflowInstance::pending(Uuid::now_v7(), "linear", json!({"repo": "conduit"}))
    }

    fn owner() -> Uuid {
        Uuid::now_v7()
    }

    fn lease(from: DateTime<Utc>) -> DateTime<Utc> {
        from + chrono::Duration::seconds(30)
    }

    async fn claim(repo: &SqliteWorkflowRepository, id: &Uuid) {
        let now = Utc::now();
        assert!(repo.claim_instance(id, owner(), now, lease(now)).await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_claim_is_exclusive() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let instance = sample_instance();
        repo.create_instance(&instance).await.unwrap();

        let (first, second) = (owner(), owner());
        let now = Utc::now();
        assert!(repo.claim_instance(&instance.id, first, now, lease(now)).await.unwrap());
        assert!(!repo.claim_instance(&instance.id, second, now, lease(now)).await.unwrap());

        assert!(!repo.claim_instance(&Uuid::now_v7(), first, now, lease(now)).await.unwrap());

        let loaded = repo.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Running);
        assert_eq!(
            loaded.started_at.map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn test_take_over_waits_for_lease_expiry() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let instance = sample_instance();
        repo.create_instance(&instance).await.unwrap();

        let (first, second) = (owner(), owner());
        let now = Utc::now();
        repo.claim_instance(&instance.id, first, now, lease(now)).await.unwrap();

        // Live lease: the holder keeps it, others are refused.
        assert!(!repo.take_over_instance(&instance.id, second, now, lease(now)).await.unwrap());
        assert!(repo.renew_lease(&instance.id, first, lease(now)).await.unwrap());
        assert!(!repo.renew_lease(&instance.id, second, lease(now)).await.unwrap());

        // After expiry the instance changes hands and the old holder loses it.
        let later = lease(now) + chrono::Duration::seconds(1);
        assert!(repo.take_over_instance(&instance.id, second, later, lease(later)).await.unwrap());
        assert!(!repo.renew_lease(&instance.id, first, lease(later)).await.unwrap());
        assert!(repo.renew_lease(&instance.id, second, lease(later)).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_and_get_instance() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let instance = sample_instance();
        repo.create_instance(&instance).await.unwrap();

        let loaded = repo.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.workflow_type, "linear");
        assert_eq!(loaded.status, WorkflowStatus::Pending);
        assert_eq!(loaded.input["repo"], "conduit");
        assert_eq!(loaded.payload["input"]["repo"], "conduit");
        assert!(loaded.results.is_none());
        assert!(loaded.started_at.is_none());

        assert!(repo.get_instance(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_instance_conflicts() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let instance = sample_instance();
        repo.create_instance(&instance).await.unwrap();

        let err = repo.create_instance(&instance).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_lifecycle_to_completed() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let instance = sample_instance();
        repo.create_instance(&instance).await.unwrap();

        let started = Utc::now();
        assert!(repo.claim_instance(&instance.id, owner(), started, lease(started)).await.unwrap());

        let payload = json!({"input": {}, "steps": {"A": "A"}});
        repo.update_payload(&instance.id, &payload).await.unwrap();
        repo.complete_instance(&instance.id, &payload, &json!({"A": "A"}), Utc::now())
            .await
            .unwrap();

        let loaded = repo.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Completed);
        assert_eq!(loaded.results, Some(json!({"A": "A"})));
        assert_eq!(loaded.payload["steps"]["A"], "A");
        assert_eq!(
            loaded.started_at.map(|t| t.timestamp_millis()),
            Some(started.timestamp_millis())
        );
        assert!(loaded.completed_at.is_some());

        // A terminal instance cannot go back to running.
        let now = Utc::now();
        assert!(!repo.claim_instance(&instance.id, owner(), now, lease(now)).await.unwrap());
        assert!(!repo.take_over_instance(&instance.id, owner(), now, lease(now)).await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_instance_records_kind() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let instance = sample_instance();
        repo.create_instance(&instance).await.unwrap();
        claim(&repo, &instance.id).await;

        repo.fail_instance(&instance.id, "step 'B' timed out", ErrorKind::StepTimeout, Utc::now())
            .await
            .unwrap();

        let loaded = repo.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("step 'B' timed out"));
        assert_eq!(loaded.error_kind, Some(ErrorKind::StepTimeout));
    }

    #[tokio::test]
    async fn test_update_missing_instance_is_not_found() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let err = repo
            .update_payload(&Uuid::now_v7(), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_list_instances_filters_by_status() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let a = sample_instance();
        let b = sample_instance();
        repo.create_instance(&a).await.unwrap();
        repo.create_instance(&b).await.unwrap();
        claim(&repo, &b.id).await;

        let all = repo.list_instances(None, 10).await.unwrap();
        assert_eq!(all.len(), 2);

        let running = repo
            .list_instances(Some(WorkflowStatus::Running), 10)
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, b.id);

        assert_eq!(repo.list_instances(None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_step_upserts() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let instance = sample_instance();
        repo.create_instance(&instance).await.unwrap();

        let mut record = StepRecord::not_started(instance.id, "B");
        repo.save_step(&record).await.unwrap();
        repo.save_step(&StepRecord::not_started(instance.id, "A"))
            .await
            .unwrap();

        record.status = StepStatus::Running;
        record.attempt_count = 2;
        record.error = Some("boom".into());
        record.error_kind = Some(ErrorKind::StepError);
        record.next_attempt_at = Some(Utc::now());
        repo.save_step(&record).await.unwrap();

        let steps = repo.list_steps(&instance.id).await.unwrap();
        let ids: Vec<&str> = steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(steps[1].status, StepStatus::Running);
        assert_eq!(steps[1].attempt_count, 2);
        assert_eq!(steps[1].error_kind, Some(ErrorKind::StepError));
        assert!(steps[1].next_attempt_at.is_some());

        record.status = StepStatus::Completed;
        record.result = Some(json!("B"));
        record.error = None;
        record.error_kind = None;
        record.next_attempt_at = None;
        repo.save_step(&record).await.unwrap();

        let steps = repo.list_steps(&instance.id).await.unwrap();
        assert_eq!(steps[1].result, Some(json!("B")));
        assert!(steps[1].error.is_none());
        assert!(steps[1].next_attempt_at.is_none());
    }
}
