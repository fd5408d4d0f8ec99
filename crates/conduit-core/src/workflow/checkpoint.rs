//! Durable checkpoints for workflow execution state.
//!
//! Wraps `WorkflowRepository` with one method per state transition. Every
//! transition is persisted before the executor moves forward or tells
//! anyone about it, so a crashed run can be resumed from its records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use conduit_types::error::ErrorKind;
use conduit_types::workflow::{StepRecord, StepStatus, WorkflowInstance};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

/// Errors from checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),
}

fn repo_err(e: impl std::fmt::Display) -> CheckpointError {
    CheckpointError::Repository(e.to_string())
}

fn lease_until(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Records execution checkpoints for workflow instances.
///
/// Generic over `R: WorkflowRepository` so it works with SQLite or an
/// in-memory double.
pub struct CheckpointManager<R: WorkflowRepository> {
    repo: R,
}

impl<R: WorkflowRepository> CheckpointManager<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Instance checkpoints
    // -----------------------------------------------------------------------

    pub async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), CheckpointError> {
        self.repo.create_instance(instance).await.map_err(repo_err)?;
        tracing::debug!(
            workflow_id = %instance.id,
            workflow_type = instance.workflow_type.as_str(),
            "checkpointed instance created"
        );
        Ok(())
    }

    /// Load an instance and its step records.
    pub async fn load(
        &self,
        workflow_id: Uuid,
    ) -> Result<(WorkflowInstance, Vec<StepRecord>), CheckpointError> {
        let instance = self
            .repo
            .get_instance(&workflow_id)
            .await
            .map_err(repo_err)?
            .ok_or(CheckpointError::InstanceNotFound(workflow_id))?;
        let steps = self.repo.list_steps(&workflow_id).await.map_err(repo_err)?;
        Ok((instance, steps))
    }

    /// Claim a pending instance for `owner`. `false` if it is not pending.
    pub async fn instance_claimed(
        &self,
        workflow_id: Uuid,
        owner: Uuid,
        lease: Duration,
    ) -> Result<bool, CheckpointError> {
        let now = Utc::now();
        self.repo
            .claim_instance(&workflow_id, owner, now, lease_until(now, lease))
            .await
            .map_err(repo_err)
    }

    /// Take over a running instance whose lease expired. `false` while
    /// another owner holds a live lease.
    pub async fn instance_taken_over(
        &self,
        workflow_id: Uuid,
        owner: Uuid,
        lease: Duration,
    ) -> Result<bool, CheckpointError> {
        let now = Utc::now();
        let taken = self
            .repo
            .take_over_instance(&workflow_id, owner, now, lease_until(now, lease))
            .await
            .map_err(repo_err)?;
        if taken {
            tracing::debug!(workflow_id = %workflow_id, owner = %owner, "took over instance lease");
        }
        Ok(taken)
    }

    pub async fn lease_renewed(
        &self,
        workflow_id: Uuid,
        owner: Uuid,
        lease: Duration,
    ) -> Result<bool, CheckpointError> {
        self.repo
            .renew_lease(&workflow_id, owner, lease_until(Utc::now(), lease))
            .await
            .map_err(repo_err)
    }

    pub async fn payload(&self, workflow_id: Uuid, payload: &Value) -> Result<(), CheckpointError> {
        self.repo
            .update_payload(&workflow_id, payload)
            .await
            .map_err(repo_err)
    }

    pub async fn instance_completed(
        &self,
        workflow_id: Uuid,
        payload: &Value,
        results: &Value,
    ) -> Result<(), CheckpointError> {
        self.repo
            .complete_instance(&workflow_id, payload, results, Utc::now())
            .await
            .map_err(repo_err)?;
        tracing::debug!(workflow_id = %workflow_id, "checkpointed instance completed");
        Ok(())
    }

    pub async fn instance_failed(
        &self,
        workflow_id: Uuid,
        kind: ErrorKind,
        error: &str,
    ) -> Result<(), CheckpointError> {
        self.repo
            .fail_instance(&workflow_id, error, kind, Utc::now())
            .await
            .map_err(repo_err)?;
        tracing::debug!(workflow_id = %workflow_id, %kind, error, "checkpointed instance failed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step checkpoints
    // -----------------------------------------------------------------------

    /// Start a new attempt: bump `attempt_count` and mark the step running.
    pub async fn step_attempt_started(&self, record: &mut StepRecord) -> Result<(), CheckpointError> {
        record.status = StepStatus::Running;
        record.attempt_count += 1;
        record.started_at = Some(Utc::now());
        record.next_attempt_at = None;
        self.save(record).await?;
        tracing::debug!(
            workflow_id = %record.workflow_id,
            step_id = record.step_id.as_str(),
            attempt = record.attempt_count,
            "checkpointed step start"
        );
        Ok(())
    }

    pub async fn step_completed(
        &self,
        record: &mut StepRecord,
        result: Value,
    ) -> Result<(), CheckpointError> {
        record.status = StepStatus::Completed;
        record.result = Some(result);
        record.error = None;
        record.error_kind = None;
        record.next_attempt_at = None;
        record.completed_at = Some(Utc::now());
        self.save(record).await?;
        tracing::debug!(
            workflow_id = %record.workflow_id,
            step_id = record.step_id.as_str(),
            "checkpointed step complete"
        );
        Ok(())
    }

    /// A failed attempt that will be retried at `next_attempt_at`.
    ///
    /// The step stays `running`; the pending retry is the persisted
    /// `next_attempt_at`.
    pub async fn step_retry_scheduled(
        &self,
        record: &mut StepRecord,
        kind: ErrorKind,
        error: &str,
        next_attempt_at: chrono::DateTime<Utc>,
    ) -> Result<(), CheckpointError> {
        record.status = StepStatus::Running;
        record.error = Some(error.to_string());
        record.error_kind = Some(kind);
        record.next_attempt_at = Some(next_attempt_at);
        self.save(record).await?;
        tracing::debug!(
            workflow_id = %record.workflow_id,
            step_id = record.step_id.as_str(),
            attempt = record.attempt_count,
            %next_attempt_at,
            "checkpointed step retry"
        );
        Ok(())
    }

    /// Permanent failure.
    pub async fn step_failed(
        &self,
        record: &mut StepRecord,
        kind: ErrorKind,
        error: &str,
    ) -> Result<(), CheckpointError> {
        record.status = StepStatus::Failed;
        record.error = Some(error.to_string());
        record.error_kind = Some(kind);
        record.next_attempt_at = None;
        record.completed_at = Some(Utc::now());
        self.save(record).await?;
        tracing::debug!(
            workflow_id = %record.workflow_id,
            step_id = record.step_id.as_str(),
            error,
            "checkpointed step failed"
        );
        Ok(())
    }

    /// Short-circuit a step because `failed_step` failed permanently.
    pub async fn step_skipped(
        &self,
        workflow_id: Uuid,
        step_id: &str,
        failed_step: &str,
    ) -> Result<StepRecord, CheckpointError> {
        let mut record = StepRecord::not_started(workflow_id, step_id);
        record.status = StepStatus::Skipped;
        record.error = Some(format!("dependency '{failed_step}' failed"));
        record.error_kind = Some(ErrorKind::DependencyFailure);
        record.completed_at = Some(Utc::now());
        self.save(&record).await?;
        tracing::debug!(workflow_id = %workflow_id, step_id, failed_step, "checkpointed step skipped");
        Ok(record)
    }

    async fn save(&self, record: &StepRecord) -> Result<(), CheckpointError> {
        self.repo.save_step(record).await.map_err(repo_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryWorkflowRepository;
    use conduit_types::workflow::WorkflowStatus;
    use serde_json::json;

    async fn manager_with_instance() -> (CheckpointManager<InMemoryWorkflowRepository>, Uuid) {
        let manager = CheckpointManager::new(InMemoryWorkflowRepository::new());
        let id = Uuid::now_v7();
        manager
            .create_instance(&WorkflowInstance::pending(id, "linear", json!({})))
            .await
            .unwrap();
        (manager, id)
    }

    #[tokio::test]
    async fn attempt_lifecycle_is_persisted() {
        let (manager, id) = manager_with_instance().await;
        let mut record = StepRecord::not_started(id, "a");

        manager.step_attempt_started(&mut record).await.unwrap();
        assert_eq!(record.attempt_count, 1);

        let retry_at = Utc::now();
        manager
            .step_retry_scheduled(&mut record, ErrorKind::StepError, "boom", retry_at)
            .await
            .unwrap();
        manager.step_attempt_started(&mut record).await.unwrap();
        assert_eq!(record.attempt_count, 2);
        assert!(record.next_attempt_at.is_none());

        manager.step_completed(&mut record, json!("A")).await.unwrap();

        let (_, steps) = manager.load(id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[0].result, Some(json!("A")));
        assert!(steps[0].error.is_none());

        let history = manager.repo().history.lock().unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[1].next_attempt_at, Some(retry_at));
    }

    #[tokio::test]
    async fn skipped_step_records_dependency_failure() {
        let (manager, id) = manager_with_instance().await;
        let record = manager.step_skipped(id, "c", "b").await.unwrap();
        assert_eq!(record.status, StepStatus::Skipped);
        assert_eq!(record.error_kind, Some(ErrorKind::DependencyFailure));
        assert_eq!(record.attempt_count, 0);
        assert_eq!(record.error.as_deref(), Some("dependency 'b' failed"));
    }

    #[tokio::test]
    async fn instance_transitions() {
        let (manager, id) = manager_with_instance().await;
        let owner = Uuid::now_v7();
        assert!(manager.instance_claimed(id, owner, Duration::from_secs(30)).await.unwrap());
        assert!(!manager.instance_claimed(id, owner, Duration::from_secs(30)).await.unwrap());
        assert!(manager.lease_renewed(id, owner, Duration::from_secs(30)).await.unwrap());
        manager
            .instance_failed(id, ErrorKind::StepTimeout, "step 'a' timed out")
            .await
            .unwrap();

        let (instance, _) = manager.load(id).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert_eq!(instance.error_kind, Some(ErrorKind::StepTimeout));
        assert!(instance.started_at.is_some());
        assert!(instance.completed_at.is_some());
    }

    #[tokio::test]
    async fn load_missing_instance() {
        let manager = CheckpointManager::new(InMemoryWorkflowRepository::new());
        let err = manager.load(Uuid::nil()).await.unwrap_err();
        assert!(matches!(err, CheckpointError::InstanceNotFound(_)));
    }
}
