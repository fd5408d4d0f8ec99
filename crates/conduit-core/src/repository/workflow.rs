//! Workflow repository trait definition.
//!
//! Stores workflow instances and their per-step execution records. The
//! executor persists every state transition through this port before it
//! publishes anything about it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use conduit_types::error::{ErrorKind, RepositoryError};
use conduit_types::workflow::{StepRecord, WorkflowInstance, WorkflowStatus};
use serde_json::Value;
use uuid::Uuid;

/// Repository trait for workflow execution state.
///
/// Covers two entity families:
/// - **Instances:** create, transition and query workflow instances.
/// - **Steps:** upsert and query step execution records.
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Insert a new instance. Fails with `Conflict` if the id is taken.
    fn create_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Atomic `pending -> running` claim. `owner` holds the run lease until
    /// `lease_until`. Returns `false` if the instance is not pending.
    fn claim_instance(
        &self,
        id: &Uuid,
        owner: Uuid,
        started_at: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Hand a `running` instance to `owner` if its lease expired at or before
    /// `now` (or was never recorded). Returns `false` while a live lease exists.
    fn take_over_instance(
        &self,
        id: &Uuid,
        owner: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Extend `owner`'s lease. Returns `false` once the instance is no longer
    /// running under that owner.
    fn renew_lease(
        &self,
        id: &Uuid,
        owner: Uuid,
        lease_until: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Replace the accumulated payload of a running instance.
    fn update_payload(
        &self,
        id: &Uuid,
        payload: &Value,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// `running -> completed`, recording the results view.
    fn complete_instance(
        &self,
        id: &Uuid,
        payload: &Value,
        results: &Value,
        completed_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// `running -> failed`.
    fn fail_instance(
        &self,
        id: &Uuid,
        error: &str,
        kind: ErrorKind,
        completed_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Newest first, optionally filtered by status.
    fn list_instances(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Insert or replace the record for `(workflow_id, step_id)`.
    fn save_step(
        &self,
        record: &StepRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All step records of an instance, ordered by step id.
    fn list_steps(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepRecord>, RepositoryError>> + Send;
}

impl<T: WorkflowRepository> WorkflowRepository for Arc<T> {
    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        (**self).create_instance(instance).await
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        (**self).get_instance(id).await
    }

    async fn claim_instance(
        &self,
        id: &Uuid,
        owner: Uuid,
        started_at: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        (**self)
            .claim_instance(id, owner, started_at, lease_until)
            .await
    }

    async fn take_over_instance(
        &self,
        id: &Uuid,
        owner: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        (**self)
            .take_over_instance(id, owner, now, lease_until)
            .await
    }

    async fn renew_lease(
        &self,
        id: &Uuid,
        owner: Uuid,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        (**self).renew_lease(id, owner, lease_until).await
    }

    async fn update_payload(&self, id: &Uuid, payload: &Value) -> Result<(), RepositoryError> {
        (**self).update_payload(id, payload).await
    }

    async fn complete_instance(
        &self,
        id: &Uuid,
        payload: &Value,
        results: &Value,
        completed_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        (**self).complete_instance(id, payload, results, completed_at).await
    }

    async fn fail_instance(
        &self,
        id: &Uuid,
        error: &str,
        kind: ErrorKind,
        completed_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        (**self).fail_instance(id, error, kind, completed_at).await
    }

    async fn list_instances(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        (**self).list_instances(status, limit).await
    }

    async fn save_step(&self, record: &StepRecord) -> Result<(), RepositoryError> {
        (**self).save_step(record).await
    }

    async fn list_steps(&self, workflow_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        (**self).list_steps(workflow_id).await
    }
}
