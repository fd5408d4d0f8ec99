//! Workflow submission service.
//!
//! The producer-side entry point: creates `pending` instances and enqueues
//! the request for a worker to pick up. Never waits for completion.

use conduit_types::envelope::MessageEnvelope;
use conduit_types::error::{QueueError, RepositoryError};
use conduit_types::workflow::{WorkflowInstance, WorkflowStatus, WorkflowStatusReport};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::repository::queue::QueueRepository;
use crate::repository::workflow::WorkflowRepository;

use super::registry::WorkflowRegistry;
use super::status::{ResultsLookup, load_results};

/// Default queue for workflow submissions.
pub const DEFAULT_SUBMISSION_QUEUE: &str = "workflow_requests";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("workflow instance not found: {0}")]
    NotFound(Uuid),

    #[error("workflow {workflow_id} is not completed (status: {status})")]
    NotCompleted {
        workflow_id: Uuid,
        status: WorkflowStatus,
    },

    #[error("unknown workflow type: '{0}'")]
    UnknownWorkflowType(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Submits workflows and reads back their state.
///
/// Generic over both storage ports so producers, workers and tests can
/// share one implementation.
pub struct WorkflowService<Q: QueueRepository, W: WorkflowRepository> {
    queue: Q,
    repo: W,
    registry: WorkflowRegistry,
    submission_queue: String,
}

impl<Q: QueueRepository, W: WorkflowRepository> WorkflowService<Q, W> {
    pub fn new(queue: Q, repo: W, registry: WorkflowRegistry) -> Self {
        Self {
            queue,
            repo,
            registry,
            submission_queue: DEFAULT_SUBMISSION_QUEUE.to_string(),
        }
    }

    pub fn with_submission_queue(mut self, queue: impl Into<String>) -> Self {
        self.submission_queue = queue.into();
        self
    }

    pub fn submission_queue(&self) -> &str {
        &self.submission_queue
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Create a `pending` instance and enqueue a `workflow` envelope for it.
    ///
    /// Returns the new workflow id as soon as the message is durable.
    pub async fn submit_workflow(
        &self,
        workflow_type: &str,
        payload: Value,
    ) -> Result<Uuid, ServiceError> {
        if !self.registry.contains(workflow_type) {
            return Err(ServiceError::UnknownWorkflowType(workflow_type.to_string()));
        }

        let workflow_id = Uuid::now_v7();
        let instance = WorkflowInstance::pending(workflow_id, workflow_type, payload.clone());
        self.repo.create_instance(&instance).await?;

        let envelope = MessageEnvelope::Workflow {
            workflow_type: workflow_type.to_string(),
            workflow_id: Some(workflow_id),
            payload,
        };
        self.queue.create_queue(&self.submission_queue).await?;
        let message_id = self
            .queue
            .send(&self.submission_queue, &envelope.to_value())
            .await?;

        tracing::info!(
            workflow_id = %workflow_id,
            workflow_type,
            queue = self.submission_queue.as_str(),
            message_id,
            "workflow submitted"
        );
        Ok(workflow_id)
    }

    /// Enqueue an arbitrary envelope. Returns the message id.
    pub async fn submit_message(
        &self,
        queue: &str,
        envelope: &MessageEnvelope,
    ) -> Result<i64, ServiceError> {
        self.queue.create_queue(queue).await?;
        let message_id = self.queue.send(queue, &envelope.to_value()).await?;
        tracing::debug!(queue, message_id, kind = %envelope.kind(), "message submitted");
        Ok(message_id)
    }

    /// Snapshot with per-step statuses.
    ///
    /// Instances not yet picked up by a worker have no step records; their
    /// progress is measured against the registered definition.
    pub async fn get_status(&self, workflow_id: Uuid) -> Result<WorkflowStatusReport, ServiceError> {
        let instance = self
            .repo
            .get_instance(&workflow_id)
            .await?
            .ok_or(ServiceError::NotFound(workflow_id))?;
        let records = self.repo.list_steps(&workflow_id).await?;
        let total = self
            .registry
            .get(&instance.workflow_type)
            .map(|d| d.steps.len());
        Ok(WorkflowStatusReport::from_records(&instance, &records, total))
    }

    pub async fn get_results(&self, workflow_id: Uuid) -> Result<Value, ServiceError> {
        match load_results(&self.repo, &workflow_id).await? {
            ResultsLookup::Ready(results) => Ok(results),
            ResultsLookup::NotCompleted(status) => {
                Err(ServiceError::NotCompleted { workflow_id, status })
            }
            ResultsLookup::NotFound => Err(ServiceError::NotFound(workflow_id)),
        }
    }

    pub async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, ServiceError> {
        Ok(self.repo.list_instances(status, limit).await?)
    }
}
