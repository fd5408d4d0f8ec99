//! Read-side queries over persisted workflow state.

use conduit_types::error::RepositoryError;
use conduit_types::workflow::{WorkflowStatus, WorkflowStatusReport};
use serde_json::Value;
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

/// Outcome of a results lookup. `NotFound` and `NotCompleted` stay distinct.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultsLookup {
    Ready(Value),
    NotCompleted(WorkflowStatus),
    NotFound,
}

/// Snapshot of an instance with per-step statuses, or `None` if unknown.
pub async fn load_status<R: WorkflowRepository>(
    repo: &R,
    workflow_id: &Uuid,
) -> Result<Option<WorkflowStatusReport>, RepositoryError> {
    let Some(instance) = repo.get_instance(workflow_id).await? else {
        return Ok(None);
    };
    let steps = repo.list_steps(workflow_id).await?;
    Ok(Some(WorkflowStatusReport::from_records(&instance, &steps, None)))
}

pub async fn load_results<R: WorkflowRepository>(
    repo: &R,
    workflow_id: &Uuid,
) -> Result<ResultsLookup, RepositoryError> {
    let Some(instance) = repo.get_instance(workflow_id).await? else {
        return Ok(ResultsLookup::NotFound);
    };
    match (instance.status, instance.results) {
        (WorkflowStatus::Completed, Some(results)) => Ok(ResultsLookup::Ready(results)),
        (status, _) => Ok(ResultsLookup::NotCompleted(status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryWorkflowRepository;
    use chrono::Utc;
    use conduit_types::workflow::{StepRecord, StepStatus, WorkflowInstance};
    use serde_json::json;

    #[tokio::test]
    async fn results_distinguish_missing_from_unfinished() {
        let repo = InMemoryWorkflowRepository::new();
        let id = Uuid::now_v7();

        assert_eq!(load_results(&repo, &id).await.unwrap(), ResultsLookup::NotFound);

        repo.create_instance(&WorkflowInstance::pending(id, "linear", json!({})))
            .await
            .unwrap();
        assert_eq!(
            load_results(&repo, &id).await.unwrap(),
            ResultsLookup::NotCompleted(WorkflowStatus::Pending)
        );

        repo.complete_instance(&id, &json!({}), &json!({"a": "A"}), Utc::now())
            .await
            .unwrap();
        assert_eq!(
            load_results(&repo, &id).await.unwrap(),
            ResultsLookup::Ready(json!({"a": "A"}))
        );
    }

    #[tokio::test]
    async fn status_reports_progress() {
        let repo = InMemoryWorkflowRepository::new();
        let id = Uuid::now_v7();
        repo.create_instance(&WorkflowInstance::pending(id, "linear", json!({})))
            .await
            .unwrap();
        repo.claim_instance(&id, Uuid::now_v7(), Utc::now(), Utc::now())
            .await
            .unwrap();

        let mut a = StepRecord::not_started(id, "a");
        a.status = StepStatus::Completed;
        repo.save_step(&a).await.unwrap();
        repo.save_step(&StepRecord::not_started(id, "b")).await.unwrap();

        let report = load_status(&repo, &id).await.unwrap().unwrap();
        assert_eq!(report.status, WorkflowStatus::Running);
        assert_eq!(report.progress_percent, 50);
        assert_eq!(report.steps["a"], StepStatus::Completed);

        assert!(load_status(&repo, &Uuid::nil()).await.unwrap().is_none());
    }
}
