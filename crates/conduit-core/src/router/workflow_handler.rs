//! Handlers that turn queue messages into workflow runs.

use std::sync::Arc;

use conduit_types::envelope::MessageEnvelope;
use conduit_types::error::ErrorKind;
use conduit_types::queue::QueueMessage;
use serde_json::{Map, Value};

use super::handler::{HandlerError, HandlerOutput, MessageHandler};
use crate::consensus::report_from_results;
use crate::workflow::definition::WorkflowDefinition;
use crate::workflow::executor::{ExecutionResult, ExecutorError, WorkflowExecutor};
use crate::workflow::registry::WorkflowRegistry;

/// Runs `workflow` envelopes through the executor.
///
/// Envelopes carrying a `workflow_id` run the pre-created instance, so a
/// redelivered message resumes the same run instead of starting another.
/// While another worker still holds that run, the message is deferred.
pub struct WorkflowMessageHandler<E: WorkflowExecutor> {
    executor: Arc<E>,
    registry: WorkflowRegistry,
}

impl<E: WorkflowExecutor> WorkflowMessageHandler<E> {
    pub fn new(executor: Arc<E>, registry: WorkflowRegistry) -> Self {
        Self { executor, registry }
    }
}

impl<E: WorkflowExecutor> MessageHandler for WorkflowMessageHandler<E> {
    async fn handle(
        &self,
        message: &QueueMessage,
        envelope: MessageEnvelope,
    ) -> Result<HandlerOutput, HandlerError> {
        let MessageEnvelope::Workflow {
            workflow_type,
            workflow_id,
            payload,
        } = envelope
        else {
            return Err(HandlerError::new(
                ErrorKind::UnknownMessageType,
                "workflow handler received a non-workflow envelope",
            ));
        };

        let Some(definition) = self.registry.get(&workflow_type) else {
            tracing::warn!(
                queue = message.queue_name.as_str(),
                message_id = message.message_id,
                workflow_type = workflow_type.as_str(),
                "no definition registered for workflow type"
            );
            let err = HandlerError::new(
                ErrorKind::UnknownMessageType,
                format!("unknown workflow type: '{workflow_type}'"),
            );
            return Err(match workflow_id {
                Some(id) => err.with_workflow_id(id),
                None => err,
            });
        };

        let run = match workflow_id {
            Some(id) => self.executor.run_instance(&definition, id).await,
            None => self.executor.execute(&definition, payload).await,
        };

        let result = run.map_err(|e| executor_failure(e, workflow_id))?;
        outcome(result, |results, out| {
            out.insert("results".into(), results.clone());
        })
    }
}

/// Runs `consensus_review` envelopes through the consensus definition.
///
/// The consensus report is flattened into the published result.
pub struct ConsensusMessageHandler<E: WorkflowExecutor> {
    executor: Arc<E>,
    definition: Arc<WorkflowDefinition>,
}

impl<E: WorkflowExecutor> ConsensusMessageHandler<E> {
    pub fn new(executor: Arc<E>, definition: Arc<WorkflowDefinition>) -> Self {
        Self {
            executor,
            definition,
        }
    }
}

impl<E: WorkflowExecutor> MessageHandler for ConsensusMessageHandler<E> {
    async fn handle(
        &self,
        _message: &QueueMessage,
        envelope: MessageEnvelope,
    ) -> Result<HandlerOutput, HandlerError> {
        let MessageEnvelope::ConsensusReview(input) = envelope else {
            return Err(HandlerError::new(
                ErrorKind::UnknownMessageType,
                "consensus handler received a non-consensus envelope",
            ));
        };

        let input = serde_json::to_value(&input)
            .map_err(|e| HandlerError::new(ErrorKind::StepError, e.to_string()))?;
        let result = self
            .executor
            .execute(&self.definition, input)
            .await
            .map_err(|e| executor_failure(e, None))?;

        outcome(result, |results, out| {
            if let Ok(Value::Object(report)) = report_from_results(results)
                .and_then(|report| serde_json::to_value(report))
            {
                out.extend(report);
            }
        })
    }
}

/// Map a terminal execution result to handler output or a handled failure.
fn outcome(
    result: ExecutionResult,
    fill: impl FnOnce(&Value, &mut Map<String, Value>),
) -> Result<HandlerOutput, HandlerError> {
    if !result.is_completed() {
        let failure = HandlerError::new(
            result.error_kind.unwrap_or(ErrorKind::StepError),
            result.error.unwrap_or_else(|| "workflow failed".to_string()),
        );
        return Err(failure.with_workflow_id(result.workflow_id));
    }

    let mut out = Map::new();
    out.insert("workflow_type".into(), Value::String(result.workflow_type.clone()));
    out.insert(
        "final_steps".into(),
        Value::Array(result.final_steps.iter().cloned().map(Value::String).collect()),
    );
    if let Some(results) = &result.results {
        fill(results, &mut out);
    }
    Ok(HandlerOutput::new(out).with_workflow_id(result.workflow_id))
}

/// A run held by another executor is deferred, not failed.
fn executor_failure(error: ExecutorError, workflow_id: Option<uuid::Uuid>) -> HandlerError {
    let mut failure = match error {
        ExecutorError::AlreadyRunning(_) => {
            HandlerError::deferred(error.error_kind(), error.to_string())
        }
        _ => HandlerError::new(error.error_kind(), error.to_string()),
    };
    failure.workflow_id = workflow_id;
    failure
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{BoxSpecialist, consensus_definition};
    use crate::event::EventBus;
    use crate::repository::WorkflowRepository;
    use crate::testing::InMemoryWorkflowRepository;
    use crate::workflow::definition::StepDescriptor;
    use crate::workflow::executor::DagExecutor;
    use crate::workflow::worker::{BoxStepWorker, StepFailure};
    use crate::workflow::StepContext;
    use chrono::Utc;
    use conduit_types::consensus::ConsensusInput;
    use conduit_types::workflow::{RetryPolicy, WorkflowInstance, WorkflowStatus};
    use serde_json::json;
    use uuid::Uuid;

    type Executor = DagExecutor<Arc<InMemoryWorkflowRepository>>;

    fn message() -> QueueMessage {
        QueueMessage {
            queue_name: "workflow_requests".into(),
            message_id: 7,
            enqueued_at: Utc::now(),
            visible_at: Utc::now(),
            read_count: 1,
            body: json!({}),
        }
    }

    fn setup() -> (WorkflowMessageHandler<Executor>, Arc<InMemoryWorkflowRepository>) {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let executor = Arc::new(DagExecutor::new(Arc::clone(&repo), EventBus::new(64)));
        let registry = WorkflowRegistry::new();
        let named = || {
            BoxStepWorker::from_fn(|ctx: StepContext| async move {
                Ok::<Value, StepFailure>(json!(ctx.step_id()))
            })
        };
        registry.register(
            WorkflowDefinition::builder("linear", "1")
                .step(StepDescriptor::from_box("A", named()))
                .step(StepDescriptor::from_box("B", named()).depends_on(["A"]))
                .step(StepDescriptor::from_box("C", named()).depends_on(["B"]))
                .build()
                .unwrap(),
        );
        registry.register(
            WorkflowDefinition::builder("broken", "1")
                .step(
                    StepDescriptor::from_box(
                        "x",
                        BoxStepWorker::from_fn(|_| async {
                            Err::<Value, StepFailure>(StepFailure::new("bad input"))
                        }),
                    )
                    .retry(RetryPolicy::no_retry()),
                )
                .build()
                .unwrap(),
        );
        (WorkflowMessageHandler::new(executor, registry), repo)
    }

    fn workflow(workflow_type: &str, workflow_id: Option<Uuid>) -> MessageEnvelope {
        MessageEnvelope::Workflow {
            workflow_type: workflow_type.into(),
            workflow_id,
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn runs_registered_workflow() {
        let (handler, _) = setup();
        let out = handler.handle(&message(), workflow("linear", None)).await.unwrap();

        assert!(out.workflow_id.is_some());
        assert_eq!(out.result["results"], json!({"A": "A", "B": "B", "C": "C"}));
        assert_eq!(out.result["final_steps"], json!(["C"]));
        assert_eq!(out.result["workflow_type"], "linear");
    }

    #[tokio::test]
    async fn runs_pre_created_instance() {
        let (handler, repo) = setup();
        let id = Uuid::now_v7();
        repo.create_instance(&WorkflowInstance::pending(id, "linear", json!({})))
            .await
            .unwrap();

        let out = handler.handle(&message(), workflow("linear", Some(id))).await.unwrap();
        assert_eq!(out.workflow_id, Some(id));

        let instance = repo.get_instance(&id).await.unwrap().unwrap();
        assert_eq!(instance.status, WorkflowStatus::Completed);

        // Redelivery of the same message returns the stored outcome.
        let again = handler.handle(&message(), workflow("linear", Some(id))).await.unwrap();
        assert_eq!(again.result["results"], out.result["results"]);
    }

    #[tokio::test]
    async fn run_held_by_another_worker_is_deferred() {
        let (handler, repo) = setup();
        let id = Uuid::now_v7();
        repo.create_instance(&WorkflowInstance::pending(id, "linear", json!({})))
            .await
            .unwrap();
        let now = Utc::now();
        repo.claim_instance(&id, Uuid::now_v7(), now, now + chrono::Duration::seconds(60))
            .await
            .unwrap();

        let err = handler
            .handle(&message(), workflow("linear", Some(id)))
            .await
            .unwrap_err();
        assert!(err.deferred);
        assert_eq!(err.workflow_id, Some(id));

        let instance = repo.get_instance(&id).await.unwrap().unwrap();
        assert_eq!(instance.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn unknown_workflow_type_is_reported() {
        let (handler, _) = setup();
        let err = handler
            .handle(&message(), workflow("train_model", None))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownMessageType);
        assert!(err.message.contains("train_model"));
    }

    #[tokio::test]
    async fn failed_run_becomes_handler_error() {
        let (handler, _) = setup();
        let err = handler.handle(&message(), workflow("broken", None)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::StepError);
        assert!(err.message.contains("bad input"));
        assert!(err.workflow_id.is_some());
        assert!(!err.deferred);
    }

    #[tokio::test]
    async fn missing_instance_is_reported() {
        let (handler, _) = setup();
        let err = handler
            .handle(&message(), workflow("linear", Some(Uuid::nil())))
            .await
            .unwrap_err();
        assert_eq!(err.workflow_id, Some(Uuid::nil()));
        assert!(err.message.contains("not found"));
    }

    #[tokio::test]
    async fn consensus_report_is_flattened() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let executor = Arc::new(DagExecutor::new(repo, EventBus::new(64)));
        let definition = Arc::new(consensus_definition(BoxSpecialist::default()).unwrap());
        let handler = ConsensusMessageHandler::new(executor, definition);

        let envelope = MessageEnvelope::ConsensusReview(ConsensusInput {
            initial_confidence: 0.90,
            ..ConsensusInput::default()
        });
        let out = handler.handle(&message(), envelope).await.unwrap();

        assert_eq!(out.result["mode"], "fast");
        assert_eq!(out.result["specialists"].as_array().unwrap().len(), 1);
        assert_eq!(out.result["workflow_type"], "consensus_review");
    }
}
