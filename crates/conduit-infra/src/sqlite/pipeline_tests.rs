//! Submission, consumption and execution against a real SQLite database.

use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit_core::consensus::{BoxSpecialist, CONSENSUS_WORKFLOW_TYPE, consensus_definition};
use conduit_core::event::EventBus;
use conduit_core::repository::{QueueRepository, WorkflowRepository};
use conduit_core::router::{
    BoxMessageHandler, ConsensusMessageHandler, HandlerRegistry, MultiQueueConsumer,
    WorkflowMessageHandler,
};
use conduit_core::workflow::{
    BoxStepWorker, DagExecutor, StepContext, StepDescriptor, StepFailure, WorkflowDefinition,
    WorkflowRegistry, WorkflowService,
};
use conduit_types::config::{ConsumerConfig, ConsumerMode};
use conduit_types::consensus::ConsensusInput;
use conduit_types::envelope::{MessageEnvelope, MessageKind};
use conduit_types::workflow::{StepStatus, WorkflowStatus};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::pool::DatabasePool;
use super::queue::SqliteQueueRepository;
use super::workflow::SqliteWorkflowRepository;

type Queue = Arc<SqliteQueueRepository>;
type Repo = Arc<SqliteWorkflowRepository>;

struct Stack {
    queue: Queue,
    repo: Repo,
    service: WorkflowService<Queue, Repo>,
    consumer: Arc<MultiQueueConsumer<Queue>>,
}

async fn stack(max_read_count: u32) -> Stack {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
    std::mem::forget(dir);
    let pool = DatabasePool::new(&url).await.unwrap();

    let queue = Arc::new(SqliteQueueRepository::new(pool.clone()));
    let repo = Arc::new(SqliteWorkflowRepository::new(pool));

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
    let consensus = registry.register(consensus_definition(BoxSpecialist::default()).unwrap());

    let executor = Arc::new(DagExecutor::new(Arc::clone(&repo), EventBus::new(64)));
    let handlers = HandlerRegistry::with_ping()
        .register(
            MessageKind::Workflow,
            BoxMessageHandler::new(WorkflowMessageHandler::new(
                Arc::clone(&executor),
                registry.clone(),
            )),
        )
        .register(
            MessageKind::ConsensusReview,
            BoxMessageHandler::new(ConsensusMessageHandler::new(executor, consensus)),
        );

    let config = ConsumerConfig {
        queues: vec!["workflow_requests".into()],
        poll_interval_ms: 10,
        batch_size: 10,
        visibility_timeout_secs: 30,
        max_read_count,
        mode: ConsumerMode::Sequential,
    };
    let consumer = Arc::new(MultiQueueConsumer::new(Arc::clone(&queue), handlers, config));
    consumer.ensure_queues().await.unwrap();

    let service = WorkflowService::new(Arc::clone(&queue), Arc::clone(&repo), registry);
    Stack {
        queue,
        repo,
        service,
        consumer,
    }
}

/// Read every live message on `queue` and return the bodies.
async fn drain(queue: &Queue, name: &str) -> Vec<Value> {
    queue.create_queue(name).await.unwrap();
    queue
        .read_batch(name, Duration::from_secs(30), 100)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.body)
        .collect()
}

#[tokio::test]
async fn linear_workflow_completes_through_the_queue() {
    let stack = stack(5).await;
    let id = stack.service.submit_workflow("linear", json!({})).await.unwrap();

    let status = stack.service.get_status(id).await.unwrap();
    assert_eq!(status.status, WorkflowStatus::Pending);

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(Arc::clone(&stack.consumer).run(shutdown.clone()));

    let deadline = Instant::now() + Duration::from_secs(10);
    while stack.queue.stats("workflow_requests").await.unwrap().total > 0 {
        assert!(Instant::now() < deadline, "request never archived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    shutdown.cancel();
    worker.await.unwrap().unwrap();

    let results = drain(&stack.queue, "workflow_results").await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["status"], "success");
    assert_eq!(results[0]["workflow_id"], id.to_string());
    assert_eq!(results[0]["results"], json!({"A": "A", "B": "B", "C": "C"}));

    let status = stack.service.get_status(id).await.unwrap();
    assert_eq!(status.status, WorkflowStatus::Completed);
    assert_eq!(status.progress_percent, 100);
    assert!(status.steps.values().all(|s| *s == StepStatus::Completed));

    let steps = stack.repo.list_steps(&id).await.unwrap();
    let a = steps.iter().find(|s| s.step_id == "A").unwrap();
    let b = steps.iter().find(|s| s.step_id == "B").unwrap();
    assert!(a.completed_at.unwrap() <= b.started_at.unwrap());

    let archived = stack.queue.list_archived("workflow_requests", 10).await.unwrap();
    assert_eq!(archived.len(), 1);
}

#[tokio::test]
async fn consensus_review_publishes_report() {
    let stack = stack(5).await;
    stack
        .service
        .submit_message(
            "workflow_requests",
            &MessageEnvelope::ConsensusReview(ConsensusInput {
                initial_confidence: 0.9,
                ..ConsensusInput::default()
            }),
        )
        .await
        .unwrap();

    assert_eq!(stack.consumer.poll_once().await.unwrap(), 1);

    let results = drain(&stack.queue, "workflow_results").await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["status"], "success");
    assert_eq!(results[0]["workflow_type"], CONSENSUS_WORKFLOW_TYPE);
    assert_eq!(results[0]["mode"], "fast");
    assert_eq!(results[0]["specialists"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn poison_message_is_dead_lettered() {
    let stack = stack(2).await;
    let id = stack
        .queue
        .send("workflow_requests", &json!({"type": "ping"}))
        .await
        .unwrap();

    // Two claims that never finish, simulating crashed workers.
    for _ in 0..2 {
        let msg = stack
            .queue
            .read("workflow_requests", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.message_id, id);
    }

    assert_eq!(stack.consumer.poll_once().await.unwrap(), 1);

    let dead = drain(&stack.queue, "workflow_requests_dlq").await;
    assert_eq!(dead.len(), 1);
    assert!(drain(&stack.queue, "workflow_results").await.is_empty());
    assert_eq!(stack.consumer.metrics().dead_lettered, 1);
}
