//! Workflow executor: ready-set DAG execution with durable checkpoints.
//!
//! The `DagExecutor` launches a step the moment all of its dependencies are
//! completed; there is no wave barrier. Steps run as `JoinSet` tasks, bounded
//! by a per-workflow-type semaphore, each attempt under the step timeout and
//! a panic boundary.
//!
//! # Execution flow
//!
//! 1. Claim the instance (`pending -> running`, or take over a running
//!    instance whose lease expired) and record every step as `not_started`.
//!    The lease is renewed for as long as the run is driven here.
//! 2. Launch all ready steps with a snapshot of the current payload.
//! 3. On success, persist the result, merge it into the payload and launch
//!    whatever became ready.
//! 4. On failure, retry per the step's policy (the next attempt time is
//!    persisted) or fail the step, skip its transitive dependents and stop
//!    launching. Steps already in flight are allowed to finish.
//! 5. Mark the instance `completed` (results = every step's result) or `failed`.
//!
//! Every transition is checkpointed before the matching event is published.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use conduit_types::error::ErrorKind;
use conduit_types::event::WorkflowEvent;
use conduit_types::workflow::{
    StepRecord, StepStatus, WorkflowInstance, WorkflowStatus, WorkflowStatusReport,
};
use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowRepository;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::{MAX_STEP_RESULT_SIZE, StepContext, WorkflowPayload};
use super::dag::{get_step_dependents, ready_steps};
use super::definition::{StepDescriptor, WorkflowDefinition, WorkflowError};
use super::retry::{RetryDecision, RetryHandler};
use super::status::{ResultsLookup, load_results, load_status};

// ---------------------------------------------------------------------------
// WorkflowExecutor trait
// ---------------------------------------------------------------------------

/// Trait for workflow execution engines.
///
/// Uses RPITIT for async methods, consistent with the repository ports.
pub trait WorkflowExecutor: Send + Sync {
    /// Create a new instance for `input` and run it to a terminal state.
    fn execute(
        &self,
        definition: &WorkflowDefinition,
        input: Value,
    ) -> impl std::future::Future<Output = Result<ExecutionResult, ExecutorError>> + Send;

    /// Run an instance created earlier (e.g. by a submission service).
    fn run_instance(
        &self,
        definition: &WorkflowDefinition,
        workflow_id: Uuid,
    ) -> impl std::future::Future<Output = Result<ExecutionResult, ExecutorError>> + Send;

    /// Continue an interrupted run, skipping completed steps and honoring
    /// persisted retry times.
    fn resume(
        &self,
        definition: &WorkflowDefinition,
        workflow_id: Uuid,
    ) -> impl std::future::Future<Output = Result<ExecutionResult, ExecutorError>> + Send;
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// Terminal outcome of a workflow run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub workflow_id: Uuid,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    /// `{step_id: result}` for every step; set only when completed.
    pub results: Option<Value>,
    /// Sink steps of the definition, whose results are the terminal outputs.
    pub final_steps: Vec<String>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Steps short-circuited by a dependency failure.
    pub skipped_steps: Vec<String>,
}

impl ExecutionResult {
    pub fn is_completed(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }
}

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Errors that stop the executor itself.
///
/// Step failures are not errors here: they end in a `failed` instance and
/// an `ExecutionResult` describing it.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("workflow instance not found: {0}")]
    NotFound(Uuid),

    #[error("workflow {workflow_id} is not completed (status: {status})")]
    NotCompleted {
        workflow_id: Uuid,
        status: WorkflowStatus,
    },

    #[error("instance {workflow_id} has type '{actual}', expected '{expected}'")]
    TypeMismatch {
        workflow_id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("step task aborted: {0}")]
    TaskAborted(String),

    #[error("workflow {0} is already running under a live lease")]
    AlreadyRunning(Uuid),

    #[error("lease on workflow {0} was lost to another executor")]
    LeaseLost(Uuid),
}

impl ExecutorError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            ExecutorError::Checkpoint(_) => ErrorKind::StorageError,
            ExecutorError::TaskAborted(_) | ExecutorError::LeaseLost(_) => {
                ErrorKind::ExecutorCrash
            }
            _ => ErrorKind::StepError,
        }
    }
}

// ---------------------------------------------------------------------------
// DagExecutor
// ---------------------------------------------------------------------------

/// Outcome of one step task, after all of its attempts.
struct StepOutcome {
    step_id: String,
    attempt: u32,
    duration_ms: u64,
    result: Result<Value, (ErrorKind, String)>,
}

/// First permanent failure of a run.
struct Failure {
    step_id: String,
    kind: ErrorKind,
    error: String,
}

/// Default run lease. Renewed every third of its length while a run is driven.
pub const DEFAULT_RUN_LEASE: Duration = Duration::from_secs(30);

/// Ready-set DAG executor with durable checkpointing.
///
/// Generic over `R: WorkflowRepository` for storage flexibility.
pub struct DagExecutor<R: WorkflowRepository> {
    checkpoint: Arc<CheckpointManager<R>>,
    event_bus: EventBus,
    /// Per-workflow-type concurrency semaphores, shared across instances.
    concurrency_semaphores: DashMap<String, Arc<Semaphore>>,
    /// Lease owner id of this executor.
    owner: Uuid,
    lease: Duration,
}

impl<R: WorkflowRepository + 'static> DagExecutor<R> {
    pub fn new(repo: R, event_bus: EventBus) -> Self {
        Self {
            checkpoint: Arc::new(CheckpointManager::new(repo)),
            event_bus,
            concurrency_semaphores: DashMap::new(),
            owner: Uuid::now_v7(),
            lease: DEFAULT_RUN_LEASE,
        }
    }

    /// Override the run lease length.
    pub fn with_run_lease(mut self, lease: Duration) -> Self {
        self.lease = lease.max(Duration::from_millis(30));
        self
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub fn repo(&self) -> &R {
        self.checkpoint.repo()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Create a pending instance and run it in the background.
    ///
    /// Returns as soon as the instance is persisted.
    pub async fn start(
        self: &Arc<Self>,
        definition: Arc<WorkflowDefinition>,
        input: Value,
    ) -> Result<Uuid, ExecutorError> {
        let instance = WorkflowInstance::pending(Uuid::now_v7(), &definition.workflow_type, input);
        self.checkpoint.create_instance(&instance).await?;
        let workflow_id = instance.id;

        let executor = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = executor.run_instance(&definition, workflow_id).await {
                tracing::error!(workflow_id = %workflow_id, error = %e, "background workflow run failed");
            }
        });

        Ok(workflow_id)
    }

    pub async fn status(&self, workflow_id: Uuid) -> Result<WorkflowStatusReport, ExecutorError> {
        load_status(self.repo(), &workflow_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(ExecutorError::NotFound(workflow_id))
    }

    pub async fn results(&self, workflow_id: Uuid) -> Result<Value, ExecutorError> {
        match load_results(self.repo(), &workflow_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
        {
            ResultsLookup::Ready(results) => Ok(results),
            ResultsLookup::NotCompleted(status) => {
                Err(ExecutorError::NotCompleted { workflow_id, status })
            }
            ResultsLookup::NotFound => Err(ExecutorError::NotFound(workflow_id)),
        }
    }

    fn semaphore_for(&self, definition: &WorkflowDefinition) -> Arc<Semaphore> {
        self.concurrency_semaphores
            .entry(definition.workflow_type.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(definition.concurrency)))
            .clone()
    }

    async fn load_for(
        &self,
        definition: &WorkflowDefinition,
        workflow_id: Uuid,
    ) -> Result<(WorkflowInstance, Vec<StepRecord>), ExecutorError> {
        let (instance, steps) = match self.checkpoint.load(workflow_id).await {
            Ok(loaded) => loaded,
            Err(CheckpointError::InstanceNotFound(id)) => return Err(ExecutorError::NotFound(id)),
            Err(e) => return Err(e.into()),
        };
        if instance.workflow_type != definition.workflow_type {
            return Err(ExecutorError::TypeMismatch {
                workflow_id,
                expected: definition.workflow_type.clone(),
                actual: instance.workflow_type,
            });
        }
        Ok((instance, steps))
    }

    /// Drive an instance from its persisted state to a terminal state.
    ///
    /// Fails with `AlreadyRunning` when another executor holds the instance.
    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        instance: WorkflowInstance,
        mut persisted: Vec<StepRecord>,
    ) -> Result<ExecutionResult, ExecutorError> {
        let workflow_id = instance.id;
        let final_steps = definition.final_steps();

        if instance.status.is_terminal() {
            return Ok(stored_result(&instance, &persisted, final_steps));
        }

        let held = if instance.status == WorkflowStatus::Pending {
            self.checkpoint
                .instance_claimed(workflow_id, self.owner, self.lease)
                .await?
        } else {
            self.checkpoint
                .instance_taken_over(workflow_id, self.owner, self.lease)
                .await?
        };
        if !held {
            return Err(ExecutorError::AlreadyRunning(workflow_id));
        }
        if instance.status == WorkflowStatus::Running {
            // The previous holder may have written records after they were loaded.
            persisted = self.checkpoint.load(workflow_id).await?.1;
        }

        let mut records: HashMap<String, StepRecord> = persisted
            .into_iter()
            .map(|r| (r.step_id.clone(), r))
            .collect();

        if instance.status == WorkflowStatus::Pending {
            for step in &definition.steps {
                let record = records
                    .entry(step.id.clone())
                    .or_insert_with(|| StepRecord::not_started(workflow_id, &step.id));
                self.checkpoint.repo().save_step(record).await.map_err(|e| {
                    CheckpointError::Repository(e.to_string())
                })?;
            }
            self.event_bus.publish(WorkflowEvent::WorkflowStarted {
                workflow_id,
                workflow_type: definition.workflow_type.clone(),
                total_steps: definition.steps.len(),
            });
            tracing::info!(
                workflow_id = %workflow_id,
                workflow_type = definition.workflow_type.as_str(),
                steps = definition.steps.len(),
                "starting workflow execution"
            );
        } else {
            tracing::info!(
                workflow_id = %workflow_id,
                workflow_type = definition.workflow_type.as_str(),
                "resuming workflow execution"
            );
        }

        let run_start = Instant::now();
        let mut payload = WorkflowPayload::from_json(instance.payload)?;

        // Completed results may not have reached the payload before a crash.
        for record in records.values() {
            if let (StepStatus::Completed, Some(result)) = (record.status, &record.result) {
                if payload.step_result(&record.step_id).is_none() {
                    payload = payload.with_step_result(&record.step_id, result.clone());
                }
            }
        }

        // Scheduling view: interrupted or retry-pending steps are relaunched,
        // so they count as not started here. Their records keep attempt
        // counts and `next_attempt_at`.
        let mut statuses: HashMap<String, StepStatus> = definition
            .steps
            .iter()
            .map(|s| {
                let status = match records.get(&s.id).map(|r| r.status) {
                    Some(StepStatus::Running) | None => StepStatus::NotStarted,
                    Some(other) => other,
                };
                (s.id.clone(), status)
            })
            .collect();

        let mut failure: Option<Failure> = definition.steps.iter().find_map(|s| {
            let record = records.get(&s.id)?;
            (record.status == StepStatus::Failed).then(|| Failure {
                step_id: s.id.clone(),
                kind: record.error_kind.unwrap_or(ErrorKind::StepError),
                error: record.error.clone().unwrap_or_default(),
            })
        });

        let mut skipped_steps: Vec<String> = definition
            .steps
            .iter()
            .filter(|s| statuses.get(&s.id) == Some(&StepStatus::Skipped))
            .map(|s| s.id.clone())
            .collect();

        if let Some(f) = &failure {
            let newly = self
                .skip_dependents(definition, workflow_id, &f.step_id, &mut statuses)
                .await?;
            skipped_steps.extend(newly);
        }

        let semaphore = self.semaphore_for(definition);
        let workflow_type: Arc<str> = Arc::from(definition.workflow_type.as_str());
        let mut join_set: JoinSet<Result<StepOutcome, ExecutorError>> = JoinSet::new();

        let renew_every = self.lease / 3;
        let mut lease_ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + renew_every, renew_every);
        lease_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if failure.is_none() {
                let ready: Vec<StepDescriptor> = ready_steps(&definition.steps, &statuses)
                    .into_iter()
                    .cloned()
                    .collect();
                let snapshot = Arc::new(payload.clone());

                for step in ready {
                    statuses.insert(step.id.clone(), StepStatus::Running);
                    let record = records
                        .remove(&step.id)
                        .unwrap_or_else(|| StepRecord::not_started(workflow_id, &step.id));
                    let ctx = StepContext::new(
                        workflow_id,
                        Arc::clone(&workflow_type),
                        step.id.clone(),
                        record.attempt_count + 1,
                        Arc::clone(&snapshot),
                    );

                    tracing::debug!(workflow_id = %workflow_id, step_id = step.id.as_str(), "launching step");
                    join_set.spawn(run_step(
                        Arc::clone(&self.checkpoint),
                        self.event_bus.clone(),
                        Arc::clone(&semaphore),
                        step,
                        record,
                        ctx,
                    ));
                }
            }

            let joined = loop {
                tokio::select! {
                    joined = join_set.join_next() => break joined,
                    _ = lease_ticker.tick() => {
                        if !self.renew_lease(workflow_id).await {
                            join_set.abort_all();
                            tracing::warn!(workflow_id = %workflow_id, "run lease lost, stopping");
                            return Err(ExecutorError::LeaseLost(workflow_id));
                        }
                    }
                }
            };
            let Some(joined) = joined else {
                break;
            };

            let outcome = match joined {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    join_set.abort_all();
                    return Err(self.abandon(workflow_id, e).await);
                }
                Err(join_err) => {
                    join_set.abort_all();
                    let e = ExecutorError::TaskAborted(join_err.to_string());
                    return Err(self.abandon(workflow_id, e).await);
                }
            };

            match outcome.result {
                Ok(value) => {
                    statuses.insert(outcome.step_id.clone(), StepStatus::Completed);
                    payload = payload.with_step_result(&outcome.step_id, value);
                    self.checkpoint.payload(workflow_id, &payload.to_json()).await?;

                    self.event_bus.publish(WorkflowEvent::StepCompleted {
                        workflow_id,
                        step_id: outcome.step_id,
                        attempt: outcome.attempt,
                        duration_ms: outcome.duration_ms,
                    });
                }
                Err((kind, error)) => {
                    statuses.insert(outcome.step_id.clone(), StepStatus::Failed);
                    let newly = self
                        .skip_dependents(definition, workflow_id, &outcome.step_id, &mut statuses)
                        .await?;
                    skipped_steps.extend(newly);

                    if failure.is_none() {
                        failure = Some(Failure {
                            step_id: outcome.step_id,
                            kind,
                            error,
                        });
                    }
                }
            }
        }

        let duration_ms = run_start.elapsed().as_millis() as u64;

        if failure.is_none() {
            let pending: Vec<&str> = definition
                .steps
                .iter()
                .filter(|s| statuses.get(&s.id) != Some(&StepStatus::Completed))
                .map(|s| s.id.as_str())
                .collect();
            if !pending.is_empty() {
                failure = Some(Failure {
                    step_id: pending[0].to_string(),
                    kind: ErrorKind::ExecutorCrash,
                    error: format!("run stalled with unfinished steps: {}", pending.join(", ")),
                });
            }
        }

        if let Some(f) = failure {
            let message = format!("step '{}' failed: {}", f.step_id, f.error);
            self.checkpoint
                .instance_failed(workflow_id, f.kind, &message)
                .await?;

            tracing::warn!(
                workflow_id = %workflow_id,
                step_id = f.step_id.as_str(),
                error_kind = %f.kind,
                skipped = skipped_steps.len(),
                "workflow failed"
            );
            self.event_bus.publish(WorkflowEvent::WorkflowFailed {
                workflow_id,
                error_kind: f.kind,
                error: message.clone(),
                skipped_steps: skipped_steps.clone(),
            });

            return Ok(ExecutionResult {
                workflow_id,
                workflow_type: definition.workflow_type.clone(),
                status: WorkflowStatus::Failed,
                results: None,
                final_steps,
                error: Some(message),
                error_kind: Some(f.kind),
                skipped_steps,
            });
        }

        let results: Map<String, Value> = definition
            .steps
            .iter()
            .map(|s| {
                let result = payload.step_result(&s.id).cloned().unwrap_or(Value::Null);
                (s.id.clone(), result)
            })
            .collect();
        let results = Value::Object(results);

        self.checkpoint
            .instance_completed(workflow_id, &payload.to_json(), &results)
            .await?;

        tracing::info!(workflow_id = %workflow_id, duration_ms, "workflow completed");
        self.event_bus.publish(WorkflowEvent::WorkflowCompleted {
            workflow_id,
            duration_ms,
        });

        Ok(ExecutionResult {
            workflow_id,
            workflow_type: definition.workflow_type.clone(),
            status: WorkflowStatus::Completed,
            results: Some(results),
            final_steps,
            error: None,
            error_kind: None,
            skipped_steps,
        })
    }

    /// Mark every not-yet-started transitive dependent of `failed_step` skipped.
    async fn skip_dependents(
        &self,
        definition: &WorkflowDefinition,
        workflow_id: Uuid,
        failed_step: &str,
        statuses: &mut HashMap<String, StepStatus>,
    ) -> Result<Vec<String>, ExecutorError> {
        let mut skipped = Vec::new();
        for dependent in get_step_dependents(failed_step, &definition.steps) {
            if statuses.get(dependent) != Some(&StepStatus::NotStarted) {
                continue;
            }
            self.checkpoint
                .step_skipped(workflow_id, dependent, failed_step)
                .await?;
            statuses.insert(dependent.to_string(), StepStatus::Skipped);
            skipped.push(dependent.to_string());
        }
        Ok(skipped)
    }

    /// Renew this executor's lease. A storage error keeps the run going;
    /// only an explicit loss stops it.
    async fn renew_lease(&self, workflow_id: Uuid) -> bool {
        match self
            .checkpoint
            .lease_renewed(workflow_id, self.owner, self.lease)
            .await
        {
            Ok(held) => held,
            Err(e) => {
                tracing::warn!(workflow_id = %workflow_id, error = %e, "could not renew run lease");
                true
            }
        }
    }

    /// Best-effort failure record when the run itself cannot continue.
    async fn abandon(&self, workflow_id: Uuid, error: ExecutorError) -> ExecutorError {
        tracing::error!(workflow_id = %workflow_id, error = %error, "abandoning workflow run");
        if let Err(e) = self
            .checkpoint
            .instance_failed(workflow_id, error.error_kind(), &error.to_string())
            .await
        {
            tracing::error!(workflow_id = %workflow_id, error = %e, "could not record abandoned run");
        }
        error
    }
}

impl<R: WorkflowRepository + 'static> WorkflowExecutor for DagExecutor<R> {
    async fn execute(
        &self,
        definition: &WorkflowDefinition,
        input: Value,
    ) -> Result<ExecutionResult, ExecutorError> {
        let instance = WorkflowInstance::pending(Uuid::now_v7(), &definition.workflow_type, input);
        self.checkpoint.create_instance(&instance).await?;
        self.drive(definition, instance, Vec::new()).await
    }

    async fn run_instance(
        &self,
        definition: &WorkflowDefinition,
        workflow_id: Uuid,
    ) -> Result<ExecutionResult, ExecutorError> {
        let (instance, steps) = self.load_for(definition, workflow_id).await?;
        self.drive(definition, instance, steps).await
    }

    async fn resume(
        &self,
        definition: &WorkflowDefinition,
        workflow_id: Uuid,
    ) -> Result<ExecutionResult, ExecutorError> {
        let (instance, steps) = self.load_for(definition, workflow_id).await?;
        if instance.status == WorkflowStatus::Running {
            let done = steps
                .iter()
                .filter(|s| s.status == StepStatus::Completed)
                .count();
            tracing::info!(workflow_id = %workflow_id, completed_steps = done, "resuming from checkpoint");
        }
        self.drive(definition, instance, steps).await
    }
}

/// Rebuild the outcome of an instance that already reached a terminal state.
fn stored_result(
    instance: &WorkflowInstance,
    steps: &[StepRecord],
    final_steps: Vec<String>,
) -> ExecutionResult {
    ExecutionResult {
        workflow_id: instance.id,
        workflow_type: instance.workflow_type.clone(),
        status: instance.status,
        results: instance.results.clone(),
        final_steps,
        error: instance.error.clone(),
        error_kind: instance.error_kind,
        skipped_steps: steps
            .iter()
            .filter(|s| s.status == StepStatus::Skipped)
            .map(|s| s.step_id.clone())
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Step task
// ---------------------------------------------------------------------------

/// Run one step through all of its attempts.
///
/// Returns `Err` only when a checkpoint cannot be written; step failures are
/// reported inside `StepOutcome`.
async fn run_step<R: WorkflowRepository>(
    checkpoint: Arc<CheckpointManager<R>>,
    event_bus: EventBus,
    semaphore: Arc<Semaphore>,
    step: StepDescriptor,
    mut record: StepRecord,
    ctx: StepContext,
) -> Result<StepOutcome, ExecutorError> {
    let workflow_id = record.workflow_id;

    // An attempt that was in flight when the previous process died.
    if record.status == StepStatus::Running
        && record.next_attempt_at.is_none()
        && record.attempt_count > 0
    {
        let error = "attempt interrupted before completion".to_string();
        if let Some(outcome) = handle_failure(
            &checkpoint,
            &event_bus,
            &step,
            &mut record,
            ErrorKind::ExecutorCrash,
            error,
            0,
        )
        .await?
        {
            return Ok(outcome);
        }
    }

    loop {
        if let Some(at) = record.next_attempt_at {
            tokio::time::sleep(RetryHandler::remaining_delay(at, Utc::now())).await;
        }

        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ExecutorError::TaskAborted(e.to_string()))?;

        checkpoint.step_attempt_started(&mut record).await?;
        let attempt = record.attempt_count;
        event_bus.publish(WorkflowEvent::StepStarted {
            workflow_id,
            step_id: step.id.clone(),
            attempt,
        });

        let started = Instant::now();
        let call = AssertUnwindSafe(step.worker.run(ctx.for_attempt(attempt))).catch_unwind();
        let result = match tokio::time::timeout(step.timeout, call).await {
            Ok(Ok(Ok(value))) => check_result_size(value),
            Ok(Ok(Err(failure))) => Err((ErrorKind::StepError, failure.to_string())),
            Ok(Err(panic)) => Err((
                ErrorKind::ExecutorCrash,
                format!("worker panicked: {}", panic_message(panic.as_ref())),
            )),
            Err(_elapsed) => Err((
                ErrorKind::StepTimeout,
                format!("step '{}' timed out after {}ms", step.id, step.timeout.as_millis()),
            )),
        };
        drop(permit);
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                checkpoint.step_completed(&mut record, value.clone()).await?;
                return Ok(StepOutcome {
                    step_id: step.id.clone(),
                    attempt,
                    duration_ms,
                    result: Ok(value),
                });
            }
            Err((kind, error)) => {
                if let Some(outcome) = handle_failure(
                    &checkpoint,
                    &event_bus,
                    &step,
                    &mut record,
                    kind,
                    error,
                    duration_ms,
                )
                .await?
                {
                    return Ok(outcome);
                }
            }
        }
    }
}

/// Persist a failed attempt. Returns the final outcome when no retry remains.
async fn handle_failure<R: WorkflowRepository>(
    checkpoint: &CheckpointManager<R>,
    event_bus: &EventBus,
    step: &StepDescriptor,
    record: &mut StepRecord,
    kind: ErrorKind,
    error: String,
    duration_ms: u64,
) -> Result<Option<StepOutcome>, ExecutorError> {
    let workflow_id = record.workflow_id;
    let attempt = record.attempt_count;

    match RetryHandler::decide(&step.retry, attempt, kind, Utc::now()) {
        RetryDecision::RetryAt { next_attempt_at } => {
            checkpoint
                .step_retry_scheduled(record, kind, &error, next_attempt_at)
                .await?;
            let delay_ms = RetryHandler::remaining_delay(next_attempt_at, Utc::now()).as_millis() as u64;
            tracing::warn!(
                workflow_id = %workflow_id,
                step_id = step.id.as_str(),
                attempt,
                max_attempts = step.retry.max_attempts,
                delay_ms,
                error = error.as_str(),
                "step attempt failed, retrying"
            );
            event_bus.publish(WorkflowEvent::StepRetrying {
                workflow_id,
                step_id: step.id.clone(),
                attempt,
                delay_ms,
                error,
            });
            Ok(None)
        }
        RetryDecision::GiveUp => {
            checkpoint.step_failed(record, kind, &error).await?;
            tracing::warn!(
                workflow_id = %workflow_id,
                step_id = step.id.as_str(),
                attempt,
                error_kind = %kind,
                error = error.as_str(),
                "step failed"
            );
            event_bus.publish(WorkflowEvent::StepFailed {
                workflow_id,
                step_id: step.id.clone(),
                attempt,
                error_kind: kind,
                error: error.clone(),
            });
            Ok(Some(StepOutcome {
                step_id: step.id.clone(),
                attempt,
                duration_ms,
                result: Err((kind, error)),
            }))
        }
    }
}

fn check_result_size(value: Value) -> Result<Value, (ErrorKind, String)> {
    let size = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
    if size > MAX_STEP_RESULT_SIZE {
        return Err((
            ErrorKind::StepError,
            format!("step result of {size} bytes exceeds the {MAX_STEP_RESULT_SIZE} byte limit"),
        ));
    }
    Ok(value)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
