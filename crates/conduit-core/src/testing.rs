//! In-memory repository doubles shared by the unit tests of this crate.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use conduit_types::error::{ErrorKind, QueueError, RepositoryError};
use conduit_types::queue::{AckOutcome, ArchivedMessage, QueueMessage, QueueStats, clamp_visibility};
use conduit_types::workflow::{StepRecord, WorkflowInstance, WorkflowStatus};
use serde_json::Value;
use uuid::Uuid;

use crate::repository::{QueueRepository, WorkflowRepository};

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    next_id: i64,
    queues: BTreeMap<String, Vec<QueueMessage>>,
    archive: BTreeMap<String, Vec<ArchivedMessage>>,
}

#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    /// When set, every operation fails with `QueueError::Storage`.
    pub fail_storage: AtomicBool,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.fail_storage.load(Ordering::SeqCst) {
            return Err(QueueError::Storage("storage offline".to_string()));
        }
        Ok(())
    }

    /// Live message bodies in id order, regardless of visibility.
    pub fn bodies(&self, queue: &str) -> Vec<Value> {
        let state = self.state.lock().unwrap();
        state
            .queues
            .get(queue)
            .map(|msgs| msgs.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn archived_ids(&self, queue: &str) -> Vec<i64> {
        let state = self.state.lock().unwrap();
        state
            .archive
            .get(queue)
            .map(|msgs| msgs.iter().map(|m| m.message_id).collect())
            .unwrap_or_default()
    }

    /// Force a message's read count, simulating many prior redeliveries.
    pub fn set_read_count(&self, queue: &str, message_id: i64, read_count: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(msg) = state
            .queues
            .get_mut(queue)
            .and_then(|msgs| msgs.iter_mut().find(|m| m.message_id == message_id))
        {
            msg.read_count = read_count;
        }
    }

    fn enqueue(&self, queue: &str, body: &Value, delay: Duration) -> Result<i64, QueueError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        if !state.queues.contains_key(queue) {
            return Err(QueueError::QueueNotFound(queue.to_string()));
        }
        state.next_id += 1;
        let id = state.next_id;
        let now = Utc::now();
        let msg = QueueMessage {
            queue_name: queue.to_string(),
            message_id: id,
            enqueued_at: now,
            visible_at: now + hide_for(delay),
            read_count: 0,
            body: body.clone(),
        };
        state.queues.get_mut(queue).unwrap().push(msg);
        Ok(id)
    }
}

fn hide_for(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(clamp_visibility(d)).unwrap_or_default()
}

impl QueueRepository for InMemoryQueue {
    async fn create_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.queues.entry(queue.to_string()).or_default();
        state.archive.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn create_queue_strict(&self, queue: &str) -> Result<(), QueueError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        if state.queues.contains_key(queue) {
            return Err(QueueError::AlreadyExists(queue.to_string()));
        }
        state.queues.insert(queue.to_string(), Vec::new());
        state.archive.insert(queue.to_string(), Vec::new());
        Ok(())
    }

    async fn send(&self, queue: &str, body: &Value) -> Result<i64, QueueError> {
        self.enqueue(queue, body, Duration::ZERO)
    }

    async fn send_delayed(
        &self,
        queue: &str,
        body: &Value,
        delay: Duration,
    ) -> Result<i64, QueueError> {
        self.enqueue(queue, body, delay)
    }

    async fn read(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>, QueueError> {
        Ok(self.read_batch(queue, visibility_timeout, 1).await?.pop())
    }

    async fn read_batch(
        &self,
        queue: &str,
        visibility_timeout: Duration,
        limit: usize,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let msgs = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
        let now = Utc::now();
        let hidden_until = now + hide_for(visibility_timeout);
        let mut claimed = Vec::new();
        for msg in msgs.iter_mut().filter(|m| m.visible_at <= now).take(limit) {
            msg.visible_at = hidden_until;
            msg.read_count += 1;
            claimed.push(msg.clone());
        }
        Ok(claimed)
    }

    async fn acknowledge(&self, queue: &str, message_id: i64) -> Result<AckOutcome, QueueError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let msgs = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
        let before = msgs.len();
        msgs.retain(|m| m.message_id != message_id);
        Ok(if msgs.len() < before {
            AckOutcome::Deleted
        } else {
            AckOutcome::NotFound
        })
    }

    async fn nack(&self, queue: &str, message_id: i64) -> Result<bool, QueueError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let msgs = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
        match msgs.iter_mut().find(|m| m.message_id == message_id) {
            Some(msg) => {
                msg.visible_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn extend_visibility(
        &self,
        queue: &str,
        message_id: i64,
        visibility_timeout: Duration,
    ) -> Result<bool, QueueError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let msgs = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
        match msgs.iter_mut().find(|m| m.message_id == message_id) {
            Some(msg) => {
                msg.visible_at = Utc::now() + hide_for(visibility_timeout);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn archive(&self, queue: &str, message_id: i64) -> Result<bool, QueueError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let msgs = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
        let Some(pos) = msgs.iter().position(|m| m.message_id == message_id) else {
            return Ok(false);
        };
        let msg = msgs.remove(pos);
        state.archive.entry(queue.to_string()).or_default().push(ArchivedMessage {
            queue_name: msg.queue_name,
            message_id: msg.message_id,
            enqueued_at: msg.enqueued_at,
            archived_at: Utc::now(),
            read_count: msg.read_count,
            body: msg.body,
        });
        Ok(true)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        self.check()?;
        let state = self.state.lock().unwrap();
        let msgs = state
            .queues
            .get(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
        let now = Utc::now();
        let in_flight = msgs.iter().filter(|m| m.visible_at > now).count() as u64;
        Ok(QueueStats::new(msgs.len() as u64, in_flight))
    }

    async fn purge(&self, queue: &str) -> Result<u64, QueueError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let msgs = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
        let count = msgs.len() as u64;
        msgs.clear();
        Ok(count)
    }

    async fn drop_queue(&self, queue: &str) -> Result<bool, QueueError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.archive.remove(queue);
        Ok(state.queues.remove(queue).is_some())
    }

    async fn list_queues(&self) -> Result<Vec<String>, QueueError> {
        self.check()?;
        Ok(self.state.lock().unwrap().queues.keys().cloned().collect())
    }

    async fn list_archived(
        &self,
        queue: &str,
        limit: u32,
    ) -> Result<Vec<ArchivedMessage>, QueueError> {
        self.check()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .archive
            .get(queue)
            .map(|msgs| msgs.iter().rev().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Workflow state
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    instances: Mutex<BTreeMap<Uuid, WorkflowInstance>>,
    steps: Mutex<BTreeMap<(Uuid, String), StepRecord>>,
    /// Every saved step record, in save order.
    pub history: Mutex<Vec<StepRecord>>,
    /// Run lease per running instance: `(owner, expires_at)`.
    leases: Mutex<BTreeMap<Uuid, (Uuid, DateTime<Utc>)>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_instance<T>(
        &self,
        id: &Uuid,
        f: impl FnOnce(&mut WorkflowInstance) -> T,
    ) -> Result<T, RepositoryError> {
        let mut instances = self.instances.lock().unwrap();
        let instance = instances.get_mut(id).ok_or(RepositoryError::NotFound)?;
        Ok(f(instance))
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let mut instances = self.instances.lock().unwrap();
        if instances.contains_key(&instance.id) {
            return Err(RepositoryError::Conflict(instance.id.to_string()));
        }
        instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.instances.lock().unwrap().get(id).cloned())
    }

    async fn claim_instance(
        &self,
        id: &Uuid,
        owner: Uuid,
        started_at: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut instances = self.instances.lock().unwrap();
        let Some(instance) = instances.get_mut(id) else {
            return Ok(false);
        };
        if instance.status != WorkflowStatus::Pending {
            return Ok(false);
        }
        instance.status = WorkflowStatus::Running;
        instance.started_at.get_or_insert(started_at);
        self.leases.lock().unwrap().insert(*id, (owner, lease_until));
        Ok(true)
    }

    async fn take_over_instance(
        &self,
        id: &Uuid,
        owner: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let instances = self.instances.lock().unwrap();
        if instances.get(id).map(|i| i.status) != Some(WorkflowStatus::Running) {
            return Ok(false);
        }
        let mut leases = self.leases.lock().unwrap();
        if matches!(leases.get(id), Some((_, expires_at)) if *expires_at > now) {
            return Ok(false);
        }
        leases.insert(*id, (owner, lease_until));
        Ok(true)
    }

    async fn renew_lease(
        &self,
        id: &Uuid,
        owner: Uuid,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let instances = self.instances.lock().unwrap();
        if instances.get(id).map(|i| i.status) != Some(WorkflowStatus::Running) {
            return Ok(false);
        }
        let mut leases = self.leases.lock().unwrap();
        match leases.get_mut(id) {
            Some(lease) if lease.0 == owner => {
                lease.1 = lease_until;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_payload(&self, id: &Uuid, payload: &Value) -> Result<(), RepositoryError> {
        self.with_instance(id, |i| i.payload = payload.clone())
    }

    async fn complete_instance(
        &self,
        id: &Uuid,
        payload: &Value,
        results: &Value,
        completed_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.with_instance(id, |i| {
            i.status = WorkflowStatus::Completed;
            i.payload = payload.clone();
            i.results = Some(results.clone());
            i.completed_at = Some(completed_at);
        })
    }

    async fn fail_instance(
        &self,
        id: &Uuid,
        error: &str,
        kind: ErrorKind,
        completed_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.with_instance(id, |i| {
            i.status = WorkflowStatus::Failed;
            i.error = Some(error.to_string());
            i.error_kind = Some(kind);
            i.completed_at = Some(completed_at);
        })
    }

    async fn list_instances(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let instances = self.instances.lock().unwrap();
        Ok(instances
            .values()
            .rev()
            .filter(|i| status.is_none_or(|s| i.status == s))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn save_step(&self, record: &StepRecord) -> Result<(), RepositoryError> {
        self.steps
            .lock()
            .unwrap()
            .insert((record.workflow_id, record.step_id.clone()), record.clone());
        self.history.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn list_steps(&self, workflow_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        Ok(self
            .steps
            .lock()
            .unwrap()
            .iter()
            .filter(|((id, _), _)| id == workflow_id)
            .map(|(_, r)| r.clone())
            .collect())
    }
}
