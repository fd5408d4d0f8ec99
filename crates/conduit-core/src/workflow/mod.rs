//! Workflow engine core: definitions, DAG execution, and durable checkpointing.
//!
//! - `definition` -- builder API and validation for step graphs
//! - `dag` -- cycle detection, execution waves, ready-set computation
//! - `worker` -- the step worker port and its boxed form
//! - `context` -- immutable payload snapshots handed to workers
//! - `retry` -- retry decisions with exponential backoff
//! - `checkpoint` -- durable per-transition checkpoints
//! - `executor` -- ready-set parallel DAG executor
//! - `status` -- status and results queries
//! - `registry` -- workflow type to definition map
//! - `service` -- submission service used by producers

pub mod checkpoint;
pub mod context;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod registry;
pub mod retry;
pub mod service;
pub mod status;
pub mod worker;

pub use context::{StepContext, WorkflowPayload};
pub use definition::{StepDescriptor, WorkflowDefinition, WorkflowError};
pub use executor::{DagExecutor, ExecutionResult, ExecutorError, WorkflowExecutor};
pub use registry::WorkflowRegistry;
pub use service::{ServiceError, WorkflowService};
pub use worker::{BoxStepWorker, StepFailure, StepWorker};
