//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (conduit-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod queue;
pub mod workflow;

pub use queue::QueueRepository;
pub use workflow::WorkflowRepository;
