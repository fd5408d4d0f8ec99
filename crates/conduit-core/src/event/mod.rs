//! Workflow lifecycle event distribution.
//!
//! `EventBus` fans `WorkflowEvent`s out to every subscriber through a
//! `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::EventBus;
