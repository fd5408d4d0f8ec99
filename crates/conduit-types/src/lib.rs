//! Shared domain types for Conduit.
//!
//! Queue messages, workflow instances and step records, wire envelopes,
//! consensus results, configuration, and the error taxonomy.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod consensus;
pub mod envelope;
pub mod error;
pub mod event;
pub mod queue;
pub mod workflow;
