//! Business logic and repository trait definitions for Conduit.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements, plus everything that runs on top of them: the workflow
//! executor, the queue router and the consensus workflow. It depends only on
//! `conduit-types` -- never on `conduit-infra` or any database/IO crate.

pub mod consensus;
pub mod event;
pub mod repository;
pub mod router;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
