//! Infrastructure layer for Conduit.
//!
//! Implements the repository traits defined in `conduit-core` on top of
//! SQLite, and loads the global configuration file from the data directory.

pub mod config;
pub mod sqlite;
