//! Relational store module.
//!
//! Provides the shared connection pool and schema setup for database-backed
//! queues.

pub mod pool;

pub use pool::{is_valid_identifier, DatabasePool, DatabasePoolError, Dialect};
