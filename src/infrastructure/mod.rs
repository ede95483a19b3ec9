//! Infrastructure layer modules
//!
//! This module contains shared infrastructure components:
//! - `config`: Application configuration and settings
//! - `database`: Relational connection pool and queue schema
//! - `error`: Protocol boundary error type
//! - `metrics`: Prometheus metrics helpers

pub mod config;
pub mod database;
pub mod error;
pub mod metrics;
