//! Broker endpoints served under the reserved `/_fmq/` prefix.

mod health;
mod metrics;

pub use health::{health, HealthResponse, QueueHealthResponse};
pub use metrics::prometheus_metrics;
