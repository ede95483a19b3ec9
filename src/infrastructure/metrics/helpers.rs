//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    CLIENT_ERRORS_TOTAL, LISTENERS_REGISTERED_TOTAL, MESSAGES_GRABBED_TOTAL,
    MESSAGES_PEEKED_TOTAL, MESSAGES_POLLED_TOTAL, MESSAGES_PUT_TOTAL, PUT_REJECTED_TOTAL,
    QUEUES_REGISTERED, REQUESTS_TOTAL, WAKEUP_ATTEMPTS_TOTAL, WAKEUP_FAILURES_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording queue operation metrics
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn record_put() {
        MESSAGES_PUT_TOTAL.inc();
    }

    pub fn record_polled() {
        MESSAGES_POLLED_TOTAL.inc();
    }

    pub fn record_peeked() {
        MESSAGES_PEEKED_TOTAL.inc();
    }

    pub fn record_grabbed() {
        MESSAGES_GRABBED_TOTAL.inc();
    }

    /// Record a put rejected by the named limit (`max_messages` or `max_size`)
    pub fn record_rejected(limit: &str) {
        PUT_REJECTED_TOTAL.with_label_values(&[limit]).inc();
    }

    pub fn set_registered_queues(count: usize) {
        QUEUES_REGISTERED.set(count as i64);
    }
}

/// Helper struct for recording listener metrics
pub struct ListenerMetrics;

impl ListenerMetrics {
    pub fn record_registered() {
        LISTENERS_REGISTERED_TOTAL.inc();
    }

    pub fn record_wakeup(success: bool) {
        WAKEUP_ATTEMPTS_TOTAL.inc();
        if !success {
            WAKEUP_FAILURES_TOTAL.inc();
        }
    }
}

/// Helper struct for recording request metrics
pub struct RequestMetrics;

impl RequestMetrics {
    pub fn record(verb: &str, status: u16) {
        REQUESTS_TOTAL
            .with_label_values(&[verb, &status.to_string()])
            .inc();
    }

    pub fn record_client_error(kind: &str) {
        CLIENT_ERRORS_TOTAL.with_label_values(&[kind]).inc();
    }
}
