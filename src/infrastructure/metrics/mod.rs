//! Prometheus metrics for the broker.
//!
//! - Message metrics (put, polled, peeked, grabbed, rejected)
//! - Listener metrics (registrations, wakeup attempts and failures)
//! - Request metrics (by verb and status, client errors by kind)

mod helpers;

pub use helpers::{encode_metrics, ListenerMetrics, QueueMetrics, RequestMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "fmq";

lazy_static! {
    // ============================================================================
    // Message Metrics
    // ============================================================================

    /// Messages accepted by put
    pub static ref MESSAGES_PUT_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_put_total", METRIC_PREFIX),
        "Total messages accepted into a queue"
    ).unwrap();

    /// Messages handed out by destructive reads
    pub static ref MESSAGES_POLLED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_polled_total", METRIC_PREFIX),
        "Total messages removed by poll"
    ).unwrap();

    /// Messages handed out by peek
    pub static ref MESSAGES_PEEKED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_peeked_total", METRIC_PREFIX),
        "Total messages returned by peek"
    ).unwrap();

    /// Messages removed by grab
    pub static ref MESSAGES_GRABBED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_grabbed_total", METRIC_PREFIX),
        "Total peeked messages removed by grab"
    ).unwrap();

    /// Puts rejected because a queue limit would be exceeded
    pub static ref PUT_REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_put_rejected_total", METRIC_PREFIX),
        "Total puts rejected by queue limits",
        &["limit"]
    ).unwrap();

    /// Queues currently registered with the manager
    pub static ref QUEUES_REGISTERED: IntGauge = register_int_gauge!(
        format!("{}_queues_registered", METRIC_PREFIX),
        "Number of registered queues"
    ).unwrap();

    // ============================================================================
    // Listener Metrics
    // ============================================================================

    /// Listener registrations after an empty poll or peek
    pub static ref LISTENERS_REGISTERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_listeners_registered_total", METRIC_PREFIX),
        "Total long-poll listener registrations"
    ).unwrap();

    /// Wakeup connection attempts
    pub static ref WAKEUP_ATTEMPTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_wakeup_attempts_total", METRIC_PREFIX),
        "Total listener wakeup attempts"
    ).unwrap();

    /// Wakeup attempts that could not connect
    pub static ref WAKEUP_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_wakeup_failures_total", METRIC_PREFIX),
        "Total listener wakeup attempts that failed"
    ).unwrap();

    // ============================================================================
    // Request Metrics
    // ============================================================================

    /// Requests by verb and response status
    pub static ref REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_requests_total", METRIC_PREFIX),
        "Total queue requests",
        &["verb", "status"]
    ).unwrap();

    /// Client errors by kind
    pub static ref CLIENT_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_client_errors_total", METRIC_PREFIX),
        "Total requests answered with a client error",
        &["kind"]
    ).unwrap();
}
