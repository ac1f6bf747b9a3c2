//! Prometheus metrics for the mailbox cache.
//!
//! - Operation latency per stable operation name (insert, get, removeByGuid, ...)
//! - Event counters (messages removed, stale ephemeral messages discarded)
//! - Cluster command outcomes, call latency and circuit breaker state per
//!   logical client
//!
//! The engine never touches these statics directly; it records through an
//! injected [`MetricsRecorder`].

mod helpers;
mod recorder;

pub use helpers::{encode_metrics, ClusterMetrics};
pub use recorder::{MetricsRecorder, NoopRecorder, PrometheusRecorder};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara";

lazy_static! {
    // ============================================================================
    // Messages Cache Metrics
    // ============================================================================

    /// Latency of messages cache operations
    pub static ref CACHE_OPERATION_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_messages_cache_operation_latency_seconds", METRIC_PREFIX),
        "Messages cache operation latency in seconds",
        &["operation"],
        vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    ).unwrap();

    /// Messages cache event counters
    pub static ref CACHE_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_cache_events_total", METRIC_PREFIX),
        "Messages cache events by name",
        &["event"]
    ).unwrap();

    // ============================================================================
    // Cluster Metrics
    // ============================================================================

    /// Cluster call outcomes per logical client
    pub static ref CLUSTER_COMMANDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_redis_cluster_commands_total", METRIC_PREFIX),
        "Redis Cluster calls by client and outcome",
        &["client", "outcome"]
    ).unwrap();

    /// Cluster call latency per logical client and operation, retries included
    pub static ref CLUSTER_COMMAND_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_redis_cluster_command_latency_seconds", METRIC_PREFIX),
        "Redis Cluster call latency in seconds",
        &["client", "operation"],
        vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    ).unwrap();

    /// Circuit breaker state per logical client (0=closed, 1=open, 2=half-open)
    pub static ref CLUSTER_CIRCUIT_BREAKER_STATE: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_redis_cluster_circuit_breaker_state", METRIC_PREFIX),
        "Redis Cluster circuit breaker state (0=closed, 1=open, 2=half-open)",
        &["client"]
    ).unwrap();
}
