//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use crate::redis::CircuitState;

use super::{CLUSTER_CIRCUIT_BREAKER_STATE, CLUSTER_COMMANDS_TOTAL, CLUSTER_COMMAND_LATENCY};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording cluster call metrics
pub struct ClusterMetrics;

impl ClusterMetrics {
    /// Record a call that reached the cluster and succeeded
    pub fn record_success(client: &str) {
        CLUSTER_COMMANDS_TOTAL
            .with_label_values(&[client, "success"])
            .inc();
    }

    /// Record a call that failed after its retries
    pub fn record_failure(client: &str) {
        CLUSTER_COMMANDS_TOTAL
            .with_label_values(&[client, "failure"])
            .inc();
    }

    /// Record a single retried attempt
    pub fn record_retry(client: &str) {
        CLUSTER_COMMANDS_TOTAL
            .with_label_values(&[client, "retry"])
            .inc();
    }

    /// Record a call rejected by an open circuit
    pub fn record_rejected(client: &str) {
        CLUSTER_COMMANDS_TOTAL
            .with_label_values(&[client, "rejected"])
            .inc();
    }

    /// Record how long a call took from its first attempt to its outcome
    pub fn observe_latency(client: &str, operation: &str, elapsed: Duration) {
        CLUSTER_COMMAND_LATENCY
            .with_label_values(&[client, operation])
            .observe(elapsed.as_secs_f64());
    }

    /// Publish the breaker state
    pub fn set_circuit_state(client: &str, state: CircuitState) {
        CLUSTER_CIRCUIT_BREAKER_STATE
            .with_label_values(&[client])
            .set(state as i64);
    }
}
