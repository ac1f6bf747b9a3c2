use std::time::Duration;

use super::{CACHE_EVENTS_TOTAL, CACHE_OPERATION_LATENCY};

/// Sink for timers and counters, keyed by a stable operation or event name.
pub trait MetricsRecorder: Send + Sync {
    fn record_latency(&self, operation: &str, elapsed: Duration);

    fn increment(&self, event: &str, count: u64);
}

/// Records into the process-wide Prometheus registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusRecorder;

impl MetricsRecorder for PrometheusRecorder {
    fn record_latency(&self, operation: &str, elapsed: Duration) {
        CACHE_OPERATION_LATENCY
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    fn increment(&self, event: &str, count: u64) {
        CACHE_EVENTS_TOTAL.with_label_values(&[event]).inc_by(count);
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {
    fn record_latency(&self, _operation: &str, _elapsed: Duration) {}

    fn increment(&self, _event: &str, _count: u64) {}
}
