//! Redis Cluster access layer
//!
//! Provides the resilient cluster connection and the slot arithmetic the
//! mailbox key scheme depends on.
//!
//! # Modules
//!
//! - `ClusterConnection`: breaker + retry + deadline around a cluster client
//! - `CircuitBreaker`: Prevents cascading failures when the cluster is unavailable
//! - `RetryPolicy` / `ExponentialBackoff`: bounded retries for transient faults
//! - `ClusterHealth`: last outcome and last failed operation per client
//! - `slots`: CRC16 key slots and minimal per-slot hash tags

mod backoff;
mod circuit_breaker;
mod cluster;
mod health;
pub mod slots;

pub use backoff::{BackoffConfig, ExponentialBackoff, RetryPolicy};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use cluster::{ClusterConnection, ClusterError};
pub use health::{CallFailure, ClusterHealth, ClusterHealthStats, ClusterHealthStatus};

/// Get current time in milliseconds since epoch
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
