//! Per-client call health.
//!
//! Tracks what the last calls of one logical cluster client did: how many
//! failed in a row, when one last succeeded, and which operation failed last
//! and why. The health loop in the binary logs a snapshot on every tick.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use super::{current_time_ms, ClusterError};

/// Coarse status derived from the recorded outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterHealthStatus {
    /// No call has completed yet
    Unknown,
    /// The last call succeeded
    Healthy,
    /// The last call failed after its retries
    Degraded,
    /// The last call was rejected by the circuit breaker
    CircuitOpen,
}

impl ClusterHealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterHealthStatus::Unknown => "unknown",
            ClusterHealthStatus::Healthy => "healthy",
            ClusterHealthStatus::Degraded => "degraded",
            ClusterHealthStatus::CircuitOpen => "circuit_open",
        }
    }
}

/// The most recent failed or rejected call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFailure {
    pub operation: String,
    /// Stable error class, see [`ClusterError::kind_label`]
    pub kind: &'static str,
    pub message: String,
    pub at_ms: i64,
}

#[derive(Debug, Default)]
struct Outcomes {
    status: Option<ClusterHealthStatus>,
    last_failure: Option<CallFailure>,
}

/// Health of one logical cluster client, updated by
/// [`ClusterConnection`](super::ClusterConnection) once per call.
#[derive(Debug, Default)]
pub struct ClusterHealth {
    consecutive_failures: AtomicU32,
    total_failures: AtomicU64,
    total_rejected: AtomicU64,
    last_success_ms: AtomicI64,
    outcomes: Mutex<Outcomes>,
}

impl ClusterHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.last_success_ms.store(current_time_ms(), Ordering::Release);
        self.outcomes().status = Some(ClusterHealthStatus::Healthy);
    }

    pub fn record_failure(&self, operation: &str, error: &ClusterError) {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
        self.total_failures.fetch_add(1, Ordering::AcqRel);
        self.remember(ClusterHealthStatus::Degraded, operation, error);
    }

    pub fn record_rejected(&self, operation: &str, error: &ClusterError) {
        self.total_rejected.fetch_add(1, Ordering::AcqRel);
        self.remember(ClusterHealthStatus::CircuitOpen, operation, error);
    }

    pub fn status(&self) -> ClusterHealthStatus {
        self.outcomes()
            .status
            .unwrap_or(ClusterHealthStatus::Unknown)
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == ClusterHealthStatus::Healthy
    }

    pub fn stats(&self) -> ClusterHealthStats {
        let outcomes = self.outcomes();
        ClusterHealthStats {
            status: outcomes.status.unwrap_or(ClusterHealthStatus::Unknown),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            total_failures: self.total_failures.load(Ordering::Acquire),
            total_rejected: self.total_rejected.load(Ordering::Acquire),
            last_success_ms: self.last_success_ms.load(Ordering::Acquire),
            last_failure: outcomes.last_failure.clone(),
        }
    }

    fn remember(&self, status: ClusterHealthStatus, operation: &str, error: &ClusterError) {
        let mut outcomes = self.outcomes();
        outcomes.status = Some(status);
        outcomes.last_failure = Some(CallFailure {
            operation: operation.to_string(),
            kind: error.kind_label(),
            message: error.to_string(),
            at_ms: current_time_ms(),
        });
    }

    fn outcomes(&self) -> std::sync::MutexGuard<'_, Outcomes> {
        self.outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Health snapshot
#[derive(Debug, Clone)]
pub struct ClusterHealthStats {
    pub status: ClusterHealthStatus,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_rejected: u64,
    /// 0 until the first success
    pub last_success_ms: i64,
    pub last_failure: Option<CallFailure>,
}
