//! Fault-tolerant Redis Cluster connection.
//!
//! Every call goes through the same gate: the circuit breaker decides whether
//! the call may start, then the retry policy re-runs transient failures with
//! backoff, each attempt bounded by a fixed deadline. The breaker sees one
//! outcome per call, after retries.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use redis::cluster::{ClusterClient, ClusterConnection as SyncClusterConnection};
use redis::cluster_async::ClusterConnection as AsyncClusterConnection;
use redis::{ErrorKind, RedisError, RedisResult};
use tokio::sync::RwLock;

use crate::config::RedisClusterConfig;
use crate::metrics::ClusterMetrics;

use super::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, ClusterHealth, ClusterHealthStats,
    RetryPolicy,
};

/// Error type for cluster calls.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    /// Circuit breaker is open; the call never reached the cluster
    #[error("Circuit breaker '{0}' is open")]
    CircuitOpen(String),

    /// The call exceeded the per-call deadline
    #[error("Cluster call timed out after {0:?}")]
    Timeout(Duration),

    /// Connection not available
    #[error("Connection not available: {0}")]
    ConnectionUnavailable(String),
}

impl ClusterError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClusterError::Timeout(_) | ClusterError::ConnectionUnavailable(_) => true,
            ClusterError::CircuitOpen(_) => false,
            ClusterError::Redis(e) => {
                e.is_timeout()
                    || e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_cluster_error()
                    || matches!(
                        e.kind(),
                        ErrorKind::TryAgain
                            | ErrorKind::ClusterDown
                            | ErrorKind::MasterDown
                            | ErrorKind::BusyLoadingError
                    )
            }
        }
    }

    /// Stable error class for health snapshots and logs.
    pub fn kind_label(&self) -> &'static str {
        match self {
            ClusterError::Timeout(_) => "timeout",
            ClusterError::CircuitOpen(_) => "circuit_open",
            ClusterError::ConnectionUnavailable(_) => "connection_unavailable",
            ClusterError::Redis(e) if e.is_timeout() => "timeout",
            ClusterError::Redis(e) if e.is_connection_dropped() => "connection_dropped",
            ClusterError::Redis(e) if e.is_connection_refusal() => "connection_refused",
            ClusterError::Redis(e) if e.is_io_error() => "io",
            ClusterError::Redis(e) if e.is_cluster_error() => "cluster",
            ClusterError::Redis(_) => "redis",
        }
    }

    /// Whether the cached connection should be dropped and rebuilt.
    fn breaks_connection(&self) -> bool {
        match self {
            ClusterError::Redis(e) => e.is_connection_dropped() || e.is_io_error(),
            ClusterError::ConnectionUnavailable(_) => true,
            _ => false,
        }
    }
}

/// One logical cluster client (e.g. `messages-cache`) shared by all callers.
///
/// Holds a multiplexed async connection for steady-state traffic and a lazily
/// created blocking connection for one-off startup work such as script
/// registration. Both share the breaker and retry policy.
pub struct ClusterConnection {
    name: String,
    client: ClusterClient,
    connection: RwLock<Option<AsyncClusterConnection>>,
    sync_connection: Mutex<Option<SyncClusterConnection>>,
    circuit_breaker: Arc<CircuitBreaker>,
    health: Arc<ClusterHealth>,
    retry: RetryPolicy,
    command_timeout: Duration,
}

impl ClusterConnection {
    /// Create a cluster connection. No network traffic happens until the
    /// first call.
    pub fn new(name: impl Into<String>, config: &RedisClusterConfig) -> Result<Self, ClusterError> {
        let name = name.into();
        let command_timeout = config.command_timeout();

        let client = ClusterClient::builder(config.nodes.clone())
            .connection_timeout(command_timeout)
            .response_timeout(command_timeout)
            .build()?;

        Ok(Self {
            circuit_breaker: Arc::new(CircuitBreaker::with_config(
                name.clone(),
                CircuitBreakerConfig::from(config),
            )),
            name,
            client,
            connection: RwLock::new(None),
            sync_connection: Mutex::new(None),
            health: Arc::new(ClusterHealth::new()),
            retry: RetryPolicy::from(config),
            command_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    pub fn health(&self) -> ClusterHealthStats {
        self.health.stats()
    }

    /// Healthy means the last call succeeded and the breaker is closed.
    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy() && self.circuit_breaker.state() == CircuitState::Closed
    }

    /// Run `f` against the async connection under breaker, retry and deadline.
    ///
    /// `f` may be invoked once per attempt, each time with a fresh handle to
    /// the shared multiplexed connection.
    pub async fn execute<F, Fut, T>(&self, operation: &str, f: F) -> Result<T, ClusterError>
    where
        F: Fn(AsyncClusterConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        self.check_circuit(operation)?;

        let started = Instant::now();
        let mut backoff = self.retry.backoff();
        let mut attempt = 1;

        loop {
            let error = match self.attempt(&f).await {
                Ok(value) => {
                    self.on_success(operation, started);
                    return Ok(value);
                }
                Err(e) => e,
            };

            if error.breaks_connection() {
                *self.connection.write().await = None;
            }

            if !error.is_transient() || attempt >= self.retry.max_attempts {
                self.on_failure(operation, &error, attempt, started);
                return Err(error);
            }

            let delay = backoff.next_delay();
            tracing::warn!(
                client = %self.name,
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient cluster error, retrying"
            );
            ClusterMetrics::record_retry(&self.name);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Blocking counterpart of [`execute`](Self::execute) for startup work.
    ///
    /// Must not be called from inside an async task; use `spawn_blocking`.
    pub fn execute_sync<F, T>(&self, operation: &str, mut f: F) -> Result<T, ClusterError>
    where
        F: FnMut(&mut SyncClusterConnection) -> RedisResult<T>,
    {
        self.check_circuit(operation)?;

        let started = Instant::now();
        let mut backoff = self.retry.backoff();
        let mut attempt = 1;

        loop {
            let error = match self.attempt_sync(&mut f) {
                Ok(value) => {
                    self.on_success(operation, started);
                    return Ok(value);
                }
                Err(e) => e,
            };

            if error.breaks_connection() {
                if let Ok(mut guard) = self.sync_connection.lock() {
                    *guard = None;
                }
            }

            if !error.is_transient() || attempt >= self.retry.max_attempts {
                self.on_failure(operation, &error, attempt, started);
                return Err(error);
            }

            let delay = backoff.next_delay();
            tracing::warn!(
                client = %self.name,
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient cluster error, retrying"
            );
            ClusterMetrics::record_retry(&self.name);
            std::thread::sleep(delay);
            attempt += 1;
        }
    }

    /// Ping a cluster node to check connectivity.
    pub async fn ping(&self) -> Result<(), ClusterError> {
        self.execute("ping", |mut conn| async move {
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    fn check_circuit(&self, operation: &str) -> Result<(), ClusterError> {
        if self.circuit_breaker.allow_request() {
            return Ok(());
        }

        // Half-open rejections happen once its trial permits are used up
        let error = ClusterError::CircuitOpen(self.name.clone());
        self.health.record_rejected(operation, &error);
        ClusterMetrics::record_rejected(&self.name);
        ClusterMetrics::set_circuit_state(&self.name, self.circuit_breaker.state());
        Err(error)
    }

    async fn attempt<F, Fut, T>(&self, f: &F) -> Result<T, ClusterError>
    where
        F: Fn(AsyncClusterConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.get_connection().await?;

        match tokio::time::timeout(self.command_timeout, f(conn)).await {
            Ok(result) => result.map_err(ClusterError::from),
            Err(_) => Err(ClusterError::Timeout(self.command_timeout)),
        }
    }

    fn attempt_sync<F, T>(&self, f: &mut F) -> Result<T, ClusterError>
    where
        F: FnMut(&mut SyncClusterConnection) -> RedisResult<T>,
    {
        let mut guard = self
            .sync_connection
            .lock()
            .map_err(|_| ClusterError::ConnectionUnavailable("sync connection poisoned".into()))?;

        if guard.is_none() {
            let conn = self.client.get_connection()?;
            conn.set_read_timeout(Some(self.command_timeout))?;
            conn.set_write_timeout(Some(self.command_timeout))?;
            tracing::info!(client = %self.name, "Blocking cluster connection established");
            *guard = Some(conn);
        }

        let conn = guard
            .as_mut()
            .ok_or_else(|| ClusterError::ConnectionUnavailable("sync connection missing".into()))?;

        f(conn).map_err(|e| {
            if e.is_timeout() {
                ClusterError::Timeout(self.command_timeout)
            } else {
                ClusterError::Redis(e)
            }
        })
    }

    /// Get the shared async connection, establishing it if needed.
    async fn get_connection(&self) -> Result<AsyncClusterConnection, ClusterError> {
        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        let mut conn_guard = self.connection.write().await;

        // Double-check in case another task connected while we waited
        if let Some(ref c) = *conn_guard {
            return Ok(c.clone());
        }

        let conn = tokio::time::timeout(self.command_timeout, self.client.get_async_connection())
            .await
            .map_err(|_| ClusterError::Timeout(self.command_timeout))??;

        *conn_guard = Some(conn.clone());
        tracing::info!(client = %self.name, "Cluster connection established");
        Ok(conn)
    }

    fn on_success(&self, operation: &str, started: Instant) {
        self.circuit_breaker.record_success();
        self.health.record_success();
        ClusterMetrics::record_success(&self.name);
        ClusterMetrics::observe_latency(&self.name, operation, started.elapsed());
        ClusterMetrics::set_circuit_state(&self.name, self.circuit_breaker.state());
    }

    fn on_failure(&self, operation: &str, error: &ClusterError, attempts: u32, started: Instant) {
        self.circuit_breaker.record_failure();
        self.health.record_failure(operation, error);
        ClusterMetrics::record_failure(&self.name);
        ClusterMetrics::observe_latency(&self.name, operation, started.elapsed());
        ClusterMetrics::set_circuit_state(&self.name, self.circuit_breaker.state());
        tracing::error!(
            client = %self.name,
            operation,
            attempts,
            error = %error,
            "Cluster call failed"
        );
    }
}
