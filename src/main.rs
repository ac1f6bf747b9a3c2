use std::sync::Arc;

use anyhow::Result;
use tokio::signal;

use ara_mailbox_cache::config::Settings;
use ara_mailbox_cache::error::AppError;
use ara_mailbox_cache::messages::{create_message_store, MessagesCache};
use ara_mailbox_cache::metrics::encode_metrics;
use ara_mailbox_cache::redis::ClusterConnection;
use ara_mailbox_cache::telemetry::init_tracing;

const CLUSTER_CLIENT_NAME: &str = "messages-cache";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!(
        nodes = ?settings.redis_cluster.nodes,
        backend = %settings.messages_cache.backend,
        "Configuration loaded"
    );

    let connection = Arc::new(ClusterConnection::new(
        CLUSTER_CLIENT_NAME,
        &settings.redis_cluster,
    )?);

    // Script registration is a blocking round trip per script
    let store = {
        let cache_settings = settings.messages_cache.clone();
        let connection = Arc::clone(&connection);
        tokio::task::spawn_blocking(move || create_message_store(&cache_settings, Some(connection)))
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
            .map_err(AppError::from)?
    };

    // Separate runtime for removals. Dropping it in async context panics,
    // so it is built after every fallible step.
    let deletion_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.messages_cache.deletion_worker_threads.max(1))
        .thread_name("message-deletion")
        .enable_all()
        .build()?;

    let cache = MessagesCache::new(store, deletion_runtime.handle().clone())
        .with_persist_fetch_timeout(settings.messages_cache.persist_fetch_timeout());
    tracing::info!(backend = cache.backend_type(), "Messages cache ready");

    run_health_loop(&connection, &settings).await;

    tracing::info!("Waiting for pending discards...");
    cache.drain_pending_discards().await;
    deletion_runtime.shutdown_background();

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Ping the cluster and log breaker and health state until a shutdown signal.
async fn run_health_loop(connection: &ClusterConnection, settings: &Settings) {
    let mut interval = tokio::time::interval(settings.messages_cache.health_check_interval());
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = interval.tick() => {
                if let Err(e) = connection.ping().await {
                    let e = AppError::from(e);
                    tracing::warn!(code = e.code(), error = %e, "Cluster health check failed");
                }

                let health = connection.health();
                tracing::info!(
                    client = connection.name(),
                    circuit = connection.circuit_state().as_str(),
                    status = health.status.as_str(),
                    consecutive_failures = health.consecutive_failures,
                    total_failures = health.total_failures,
                    total_rejected = health.total_rejected,
                    last_failed_operation = health.last_failure.as_ref().map(|f| f.operation.as_str()),
                    last_failure_kind = health.last_failure.as_ref().map(|f| f.kind),
                    "Cluster health"
                );

                match encode_metrics() {
                    Ok(metrics) => tracing::debug!(bytes = metrics.len(), "Metrics snapshot encoded"),
                    Err(e) => tracing::warn!(error = %e, "Failed to encode metrics"),
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
