//! Message store factory

use std::sync::Arc;

use crate::config::MessagesCacheConfig;
use crate::redis::ClusterConnection;

use super::memory_store::MemoryQueueStore;
use super::redis_store::RedisClusterStore;
use super::store::{MessageQueueStore, StoreError};

/// Create a message store based on configuration.
///
/// - `"redis"` (default): a `RedisClusterStore`, registering its scripts
///   through `connection`'s blocking path
/// - `"memory"`: a `MemoryQueueStore`
///
/// A Redis backend requested without a connection falls back to memory.
/// Blocks while registering scripts; call it from `spawn_blocking`.
pub fn create_message_store(
    settings: &MessagesCacheConfig,
    connection: Option<Arc<ClusterConnection>>,
) -> Result<Arc<dyn MessageQueueStore>, StoreError> {
    match settings.backend.as_str() {
        "memory" => {
            tracing::info!(backend = "memory", "Creating memory message store");
            Ok(Arc::new(MemoryQueueStore::new()))
        }
        backend => {
            if backend != "redis" {
                tracing::warn!(backend, "Unknown message store backend, using redis");
            }

            match connection {
                Some(connection) => {
                    tracing::info!(
                        backend = "redis",
                        client = connection.name(),
                        "Creating Redis Cluster message store"
                    );
                    Ok(Arc::new(RedisClusterStore::new(connection)?))
                }
                None => {
                    tracing::warn!(
                        "Redis backend requested but no cluster connection provided, falling back to memory"
                    );
                    Ok(Arc::new(MemoryQueueStore::new()))
                }
            }
        }
    }
}
