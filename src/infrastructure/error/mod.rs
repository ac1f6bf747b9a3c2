use thiserror::Error;

use crate::messages::{MessagesCacheError, StoreError};
use crate::redis::ClusterError;

/// Top-level error for service startup and the health loop.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Redis Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Message store error: {0}")]
    Store(#[from] StoreError),

    #[error("Messages cache error: {0}")]
    Cache(#[from] MessagesCacheError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable code for logs.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Cluster(ClusterError::CircuitOpen(_)) => "CIRCUIT_OPEN",
            AppError::Cluster(_) => "REDIS_ERROR",
            AppError::Store(_) => "STORE_ERROR",
            AppError::Cache(MessagesCacheError::Unavailable(_)) => "CIRCUIT_OPEN",
            AppError::Cache(_) => "CACHE_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
