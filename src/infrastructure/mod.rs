//! Infrastructure layer modules
//!
//! This module contains shared infrastructure components:
//! - `config`: Application configuration and settings
//! - `error`: Top-level error type
//! - `metrics`: Prometheus metrics and the recorder seam
//! - `redis`: Redis Cluster connection, circuit breaker, backoff, and health

pub mod config;
pub mod error;
pub mod metrics;
pub mod redis;
