use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub redis_cluster: RedisClusterConfig,
    #[serde(default)]
    pub messages_cache: MessagesCacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisClusterConfig {
    /// Seed nodes, e.g. `redis://127.0.0.1:7000`
    #[serde(default = "default_cluster_nodes")]
    pub nodes: Vec<String>,
    /// Fixed deadline applied to every cluster call, script evaluation included
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub circuit_breaker_success_threshold: u32,
    #[serde(default = "default_reset_timeout_seconds")]
    pub circuit_breaker_reset_timeout_seconds: u64,
    #[serde(default = "default_half_open_max_requests")]
    pub circuit_breaker_half_open_max_requests: u32,
    /// Total attempts per call, the first one included
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_backoff_initial_delay_ms")]
    pub backoff_initial_delay_ms: u64,
    #[serde(default = "default_backoff_max_delay_ms")]
    pub backoff_max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesCacheConfig {
    /// Store backend: "redis" or "memory"
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Worker threads of the runtime reserved for deletion work
    #[serde(default = "default_deletion_worker_threads")]
    pub deletion_worker_threads: usize,
    #[serde(default = "default_persist_fetch_timeout_seconds")]
    pub persist_fetch_timeout_seconds: u64,
    #[serde(default = "default_health_check_interval_seconds")]
    pub health_check_interval_seconds: u64,
}

fn default_cluster_nodes() -> Vec<String> {
    vec!["redis://127.0.0.1:7000".to_string()]
}

fn default_command_timeout_ms() -> u64 {
    2_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_reset_timeout_seconds() -> u64 {
    30
}

fn default_half_open_max_requests() -> u32 {
    10
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_backoff_initial_delay_ms() -> u64 {
    100
}

fn default_backoff_max_delay_ms() -> u64 {
    2_000
}

fn default_backend() -> String {
    "redis".to_string()
}

fn default_deletion_worker_threads() -> usize {
    2
}

fn default_persist_fetch_timeout_seconds() -> u64 {
    5
}

fn default_health_check_interval_seconds() -> u64 {
    30
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("redis_cluster.nodes", default_cluster_nodes())?
            .set_default("redis_cluster.command_timeout_ms", default_command_timeout_ms())?
            .set_default("messages_cache.backend", default_backend())?
            .set_default(
                "messages_cache.deletion_worker_threads",
                default_deletion_worker_threads() as u64,
            )?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // ARA_REDIS_CLUSTER__NODES, ARA_MESSAGES_CACHE__BACKEND, etc.
            .add_source(
                Environment::with_prefix("ARA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("redis_cluster.nodes"),
            );

        builder.build()?.try_deserialize()
    }
}

impl RedisClusterConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl MessagesCacheConfig {
    pub fn persist_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.persist_fetch_timeout_seconds)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }
}

impl Default for RedisClusterConfig {
    fn default() -> Self {
        Self {
            nodes: default_cluster_nodes(),
            command_timeout_ms: default_command_timeout_ms(),
            circuit_breaker_failure_threshold: default_failure_threshold(),
            circuit_breaker_success_threshold: default_success_threshold(),
            circuit_breaker_reset_timeout_seconds: default_reset_timeout_seconds(),
            circuit_breaker_half_open_max_requests: default_half_open_max_requests(),
            retry_max_attempts: default_retry_max_attempts(),
            backoff_initial_delay_ms: default_backoff_initial_delay_ms(),
            backoff_max_delay_ms: default_backoff_max_delay_ms(),
        }
    }
}

impl Default for MessagesCacheConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            deletion_worker_threads: default_deletion_worker_threads(),
            persist_fetch_timeout_seconds: default_persist_fetch_timeout_seconds(),
            health_check_interval_seconds: default_health_check_interval_seconds(),
        }
    }
}
