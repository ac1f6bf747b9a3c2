mod settings;

pub use settings::{MessagesCacheConfig, RedisClusterConfig, Settings};
