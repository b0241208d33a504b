mod loader;
mod types;

pub use loader::load_from_path;
pub use types::{
    AuthConfig, BackendConfig, BackendMode, Config, HttpPoolConfig, LoggingConfig, M3u8ClassLimit,
    M3u8Config, RedisConfig, TestFlags, TrafficConfig,
};
