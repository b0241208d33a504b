use serde::Deserialize;
use std::net::SocketAddr;

/// Redis connection configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    /// Redis server hostname or IP
    pub host: String,
    /// Redis server port
    /// Default: 6379
    #[serde(default = "default_redis_port")]
    pub port: u16,
    /// Logical database index
    /// Default: 0
    #[serde(default)]
    pub db: i64,
    /// Password, empty for unauthenticated servers
    /// Default: ""
    #[serde(default)]
    pub password: String,
    /// Connection pool size hint
    /// Default: 150
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: u32,
}

/// Origin backend mode
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    Http,
    Filesystem,
}

/// Origin backend configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Origin mode: "http" forwards to an upstream server,
    /// "filesystem" serves from a local root
    pub mode: BackendMode,
    /// Upstream host (http mode)
    #[serde(default)]
    pub host: String,
    /// Upstream port (http mode)
    /// Default: 443
    #[serde(default = "default_backend_port")]
    pub port: u16,
    /// Use HTTPS towards the upstream
    /// Default: true
    #[serde(default = "default_true")]
    pub use_https: bool,
    /// Verify upstream TLS certificates. When false, all outbound HTTPS
    /// connections made by the client pool skip verification.
    /// Default: true
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    /// Host header override sent to the upstream (http mode)
    /// Default: "" (no override)
    #[serde(default)]
    pub proxy_host_header: String,
    /// Local filesystem root (filesystem mode)
    #[serde(default)]
    pub filesystem_root: String,
    /// Serve small files with a single buffered read instead of the
    /// chunked pump (filesystem mode)
    /// Default: true
    #[serde(default = "default_true")]
    pub filesystem_sendfile: bool,
}

/// Outbound HTTP client pool configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HttpPoolConfig {
    /// Maximum total connections
    /// Default: 100
    #[serde(default = "default_connector_limit")]
    pub connector_limit: usize,
    /// Maximum idle connections kept per host
    /// Default: 30
    #[serde(default = "default_per_host")]
    pub per_host: usize,
    /// Keep-alive idle timeout in seconds
    /// Default: 60
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    /// Connect timeout in seconds
    /// Default: 15
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Total request timeout in seconds, covers the whole body transfer
    /// Default: 90
    #[serde(default = "default_total_timeout")]
    pub total_timeout_secs: u64,
}

impl Default for HttpPoolConfig {
    fn default() -> Self {
        Self {
            connector_limit: default_connector_limit(),
            per_host: default_per_host(),
            keepalive_secs: default_keepalive(),
            connect_timeout_secs: default_connect_timeout(),
            total_timeout_secs: default_total_timeout(),
        }
    }
}

/// Authorization configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// HMAC secret for URL token verification
    pub secret_key: String,
    /// API key for the admin endpoints (whitelist, file check)
    pub api_key: String,
    /// Session TTL in seconds
    /// Default: 1800
    #[serde(default = "default_session_ttl")]
    pub session_ttl: u64,
    /// Whitelist entry TTL in seconds
    /// Default: 3600
    #[serde(default = "default_ip_access_ttl")]
    pub ip_access_ttl: u64,
    /// Maximum UA+IP pairs per UID, oldest evicted first
    /// Default: 5
    #[serde(default = "default_max_pairs")]
    pub max_ua_ip_pairs_per_uid: usize,
    /// Maximum key paths per whitelist entry, oldest evicted first
    /// Default: 32
    #[serde(default = "default_max_paths")]
    pub max_paths_per_entry: usize,
    /// Fixed IP whitelist, single IPs or CIDR. Bare IPv4 addresses are
    /// widened to their /24 network at load.
    /// Default: empty
    #[serde(default)]
    pub fixed_ip_whitelist: Vec<String>,
    /// Authorize static files by IP+UA only, skipping the path check
    /// Default: false
    #[serde(default)]
    pub enable_static_file_ip_only_check: bool,
    /// Suffixes treated as static files
    #[serde(default = "default_static_extensions")]
    pub static_file_extensions: Vec<String>,
    /// Suffixes that bypass all authorization
    /// Default: [".ts", ".webp", ".php"]
    #[serde(default = "default_fully_allowed")]
    pub fully_allowed_extensions: Vec<String>,
    /// Redirect allowed enc.key requests to an external key route
    /// Default: false
    #[serde(default)]
    pub safe_key_protect_enabled: bool,
    /// Base URL prepended to the original path on key redirects
    #[serde(default)]
    pub safe_key_protect_base: String,
    /// Name of the session cookie
    /// Default: "heimdall_session"
    #[serde(default = "default_cookie_name")]
    pub session_cookie_name: String,
}

/// Per-browser-class m3u8 access window
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct M3u8ClassLimit {
    /// Window length in seconds
    pub window_secs: u64,
    /// Maximum reads inside one window
    pub max_count: u64,
}

/// Adaptive m3u8 access counter configuration
#[derive(Debug, Deserialize, Clone)]
pub struct M3u8Config {
    /// Mobile browsers
    /// Default: 3 reads / 30 s
    #[serde(default = "default_mobile_limit")]
    pub mobile_browser: M3u8ClassLimit,
    /// Desktop browsers
    /// Default: 2 reads / 20 s
    #[serde(default = "default_desktop_limit")]
    pub desktop_browser: M3u8ClassLimit,
    /// Download tools and unidentified agents
    /// Default: 1 read / 15 s
    #[serde(default = "default_tool_limit")]
    pub tool_or_downloader: M3u8ClassLimit,
}

impl Default for M3u8Config {
    fn default() -> Self {
        Self {
            mobile_browser: default_mobile_limit(),
            desktop_browser: default_desktop_limit(),
            tool_or_downloader: default_tool_limit(),
        }
    }
}

/// Traffic accounting configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TrafficConfig {
    /// Enable the traffic engine and its background loops
    /// Default: true
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Report sink URL. Empty disables reporting but keeps accounting.
    #[serde(default)]
    pub report_url: String,
    /// Bearer key sent with reports
    #[serde(default)]
    pub api_key: String,
    /// Bytes a UID must accumulate before it becomes reportable
    /// Default: 1 MiB
    #[serde(default = "default_min_bytes")]
    pub min_bytes_threshold: u64,
    /// Seconds between reports
    /// Default: 300
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
    /// Seconds after which an idle sub-threshold record is dropped
    /// Default: 600
    #[serde(default = "default_accumulator_idle")]
    pub accumulator_idle_timeout_secs: u64,
    /// Seconds after which any idle record is dropped
    /// Default: 1800
    #[serde(default = "default_long_idle")]
    pub long_idle_timeout_secs: u64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            report_url: String::new(),
            api_key: String::new(),
            min_bytes_threshold: default_min_bytes(),
            report_interval_secs: default_report_interval(),
            accumulator_idle_timeout_secs: default_accumulator_idle(),
            long_idle_timeout_secs: default_long_idle(),
        }
    }
}

/// Test-mode flags. All MUST stay false in production; a startup warning
/// is logged for every enabled flag.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TestFlags {
    /// Skip the whitelist probes entirely
    #[serde(default)]
    pub disable_ip_whitelist: bool,
    /// Skip the key-path check inside the whitelist probe
    #[serde(default)]
    pub disable_path_protection: bool,
    /// Skip HMAC token verification
    #[serde(default)]
    pub disable_session_validation: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    /// Default: "info"
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Show module path (target) in log messages
    /// Default: false
    #[serde(default)]
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), show_target: false }
    }
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Address and port to listen on
    /// Example: "0.0.0.0:7000"
    pub listen: SocketAddr,
    /// Redis connection
    pub redis: RedisConfig,
    /// Origin backend
    pub backend: BackendConfig,
    /// Outbound HTTP client pool
    #[serde(default)]
    pub http_pool: HttpPoolConfig,
    /// Authorization
    pub auth: AuthConfig,
    /// m3u8 adaptive access counter
    #[serde(default)]
    pub m3u8: M3u8Config,
    /// Traffic accounting
    #[serde(default)]
    pub traffic: TrafficConfig,
    /// Test-mode flags
    #[serde(default)]
    pub test_flags: TestFlags,
    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Path of the dashboard HTML served at /monitor
    /// Default: "" (404)
    #[serde(default)]
    pub monitor_dashboard_path: String,
}

fn default_true() -> bool {
    true
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_pool_size() -> u32 {
    150
}

fn default_backend_port() -> u16 {
    443
}

fn default_connector_limit() -> usize {
    100
}

fn default_per_host() -> usize {
    30
}

fn default_keepalive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_total_timeout() -> u64 {
    90
}

fn default_session_ttl() -> u64 {
    1800
}

fn default_ip_access_ttl() -> u64 {
    3600
}

fn default_max_pairs() -> usize {
    5
}

fn default_max_paths() -> usize {
    32
}

fn default_static_extensions() -> Vec<String> {
    [
        ".jpg", ".jpeg", ".png", ".gif", ".svg", ".css", ".js", ".woff", ".woff2", ".ttf",
        ".eot", ".ico", ".txt",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

fn default_fully_allowed() -> Vec<String> {
    [".ts", ".webp", ".php"].into_iter().map(str::to_owned).collect()
}

fn default_cookie_name() -> String {
    "heimdall_session".to_string()
}

fn default_mobile_limit() -> M3u8ClassLimit {
    M3u8ClassLimit { window_secs: 30, max_count: 3 }
}

fn default_desktop_limit() -> M3u8ClassLimit {
    M3u8ClassLimit { window_secs: 20, max_count: 2 }
}

fn default_tool_limit() -> M3u8ClassLimit {
    M3u8ClassLimit { window_secs: 15, max_count: 1 }
}

fn default_min_bytes() -> u64 {
    1024 * 1024
}

fn default_report_interval() -> u64 {
    300
}

fn default_accumulator_idle() -> u64 {
    600
}

fn default_long_idle() -> u64 {
    1800
}

fn default_log_level() -> String {
    "info".to_string()
}
