//! Configuration loading and validation.

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use heimdall_proxy_lib::config::{load_from_path, BackendMode};

fn tmp_config(name: &str, contents: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_nanos();
    let path = std::env::temp_dir().join(format!("heimdall-test-{nanos}-{name}.toml"));
    fs::write(&path, contents).expect("write config");
    path
}

const MINIMAL: &str = r#"
listen = "127.0.0.1:7000"

[redis]
host = "127.0.0.1"

[backend]
mode = "filesystem"
filesystem_root = "/tmp"

[auth]
secret_key = "S"
api_key = "K"
"#;

#[test]
fn minimal_config_gets_defaults() {
    let path = tmp_config("minimal", MINIMAL);
    let cfg = load_from_path(&path).expect("load");

    assert_eq!(cfg.backend.mode, BackendMode::Filesystem);
    assert_eq!(cfg.redis.port, 6379);
    assert_eq!(cfg.redis.pool_size, 150);
    assert_eq!(cfg.auth.session_ttl, 1800);
    assert_eq!(cfg.auth.ip_access_ttl, 3600);
    assert_eq!(cfg.auth.max_ua_ip_pairs_per_uid, 5);
    assert_eq!(cfg.auth.max_paths_per_entry, 32);
    assert_eq!(cfg.http_pool.connector_limit, 100);
    assert_eq!(cfg.http_pool.per_host, 30);
    assert_eq!(cfg.http_pool.total_timeout_secs, 90);
    assert_eq!(cfg.traffic.min_bytes_threshold, 1024 * 1024);
    assert_eq!(cfg.traffic.report_interval_secs, 300);
    assert_eq!(cfg.m3u8.desktop_browser.max_count, 2);
    assert_eq!(cfg.m3u8.desktop_browser.window_secs, 20);
    assert_eq!(cfg.m3u8.tool_or_downloader.max_count, 1);
    assert!(!cfg.test_flags.disable_session_validation);
    assert!(cfg
        .auth
        .fully_allowed_extensions
        .iter()
        .any(|e| e == ".ts"));

    let _ = fs::remove_file(path);
}

#[test]
fn http_mode_requires_host() {
    let broken = r#"
listen = "127.0.0.1:7000"

[redis]
host = "127.0.0.1"

[backend]
mode = "http"

[auth]
secret_key = "S"
api_key = "K"
"#;
    let path = tmp_config("http-no-host", broken);
    assert!(load_from_path(&path).is_err());
    let _ = fs::remove_file(path);
}

#[test]
fn filesystem_mode_requires_root() {
    let broken = r#"
listen = "127.0.0.1:7000"

[redis]
host = "127.0.0.1"

[backend]
mode = "filesystem"

[auth]
secret_key = "S"
api_key = "K"
"#;
    let path = tmp_config("fs-no-root", broken);
    assert!(load_from_path(&path).is_err());
    let _ = fs::remove_file(path);
}

#[test]
fn empty_secret_rejected() {
    let broken = MINIMAL.replace("secret_key = \"S\"", "secret_key = \"\"");
    let path = tmp_config("empty-secret", &broken);
    assert!(load_from_path(&path).is_err());
    let _ = fs::remove_file(path);
}

#[test]
fn malformed_fixed_whitelist_rejected() {
    let broken = MINIMAL.replace(
        "[auth]",
        "[auth]\nfixed_ip_whitelist = [\"not-an-ip\"]",
    );
    let path = tmp_config("bad-whitelist", &broken);
    assert!(load_from_path(&path).is_err());
    let _ = fs::remove_file(path);
}

#[test]
fn safe_key_protect_requires_base() {
    let broken = MINIMAL.replace(
        "[auth]",
        "[auth]\nsafe_key_protect_enabled = true",
    );
    let path = tmp_config("skp-no-base", &broken);
    assert!(load_from_path(&path).is_err());
    let _ = fs::remove_file(path);
}

#[test]
fn overrides_and_class_limits_parse() {
    let full = r#"
listen = "0.0.0.0:8800"

[redis]
host = "redis.internal"
port = 6380
db = 3
password = "pw"

[backend]
mode = "http"
host = "origin.internal"
port = 8443
use_https = true
ssl_verify = false
proxy_host_header = "video-files.example.com"

[auth]
secret_key = "S"
api_key = "K"
fixed_ip_whitelist = ["203.0.113.7", "10.0.0.0/8", "2001:db8::1"]
fully_allowed_extensions = [".ts"]

[m3u8]
mobile_browser = { window_secs = 60, max_count = 5 }
desktop_browser = { window_secs = 45, max_count = 4 }
tool_or_downloader = { window_secs = 10, max_count = 1 }
"#;
    let path = tmp_config("full", full);
    let cfg = load_from_path(&path).expect("load");

    assert_eq!(cfg.backend.mode, BackendMode::Http);
    assert!(!cfg.backend.ssl_verify);
    assert_eq!(cfg.backend.proxy_host_header, "video-files.example.com");
    assert_eq!(cfg.redis.db, 3);
    assert_eq!(cfg.m3u8.mobile_browser.max_count, 5);
    assert_eq!(cfg.m3u8.desktop_browser.window_secs, 45);
    assert_eq!(cfg.auth.fixed_ip_whitelist.len(), 3);

    let _ = fs::remove_file(path);
}
