use std::fs;
use std::path::Path;

use tracing::warn;

use crate::auth::cidr;
use crate::config::{BackendMode, Config};
use crate::error::{ProxyError, Result};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p)
        .map_err(|e| ProxyError::Config(format!("Failed to read config file: {e}")))?;
    let cfg: Config = toml::from_str(&txt)
        .map_err(|e| ProxyError::Config(format!("Failed to parse config: {e}")))?;

    validate_config(&cfg)?;
    warn_test_flags(&cfg);

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.auth.secret_key.is_empty() {
        return Err(ProxyError::Config("auth.secret_key must not be empty".into()));
    }
    if cfg.auth.api_key.is_empty() {
        return Err(ProxyError::Config("auth.api_key must not be empty".into()));
    }

    match cfg.backend.mode {
        BackendMode::Http => {
            if cfg.backend.host.is_empty() {
                return Err(ProxyError::Config(
                    "backend.host is required when backend.mode is \"http\"".into(),
                ));
            }
        }
        BackendMode::Filesystem => {
            if cfg.backend.filesystem_root.is_empty() {
                return Err(ProxyError::Config(
                    "backend.filesystem_root is required when backend.mode is \"filesystem\""
                        .into(),
                ));
            }
            if !Path::new(&cfg.backend.filesystem_root).exists() {
                warn!(root = %cfg.backend.filesystem_root, "filesystem root does not exist");
            }
        }
    }

    for entry in &cfg.auth.fixed_ip_whitelist {
        if cidr::parse_pattern(entry).is_none() {
            return Err(ProxyError::Config(format!(
                "Invalid fixed_ip_whitelist entry: {entry}"
            )));
        }
    }

    if cfg.auth.safe_key_protect_enabled && cfg.auth.safe_key_protect_base.is_empty() {
        return Err(ProxyError::Config(
            "auth.safe_key_protect_base is required when safe_key_protect_enabled".into(),
        ));
    }

    if cfg.traffic.enabled && cfg.traffic.report_url.is_empty() {
        warn!("traffic engine enabled without traffic.report_url, accounting only");
    }

    Ok(())
}

fn warn_test_flags(cfg: &Config) {
    let flags = &cfg.test_flags;
    if flags.disable_ip_whitelist {
        warn!("TEST MODE: disable_ip_whitelist is set, whitelist probes are skipped");
    }
    if flags.disable_path_protection {
        warn!("TEST MODE: disable_path_protection is set, key-path checks are skipped");
    }
    if flags.disable_session_validation {
        warn!("TEST MODE: disable_session_validation is set, HMAC tokens are not verified");
    }
}
