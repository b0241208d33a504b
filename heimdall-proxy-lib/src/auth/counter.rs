//! Adaptive m3u8 access counter.
//!
//! Counter key: `m3u8_access:<uid_or_ip>:<sha256(path)[:16]>`. The window
//! length and the permitted read count depend on the detected browser
//! class. INCR is the atomic admission decision; the expiry is attached
//! on the first hit of a window, so concurrent requests cannot win more
//! than `max_count` allows between them.

use serde::Serialize;
use tracing::{debug, warn};

use crate::auth::browser::{self, BrowserClass};
use crate::config::{M3u8ClassLimit, M3u8Config};
use crate::error::Result;
use crate::redis::RedisHandle;
use crate::util::path_hash;

#[derive(Debug, Clone, Serialize)]
pub struct CounterDecision {
    pub allowed: bool,
    pub browser_class: BrowserClass,
    pub current_count: u64,
    pub max_count: u64,
    pub window_secs: u64,
}

#[derive(Clone)]
pub struct M3u8Counter {
    redis: RedisHandle,
    limits: M3u8Config,
}

impl M3u8Counter {
    pub fn new(redis: RedisHandle, limits: M3u8Config) -> Self {
        Self { redis, limits }
    }

    fn class_limit(&self, class: BrowserClass) -> M3u8ClassLimit {
        match class {
            BrowserClass::MobileBrowser => self.limits.mobile_browser,
            BrowserClass::DesktopBrowser => self.limits.desktop_browser,
            BrowserClass::ToolOrDownloader => self.limits.tool_or_downloader,
        }
    }

    /// Count one playlist read for `(identity, path)` and decide whether
    /// it stays within the window budget.
    pub async fn check(&self, identity: &str, path: &str, user_agent: &str) -> Result<CounterDecision> {
        let class = browser::detect(user_agent);
        let limit = self.class_limit(class);
        let key = format!("m3u8_access:{identity}:{}", path_hash(path));

        let mut conn = self.redis.conn();
        let count: u64 = redis::cmd("INCR").arg(&key).query_async(&mut conn).await?;
        if count == 1 {
            let _: () = redis::cmd("EXPIRE")
                .arg(&key)
                .arg(limit.window_secs)
                .query_async(&mut conn)
                .await?;
        }

        let allowed = count <= limit.max_count;
        if allowed {
            debug!(
                identity,
                class = class.as_str(),
                count,
                max = limit.max_count,
                "m3u8 read counted"
            );
        } else {
            warn!(
                identity,
                class = class.as_str(),
                count,
                max = limit.max_count,
                window = limit.window_secs,
                "m3u8 window exceeded"
            );
        }

        Ok(CounterDecision {
            allowed,
            browser_class: class,
            current_count: count,
            max_count: limit.max_count,
            window_secs: limit.window_secs,
        })
    }
}
