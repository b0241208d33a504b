//! Access-log ring buffers.
//!
//! Three bounded Redis lists for the monitor UI: denied requests and
//! recent allowed requests (newest first, capped at 100 each) plus a
//! replay list recording every m3u8 counter decision (capped at 300).
//! A logging failure never fails the request that triggered it.

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::Result;
use crate::redis::RedisHandle;
use crate::util::now_secs;

pub const DENIED_KEY: &str = "access_log:denied";
pub const RECENT_KEY: &str = "access_log:recent";
pub const REPLAY_KEY: &str = "access_log:replay";

const ACCESS_LOG_CAP: usize = 100;
const REPLAY_LOG_CAP: usize = 300;
const LOG_TTL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub ts: i64,
    pub uid: String,
    pub ip: String,
    pub ua: String,
    pub path: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayLogEntry {
    pub ts: i64,
    pub identity: String,
    pub path: String,
    pub browser_class: String,
    pub count: u64,
    pub max_count: u64,
    pub blocked: bool,
}

#[derive(Clone)]
pub struct AccessLog {
    redis: RedisHandle,
}

impl AccessLog {
    pub fn new(redis: RedisHandle) -> Self {
        Self { redis }
    }

    /// Record one authorization outcome. Best effort.
    pub async fn record(
        &self,
        uid: &str,
        ip: &str,
        ua: &str,
        path: &str,
        allowed: bool,
        reason: Option<&str>,
    ) {
        let entry = AccessLogEntry {
            ts: now_secs(),
            uid: if uid.is_empty() { "unknown".to_string() } else { uid.to_string() },
            ip: ip.to_string(),
            ua: ua.to_string(),
            path: path.to_string(),
            allowed,
            reason: reason.map(str::to_owned),
        };
        let key = if allowed { RECENT_KEY } else { DENIED_KEY };
        if let Err(e) = self.push(key, &entry, ACCESS_LOG_CAP).await {
            error!(error = %e, "access log write failed");
        }
    }

    /// Record one m3u8 counter decision. Best effort.
    pub async fn record_replay(&self, entry: ReplayLogEntry) {
        if let Err(e) = self.push(REPLAY_KEY, &entry, REPLAY_LOG_CAP).await {
            error!(error = %e, "replay log write failed");
        }
    }

    async fn push<T: Serialize>(&self, key: &str, entry: &T, cap: usize) -> Result<()> {
        let raw = serde_json::to_string(entry)
            .map_err(|e| crate::error::ProxyError::Http(format!("log encode: {e}")))?;
        let mut conn = self.redis.conn();
        let _: () = conn.lpush(key, raw).await?;
        let _: () = conn.ltrim(key, 0, cap as isize - 1).await?;
        let _: () = conn.expire(key, LOG_TTL_SECS as i64).await?;
        Ok(())
    }

    /// Most recent entries in push order (newest first).
    pub async fn read(&self, key: &str, limit: usize) -> Result<Vec<AccessLogEntry>> {
        let mut conn = self.redis.conn();
        let raw: Vec<String> = conn.lrange(key, 0, limit as isize - 1).await?;
        Ok(raw.iter().filter_map(|r| serde_json::from_str(r).ok()).collect())
    }

    pub async fn counts(&self) -> Result<(usize, usize)> {
        let mut conn = self.redis.conn();
        let denied: usize = conn.llen(DENIED_KEY).await?;
        let recent: usize = conn.llen(RECENT_KEY).await?;
        Ok((denied, recent))
    }
}
