//! Shared Redis handle.
//!
//! A single multiplexed [`ConnectionManager`] is cloned into every request
//! handler and background loop. Commands are short and non-blocking, so
//! multiplexing over one connection replaces the original pool; the
//! configured `pool_size` stays as an upper bound hint for deployments
//! that front Redis with a proxy.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::info;

use crate::config::RedisConfig;
use crate::error::{ProxyError, Result};

#[derive(Clone)]
pub struct RedisHandle {
    manager: ConnectionManager,
}

impl RedisHandle {
    pub async fn connect(cfg: &RedisConfig) -> Result<Self> {
        let url = if cfg.password.is_empty() {
            format!("redis://{}:{}/{}", cfg.host, cfg.port, cfg.db)
        } else {
            format!("redis://:{}@{}:{}/{}", cfg.password, cfg.host, cfg.port, cfg.db)
        };
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        info!(host = %cfg.host, port = cfg.port, db = cfg.db, "redis connected");
        Ok(Self { manager })
    }

    /// A cloned connection for issuing commands.
    pub fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// PING with a deadline, used by the health endpoint. Returns the
    /// round-trip latency in milliseconds.
    pub async fn ping(&self, deadline: Duration) -> Result<f64> {
        let mut conn = self.conn();
        let start = std::time::Instant::now();
        tokio::time::timeout(deadline, async {
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await
        .map_err(|_| ProxyError::Http("redis ping timeout".into()))??;
        Ok(start.elapsed().as_secs_f64() * 1000.0)
    }

    /// Count keys matching a pattern with a bounded SCAN, used by /stats.
    pub async fn count_keys(&self, pattern: &str, limit: usize) -> Result<usize> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut total = 0usize;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            total += batch.len();
            cursor = next;
            if cursor == 0 || total >= limit {
                break;
            }
        }
        Ok(total)
    }

    /// Collect keys matching a pattern with SCAN.
    pub async fn scan_keys(&self, pattern: &str, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, mut batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            keys.append(&mut batch);
            cursor = next;
            if cursor == 0 || keys.len() >= limit {
                break;
            }
        }
        keys.truncate(limit);
        Ok(keys)
    }

    /// Acquire a short-lived lock key. Returns a token to release with
    /// [`Self::unlock`], or None when the lock is held elsewhere.
    pub async fn lock(&self, key: &str, ttl_ms: u64) -> Result<Option<String>> {
        let mut conn = self.conn();
        let token = uuid::Uuid::new_v4().to_string();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.map(|_| token))
    }

    pub async fn unlock(&self, key: &str, token: &str) -> Result<()> {
        let mut conn = self.conn();
        // Only delete our own lock; a stale holder must not release a
        // successor's lock.
        let current: Option<String> = conn.get(key).await?;
        if current.as_deref() == Some(token) {
            let _: () = conn.del(key).await?;
        }
        Ok(())
    }
}
