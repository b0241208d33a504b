//! Session records on Redis.
//!
//! Two keys per session: `session:<sid>` holds the record, the reverse
//! index `session_idx:<uid>:<ip>:<ua_hash>:<key_path>` maps a fingerprint
//! back to its sid. Both carry the same TTL and are refreshed together on
//! reuse, so at most one record is active per fingerprint.

use std::net::IpAddr;

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::redis::RedisHandle;
use crate::util::now_secs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub uid: String,
    pub ip: String,
    pub ua: String,
    pub key_path: String,
    pub created_at: i64,
    pub last_active: i64,
    pub access_count: u64,
}

#[derive(Clone)]
pub struct SessionStore {
    redis: RedisHandle,
    ttl_secs: u64,
}

fn record_key(sid: &str) -> String {
    format!("session:{sid}")
}

fn index_key(uid: &str, ip: &str, ua_hash: &str, key_path: &str) -> String {
    format!("session_idx:{uid}:{ip}:{ua_hash}:{key_path}")
}

impl SessionStore {
    pub fn new(redis: RedisHandle, ttl_secs: u64) -> Self {
        Self { redis, ttl_secs }
    }

    /// Reuse an existing session for the fingerprint. IP and UA must both
    /// match the stored record; a hit refreshes both keys' TTLs and bumps
    /// the access count.
    pub async fn reuse(
        &self,
        uid: &str,
        ip: IpAddr,
        ua: &str,
        ua_hash: &str,
        key_path: &str,
    ) -> Result<Option<String>> {
        let mut conn = self.redis.conn();
        let ip_str = ip.to_string();
        let idx = index_key(uid, &ip_str, ua_hash, key_path);

        let Some(sid) = conn.get::<_, Option<String>>(&idx).await? else {
            return Ok(None);
        };
        let Some(raw) = conn.get::<_, Option<String>>(record_key(&sid)).await? else {
            // Stale index without a record; drop it.
            let _: () = conn.del(&idx).await?;
            return Ok(None);
        };
        let Ok(mut record) = serde_json::from_str::<SessionRecord>(&raw) else {
            let _: () = conn.del(record_key(&sid)).await?;
            return Ok(None);
        };

        if record.ip != ip_str || record.ua != ua {
            debug!(sid, "session fingerprint mismatch, not reused");
            return Ok(None);
        }

        record.last_active = now_secs();
        record.access_count += 1;
        let raw = serde_json::to_string(&record).unwrap_or(raw);
        let _: () = conn.set_ex(record_key(&sid), raw, self.ttl_secs).await?;
        let _: () = conn.set_ex(&idx, &sid, self.ttl_secs).await?;
        debug!(sid, uid, "session reused");
        Ok(Some(sid))
    }

    /// Create a fresh session for the fingerprint.
    pub async fn create(
        &self,
        uid: &str,
        ip: IpAddr,
        ua: &str,
        ua_hash: &str,
        key_path: &str,
    ) -> Result<String> {
        let mut conn = self.redis.conn();
        let sid = Uuid::new_v4().to_string();
        let now = now_secs();
        let record = SessionRecord {
            uid: uid.to_string(),
            ip: ip.to_string(),
            ua: ua.to_string(),
            key_path: key_path.to_string(),
            created_at: now,
            last_active: now,
            access_count: 1,
        };
        let raw = serde_json::to_string(&record)
            .map_err(|e| crate::error::ProxyError::Http(format!("session encode: {e}")))?;
        let _: () = conn.set_ex(record_key(&sid), raw, self.ttl_secs).await?;
        let _: () = conn
            .set_ex(index_key(uid, &record.ip, ua_hash, key_path), &sid, self.ttl_secs)
            .await?;
        debug!(sid, uid, key_path, "session created");
        Ok(sid)
    }

    /// Fetch a session record by id, used by /stats style introspection.
    pub async fn get(&self, sid: &str) -> Result<Option<SessionRecord>> {
        let mut conn = self.redis.conn();
        let raw: Option<String> = conn.get(record_key(sid)).await?;
        Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
    }
}
