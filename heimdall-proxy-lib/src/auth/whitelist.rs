//! Dynamic whitelist store.
//!
//! Two disjoint namespaces keyed by `(ip_pattern, ua_hash)`:
//! `ip_cidr_access:*` entries bind a caller to key paths, while
//! `static_file_access:*` entries authorize static files by IP+UA alone.
//! Per UID, an ordered pair table caps how many UA+IP combinations may be
//! live at once; overflow evicts the oldest pair and deletes its entry.

use std::net::IpAddr;

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::cidr;
use crate::error::{ProxyError, Result};
use crate::redis::RedisHandle;
use crate::util::now_secs;

const STATIC_ACCESS_TYPE: &str = "static_files_only";
const LOCK_TTL_MS: u64 = 2_000;
const LOCK_RETRIES: u32 = 20;
const PROBE_SCAN_LIMIT: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathEntry {
    pub key_path: String,
    pub added_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub uid: String,
    #[serde(default)]
    pub paths: Vec<PathEntry>,
    pub ip_patterns: Vec<String>,
    pub user_agent: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UidPair {
    pub pair_id: String,
    pub ip_pattern: String,
    pub ua_hash: String,
    pub created_at: i64,
    pub last_updated: i64,
}

/// Result of an admin add, echoed back as the endpoint response body.
#[derive(Debug, Serialize)]
pub struct AddResult {
    pub ip_pattern: String,
    pub ua_hash: String,
    pub ttl: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    pub paths_count: usize,
    pub pairs_count: usize,
    pub pairs_evicted: usize,
}

/// A successful probe: the entry's uid plus the pattern that matched.
#[derive(Debug, Clone)]
pub struct ProbeHit {
    pub uid: String,
    pub matched_pattern: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Namespace {
    PathBound,
    StaticOnly,
}

impl Namespace {
    fn entry_prefix(self) -> &'static str {
        match self {
            Namespace::PathBound => "ip_cidr_access",
            Namespace::StaticOnly => "static_file_access",
        }
    }

    fn pairs_prefix(self) -> &'static str {
        match self {
            Namespace::PathBound => "uid_ua_ip_pairs",
            Namespace::StaticOnly => "uid_static_ua_ip_pairs",
        }
    }
}

fn entry_key(ns: Namespace, pattern: &str, ua_hash: &str) -> String {
    format!("{}:{}:{}", ns.entry_prefix(), cidr::encode_key_segment(pattern), ua_hash)
}

fn pairs_key(ns: Namespace, uid: &str) -> String {
    format!("{}:{}", ns.pairs_prefix(), uid)
}

#[derive(Clone)]
pub struct WhitelistStore {
    redis: RedisHandle,
    ip_access_ttl: u64,
    max_paths_per_entry: usize,
    max_pairs_per_uid: usize,
}

impl WhitelistStore {
    pub fn new(
        redis: RedisHandle,
        ip_access_ttl: u64,
        max_paths_per_entry: usize,
        max_pairs_per_uid: usize,
    ) -> Self {
        Self { redis, ip_access_ttl, max_paths_per_entry, max_pairs_per_uid }
    }

    /// Admin operation: bind `(ip, ua)` to the key path extracted from
    /// `path` under `uid`. Idempotent for repeated identical input.
    pub async fn add_path_bound(
        &self,
        uid: &str,
        key_path: &str,
        ip_or_cidr: &str,
        user_agent: &str,
    ) -> Result<AddResult> {
        if key_path.is_empty() {
            return Err(ProxyError::Http("invalid path: no match key".into()));
        }
        let pattern = cidr::normalize_pattern(ip_or_cidr)
            .ok_or_else(|| ProxyError::Http(format!("invalid IP or CIDR: {ip_or_cidr}")))?;
        self.add(Namespace::PathBound, uid, Some(key_path), &pattern, user_agent).await
    }

    /// Admin operation: authorize `(ip, ua)` for static files under `uid`,
    /// path-independent.
    pub async fn add_static(
        &self,
        uid: &str,
        ip_or_cidr: &str,
        user_agent: &str,
    ) -> Result<AddResult> {
        let pattern = cidr::normalize_pattern(ip_or_cidr)
            .ok_or_else(|| ProxyError::Http(format!("invalid IP or CIDR: {ip_or_cidr}")))?;
        self.add(Namespace::StaticOnly, uid, None, &pattern, user_agent).await
    }

    async fn add(
        &self,
        ns: Namespace,
        uid: &str,
        key_path: Option<&str>,
        pattern: &str,
        user_agent: &str,
    ) -> Result<AddResult> {
        let ua_hash = crate::util::ua_hash(user_agent);
        let key = entry_key(ns, pattern, &ua_hash);

        // Concurrent adds for the same key serialize on a short-lived
        // Redis lock; list merging is read-modify-write.
        let lock_key = format!("lock:{key}");
        let token = self.acquire_lock(&lock_key).await?;
        let result = self
            .add_locked(ns, uid, key_path, pattern, user_agent, &ua_hash, &key)
            .await;
        self.redis.unlock(&lock_key, &token).await?;
        result
    }

    async fn add_locked(
        &self,
        ns: Namespace,
        uid: &str,
        key_path: Option<&str>,
        pattern: &str,
        user_agent: &str,
        ua_hash: &str,
        key: &str,
    ) -> Result<AddResult> {
        let mut conn = self.redis.conn();
        let now = now_secs();

        let mut entry = match conn.get::<_, Option<String>>(key).await? {
            Some(raw) => serde_json::from_str::<WhitelistEntry>(&raw).unwrap_or_else(|_| {
                warn!(key, "unreadable whitelist entry replaced");
                new_entry(ns, uid, pattern, user_agent, now)
            }),
            None => new_entry(ns, uid, pattern, user_agent, now),
        };

        if let Some(kp) = key_path {
            match entry.paths.iter_mut().find(|p| p.key_path == kp) {
                Some(existing) => existing.added_at = now,
                None => entry.paths.push(PathEntry { key_path: kp.to_string(), added_at: now }),
            }
            let evicted = evict_oldest_paths(&mut entry.paths, self.max_paths_per_entry);
            if !evicted.is_empty() {
                debug!(key, evicted = evicted.len(), "path FIFO eviction");
            }
        }
        if !entry.ip_patterns.iter().any(|p| p == pattern) {
            entry.ip_patterns.push(pattern.to_string());
        }

        let raw = serde_json::to_string(&entry)
            .map_err(|e| ProxyError::Http(format!("whitelist encode: {e}")))?;
        let _: () = conn.set_ex(key, raw, self.ip_access_ttl).await?;

        let (pairs_count, pairs_evicted) =
            self.update_pair_table(ns, uid, pattern, ua_hash, now).await?;

        info!(
            uid,
            pattern,
            ua_hash,
            namespace = ns.entry_prefix(),
            paths = entry.paths.len(),
            "whitelist entry stored"
        );

        Ok(AddResult {
            ip_pattern: pattern.to_string(),
            ua_hash: ua_hash.to_string(),
            ttl: self.ip_access_ttl,
            key_path: key_path.map(str::to_owned),
            paths_count: entry.paths.len(),
            pairs_count,
            pairs_evicted,
        })
    }

    /// Maintain the per-UID pair table: append or touch the pair, evict
    /// the oldest past the cap and delete the evicted entries' keys.
    async fn update_pair_table(
        &self,
        ns: Namespace,
        uid: &str,
        pattern: &str,
        ua_hash: &str,
        now: i64,
    ) -> Result<(usize, usize)> {
        let mut conn = self.redis.conn();
        let table_key = pairs_key(ns, uid);
        let pair_id = format!("{pattern}:{ua_hash}");

        let mut pairs: Vec<UidPair> = match conn.get::<_, Option<String>>(&table_key).await? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => Vec::new(),
        };

        match pairs.iter_mut().find(|p| p.pair_id == pair_id) {
            Some(existing) => existing.last_updated = now,
            None => pairs.push(UidPair {
                pair_id,
                ip_pattern: pattern.to_string(),
                ua_hash: ua_hash.to_string(),
                created_at: now,
                last_updated: now,
            }),
        }

        let evicted = evict_oldest_pairs(&mut pairs, self.max_pairs_per_uid);
        for old in &evicted {
            let old_key = entry_key(ns, &old.ip_pattern, &old.ua_hash);
            let _: () = conn.del(&old_key).await?;
            info!(uid, pair_id = %old.pair_id, "evicted UA+IP pair and its entry");
        }

        let raw = serde_json::to_string(&pairs)
            .map_err(|e| ProxyError::Http(format!("pair table encode: {e}")))?;
        let _: () = conn.set_ex(&table_key, raw, self.ip_access_ttl).await?;

        Ok((pairs.len(), evicted.len()))
    }

    /// Probe the path-bound namespace: any entry under this ua_hash whose
    /// patterns contain the client IP and whose paths contain `key_path`.
    /// `skip_path_check` drops the path condition (static IP-only mode).
    /// A hit refreshes the entry's TTL.
    pub async fn probe_path_bound(
        &self,
        ip: IpAddr,
        ua_hash: &str,
        key_path: &str,
        skip_path_check: bool,
    ) -> Result<Option<ProbeHit>> {
        if key_path.is_empty() && !skip_path_check {
            return Ok(None);
        }
        self.probe(Namespace::PathBound, ip, ua_hash, |entry| {
            skip_path_check || entry.paths.iter().any(|p| p.key_path == key_path)
        })
        .await
    }

    /// Probe the static namespace: IP+UA match only.
    pub async fn probe_static(&self, ip: IpAddr, ua_hash: &str) -> Result<Option<ProbeHit>> {
        self.probe(Namespace::StaticOnly, ip, ua_hash, |_| true).await
    }

    async fn probe<F>(
        &self,
        ns: Namespace,
        ip: IpAddr,
        ua_hash: &str,
        accept: F,
    ) -> Result<Option<ProbeHit>>
    where
        F: Fn(&WhitelistEntry) -> bool,
    {
        let mut conn = self.redis.conn();
        let pattern = format!("{}:*:{}", ns.entry_prefix(), ua_hash);
        let keys = self.redis.scan_keys(&pattern, PROBE_SCAN_LIMIT).await?;

        for key in keys {
            let Some(raw) = conn.get::<_, Option<String>>(&key).await? else {
                continue;
            };
            let Ok(entry) = serde_json::from_str::<WhitelistEntry>(&raw) else {
                continue;
            };
            if let Some(matched) = cidr::match_patterns(ip, &entry.ip_patterns) {
                if accept(&entry) {
                    let _: () = conn.expire(&key, self.ip_access_ttl as i64).await?;
                    debug!(%ip, matched, uid = %entry.uid, "whitelist probe hit");
                    return Ok(Some(ProbeHit {
                        uid: entry.uid,
                        matched_pattern: matched.to_string(),
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Pair table readout for the admin/monitor surface.
    pub async fn uid_pairs(&self, uid: &str) -> Result<Vec<UidPair>> {
        let mut conn = self.redis.conn();
        let raw: Option<String> = conn.get(pairs_key(Namespace::PathBound, uid)).await?;
        Ok(raw.and_then(|r| serde_json::from_str(&r).ok()).unwrap_or_default())
    }

    async fn acquire_lock(&self, lock_key: &str) -> Result<String> {
        for _ in 0..LOCK_RETRIES {
            if let Some(token) = self.redis.lock(lock_key, LOCK_TTL_MS).await? {
                return Ok(token);
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        Err(ProxyError::Http(format!("whitelist lock busy: {lock_key}")))
    }
}

/// Drop the oldest paths past the cap. Stable by insertion order for
/// equal timestamps.
fn evict_oldest_paths(paths: &mut Vec<PathEntry>, cap: usize) -> Vec<PathEntry> {
    if paths.len() <= cap {
        return Vec::new();
    }
    paths.sort_by_key(|p| p.added_at);
    let overflow = paths.len() - cap;
    paths.drain(..overflow).collect()
}

/// Drop the oldest UA+IP pairs past the cap; the caller deletes the
/// evicted pairs' whitelist entries.
fn evict_oldest_pairs(pairs: &mut Vec<UidPair>, cap: usize) -> Vec<UidPair> {
    if pairs.len() <= cap {
        return Vec::new();
    }
    pairs.sort_by_key(|p| p.created_at);
    let overflow = pairs.len() - cap;
    pairs.drain(..overflow).collect()
}

fn new_entry(
    ns: Namespace,
    uid: &str,
    pattern: &str,
    user_agent: &str,
    now: i64,
) -> WhitelistEntry {
    WhitelistEntry {
        uid: uid.to_string(),
        paths: Vec::new(),
        ip_patterns: vec![pattern.to_string()],
        user_agent: user_agent.to_string(),
        created_at: now,
        access_type: match ns {
            Namespace::PathBound => None,
            Namespace::StaticOnly => Some(STATIC_ACCESS_TYPE.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_keys_are_disjoint_namespaces() {
        let path_bound = entry_key(Namespace::PathBound, "192.168.1.0/24", "abcd1234");
        let static_only = entry_key(Namespace::StaticOnly, "192.168.1.0/24", "abcd1234");
        assert_eq!(path_bound, "ip_cidr_access:192.168.1.0_24:abcd1234");
        assert_eq!(static_only, "static_file_access:192.168.1.0_24:abcd1234");
        assert_ne!(path_bound, static_only);
    }

    #[test]
    fn test_static_entry_carries_access_type() {
        let e = new_entry(Namespace::StaticOnly, "u", "10.0.0.0/24", "UA", 1);
        assert_eq!(e.access_type.as_deref(), Some("static_files_only"));
        assert!(e.paths.is_empty());
        let e = new_entry(Namespace::PathBound, "u", "10.0.0.0/24", "UA", 1);
        assert!(e.access_type.is_none());
    }

    #[test]
    fn test_entry_round_trips_without_paths_field() {
        // Static entries never serialize a paths list the probe would
        // misread; missing fields deserialize to defaults.
        let raw = r#"{"uid":"u","ip_patterns":["10.0.0.0/24"],"user_agent":"UA","created_at":5}"#;
        let entry: WhitelistEntry = serde_json::from_str(raw).expect("decode");
        assert!(entry.paths.is_empty());
        assert!(entry.access_type.is_none());
    }

    fn pair(n: u32, created_at: i64) -> UidPair {
        UidPair {
            pair_id: format!("10.0.{n}.0/24:hash{n}"),
            ip_pattern: format!("10.0.{n}.0/24"),
            ua_hash: format!("hash{n}"),
            created_at,
            last_updated: created_at,
        }
    }

    #[test]
    fn test_pair_fifo_keeps_most_recent() {
        let mut pairs: Vec<UidPair> = (1..=5).map(|n| pair(n, n as i64)).collect();
        let evicted = evict_oldest_pairs(&mut pairs, 3);

        assert_eq!(evicted.len(), 2);
        assert_eq!(evicted[0].ip_pattern, "10.0.1.0/24");
        assert_eq!(evicted[1].ip_pattern, "10.0.2.0/24");
        let kept: Vec<&str> = pairs.iter().map(|p| p.ip_pattern.as_str()).collect();
        assert_eq!(kept, ["10.0.3.0/24", "10.0.4.0/24", "10.0.5.0/24"]);
    }

    #[test]
    fn test_pair_fifo_stable_for_equal_timestamps() {
        // Pairs added within the same second evict in insertion order.
        let mut pairs: Vec<UidPair> = (1..=4).map(|n| pair(n, 100)).collect();
        let evicted = evict_oldest_pairs(&mut pairs, 3);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].ip_pattern, "10.0.1.0/24");
    }

    #[test]
    fn test_pair_fifo_under_cap_is_noop() {
        let mut pairs: Vec<UidPair> = (1..=3).map(|n| pair(n, n as i64)).collect();
        assert!(evict_oldest_pairs(&mut pairs, 5).is_empty());
        assert_eq!(pairs.len(), 3);
    }

    #[test]
    fn test_path_fifo() {
        let mut paths: Vec<PathEntry> = (1..=6)
            .map(|n| PathEntry { key_path: format!("K{n}"), added_at: n as i64 })
            .collect();
        let evicted = evict_oldest_paths(&mut paths, 4);
        assert_eq!(evicted.len(), 2);
        assert_eq!(evicted[0].key_path, "K1");
        assert_eq!(paths.first().map(|p| p.key_path.as_str()), Some("K3"));
    }
}
