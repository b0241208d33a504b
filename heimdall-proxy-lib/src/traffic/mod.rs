//! Traffic accounting engine.
//!
//! Two tiers per UID: an accumulator for callers below the byte
//! threshold and a qualified map of reportable records. Ingest is a
//! synchronous, lock-guarded update (the lock is never held across an
//! await); a reporter task drains the qualified tier on an interval and
//! a janitor drops idle records. Failed reports merge their records back
//! so nothing is lost between ticks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::TrafficConfig;
use crate::util::now_secs;

const UNIQUE_IP_CAP: usize = 20;
const UNIQUE_SESSION_CAP: usize = 10;
const CLEANUP_EVERY_RECORDS: u64 = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct UidTraffic {
    pub uid: String,
    pub total_bytes: u64,
    pub request_count: u64,
    pub file_types: BTreeMap<String, u64>,
    pub unique_ips: HashSet<String>,
    pub unique_sessions: HashSet<String>,
    pub start_time: i64,
    pub last_activity: i64,
}

impl UidTraffic {
    fn new(uid: &str, now: i64) -> Self {
        Self {
            uid: uid.to_string(),
            total_bytes: 0,
            request_count: 0,
            file_types: BTreeMap::new(),
            unique_ips: HashSet::new(),
            unique_sessions: HashSet::new(),
            start_time: now,
            last_activity: now,
        }
    }

    fn absorb(&mut self, bytes: u64, file_type: &str, ip: &str, session_id: Option<&str>, now: i64) {
        self.total_bytes += bytes;
        self.request_count += 1;
        *self.file_types.entry(file_type.to_string()).or_insert(0) += bytes;
        if self.unique_ips.len() < UNIQUE_IP_CAP {
            self.unique_ips.insert(ip.to_string());
        }
        if let Some(sid) = session_id {
            if self.unique_sessions.len() < UNIQUE_SESSION_CAP {
                self.unique_sessions.insert(sid.to_string());
            }
        }
        self.last_activity = now;
    }

    /// Fold another record for the same UID into this one, keeping the
    /// earliest start and the set caps.
    fn merge(&mut self, other: UidTraffic) {
        self.total_bytes += other.total_bytes;
        self.request_count += other.request_count;
        for (ft, b) in other.file_types {
            *self.file_types.entry(ft).or_insert(0) += b;
        }
        for ip in other.unique_ips {
            if self.unique_ips.len() >= UNIQUE_IP_CAP {
                break;
            }
            self.unique_ips.insert(ip);
        }
        for sid in other.unique_sessions {
            if self.unique_sessions.len() >= UNIQUE_SESSION_CAP {
                break;
            }
            self.unique_sessions.insert(sid);
        }
        self.start_time = self.start_time.min(other.start_time);
        self.last_activity = self.last_activity.max(other.last_activity);
    }
}

#[derive(Debug, Default)]
struct Tiers {
    /// Tier A: sub-threshold accumulation.
    accumulator: HashMap<String, UidTraffic>,
    /// Tier B: reportable records.
    qualified: HashMap<String, UidTraffic>,
}

#[derive(Debug, Default, Serialize)]
pub struct EngineStats {
    pub total_recorded_uids: u64,
    pub total_reports_sent: u64,
    pub total_bytes_reported: u64,
    pub reports_failed: u64,
    pub accumulator_cleanups: u64,
}

#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub enabled: bool,
    pub qualified_uids: usize,
    pub accumulator_uids: usize,
    pub min_bytes_threshold: u64,
    pub report_interval_secs: u64,
    pub report_url_configured: bool,
    pub stats: EngineStats,
}

pub struct TrafficEngine {
    cfg: TrafficConfig,
    tiers: Mutex<Tiers>,
    record_calls: AtomicU64,
    stats: Mutex<EngineStats>,
    client: reqwest::Client,
}

impl TrafficEngine {
    pub fn new(cfg: TrafficConfig, client: reqwest::Client) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            tiers: Mutex::new(Tiers::default()),
            record_calls: AtomicU64::new(0),
            stats: Mutex::new(EngineStats::default()),
            client,
        })
    }

    /// Ingest one finished (or broken-off) transfer. Unattributable
    /// traffic is dropped.
    pub fn record(
        &self,
        uid: &str,
        bytes: u64,
        file_type: &str,
        client_ip: &str,
        session_id: Option<&str>,
    ) {
        if !self.cfg.enabled || uid.is_empty() || bytes == 0 {
            return;
        }
        let now = now_secs();
        {
            let mut tiers = self.tiers.lock().expect("traffic tiers poisoned");
            if let Some(record) = tiers.qualified.get_mut(uid) {
                record.absorb(bytes, file_type, client_ip, session_id, now);
            } else {
                let record = tiers
                    .accumulator
                    .entry(uid.to_string())
                    .or_insert_with(|| UidTraffic::new(uid, now));
                record.absorb(bytes, file_type, client_ip, session_id, now);
                if record.total_bytes >= self.cfg.min_bytes_threshold {
                    let promoted = tiers.accumulator.remove(uid).expect("record just inserted");
                    match tiers.qualified.get_mut(uid) {
                        Some(existing) => existing.merge(promoted),
                        None => {
                            tiers.qualified.insert(uid.to_string(), promoted);
                        }
                    }
                    self.stats.lock().expect("stats poisoned").total_recorded_uids += 1;
                    debug!(uid, "uid crossed the report threshold");
                }
            }
        }

        // Opportunistic accumulator sweep, once per ~1000 ingests.
        if self.record_calls.fetch_add(1, Ordering::Relaxed) % CLEANUP_EVERY_RECORDS
            == CLEANUP_EVERY_RECORDS - 1
        {
            self.cleanup_accumulator(now);
        }
    }

    fn cleanup_accumulator(&self, now: i64) {
        let idle = self.cfg.accumulator_idle_timeout_secs as i64;
        let mut tiers = self.tiers.lock().expect("traffic tiers poisoned");
        let before = tiers.accumulator.len();
        tiers.accumulator.retain(|_, r| now - r.last_activity <= idle);
        let dropped = before - tiers.accumulator.len();
        if dropped > 0 {
            self.stats.lock().expect("stats poisoned").accumulator_cleanups += 1;
            debug!(dropped, "idle accumulator records dropped");
        }
    }

    /// Drop records idle past the long timeout in either tier.
    fn cleanup_long_idle(&self, now: i64) {
        let idle = self.cfg.long_idle_timeout_secs as i64;
        let mut tiers = self.tiers.lock().expect("traffic tiers poisoned");
        tiers.accumulator.retain(|_, r| now - r.last_activity <= idle);
        let before = tiers.qualified.len();
        tiers.qualified.retain(|_, r| now - r.last_activity <= idle);
        if before != tiers.qualified.len() {
            info!(dropped = before - tiers.qualified.len(), "long-idle qualified records dropped");
        }
    }

    /// Drain Tier B and POST it to the sink. On failure the drained
    /// records merge back (together with anything recorded meanwhile).
    pub async fn report_once(&self) -> bool {
        if self.cfg.report_url.is_empty() {
            return true;
        }
        let drained: Vec<UidTraffic> = {
            let mut tiers = self.tiers.lock().expect("traffic tiers poisoned");
            if tiers.qualified.is_empty() {
                return true;
            }
            tiers.qualified.drain().map(|(_, v)| v).collect()
        };

        let total_bytes: u64 = drained.iter().map(|r| r.total_bytes).sum();
        let body = serde_json::json!({
            "records": drained.iter().map(record_json).collect::<Vec<_>>(),
            "reporter": "file-proxy",
            "ts": now_secs(),
        });

        let result = self
            .client
            .post(&self.cfg.report_url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                let mut stats = self.stats.lock().expect("stats poisoned");
                stats.total_reports_sent += 1;
                stats.total_bytes_reported += total_bytes;
                info!(records = drained.len(), total_bytes, "traffic report delivered");
                true
            }
            outcome => {
                match outcome {
                    Ok(resp) => warn!(status = resp.status().as_u16(), "traffic report rejected"),
                    Err(e) => warn!(error = %e, "traffic report failed"),
                }
                self.stats.lock().expect("stats poisoned").reports_failed += 1;
                let mut tiers = self.tiers.lock().expect("traffic tiers poisoned");
                for record in drained {
                    match tiers.qualified.get_mut(&record.uid) {
                        Some(existing) => existing.merge(record),
                        None => {
                            tiers.qualified.insert(record.uid.clone(), record);
                        }
                    }
                }
                false
            }
        }
    }

    /// Reporter + janitor loops. Both observe the shutdown signal and the
    /// reporter flushes one last time on the way out.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.cfg.enabled {
            return;
        }
        info!(
            interval = self.cfg.report_interval_secs,
            threshold = self.cfg.min_bytes_threshold,
            url = %self.cfg.report_url,
            "traffic engine started"
        );
        let mut report_tick =
            tokio::time::interval(std::time::Duration::from_secs(self.cfg.report_interval_secs));
        report_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        report_tick.tick().await; // immediate first tick
        let mut janitor_tick = tokio::time::interval(std::time::Duration::from_secs(60));
        janitor_tick.tick().await;

        loop {
            tokio::select! {
                _ = report_tick.tick() => {
                    self.report_once().await;
                }
                _ = janitor_tick.tick() => {
                    self.cleanup_long_idle(now_secs());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Promote everything and flush once, best effort.
        {
            let mut tiers = self.tiers.lock().expect("traffic tiers poisoned");
            let pending: Vec<UidTraffic> =
                tiers.accumulator.drain().map(|(_, v)| v).collect();
            for record in pending {
                match tiers.qualified.get_mut(&record.uid) {
                    Some(existing) => existing.merge(record),
                    None => {
                        tiers.qualified.insert(record.uid.clone(), record);
                    }
                }
            }
        }
        if !self.report_once().await {
            error!("final traffic flush failed, records dropped at shutdown");
        }
        info!("traffic engine stopped");
    }

    pub fn status(&self) -> EngineStatus {
        let tiers = self.tiers.lock().expect("traffic tiers poisoned");
        let stats = self.stats.lock().expect("stats poisoned");
        EngineStatus {
            enabled: self.cfg.enabled,
            qualified_uids: tiers.qualified.len(),
            accumulator_uids: tiers.accumulator.len(),
            min_bytes_threshold: self.cfg.min_bytes_threshold,
            report_interval_secs: self.cfg.report_interval_secs,
            report_url_configured: !self.cfg.report_url.is_empty(),
            stats: EngineStats {
                total_recorded_uids: stats.total_recorded_uids,
                total_reports_sent: stats.total_reports_sent,
                total_bytes_reported: stats.total_bytes_reported,
                reports_failed: stats.reports_failed,
                accumulator_cleanups: stats.accumulator_cleanups,
            },
        }
    }

    /// Test and shutdown introspection: a UID's tier placement.
    pub fn tier_of(&self, uid: &str) -> Option<Tier> {
        let tiers = self.tiers.lock().expect("traffic tiers poisoned");
        if tiers.qualified.contains_key(uid) {
            Some(Tier::Qualified)
        } else if tiers.accumulator.contains_key(uid) {
            Some(Tier::Accumulator)
        } else {
            None
        }
    }

    /// Byte totals currently held for a UID across both tiers.
    pub fn held_bytes(&self, uid: &str) -> u64 {
        let tiers = self.tiers.lock().expect("traffic tiers poisoned");
        tiers
            .qualified
            .get(uid)
            .or_else(|| tiers.accumulator.get(uid))
            .map(|r| r.total_bytes)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Accumulator,
    Qualified,
}

fn record_json(r: &UidTraffic) -> serde_json::Value {
    let mut ips: Vec<&String> = r.unique_ips.iter().collect();
    ips.sort();
    let mut sessions: Vec<&String> = r.unique_sessions.iter().collect();
    sessions.sort();
    serde_json::json!({
        "uid": r.uid,
        "total_bytes": r.total_bytes,
        "request_count": r.request_count,
        "file_types": r.file_types,
        "unique_ips": ips,
        "unique_sessions": sessions,
        "start_time": r.start_time,
        "last_activity": r.last_activity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(threshold: u64) -> Arc<TrafficEngine> {
        let cfg = TrafficConfig {
            enabled: true,
            report_url: String::new(),
            api_key: String::new(),
            min_bytes_threshold: threshold,
            report_interval_secs: 300,
            accumulator_idle_timeout_secs: 600,
            long_idle_timeout_secs: 1800,
        };
        TrafficEngine::new(cfg, reqwest::Client::new())
    }

    #[test]
    fn test_threshold_promotion() {
        let engine = engine(1024 * 1024);
        engine.record("u", 512 * 1024, "ts", "10.0.0.1", Some("s1"));
        assert_eq!(engine.tier_of("u"), Some(Tier::Accumulator));

        engine.record("u", 512 * 1024, "ts", "10.0.0.1", Some("s1"));
        assert_eq!(engine.tier_of("u"), Some(Tier::Qualified));
        assert_eq!(engine.held_bytes("u"), 1024 * 1024);
    }

    #[test]
    fn test_empty_uid_dropped() {
        let engine = engine(100);
        engine.record("", 1000, "ts", "10.0.0.1", None);
        assert_eq!(engine.status().accumulator_uids, 0);
        assert_eq!(engine.status().qualified_uids, 0);
    }

    #[test]
    fn test_byte_conservation_across_tiers() {
        let engine = engine(1000);
        let mut expected = 0u64;
        for i in 0..10 {
            let bytes = 300 + i * 17;
            engine.record("u", bytes, "ts", "10.0.0.1", None);
            expected += bytes;
        }
        assert_eq!(engine.held_bytes("u"), expected);
    }

    #[test]
    fn test_file_type_breakdown_and_caps() {
        let engine = engine(1);
        for i in 0..30 {
            engine.record("u", 10, "ts", &format!("10.0.0.{i}"), Some(&format!("s{i}")));
        }
        engine.record("u", 40, "m3u8", "10.0.0.1", None);

        let tiers = engine.tiers.lock().expect("tiers");
        let record = tiers.qualified.get("u").expect("qualified");
        assert_eq!(record.total_bytes, 340);
        assert_eq!(record.request_count, 31);
        assert_eq!(record.file_types.get("ts"), Some(&300));
        assert_eq!(record.file_types.get("m3u8"), Some(&40));
        assert_eq!(record.unique_ips.len(), UNIQUE_IP_CAP);
        assert_eq!(record.unique_sessions.len(), UNIQUE_SESSION_CAP);
    }

    #[test]
    fn test_merge_keeps_earliest_start() {
        let mut a = UidTraffic::new("u", 100);
        a.absorb(10, "ts", "ip1", None, 100);
        let mut b = UidTraffic::new("u", 50);
        b.absorb(20, "ts", "ip2", None, 120);
        a.merge(b);
        assert_eq!(a.start_time, 50);
        assert_eq!(a.last_activity, 120);
        assert_eq!(a.total_bytes, 30);
        assert_eq!(a.request_count, 2);
    }

    #[test]
    fn test_report_json_shape() {
        let mut r = UidTraffic::new("u1", 100);
        r.absorb(2048, "ts", "203.0.113.5", Some("sid-9"), 110);
        let value = record_json(&r);
        assert_eq!(value["uid"], "u1");
        assert_eq!(value["total_bytes"], 2048);
        assert_eq!(value["request_count"], 1);
        assert_eq!(value["file_types"]["ts"], 2048);
        assert_eq!(value["unique_ips"][0], "203.0.113.5");
        assert_eq!(value["start_time"], 100);
        assert_eq!(value["last_activity"], 110);
    }
}
