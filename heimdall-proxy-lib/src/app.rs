//! Top-level service wiring.
//!
//! One `App` per process owns every long-lived component; request
//! handlers receive it as an `Arc` instead of reaching for globals.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::access_log::AccessLog;
use crate::auth::AuthPipeline;
use crate::config::Config;
use crate::error::Result;
use crate::redis::RedisHandle;
use crate::stream::registry::TransferRegistry;
use crate::stream::StreamService;
use crate::traffic::TrafficEngine;
use crate::util::now_secs;

/// Process-local request counters surfaced by /stats.
#[derive(Default)]
pub struct Counters {
    pub requests_total: AtomicU64,
    pub allowed_total: AtomicU64,
    pub denied_total: AtomicU64,
    pub origin_errors_total: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct CountersSnapshot {
    pub requests_total: u64,
    pub allowed_total: u64,
    pub denied_total: u64,
    pub origin_errors_total: u64,
}

impl Counters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            allowed_total: self.allowed_total.load(Ordering::Relaxed),
            denied_total: self.denied_total.load(Ordering::Relaxed),
            origin_errors_total: self.origin_errors_total.load(Ordering::Relaxed),
        }
    }
}

pub struct App {
    pub cfg: Arc<Config>,
    pub redis: RedisHandle,
    pub auth: AuthPipeline,
    pub stream: StreamService,
    pub access_log: AccessLog,
    pub traffic: Arc<TrafficEngine>,
    pub registry: Arc<TransferRegistry>,
    pub counters: Counters,
    pub started_at: i64,
}

impl App {
    pub async fn build(cfg: Config) -> Result<Arc<Self>> {
        let cfg = Arc::new(cfg);
        let redis = RedisHandle::connect(&cfg.redis).await?;
        let registry = TransferRegistry::new();
        // One outbound pool for the origin, the report sink and the file
        // probes; ssl_verify=false disables verification for all of them.
        let client = crate::stream::build_origin_client(&cfg)?;
        let traffic = TrafficEngine::new(cfg.traffic.clone(), client.clone());
        let stream = StreamService::new(
            Arc::clone(&cfg),
            Arc::clone(&registry),
            Arc::clone(&traffic),
            client,
        );
        let auth = AuthPipeline::new(Arc::clone(&cfg), redis.clone());
        let access_log = AccessLog::new(redis.clone());

        Ok(Arc::new(Self {
            cfg,
            redis,
            auth,
            stream,
            access_log,
            traffic,
            registry,
            counters: Counters::default(),
            started_at: now_secs(),
        }))
    }
}
