//! Monitoring endpoints: health, stats, traffic, active transfers and the
//! access-log readouts. All of them are plain JSON for the dashboard.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderValue, Response, StatusCode};
use serde_json::json;
use tracing::error;

use crate::access_log;
use crate::app::App;
use crate::proxy::respond::json_response;
use crate::stream::{full_body, RespBody};
use crate::util::now_secs;

const REDIS_PING_TIMEOUT: Duration = Duration::from_secs(2);
const KEY_CENSUS_LIMIT: usize = 10_000;

/// Liveness plus a Redis round trip. Unreachable Redis degrades the
/// status to 503 so orchestration can rotate the instance.
pub async fn health(app: &Arc<App>) -> Response<RespBody> {
    match app.redis.ping(REDIS_PING_TIMEOUT).await {
        Ok(latency_ms) => json_response(
            StatusCode::OK,
            &json!({
                "status": "healthy",
                "timestamp": now_secs(),
                "uptime_secs": now_secs() - app.started_at,
                "redis": { "status": "connected", "latency_ms": (latency_ms * 100.0).round() / 100.0 },
                "http_client": { "status": "active" },
                "traffic_engine": app.traffic.status(),
            }),
        ),
        Err(e) => {
            error!(error = %e, "health check failed");
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &json!({
                    "status": "unhealthy",
                    "timestamp": now_secs(),
                    "redis": { "status": "unreachable" },
                }),
            )
        }
    }
}

/// Process counters plus a bounded census of the Redis key families.
pub async fn stats(app: &Arc<App>) -> Response<RespBody> {
    let sessions = app.redis.count_keys("session:*", KEY_CENSUS_LIMIT).await.ok();
    let whitelist = app
        .redis
        .count_keys("ip_cidr_access:*", KEY_CENSUS_LIMIT)
        .await
        .ok();
    let static_whitelist = app
        .redis
        .count_keys("static_file_access:*", KEY_CENSUS_LIMIT)
        .await
        .ok();
    let m3u8_counters = app
        .redis
        .count_keys("m3u8_access:*", KEY_CENSUS_LIMIT)
        .await
        .ok();

    json_response(
        StatusCode::OK,
        &json!({
            "timestamp": now_secs(),
            "counters": app.counters.snapshot(),
            "pool": {
                "redis_pool_size": app.cfg.redis.pool_size,
                "http_connector_limit": app.cfg.http_pool.connector_limit,
                "http_per_host": app.cfg.http_pool.per_host,
            },
            "redis_keys": {
                "active_sessions": sessions,
                "whitelist_entries": whitelist,
                "static_whitelist_entries": static_whitelist,
                "m3u8_counters": m3u8_counters,
            },
        }),
    )
}

pub fn traffic(app: &Arc<App>) -> Response<RespBody> {
    let mut status = serde_json::to_value(app.traffic.status()).unwrap_or_else(|_| json!({}));
    if let Some(map) = status.as_object_mut() {
        map.insert("timestamp".into(), json!(now_secs()));
    }
    json_response(StatusCode::OK, &status)
}

pub fn active_transfers(app: &Arc<App>) -> Response<RespBody> {
    let snapshot = app.registry.snapshot();
    json_response(
        StatusCode::OK,
        &serde_json::to_value(&snapshot).unwrap_or_else(|_| json!({})),
    )
}

pub async fn access_logs(app: &Arc<App>, denied: bool, limit: usize) -> Response<RespBody> {
    let key = if denied { access_log::DENIED_KEY } else { access_log::RECENT_KEY };
    match app.access_log.read(key, limit).await {
        Ok(entries) => json_response(
            StatusCode::OK,
            &json!({
                "count": entries.len(),
                "entries": entries,
            }),
        ),
        Err(e) => {
            error!(error = %e, "access log read failed");
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &json!({ "error": "transient" }),
            )
        }
    }
}

/// The dashboard is a static file owned by the deployment; without one
/// configured the route is a JSON 404.
pub async fn dashboard(app: &Arc<App>) -> Response<RespBody> {
    let path = &app.cfg.monitor_dashboard_path;
    if !path.is_empty() {
        if let Ok(html) = tokio::fs::read(path).await {
            let mut resp = Response::new(full_body(Bytes::from(html)));
            resp.headers_mut()
                .insert("content-type", HeaderValue::from_static("text/html; charset=utf-8"));
            return resp;
        }
    }
    json_response(
        StatusCode::NOT_FOUND,
        &json!({ "error": "monitor dashboard not found" }),
    )
}
