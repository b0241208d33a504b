//! File existence probes for the admin surface.
//!
//! Single and batch variants, both behind the API key. The filesystem
//! mode answers from a stat, the HTTP mode probes the origin with HEAD.

use std::path::Path;
use std::sync::Arc;

use http::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::app::App;
use crate::config::BackendMode;
use crate::proxy::respond::json_response;
use crate::stream::fs::resolve_under_root;
use crate::stream::RespBody;

pub const BATCH_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct BatchCheckRequest {
    pub paths: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub path: String,
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn check_single(app: &Arc<App>, req: CheckRequest) -> Response<RespBody> {
    let result = check_one(app, &req.path).await;
    json_response(StatusCode::OK, &serde_json::to_value(&result).unwrap_or_else(|_| json!({})))
}

pub async fn check_batch(app: &Arc<App>, req: BatchCheckRequest) -> Response<RespBody> {
    if req.paths.is_empty() || req.paths.len() > BATCH_LIMIT {
        return json_response(
            StatusCode::BAD_REQUEST,
            &json!({
                "error": "bad_request",
                "detail": format!("paths must contain 1..={BATCH_LIMIT} entries"),
            }),
        );
    }

    let mut results = Vec::with_capacity(req.paths.len());
    for path in &req.paths {
        results.push(check_one(app, path).await);
    }
    let exists_count = results.iter().filter(|r| r.exists).count();
    let error_count = results.iter().filter(|r| r.error.is_some()).count();

    json_response(
        StatusCode::OK,
        &json!({
            "results": results,
            "total": req.paths.len(),
            "exists_count": exists_count,
            "not_found_count": req.paths.len() - exists_count - error_count,
            "error_count": error_count,
        }),
    )
}

async fn check_one(app: &Arc<App>, path: &str) -> CheckResult {
    match app.cfg.backend.mode {
        BackendMode::Filesystem => check_filesystem(app, path).await,
        BackendMode::Http => check_http(app, path).await,
    }
}

async fn check_filesystem(app: &Arc<App>, path: &str) -> CheckResult {
    let root = Path::new(&app.cfg.backend.filesystem_root);
    let Some(resolved) = resolve_under_root(root, path) else {
        warn!(path, "file check rejected traversal");
        return CheckResult {
            path: path.to_string(),
            exists: false,
            error: Some("invalid path".to_string()),
        };
    };
    let exists = tokio::fs::metadata(&resolved)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    CheckResult { path: path.to_string(), exists, error: None }
}

async fn check_http(app: &Arc<App>, path: &str) -> CheckResult {
    let url = app.stream.origin_url(path);
    let mut req = app.stream.client.head(&url);
    if !app.cfg.backend.proxy_host_header.is_empty() {
        req = req.header("Host", &app.cfg.backend.proxy_host_header);
    }
    match req.send().await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            let exists = (200..400).contains(&status);
            let error = (!exists && status != 404).then(|| format!("HTTP {status}"));
            CheckResult { path: path.to_string(), exists, error }
        }
        Err(e) => {
            warn!(url, error = %e, "file check probe failed");
            CheckResult {
                path: path.to_string(),
                exists: false,
                error: Some("probe failed".to_string()),
            }
        }
    }
}
