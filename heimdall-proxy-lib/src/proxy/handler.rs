//! Request router.
//!
//! One service function handles the whole surface: the monitoring and
//! admin endpoints by exact path, everything else as a proxied file
//! request through the authorization pipeline and the byte pump.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::app::App;
use crate::auth::{AuthRequest, Outcome};
use crate::config::BackendMode;
use crate::file_check;
use crate::monitor;
use crate::net;
use crate::proxy::respond::{
    apply_cors, apply_session_cookie, error_response, error_response_detail, json_response,
    redirect_response, validate_api_key,
};
use crate::stream::{RespBody, StreamContext};

const BODY_LIMIT_BYTES: usize = 64 * 1024;

pub async fn handle(
    app: Arc<App>,
    req: Request<Incoming>,
    peer: SocketAddr,
) -> Response<RespBody> {
    app.counters.requests_total.fetch_add(1, Ordering::Relaxed);

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = parse_query(req.uri().query().unwrap_or(""));

    match (method.as_str(), path.as_str()) {
        ("GET", "/health") => monitor::health(&app).await,
        ("GET", "/stats") => monitor::stats(&app).await,
        ("GET", "/traffic") => monitor::traffic(&app),
        ("GET", "/monitor") => monitor::dashboard(&app).await,
        ("GET", "/active-transfers") => monitor::active_transfers(&app),
        ("GET", "/api/access-logs/denied") => {
            monitor::access_logs(&app, true, log_limit(&query)).await
        }
        ("GET", "/api/access-logs/recent") => {
            monitor::access_logs(&app, false, log_limit(&query)).await
        }
        ("POST", "/api/whitelist") => whitelist_admin(&app, req, false).await,
        ("POST", "/api/static-whitelist") => whitelist_admin(&app, req, true).await,
        ("POST", "/api/file/check") => {
            match authorized_json_body::<file_check::CheckRequest>(&app, req).await {
                Ok(body) => file_check::check_single(&app, body).await,
                Err(resp) => resp,
            }
        }
        ("POST", "/api/file/check/batch") => {
            match authorized_json_body::<file_check::BatchCheckRequest>(&app, req).await {
                Ok(body) => file_check::check_batch(&app, body).await,
                Err(resp) => resp,
            }
        }
        ("GET", _) | ("HEAD", _) => proxy_file(&app, req, &path, query, peer).await,
        _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed"),
    }
}

/// The proxied-file flow: authorize, then pump from the configured
/// origin, then decorate with CORS and the session cookie.
async fn proxy_file(
    app: &Arc<App>,
    req: Request<Incoming>,
    path: &str,
    query: HashMap<String, String>,
    peer: SocketAddr,
) -> Response<RespBody> {
    let headers = req.headers();
    let client_ip = net::client_ip(headers, peer);
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let range_header = headers
        .get("range")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let auth_req = AuthRequest {
        path,
        query: &query,
        client_ip,
        user_agent: &user_agent,
    };
    let outcome = app.auth.authorize(&auth_req).await;

    let ctx = match outcome {
        Outcome::Deny(reason) => {
            app.counters.denied_total.fetch_add(1, Ordering::Relaxed);
            let uid = query.get("uid").cloned().unwrap_or_default();
            app.access_log
                .record(
                    &uid,
                    &client_ip.to_string(),
                    &user_agent,
                    path,
                    false,
                    Some(reason.as_str()),
                )
                .await;
            debug!(path, reason = reason.as_str(), "request denied");
            let mut resp = error_response(reason.into(), reason.as_str());
            apply_cors(&mut resp, req.headers());
            return resp;
        }
        Outcome::RedirectProtected(url) => {
            app.counters.allowed_total.fetch_add(1, Ordering::Relaxed);
            return redirect_response(&url);
        }
        Outcome::Allow(ctx) => ctx,
    };

    app.counters.allowed_total.fetch_add(1, Ordering::Relaxed);
    app.access_log
        .record(&ctx.uid, &client_ip.to_string(), &user_agent, path, true, None)
        .await;

    let stream_ctx = StreamContext {
        uid: ctx.uid.clone(),
        session_id: ctx.session_id.clone(),
        client_ip: client_ip.to_string(),
    };

    let served = match app.cfg.backend.mode {
        BackendMode::Filesystem => {
            app.stream
                .serve_filesystem(req.method(), path, range_header.as_deref(), stream_ctx)
                .await
        }
        BackendMode::Http => {
            app.stream
                .serve_http(
                    req.method(),
                    path,
                    range_header.as_deref(),
                    &user_agent,
                    stream_ctx,
                )
                .await
        }
    };

    let mut resp = match served {
        Ok(resp) => resp,
        Err(e) => {
            app.counters.origin_errors_total.fetch_add(1, Ordering::Relaxed);
            error!(path, error = %e, "origin serve failed");
            error_response(StatusCode::BAD_GATEWAY, "origin_error")
        }
    };

    apply_cors(&mut resp, req.headers());
    if ctx.new_session {
        if let Some(sid) = &ctx.session_id {
            apply_session_cookie(
                &mut resp,
                &app.cfg.auth.session_cookie_name,
                sid,
                app.cfg.auth.session_ttl,
            );
        }
    }
    resp
}

/// Whitelist admin endpoints. `statik` picks the path-independent
/// namespace.
async fn whitelist_admin(
    app: &Arc<App>,
    req: Request<Incoming>,
    statik: bool,
) -> Response<RespBody> {
    #[derive(serde::Deserialize)]
    struct WhitelistBody {
        uid: String,
        #[serde(default)]
        path: String,
        #[serde(rename = "clientIp")]
        client_ip: String,
        #[serde(rename = "UserAgent")]
        user_agent: String,
    }

    let body: WhitelistBody = match authorized_json_body(app, req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    if body.uid.is_empty() || body.client_ip.is_empty() || body.user_agent.is_empty() {
        return error_response_detail(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "uid, clientIp and UserAgent are required",
        );
    }

    let result = if statik {
        app.auth
            .whitelist
            .add_static(&body.uid, &body.client_ip, &body.user_agent)
            .await
    } else {
        if body.path.is_empty() {
            return error_response_detail(
                StatusCode::BAD_REQUEST,
                "bad_request",
                "path is required",
            );
        }
        let key_path = crate::auth::match_key::extract_match_key(&body.path);
        app.auth
            .whitelist
            .add_path_bound(&body.uid, &key_path, &body.client_ip, &body.user_agent)
            .await
    };

    match result {
        Ok(added) => {
            let mut value = serde_json::to_value(&added).unwrap_or_default();
            if let Some(map) = value.as_object_mut() {
                map.insert("success".into(), serde_json::Value::Bool(true));
            }
            json_response(StatusCode::OK, &value)
        }
        Err(e) => {
            warn!(error = %e, "whitelist add rejected");
            error_response_detail(StatusCode::BAD_REQUEST, "bad_request", "invalid whitelist input")
        }
    }
}

/// Check the API key, then collect and decode a bounded JSON body.
async fn authorized_json_body<T: DeserializeOwned>(
    app: &Arc<App>,
    req: Request<Incoming>,
) -> std::result::Result<T, Response<RespBody>> {
    if !validate_api_key(req.headers(), &app.cfg.auth.api_key) {
        return Err(error_response(StatusCode::FORBIDDEN, "invalid_api_key"));
    }
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "bad_request"))?
        .to_bytes();
    if body.len() > BODY_LIMIT_BYTES {
        return Err(error_response_detail(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "body too large",
        ));
    }
    serde_json::from_slice(&body).map_err(|_| {
        error_response_detail(StatusCode::BAD_REQUEST, "bad_request", "invalid JSON body")
    })
}

fn log_limit(query: &HashMap<String, String>) -> usize {
    query
        .get("limit")
        .and_then(|v| v.parse::<usize>().ok())
        .map(|n| n.clamp(1, 300))
        .unwrap_or(100)
}

/// Minimal form decoding: pairs split on `&`/`=`, percent sequences and
/// `+` decoded. Invalid escapes are kept verbatim.
pub fn parse_query(raw: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        map.insert(percent_decode(k), percent_decode(v));
    }
    map
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => match (hex_val(bytes.get(i + 1)), hex_val(bytes.get(i + 2))) {
                (Some(h), Some(l)) => {
                    out.push(h << 4 | l);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: Option<&u8>) -> Option<u8> {
    match b? {
        c @ b'0'..=b'9' => Some(c - b'0'),
        c @ b'a'..=b'f' => Some(c - b'a' + 10),
        c @ b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_basic() {
        let q = parse_query("uid=u1&expires=9999999999&token=abc_DEF-123");
        assert_eq!(q.get("uid").map(String::as_str), Some("u1"));
        assert_eq!(q.get("expires").map(String::as_str), Some("9999999999"));
        assert_eq!(q.get("token").map(String::as_str), Some("abc_DEF-123"));
    }

    #[test]
    fn test_parse_query_decoding() {
        let q = parse_query("a=1%2B1&b=hello+world&c=%zz");
        assert_eq!(q.get("a").map(String::as_str), Some("1+1"));
        assert_eq!(q.get("b").map(String::as_str), Some("hello world"));
        // Invalid escape stays verbatim.
        assert_eq!(q.get("c").map(String::as_str), Some("%zz"));
    }

    #[test]
    fn test_parse_query_edge_cases() {
        let q = parse_query("");
        assert!(q.is_empty());
        let q = parse_query("flag&k=");
        assert_eq!(q.get("flag").map(String::as_str), Some(""));
        assert_eq!(q.get("k").map(String::as_str), Some(""));
    }

    #[test]
    fn test_log_limit_clamped() {
        let mut q = HashMap::new();
        assert_eq!(log_limit(&q), 100);
        q.insert("limit".to_string(), "5".to_string());
        assert_eq!(log_limit(&q), 5);
        q.insert("limit".to_string(), "99999".to_string());
        assert_eq!(log_limit(&q), 300);
        q.insert("limit".to_string(), "0".to_string());
        assert_eq!(log_limit(&q), 1);
    }
}
