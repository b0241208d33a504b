//! Response construction helpers.
//!
//! Synthetic JSON responses for errors and API results, the CORS echo and
//! the admin API-key check. Error bodies carry only the error kind, never
//! internal error text.

use bytes::Bytes;
use http::header::{HeaderValue, LOCATION, SET_COOKIE, VARY};
use http::{HeaderMap, Response, StatusCode};
use tracing::warn;

use crate::stream::{full_body, RespBody};

pub fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<RespBody> {
    let bytes = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let mut resp = Response::new(full_body(Bytes::from(bytes)));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert("content-type", HeaderValue::from_static("application/json"));
    resp
}

/// `{"error": kind}` with the mapped status.
pub fn error_response(status: StatusCode, kind: &str) -> Response<RespBody> {
    json_response(status, &serde_json::json!({ "error": kind }))
}

pub fn error_response_detail(status: StatusCode, kind: &str, detail: &str) -> Response<RespBody> {
    json_response(status, &serde_json::json!({ "error": kind, "detail": detail }))
}

/// 302 with caching disabled, used by safe-key-protect.
pub fn redirect_response(url: &str) -> Response<RespBody> {
    let mut resp = Response::new(full_body(Bytes::new()));
    *resp.status_mut() = StatusCode::FOUND;
    if let Ok(v) = HeaderValue::from_str(url) {
        resp.headers_mut().insert(LOCATION, v);
    }
    resp.headers_mut().insert(
        "cache-control",
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    resp
}

/// Echo the request Origin (never `*`: credentialed requests forbid it),
/// mark the response as varying on it and expose the headers a download
/// progress UI needs.
pub fn apply_cors(resp: &mut Response<RespBody>, request_headers: &HeaderMap) {
    let headers = resp.headers_mut();
    if let Some(origin) = request_headers.get("origin") {
        headers.insert("access-control-allow-origin", origin.clone());
        headers.append(VARY, HeaderValue::from_static("Origin"));
        headers.insert(
            "access-control-allow-credentials",
            HeaderValue::from_static("true"),
        );
    }
    headers.insert(
        "access-control-expose-headers",
        HeaderValue::from_static("Content-Length, Content-Range, Accept-Ranges, Content-Type"),
    );
}

/// Attach the session cookie created by the pipeline.
pub fn apply_session_cookie(
    resp: &mut Response<RespBody>,
    cookie_name: &str,
    session_id: &str,
    ttl_secs: u64,
) {
    let cookie =
        format!("{cookie_name}={session_id}; Path=/; Max-Age={ttl_secs}; HttpOnly; SameSite=Lax");
    if let Ok(v) = HeaderValue::from_str(&cookie) {
        resp.headers_mut().insert(SET_COOKIE, v);
    }
}

/// Admin API-key check. Both `Bearer <key>` and the bare `<key>` are
/// accepted; the bare form is historical and logs a deprecation warning.
pub fn validate_api_key(headers: &HeaderMap, expected: &str) -> bool {
    let Some(authorization) = headers.get("authorization").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    if let Some(token) = authorization.strip_prefix("Bearer ") {
        return token == expected;
    }
    if authorization == expected {
        warn!("bare Authorization API key accepted; use \"Bearer <key>\" (deprecated form)");
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("authorization", value.parse().expect("hv"));
        h
    }

    #[test]
    fn test_bearer_and_bare_forms_accepted() {
        assert!(validate_api_key(&headers_with_auth("Bearer k-123"), "k-123"));
        assert!(validate_api_key(&headers_with_auth("k-123"), "k-123"));
    }

    #[test]
    fn test_wrong_or_missing_key_rejected() {
        assert!(!validate_api_key(&headers_with_auth("Bearer nope"), "k-123"));
        assert!(!validate_api_key(&headers_with_auth("bearer k-123"), "k-123"));
        assert!(!validate_api_key(&HeaderMap::new(), "k-123"));
    }

    #[test]
    fn test_cors_echoes_origin_not_star() {
        let mut req_headers = HeaderMap::new();
        req_headers.insert("origin", "https://player.example".parse().expect("hv"));
        let mut resp = Response::new(crate::stream::empty_body());
        apply_cors(&mut resp, &req_headers);
        assert_eq!(
            resp.headers()
                .get("access-control-allow-origin")
                .and_then(|v| v.to_str().ok()),
            Some("https://player.example")
        );
        assert_eq!(
            resp.headers().get(VARY).and_then(|v| v.to_str().ok()),
            Some("Origin")
        );
    }

    #[test]
    fn test_no_origin_no_allow_origin_header() {
        let mut resp = Response::new(crate::stream::empty_body());
        apply_cors(&mut resp, &HeaderMap::new());
        assert!(resp.headers().get("access-control-allow-origin").is_none());
        // Expose-Headers is always present.
        assert!(resp.headers().get("access-control-expose-headers").is_some());
    }

    #[test]
    fn test_error_body_is_kind_only() {
        let resp = error_response(StatusCode::FORBIDDEN, "invalid_token");
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
