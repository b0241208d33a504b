//! HTTP origin.
//!
//! Forwards the request to the upstream with the inbound Range header
//! verbatim, copies the origin's response headers (minus the hop-by-hop
//! and encoding set) and pumps the body through the capacity-1 channel.

use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderName, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderValue, Method, Response, StatusCode};
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use super::registry::{TransferRegistry, TransferStatus};
use super::{
    apply_cache_headers, channel_body, classify_file_type, empty_body, RespBody, StreamContext,
    StreamService,
};
use crate::error::Result;
use crate::traffic::TrafficEngine;

/// Response headers never copied from the origin: they describe the
/// origin connection, not ours, and stripping the encoding pair keeps
/// Content-Length intact for download progress display.
const EXCLUDED_HEADERS: &[HeaderName] = &[TRANSFER_ENCODING, CONTENT_ENCODING, CONNECTION];

impl StreamService {
    pub fn origin_url(&self, path: &str) -> String {
        let backend = &self.cfg.backend;
        let scheme = if backend.use_https { "https" } else { "http" };
        format!(
            "{scheme}://{}:{}/{}",
            backend.host,
            backend.port,
            path.trim_start_matches('/')
        )
    }

    /// Serve `path` by relaying from the upstream origin.
    pub async fn serve_http(
        &self,
        method: &Method,
        path: &str,
        range_header: Option<&str>,
        user_agent: &str,
        ctx: StreamContext,
    ) -> Result<Response<RespBody>> {
        let url = self.origin_url(path);
        let backend = &self.cfg.backend;

        let mut req = if method == Method::HEAD {
            self.client.head(&url)
        } else {
            self.client.get(&url)
        };
        req = req.header("User-Agent", user_agent);
        req = req.header("X-Forwarded-For", &ctx.client_ip);
        if !backend.proxy_host_header.is_empty() {
            req = req.header("Host", &backend.proxy_host_header);
        }
        if let Some(range) = range_header {
            req = req.header("Range", range);
        }

        let origin_resp = match req.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(url, "origin timeout");
                return status_response(StatusCode::GATEWAY_TIMEOUT);
            }
            Err(e) => {
                warn!(url, error = %e, "origin request failed");
                return status_response(StatusCode::BAD_GATEWAY);
            }
        };

        let status = origin_resp.status();
        if status.as_u16() >= 400 {
            debug!(url, status = status.as_u16(), "origin error status relayed");
            return status_response(status);
        }

        let path_lower = path.to_lowercase();
        let file_type = classify_file_type(&path_lower);

        let mut resp = Response::new(empty_body());
        *resp.status_mut() = status;
        for (name, value) in origin_resp.headers() {
            if EXCLUDED_HEADERS.contains(name) {
                continue;
            }
            resp.headers_mut().append(name.clone(), value.clone());
        }
        if !resp.headers().contains_key("accept-ranges") {
            resp.headers_mut()
                .insert("accept-ranges", HeaderValue::from_static("bytes"));
        }
        apply_cache_headers(&mut resp, file_type);

        if method == Method::HEAD {
            return Ok(resp);
        }

        let total_size = origin_resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let transfer_id = self.registry.begin(
            path.rsplit('/').next().unwrap_or(path),
            path,
            file_type,
            &ctx.client_ip,
            &ctx.uid,
            ctx.session_id.as_deref(),
            total_size,
        );

        let (tx, body) = channel_body();
        let registry = Arc::clone(&self.registry);
        let traffic = Arc::clone(&self.traffic);
        let file_type = file_type.to_string();
        tokio::spawn(async move {
            run_http_pump(origin_resp, tx, registry, transfer_id, traffic, ctx, file_type).await;
        });

        *resp.body_mut() = body;
        Ok(resp)
    }
}

async fn run_http_pump(
    origin_resp: reqwest::Response,
    tx: tokio::sync::mpsc::Sender<Bytes>,
    registry: Arc<TransferRegistry>,
    transfer_id: String,
    traffic: Arc<TrafficEngine>,
    ctx: StreamContext,
    file_type: String,
) {
    let mut transferred: u64 = 0;
    let mut stream = origin_resp.bytes_stream();
    let status = loop {
        match stream.next().await {
            Some(Ok(chunk)) => {
                let len = chunk.len() as u64;
                if tx.send(chunk).await.is_err() {
                    debug!(transfer_id, transferred, "client disconnected");
                    break TransferStatus::Disconnected;
                }
                transferred += len;
                registry.update(&transfer_id, transferred);
            }
            Some(Err(e)) => {
                // The total timeout lands here as a mid-body error.
                warn!(transfer_id, error = %e, "origin body failed mid-stream");
                break TransferStatus::Error;
            }
            None => break TransferStatus::Completed,
        }
    };

    registry.finish(&transfer_id, status);
    if !ctx.uid.is_empty() && transferred > 0 {
        traffic.record(
            &ctx.uid,
            transferred,
            &file_type,
            &ctx.client_ip,
            ctx.session_id.as_deref(),
        );
    }
}

fn status_response(status: StatusCode) -> Result<Response<RespBody>> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = status;
    Ok(resp)
}
