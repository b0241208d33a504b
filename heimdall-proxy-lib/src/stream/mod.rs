//! Streaming transport.
//!
//! Origin-agnostic byte pump: the filesystem and HTTP origins both feed a
//! capacity-1 channel that backs the hyper response body, so an origin
//! that outruns the client blocks at the send. A failed send means the
//! client went away; the pump stops at the next chunk boundary without
//! treating it as an error.

pub mod fs;
pub mod http_origin;
pub mod range;
pub mod registry;

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{
    ACCEPT_RANGES, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, EXPIRES, PRAGMA,
};
use http::{HeaderValue, Response};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::config::Config;
use crate::error::Result;
use crate::traffic::TrafficEngine;
use registry::TransferRegistry;

pub type RespBody = BoxBody<Bytes, Infallible>;

/// Attribution context a pump carries: who gets billed for the bytes.
#[derive(Debug, Clone, Default)]
pub struct StreamContext {
    pub uid: String,
    pub session_id: Option<String>,
    pub client_ip: String,
}

pub fn empty_body() -> RespBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

pub fn full_body(bytes: Bytes) -> RespBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// A body fed chunk-by-chunk from a pump task. Capacity 1: the pump
/// cannot run ahead of the client by more than one chunk.
pub fn channel_body() -> (mpsc::Sender<Bytes>, RespBody) {
    let (tx, rx) = mpsc::channel::<Bytes>(1);
    let body = StreamBody::new(
        ReceiverStream::new(rx).map(|chunk| Ok::<_, Infallible>(Frame::data(chunk))),
    )
    .boxed();
    (tx, body)
}

/// Chunk size by total file size, nginx-style buckets.
pub fn chunk_size_for(file_size: u64) -> usize {
    const MIB: u64 = 1024 * 1024;
    if file_size < MIB {
        32 * 1024
    } else if file_size < 32 * MIB {
        128 * 1024
    } else if file_size < 256 * MIB {
        512 * 1024
    } else {
        2 * 1024 * 1024
    }
}

/// File-type tag used for cache policy and traffic attribution.
pub fn classify_file_type(path_lower: &str) -> &'static str {
    if path_lower.ends_with(".m3u8") {
        "m3u8"
    } else if path_lower.ends_with(".ts") {
        "ts"
    } else if path_lower.ends_with("enc.key") || path_lower.ends_with(".key") {
        "enc_key"
    } else if [".jpg", ".jpeg", ".png", ".gif", ".svg", ".css", ".js", ".woff", ".woff2", ".ttf", ".ico"]
        .iter()
        .any(|e| path_lower.ends_with(e))
    {
        "static"
    } else {
        "default"
    }
}

pub fn media_type_for(path_lower: &str) -> &'static str {
    match path_lower.rsplit_once('.').map(|(_, ext)| ext) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        Some("mp4") => "video/mp4",
        Some("m4s") => "video/iso.segment",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("mov") => "video/quicktime",
        Some("flv") => "video/x-flv",
        Some("key") => "application/octet-stream",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("webp") => "image/webp",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Apply the cache policy for a file type onto a response under
/// construction. Playlists and key files must never be cached; media
/// gets a short public lifetime.
pub fn apply_cache_headers(resp: &mut Response<RespBody>, file_type: &str) {
    let headers = resp.headers_mut();
    match file_type {
        "m3u8" | "enc_key" => {
            headers.insert(
                CACHE_CONTROL,
                HeaderValue::from_static("no-cache, no-store, must-revalidate"),
            );
            headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
            headers.insert(EXPIRES, HeaderValue::from_static("0"));
        }
        _ => {
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("public, max-age=600"));
        }
    }
}

/// Common headers of a successful streamed response.
pub fn apply_entity_headers(
    resp: &mut Response<RespBody>,
    media_type: &str,
    content_length: Option<u64>,
) {
    let headers = resp.headers_mut();
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Ok(v) = HeaderValue::from_str(media_type) {
        headers.insert(CONTENT_TYPE, v);
    }
    if let Some(len) = content_length {
        if let Ok(v) = HeaderValue::from_str(&len.to_string()) {
            headers.insert(CONTENT_LENGTH, v);
        }
    }
}

/// The unified stream service: one of the two origin modes, the transfer
/// registry and the traffic engine.
pub struct StreamService {
    pub cfg: Arc<Config>,
    pub registry: Arc<TransferRegistry>,
    pub traffic: Arc<TrafficEngine>,
    pub client: reqwest::Client,
}

impl StreamService {
    pub fn new(
        cfg: Arc<Config>,
        registry: Arc<TransferRegistry>,
        traffic: Arc<TrafficEngine>,
        client: reqwest::Client,
    ) -> Self {
        Self { cfg, registry, traffic, client }
    }
}

/// Outbound client shared by the HTTP origin and the file-check probes.
pub fn build_origin_client(cfg: &Config) -> Result<reqwest::Client> {
    let pool = &cfg.http_pool;
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(pool.per_host)
        .pool_idle_timeout(std::time::Duration::from_secs(pool.keepalive_secs))
        .connect_timeout(std::time::Duration::from_secs(pool.connect_timeout_secs))
        .timeout(std::time::Duration::from_secs(pool.total_timeout_secs))
        .redirect(reqwest::redirect::Policy::limited(10));
    if !cfg.backend.ssl_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder
        .build()
        .map_err(|e| crate::error::ProxyError::Config(format!("origin client: {e}")))
}
