//! Filesystem origin.
//!
//! Resolves the request path under the configured root (with a traversal
//! guard), answers Range requests itself and pumps the byte window to the
//! client. Small non-range files go out in a single buffered read when
//! `filesystem_sendfile` is on.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use http::header::CONTENT_RANGE;
use http::{HeaderValue, Method, Response, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use super::range::{parse_range, RangeOutcome};
use super::registry::{TransferRegistry, TransferStatus};
use super::{
    apply_cache_headers, apply_entity_headers, channel_body, chunk_size_for, classify_file_type,
    empty_body, full_body, media_type_for, RespBody, StreamContext, StreamService,
};
use crate::error::Result;
use crate::traffic::TrafficEngine;

/// Files below this size skip the chunked pump for a plain one-shot read.
const SENDFILE_THRESHOLD: u64 = 1024 * 1024;

impl StreamService {
    /// Serve `path` from the filesystem root.
    pub async fn serve_filesystem(
        &self,
        method: &Method,
        path: &str,
        range_header: Option<&str>,
        ctx: StreamContext,
    ) -> Result<Response<RespBody>> {
        let root = Path::new(&self.cfg.backend.filesystem_root);
        let Some(full_path) = resolve_under_root(root, path) else {
            warn!(path, "path traversal rejected");
            return status_response(StatusCode::FORBIDDEN);
        };

        let meta = match tokio::fs::metadata(&full_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return status_response(StatusCode::NOT_FOUND);
            }
            Err(e) => {
                warn!(path, error = %e, "stat failed");
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };
        if !meta.is_file() {
            return status_response(StatusCode::FORBIDDEN);
        }
        let file_size = meta.len();

        let path_lower = path.to_lowercase();
        let file_type = classify_file_type(&path_lower);
        let media_type = media_type_for(&path_lower);

        let (status, start, end) = match parse_range(range_header, file_size) {
            RangeOutcome::Full => (StatusCode::OK, 0, file_size.saturating_sub(1)),
            RangeOutcome::Partial { start, end } => (StatusCode::PARTIAL_CONTENT, start, end),
            RangeOutcome::Unsatisfiable => {
                let mut resp = Response::new(empty_body());
                *resp.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
                if let Ok(v) = HeaderValue::from_str(&format!("bytes */{file_size}")) {
                    resp.headers_mut().insert(CONTENT_RANGE, v);
                }
                return Ok(resp);
            }
        };
        let content_length = if file_size == 0 { 0 } else { end - start + 1 };

        let mut resp = Response::new(empty_body());
        *resp.status_mut() = status;
        apply_entity_headers(&mut resp, media_type, Some(content_length));
        apply_cache_headers(&mut resp, file_type);
        if status == StatusCode::PARTIAL_CONTENT {
            if let Ok(v) =
                HeaderValue::from_str(&format!("bytes {start}-{end}/{file_size}"))
            {
                resp.headers_mut().insert(CONTENT_RANGE, v);
            }
        }

        if method == Method::HEAD || content_length == 0 {
            return Ok(resp);
        }

        // One-shot read for small full-content responses.
        let is_full = status == StatusCode::OK;
        if is_full
            && self.cfg.backend.filesystem_sendfile
            && file_size < SENDFILE_THRESHOLD
        {
            let bytes = tokio::fs::read(&full_path).await?;
            if !ctx.uid.is_empty() {
                self.traffic.record(
                    &ctx.uid,
                    bytes.len() as u64,
                    file_type,
                    &ctx.client_ip,
                    ctx.session_id.as_deref(),
                );
            }
            debug!(path, size = bytes.len(), "one-shot file response");
            *resp.body_mut() = full_body(Bytes::from(bytes));
            return Ok(resp);
        }

        let mut file = File::open(&full_path).await?;
        if start > 0 {
            file.seek(std::io::SeekFrom::Start(start)).await?;
        }

        let transfer_id = self.registry.begin(
            file_name(path),
            &full_path.to_string_lossy(),
            file_type,
            &ctx.client_ip,
            &ctx.uid,
            ctx.session_id.as_deref(),
            Some(content_length),
        );

        let (tx, body) = channel_body();
        let registry = Arc::clone(&self.registry);
        let traffic = Arc::clone(&self.traffic);
        let chunk_size = chunk_size_for(file_size);
        let file_type = file_type.to_string();
        tokio::spawn(async move {
            run_file_pump(
                file,
                content_length,
                chunk_size,
                tx,
                registry,
                transfer_id,
                traffic,
                ctx,
                file_type,
            )
            .await;
        });

        *resp.body_mut() = body;
        Ok(resp)
    }
}

/// Read the `[0, remaining)` window from the positioned file and feed the
/// client one chunk at a time.
#[allow(clippy::too_many_arguments)]
async fn run_file_pump(
    mut file: File,
    mut remaining: u64,
    chunk_size: usize,
    tx: tokio::sync::mpsc::Sender<Bytes>,
    registry: Arc<TransferRegistry>,
    transfer_id: String,
    traffic: Arc<TrafficEngine>,
    ctx: StreamContext,
    file_type: String,
) {
    let mut transferred: u64 = 0;
    let mut buf = vec![0u8; chunk_size];
    let status = loop {
        if remaining == 0 {
            break TransferStatus::Completed;
        }
        let want = chunk_size.min(remaining as usize);
        match file.read(&mut buf[..want]).await {
            Ok(0) => break TransferStatus::Completed,
            Ok(n) => {
                // The send blocks until the client drained the previous
                // chunk; a closed receiver means the client disconnected.
                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    debug!(transfer_id, transferred, "client disconnected");
                    break TransferStatus::Disconnected;
                }
                transferred += n as u64;
                remaining -= n as u64;
                registry.update(&transfer_id, transferred);
            }
            Err(e) => {
                warn!(transfer_id, error = %e, "file read failed mid-stream");
                break TransferStatus::Error;
            }
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

/// Join and canonicalize a request path under the root, rejecting any
/// result that escapes it. A path whose parent does not exist yet is
/// returned as joined (dot-dot already rejected lexically) so the caller
/// answers 404 from the stat instead of 403.
pub fn resolve_under_root(root: &Path, path: &str) -> Option<PathBuf> {
    let relative = path.trim_start_matches('/');
    if relative.split('/').any(|seg| seg == "..") {
        return None;
    }
    let joined = root.join(relative);
    let canonical_root = root.canonicalize().ok()?;
    match joined.canonicalize() {
        Ok(resolved) => resolved.starts_with(&canonical_root).then_some(resolved),
        Err(_) => match joined.parent().and_then(|p| p.canonicalize().ok()) {
            Some(parent) => {
                if !parent.starts_with(&canonical_root) {
                    return None;
                }
                Some(parent.join(joined.file_name()?))
            }
            None => Some(joined),
        },
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn status_response(status: StatusCode) -> Result<Response<RespBody>> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = status;
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traversal_segments_rejected() {
        let root = std::env::temp_dir();
        assert!(resolve_under_root(&root, "/a/../../etc/passwd").is_none());
        assert!(resolve_under_root(&root, "../outside").is_none());
    }

    #[test]
    fn test_plain_path_resolves() {
        let root = std::env::temp_dir();
        let resolved = resolve_under_root(&root, "/heimdall-missing-file.ts");
        assert!(resolved.is_some());
        assert!(resolved
            .expect("resolved")
            .starts_with(root.canonicalize().expect("root")));
    }
}
