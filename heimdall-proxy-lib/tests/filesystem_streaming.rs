//! End-to-end filesystem transport: range windows, header contracts and
//! traffic attribution, driven through the public stream service.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::{Method, StatusCode};
use http_body_util::BodyExt;
use heimdall_proxy_lib::config::Config;
use heimdall_proxy_lib::stream::registry::TransferRegistry;
use heimdall_proxy_lib::stream::{StreamContext, StreamService};
use heimdall_proxy_lib::traffic::TrafficEngine;

const FILE_SIZE: usize = 3 * 1024 * 1024;

fn tmp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("heimdall-stream-{nanos}-{name}"));
    fs::create_dir_all(&dir).expect("create tmp dir");
    dir
}

fn test_config(root: &PathBuf) -> Config {
    let toml = format!(
        r#"
listen = "127.0.0.1:7000"

[redis]
host = "127.0.0.1"

[backend]
mode = "filesystem"
filesystem_root = "{}"

[auth]
secret_key = "S"
api_key = "K"
"#,
        root.display()
    );
    toml::from_str(&toml).expect("config")
}

fn patterned_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn service(root: &PathBuf) -> (StreamService, Arc<TrafficEngine>) {
    let cfg = Arc::new(test_config(root));
    let registry = TransferRegistry::new();
    let traffic = TrafficEngine::new(cfg.traffic.clone(), reqwest::Client::new());
    let service = StreamService::new(cfg, registry, Arc::clone(&traffic), reqwest::Client::new());
    (service, traffic)
}

fn ctx(uid: &str) -> StreamContext {
    StreamContext {
        uid: uid.to_string(),
        session_id: Some("sid-test".to_string()),
        client_ip: "203.0.113.5".to_string(),
    }
}

#[tokio::test]
async fn full_get_streams_whole_file() {
    let root = tmp_dir("full");
    let data = patterned_bytes(FILE_SIZE);
    fs::write(root.join("movie.mp4"), &data).expect("write");
    let (service, traffic) = service(&root);

    let resp = service
        .serve_filesystem(&Method::GET, "/movie.mp4", None, ctx("u1"))
        .await
        .expect("serve");

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-length").and_then(|v| v.to_str().ok()),
        Some(FILE_SIZE.to_string().as_str())
    );
    assert_eq!(
        resp.headers().get("accept-ranges").and_then(|v| v.to_str().ok()),
        Some("bytes")
    );
    // A response with Content-Length must not carry an encoding.
    assert!(resp.headers().get("content-encoding").is_none());
    assert!(resp.headers().get("transfer-encoding").is_none());

    let body = resp.into_body().collect().await.expect("body").to_bytes();
    assert_eq!(body.len(), FILE_SIZE);
    assert_eq!(&body[..], &data[..]);

    // The pump records the transferred bytes against the uid.
    assert_eq!(traffic.held_bytes("u1"), FILE_SIZE as u64);
}

#[tokio::test]
async fn bounded_range_returns_exact_window() {
    let root = tmp_dir("range");
    let data = patterned_bytes(FILE_SIZE);
    fs::write(root.join("movie.mp4"), &data).expect("write");
    let (service, _traffic) = service(&root);

    let resp = service
        .serve_filesystem(
            &Method::GET,
            "/movie.mp4",
            Some("bytes=1048576-2097151"),
            ctx("u1"),
        )
        .await
        .expect("serve");

    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        resp.headers().get("content-length").and_then(|v| v.to_str().ok()),
        Some("1048576")
    );
    assert_eq!(
        resp.headers().get("content-range").and_then(|v| v.to_str().ok()),
        Some("bytes 1048576-2097151/3145728")
    );

    let body = resp.into_body().collect().await.expect("body").to_bytes();
    assert_eq!(body.len(), 1_048_576);
    assert_eq!(&body[..], &data[1_048_576..=2_097_151]);
}

#[tokio::test]
async fn suffix_and_open_ranges() {
    let root = tmp_dir("suffix");
    let data = patterned_bytes(4096);
    fs::write(root.join("seg.bin"), &data).expect("write");
    let (service, _traffic) = service(&root);

    let resp = service
        .serve_filesystem(&Method::GET, "/seg.bin", Some("bytes=-500"), ctx("u"))
        .await
        .expect("serve");
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    let body = resp.into_body().collect().await.expect("body").to_bytes();
    assert_eq!(&body[..], &data[4096 - 500..]);

    let resp = service
        .serve_filesystem(&Method::GET, "/seg.bin", Some("bytes=4000-"), ctx("u"))
        .await
        .expect("serve");
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    let body = resp.into_body().collect().await.expect("body").to_bytes();
    assert_eq!(&body[..], &data[4000..]);
}

#[tokio::test]
async fn unsatisfiable_range_is_416_with_total() {
    let root = tmp_dir("unsat");
    fs::write(root.join("seg.bin"), patterned_bytes(1000)).expect("write");
    let (service, _traffic) = service(&root);

    let resp = service
        .serve_filesystem(&Method::GET, "/seg.bin", Some("bytes=2000-3000"), ctx("u"))
        .await
        .expect("serve");

    assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        resp.headers().get("content-range").and_then(|v| v.to_str().ok()),
        Some("bytes */1000")
    );
}

#[tokio::test]
async fn head_has_headers_but_no_body() {
    let root = tmp_dir("head");
    fs::write(root.join("index.m3u8"), b"#EXTM3U\n").expect("write");
    let (service, traffic) = service(&root);

    let resp = service
        .serve_filesystem(&Method::HEAD, "/index.m3u8", None, ctx("u1"))
        .await
        .expect("serve");

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-length").and_then(|v| v.to_str().ok()),
        Some("8")
    );
    assert_eq!(
        resp.headers().get("cache-control").and_then(|v| v.to_str().ok()),
        Some("no-cache, no-store, must-revalidate")
    );
    let body = resp.into_body().collect().await.expect("body").to_bytes();
    assert!(body.is_empty());
    // HEAD transfers nothing and bills nothing.
    assert_eq!(traffic.held_bytes("u1"), 0);
}

#[tokio::test]
async fn missing_file_is_404() {
    let root = tmp_dir("missing");
    let (service, _traffic) = service(&root);
    let resp = service
        .serve_filesystem(&Method::GET, "/absent.ts", None, ctx("u"))
        .await
        .expect("serve");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn traversal_is_rejected() {
    let root = tmp_dir("traversal");
    let (service, _traffic) = service(&root);
    let resp = service
        .serve_filesystem(&Method::GET, "/../../etc/passwd", None, ctx("u"))
        .await
        .expect("serve");
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn small_file_one_shot_still_bills_uid() {
    let root = tmp_dir("sendfile");
    fs::write(root.join("thumb.jpg"), patterned_bytes(10_000)).expect("write");
    let (service, traffic) = service(&root);

    let resp = service
        .serve_filesystem(&Method::GET, "/thumb.jpg", None, ctx("u9"))
        .await
        .expect("serve");
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.expect("body").to_bytes();
    assert_eq!(body.len(), 10_000);
    assert_eq!(traffic.held_bytes("u9"), 10_000);
}

#[tokio::test]
async fn anonymous_fast_path_traffic_is_dropped() {
    let root = tmp_dir("anon");
    fs::write(root.join("seg.ts"), patterned_bytes(2048)).expect("write");
    let (service, traffic) = service(&root);

    let resp = service
        .serve_filesystem(&Method::GET, "/seg.ts", None, ctx(""))
        .await
        .expect("serve");
    let _ = resp.into_body().collect().await.expect("body");
    assert_eq!(traffic.status().accumulator_uids, 0);
    assert_eq!(traffic.status().qualified_uids, 0);
}
