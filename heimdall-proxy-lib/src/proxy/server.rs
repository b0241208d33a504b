//! Accept loop with graceful shutdown.
//!
//! Plain-HTTP listener; each connection is served by the shared router.
//! SIGTERM/SIGINT stop the accept loop, then the server waits for active
//! connections to drain before returning so background flushes can run.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use crate::app::App;
use crate::error::{ProxyError, Result};
use crate::proxy::handler;

const SHUTDOWN_DRAIN_SECS: u64 = 30;

/// Guard to decrement the active connections counter when dropped
struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
    notifier: watch::Sender<()>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let remaining = self.counter.fetch_sub(1, Ordering::Relaxed);
        // Notify when the last connection closes
        if remaining == 1 {
            let _ = self.notifier.send(());
        }
    }
}

pub async fn run(app: Arc<App>) -> Result<()> {
    let addr = app.cfg.listen;
    let listener = TcpListener::bind(addr).await.map_err(ProxyError::Io)?;
    let builder = ConnBuilder::new(TokioExecutor::new());

    let active_connections = Arc::new(AtomicUsize::new(0));
    let (connections_closed_tx, mut connections_closed_rx) = watch::channel(());

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .map_err(|e| ProxyError::Io(std::io::Error::other(format!("SIGTERM handler: {e}"))))?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .map_err(|e| ProxyError::Io(std::io::Error::other(format!("SIGINT handler: {e}"))))?;

    info!(?addr, mode = ?app.cfg.backend.mode, "proxy listening");

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, stopping accept loop");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, stopping accept loop");
                break;
            }
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept error");
                        continue;
                    }
                };

                active_connections.fetch_add(1, Ordering::Relaxed);
                let guard = ConnectionGuard {
                    counter: active_connections.clone(),
                    notifier: connections_closed_tx.clone(),
                };

                let app = Arc::clone(&app);
                let builder = builder.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    let svc = hyper::service::service_fn(move |req| {
                        let app = Arc::clone(&app);
                        async move {
                            Ok::<_, std::convert::Infallible>(
                                handler::handle(app, req, peer).await,
                            )
                        }
                    });
                    if let Err(e) = builder.serve_connection(TokioIo::new(stream), svc).await {
                        warn!(?peer, error = %e, "serve_connection error");
                    }
                });
            }
        }
    }

    let active = active_connections.load(Ordering::Relaxed);
    if active > 0 {
        info!(active, "waiting for connections to drain (timeout: {SHUTDOWN_DRAIN_SECS}s)");
        let deadline = Instant::now() + Duration::from_secs(SHUTDOWN_DRAIN_SECS);
        tokio::select! {
            _ = connections_closed_rx.changed() => {
                info!("all connections closed");
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!(
                    active = active_connections.load(Ordering::Relaxed),
                    "drain timeout reached with connections still active"
                );
            }
        }
    }

    info!("proxy server stopped");
    Ok(())
}
