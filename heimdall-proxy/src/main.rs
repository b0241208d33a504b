#![forbid(unsafe_code)]

use clap::Parser;
use heimdall_proxy_lib::{app::App, config::load_from_path, proxy, traffic};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Authenticating reverse proxy for HLS delivery")]
struct Cli {
    /// Path to configuration TOML file
    #[arg(short, long, value_name = "FILE", default_value = "config/heimdall.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match load_from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            init_tracing("info", false);
            error!(%err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    init_tracing(&cfg.logging.level, cfg.logging.show_target);
    info!(?cfg.listen, mode = ?cfg.backend.mode, "configuration loaded");

    let app = match App::build(cfg).await {
        Ok(app) => app,
        Err(err) => {
            error!(%err, "failed to start services");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let traffic_task = tokio::spawn(traffic_loop(Arc::clone(&app), shutdown_rx));

    if let Err(err) = proxy::server::run(Arc::clone(&app)).await {
        error!(%err, "server exited with error");
        std::process::exit(1);
    }

    // The accept loop is done; flush the traffic engine before exiting.
    let _ = shutdown_tx.send(true);
    let _ = traffic_task.await;
}

async fn traffic_loop(app: Arc<App>, shutdown: watch::Receiver<bool>) {
    let engine: Arc<traffic::TrafficEngine> = Arc::clone(&app.traffic);
    engine.run(shutdown).await;
}

fn init_tracing(level: &str, show_target: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(show_target)
        .init();
}
