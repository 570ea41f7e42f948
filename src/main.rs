//! News feeder — binary entrypoint.
//! Boots the source orchestrator plus two HTTP listeners: status/health
//! and the Prometheus exposition endpoint.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use news_feeder::api;
use news_feeder::config::FeederConfig;
use news_feeder::dedup::DuplicateDetector;
use news_feeder::dispatch::{HttpDispatcher, WorkflowDispatcher};
use news_feeder::metrics::Metrics;
use news_feeder::orchestrator::Orchestrator;

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("news_feeder={level},warn")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

async fn serve(router: axum::Router, port: u16, what: &'static str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding {what} port {port}"))?;
    info!(port, "{what} listener up");
    axum::serve(listener, router)
        .await
        .with_context(|| format!("{what} server"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config =
        FeederConfig::load(config_path.as_deref()).context("loading feeder configuration")?;
    init_tracing(&config.monitoring.log_level);
    info!(service = %config.service.name, sources = config.sources.len(), "configuration loaded");

    let metrics = Metrics::init().context("initializing metrics recorder")?;

    // Backends: dedup degrades to in-memory, dispatch must construct.
    let detector = Arc::new(DuplicateDetector::connect(&config.redis).await);
    let dispatcher: Arc<dyn WorkflowDispatcher> = Arc::new(
        HttpDispatcher::new(config.dispatch.clone()).context("building workflow dispatcher")?,
    );

    let status_port = config.monitoring.status_port;
    let prometheus_port = config.monitoring.prometheus_port;

    let orchestrator = Orchestrator::new(config, detector, dispatcher);
    orchestrator
        .initialize()
        .await
        .context("constructing sources")?;
    orchestrator.start().await;

    let status_router = api::create_router(orchestrator.clone());
    let metrics_router = metrics.router();
    let mut status_server = tokio::spawn(serve(status_router, status_port, "status"));
    let mut metrics_server = tokio::spawn(serve(metrics_router, prometheus_port, "metrics"));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        outcome = &mut status_server => {
            if let Ok(Err(e)) = outcome {
                error!(error = %e, "status server exited");
            }
        }
        outcome = &mut metrics_server => {
            if let Ok(Err(e)) = outcome {
                error!(error = %e, "metrics server exited");
            }
        }
    }

    orchestrator.stop().await;
    status_server.abort();
    metrics_server.abort();
    info!("feeder shut down cleanly");
    Ok(())
}
