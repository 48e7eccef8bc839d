use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod db;
mod gmp;
mod manager;
mod metrics;
mod models;
mod report;
mod scheduler;
mod sync;

use crate::config::LogFormat;
use crate::gmp::{GmpClient, ScanEngine};

/// Per-request cap on the HTTP surface
const REQUEST_TIMEOUT_SECS: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let settings = config::Settings::load().context("failed to load configuration")?;

    init_tracing(&settings.logging);

    if settings.probes.is_empty() {
        tracing::warn!("No probes configured; scan submissions will be rejected");
    }

    // Store
    let pool = db::connect(&settings.scan.db_path)
        .await
        .context("failed to open store")?;
    db::migrate(&pool).await.context("failed to migrate store")?;
    tracing::info!("Store ready at {}", settings.scan.db_path);

    let metrics = Arc::new(metrics::Metrics::new().context("failed to register metrics")?);

    // One engine handle per configured probe
    let engines: HashMap<String, Arc<dyn ScanEngine>> = settings
        .probes
        .iter()
        .map(|probe| {
            (
                probe.name.clone(),
                Arc::new(GmpClient::new(probe, &settings.scan)) as Arc<dyn ScanEngine>,
            )
        })
        .collect();
    tracing::info!("Configured {} probe(s)", engines.len());

    let callback_url = settings
        .source
        .as_ref()
        .and_then(|source| source.callback_url.clone());

    let manager = Arc::new(manager::ScanManager::new(
        pool.clone(),
        engines.clone(),
        settings.scan.clone(),
        callback_url,
        metrics.clone(),
    ));

    // Re-adopt whatever a previous process left in flight
    let adopted = manager
        .recover()
        .await
        .context("failed to recover in-flight scans")?;
    if adopted > 0 {
        tracing::info!("Re-adopted {} in-flight scan(s)", adopted);
    }

    // Sync + scheduler run only with an upstream source
    match settings.source.clone() {
        Some(source) => {
            let scheduler_interval = source.scheduler_interval;
            tokio::spawn(sync::run(pool.clone(), source, metrics.clone()));
            tokio::spawn(scheduler::run(
                pool.clone(),
                manager.clone(),
                metrics.clone(),
                scheduler_interval,
            ));
        }
        None => {
            tracing::info!("No source configured; target sync and scheduler disabled");
        }
    }

    let state = api::AppState {
        pool,
        manager,
        engines,
        probes: settings.probes.clone(),
        metrics,
    };

    let app = api::routes::router()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)));

    let addr: SocketAddr = format!("{}:{}", settings.api.host, settings.api.port)
        .parse()
        .context("invalid api bind address")?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(
        |_| format!("gvm_fleet={},tower_http=info", logging.level),
    ));

    match logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
