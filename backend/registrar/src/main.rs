//! Graduation registration portal: entry point.
//!
//! Holds registration drafts, initiates gateway payments through the
//! registration backend and reconciles the gateway's callbacks. A background
//! sweeper expires old drafts and abandons redirects that never returned.

mod api;
mod backend;
mod callback;
mod config;
mod db;
mod draft;
mod errors;
mod lookup;
mod order;
mod sweeper;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use api::AppState;
use backend::HttpBackend;
use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG controls verbosity.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    let pool = db::init_pool(&config.database_url).await?;

    let client = Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .build()?;
    let backend = HttpBackend::new(client, &config.backend_url, &config.gateway);

    // ─── Background sweeper ───────────────────────────────
    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(sweeper::run(
        pool.clone(),
        config.clone(),
        shutdown.clone(),
    ));

    // ─── HTTP API ─────────────────────────────────────────
    let state = Arc::new(AppState {
        pool,
        backend: Arc::new(backend),
        config: config.clone(),
    });
    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("Portal listening on http://{addr}");
    info!("Gateway return URL: {}", config.return_url());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!("Sweeper task ended abnormally: {e}");
    }
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Could not listen for ctrl-c: {e}");
                // Keep serving; only an explicit cancel stops us now.
                shutdown.cancelled().await;
            }
            info!("Shutdown requested");
        }
        _ = shutdown.cancelled() => {}
    }
}
