mod api_docs;
mod config;
mod controllers;
mod errors;
mod models;
mod routes;
mod services;
mod shared_state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{response::Html, routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_scalar::Scalar;

use crate::api_docs::ApiDoc;
use crate::config::Config;
use crate::services::audit::AuditLog;
use crate::services::cache::CacheGateway;
use crate::services::forecast_client::ForecastClient;
use crate::services::pipeline::Pipeline;
use crate::shared_state::{RunStats, SharedState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 1. Configuration and the static city table
    let config = Config::from_env().context("loading configuration")?;
    let cities = Arc::new(models::city::load_bundled().context("loading city table")?);
    info!(cities = cities.len(), "municipality table loaded");

    // 2. Gateways — the hot cache is load-bearing for readers, so a bad
    //    KV_URL fails startup; the audit log degrades to disabled.
    let cache = CacheGateway::connect(&config.kv_url)
        .await
        .context("connecting to the hot cache")?;
    let audit = AuditLog::connect(config.db_url.as_deref());
    if audit.is_enabled() {
        audit.ensure_schema().await;
    }
    let client = ForecastClient::new(&config.provider_base_url);

    // 3. Scheduler driving the orchestration pipeline
    let stats = Arc::new(RunStats::default());
    let pipeline = Arc::new(Pipeline::new(cities, client, cache.clone(), audit));
    let _scheduler = services::scheduler::start(&config.schedule_cron, pipeline, stats.clone())
        .await
        .context("starting the scheduler")?;

    // 4. Read API
    let shared = SharedState { cache, stats };
    let app = Router::new()
        .route(
            "/metrics",
            get(controllers::forecast_controller::prometheus_metrics),
        )
        .with_state(shared.clone())
        .nest("/api/v1/matopiba", routes::forecast_routes::api_routes(shared))
        .route(
            "/scalar",
            get(|| async { Html(Scalar::new(ApiDoc::openapi()).to_html()) }),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!("─────────────────────────────────────────────────────");
    info!(" MATOPIBA Forecast Pipeline | v{}", env!("CARGO_PKG_VERSION"));
    info!("─────────────────────────────────────────────────────");
    info!(" HTTP API:   http://{}/api/v1/matopiba", addr);
    info!(" Scalar UI:  http://{}/scalar", addr);
    info!(" Health:     http://{}/api/v1/matopiba/health", addr);
    info!(" Metrics:    http://{}/metrics", addr);
    info!(" Schedule:   {}", config.schedule_cron);
    info!("─────────────────────────────────────────────────────");

    axum_server::bind(addr)
        .serve(app.into_make_service())
        .await
        .context("http server")?;
    Ok(())
}
