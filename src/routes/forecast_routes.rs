use axum::{routing::get, Router};

use crate::controllers::forecast_controller::{get_forecasts, get_metadata, health_check};
use crate::shared_state::SharedState;

/// Build the `/api/v1/matopiba` sub-router. Handlers extract
/// `State<CacheGateway>` via `FromRef<SharedState>`.
pub fn api_routes(shared: SharedState) -> Router {
    Router::new()
        .route("/forecasts", get(get_forecasts))
        .route("/metadata", get(get_metadata))
        .route("/health", get(health_check))
        .with_state(shared)
}
