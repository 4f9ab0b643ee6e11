use utoipa::OpenApi;

use crate::controllers::forecast_controller;
use crate::models::city;
use crate::models::forecast;

#[derive(OpenApi)]
#[openapi(
    paths(
        forecast_controller::get_forecasts,
        forecast_controller::get_metadata,
        forecast_controller::health_check
    ),
    components(
        schemas(
            forecast::Snapshot,
            forecast::CityForecast,
            forecast::DailyForecast,
            forecast::ValidationMetrics,
            forecast::RunMetadata,
            forecast::RunLabel,
            forecast::Quality,
            city::StateCode
        )
    ),
    tags(
        (name = "matopiba-forecast", description = "MATOPIBA ETo Forecast API")
    )
)]
pub struct ApiDoc;
