use serde::Deserialize;

// ─── Provider wire types ─────────────────────────────────────────────────────
//
// The provider answers a multi-coordinate request with a JSON array of
// per-location objects (a single object when only one coordinate was sent).
// Hourly variables arrive as parallel arrays aligned by index; individual
// cells may be null.

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ProviderPayload {
    Many(Vec<LocationResponse>),
    One(LocationResponse),
}

impl ProviderPayload {
    pub fn into_vec(self) -> Vec<LocationResponse> {
        match self {
            ProviderPayload::Many(v) => v,
            ProviderPayload::One(o) => vec![o],
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LocationResponse {
    pub latitude: f64,
    pub longitude: f64,
    pub hourly: HourlyBlock,
}

/// Local wall-clock times (the request pins `timezone=America/Sao_Paulo`),
/// format `YYYY-MM-DDTHH:MM`.
#[derive(Debug, Default, Deserialize)]
pub struct HourlyBlock {
    #[serde(default)]
    pub time: Vec<String>,
    #[serde(default)]
    pub temperature_2m: Vec<Option<f64>>,
    #[serde(default)]
    pub relative_humidity_2m: Vec<Option<f64>>,
    #[serde(default)]
    pub dew_point_2m: Vec<Option<f64>>,
    #[serde(default)]
    pub wind_speed_10m: Vec<Option<f64>>,
    #[serde(default)]
    pub shortwave_radiation: Vec<Option<f64>>,
    #[serde(default)]
    pub precipitation: Vec<Option<f64>>,
    #[serde(default)]
    pub et0_fao_evapotranspiration: Vec<Option<f64>>,
}
