use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::errors::ConfigError;

/// The MATOPIBA region is a fixed set of 337 municipalities; the bundled
/// table must match exactly or startup is refused.
pub const EXPECTED_CITY_COUNT: usize = 337;

/// Bundled static table: `code,name,state,latitude,longitude,elevation_m`.
const CITIES_CSV: &str = include_str!("../../data/matopiba_cities.csv");

// ─── Static city reference ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum StateCode {
    MA,
    TO,
    PI,
    BA,
}

/// One municipality. Immutable for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CityRef {
    /// Stable string ID (IBGE-style code)
    pub code: String,
    pub name: String,
    pub state: StateCode,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation_m: f64,
}

// Raw CSV row; coordinates come in as options so a blank cell is a
// validation error rather than a parse panic.
#[derive(Debug, Deserialize)]
struct CityRow {
    code: String,
    name: String,
    state: StateCode,
    latitude: Option<f64>,
    longitude: Option<f64>,
    elevation_m: Option<f64>,
}

/// Load and validate the bundled city table. Called once at startup.
pub fn load_bundled() -> Result<Vec<CityRef>, ConfigError> {
    parse_city_table(CITIES_CSV)
}

fn parse_city_table(data: &str) -> Result<Vec<CityRef>, ConfigError> {
    let mut reader = csv::Reader::from_reader(data.as_bytes());
    let mut cities = Vec::with_capacity(EXPECTED_CITY_COUNT);

    for (i, row) in reader.deserialize::<CityRow>().enumerate() {
        let row = row.map_err(|e| ConfigError::CityListInvalid(format!("row {}: {e}", i + 2)))?;
        let latitude = row
            .latitude
            .filter(|v| v.is_finite())
            .ok_or_else(|| ConfigError::CityListInvalid(format!("{}: null latitude", row.code)))?;
        let longitude = row
            .longitude
            .filter(|v| v.is_finite())
            .ok_or_else(|| ConfigError::CityListInvalid(format!("{}: null longitude", row.code)))?;
        let elevation_m = row.elevation_m.filter(|v| v.is_finite()).unwrap_or(0.0);

        cities.push(CityRef {
            code: row.code,
            name: row.name,
            state: row.state,
            latitude,
            longitude,
            elevation_m,
        });
    }

    if cities.len() != EXPECTED_CITY_COUNT {
        return Err(ConfigError::CityListInvalid(format!(
            "expected {} municipalities, table has {}",
            EXPECTED_CITY_COUNT,
            cities.len()
        )));
    }
    Ok(cities)
}
