use crate::errors::ConfigError;

/// Default firing schedule: 00/06/12/18 UTC (5-field cron).
pub const DEFAULT_SCHEDULE_CRON: &str = "0 0,6,12,18 * * *";
const DEFAULT_SERVER_PORT: u16 = 8000;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    /// Hot cache connection string
    pub kv_url: String,
    /// Audit log connection string; absent disables the audit gateway
    pub db_url: Option<String>,
    /// Forecast provider endpoint (scheme + host + path)
    pub provider_base_url: String,
    pub schedule_cron: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match optional("SERVER_PORT") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidConfig {
                name: "SERVER_PORT",
                reason: format!("not a port number: {raw}"),
            })?,
            None => DEFAULT_SERVER_PORT,
        };

        Ok(Self {
            server: ServerConfig { port },
            kv_url: required("KV_URL")?,
            db_url: optional("DB_URL"),
            provider_base_url: required("PROVIDER_BASE_URL")?,
            schedule_cron: optional("SCHEDULE_CRON")
                .unwrap_or_else(|| DEFAULT_SCHEDULE_CRON.to_string()),
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::MissingConfig(name))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
