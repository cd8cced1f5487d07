use crate::settings::RetryPolicy;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "tradekeeper";
const ENV_PREFIX: &str = "TRADEKEEPER";

/// Runtime configuration
///
/// Layered as: built-in defaults, then an optional TOML file, then
/// `TRADEKEEPER__SECTION__KEY` environment variables.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Postgres URL; in-memory stores are used when absent
    pub database_url: Option<String>,
    pub venue: VenueConfig,
    pub supervisor: SupervisorConfig,
    pub reconciler: ReconcilerConfig,
    pub housekeeper: HousekeeperConfig,
    pub settings: SettingsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VenueConfig {
    pub name: String,
    pub network: String,
    /// Base URL of the public market data REST API
    pub market_data_url: String,
    pub fee_rate: f64,
    pub requests_per_minute: u32,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            name: "paper".to_string(),
            network: "testnet".to_string(),
            market_data_url: "https://api.binance.com".to_string(),
            fee_rate: 0.001,
            requests_per_minute: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub tick_interval_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
        }
    }
}

impl SupervisorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub scan_interval_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
        }
    }
}

impl ReconcilerConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HousekeeperConfig {
    pub interval_secs: u64,
    pub max_active_per_side: usize,
    /// Decimal places prices are truncated to when bucketing duplicates
    pub price_scale: u32,
}

impl Default for HousekeeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_active_per_side: 3,
            price_scale: 8,
        }
    }
}

impl HousekeeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay_ms: 200,
        }
    }
}

impl SettingsConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            delay: self.retry_delay(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `path` (or `tradekeeper.toml` in the working
    /// directory) and the environment
    pub fn load(path: Option<&str>) -> crate::Result<Self> {
        dotenvy::dotenv().ok();

        let file = config::File::with_name(path.unwrap_or(DEFAULT_CONFIG_FILE))
            .required(path.is_some());

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut app: AppConfig = settings.try_deserialize()?;

        if app.database_url.is_none() {
            app.database_url = std::env::var("DATABASE_URL").ok();
        }

        Ok(app)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.supervisor.tick_interval(), Duration::from_secs(5));
        assert_eq!(config.reconciler.scan_interval(), Duration::from_secs(30));
        assert_eq!(config.housekeeper.max_active_per_side, 3);
        assert_eq!(config.settings.retry_attempts, 3);
        assert_eq!(config.venue.name, "paper");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                "[housekeeper]\nmax_active_per_side = 5\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();

        let config: AppConfig = settings.try_deserialize().unwrap();
        assert_eq!(config.housekeeper.max_active_per_side, 5);
        assert_eq!(config.housekeeper.price_scale, 8);
        assert_eq!(config.supervisor.tick_interval_secs, 5);
    }
}
