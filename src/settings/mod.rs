// Persisted per-(account, strategy) configuration and its write path
pub mod memory;
pub mod retry;
pub mod service;

pub use memory::InMemorySettingsStore;
pub use retry::{retry_on_conflict, RetryPolicy};
pub use service::{SettingsCommitted, SettingsService};

use crate::error::{SettingsError, StoreError};
use crate::models::{AccountId, StrategyKey, StrategyType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One settings row, identified by (account_id, strategy_type)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySettings {
    pub account_id: AccountId,
    pub strategy_type: StrategyType,
    pub symbol: String,
    pub timeframe: String,
    /// Number of candles to retain for indicator windows
    pub history_window_size: u32,
    pub params: StrategyParams,
    pub active: bool,
    /// Optimistic concurrency counter, bumped by every successful save
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// Family-specific parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StrategyParams {
    Band(BandParams),
    Grid(GridParams),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandParams {
    /// Rolling window of closes used for mean and stddev
    pub period: usize,
    /// Band width in standard deviations (k)
    pub multiplier: f64,
    /// Take profit, in percent of entry price
    pub take_profit_pct: f64,
    /// Stop loss, in percent of entry price; 0 disables it
    pub stop_loss_pct: f64,
    pub order_size: Decimal,
    pub allow_long: bool,
    pub allow_short: bool,
}

impl Default for BandParams {
    fn default() -> Self {
        Self {
            period: 20,
            multiplier: 2.0,
            take_profit_pct: 1.0,
            stop_loss_pct: 0.5,
            order_size: Decimal::new(1, 3), // 0.001
            allow_long: true,
            allow_short: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridParams {
    /// Distance of each resting order from the current price, in percent
    pub step_pct: f64,
    pub order_size: Decimal,
    pub max_active_per_side: usize,
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            step_pct: 0.5,
            order_size: Decimal::new(1, 3),
            max_active_per_side: 3,
        }
    }
}

impl StrategySettings {
    /// Family defaults used when a row is first accessed
    pub fn defaults(account_id: AccountId, strategy_type: StrategyType) -> Self {
        let (history_window_size, params) = match strategy_type {
            StrategyType::Band => (100, StrategyParams::Band(BandParams::default())),
            StrategyType::Grid => (50, StrategyParams::Grid(GridParams::default())),
        };

        Self {
            account_id,
            strategy_type,
            symbol: "BTCUSDT".to_string(),
            timeframe: "1m".to_string(),
            history_window_size,
            params,
            active: false,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> StrategyKey {
        StrategyKey::new(self.account_id, self.strategy_type)
    }

    pub fn band(&self) -> Option<&BandParams> {
        match &self.params {
            StrategyParams::Band(p) => Some(p),
            _ => None,
        }
    }

    pub fn grid(&self) -> Option<&GridParams> {
        match &self.params {
            StrategyParams::Grid(p) => Some(p),
            _ => None,
        }
    }

    /// Check that the row can drive a running strategy
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.symbol.trim().is_empty() {
            return Err(SettingsError::InvalidConfig("symbol is empty".to_string()));
        }

        match (&self.params, self.strategy_type) {
            (StrategyParams::Band(p), StrategyType::Band) => {
                if p.order_size <= Decimal::ZERO {
                    return Err(SettingsError::InvalidConfig(
                        "order size must be positive".to_string(),
                    ));
                }
                if p.period < 2 {
                    return Err(SettingsError::InvalidConfig(format!(
                        "band period must be at least 2, got {}",
                        p.period
                    )));
                }
                if (self.history_window_size as usize) < p.period {
                    return Err(SettingsError::InvalidConfig(format!(
                        "history window {} is shorter than band period {}",
                        self.history_window_size, p.period
                    )));
                }
                if p.multiplier <= 0.0 || p.take_profit_pct <= 0.0 || p.stop_loss_pct < 0.0 {
                    return Err(SettingsError::InvalidConfig(
                        "band multiplier and take profit must be positive, stop loss non-negative"
                            .to_string(),
                    ));
                }
                if !p.allow_long && !p.allow_short {
                    return Err(SettingsError::InvalidConfig(
                        "at least one of long/short entries must be enabled".to_string(),
                    ));
                }
                Ok(())
            }
            (StrategyParams::Grid(p), StrategyType::Grid) => {
                if p.order_size <= Decimal::ZERO {
                    return Err(SettingsError::InvalidConfig(
                        "order size must be positive".to_string(),
                    ));
                }
                if p.step_pct <= 0.0 || p.step_pct >= 100.0 {
                    return Err(SettingsError::InvalidConfig(format!(
                        "grid step must be within (0, 100) percent, got {}",
                        p.step_pct
                    )));
                }
                if p.max_active_per_side == 0 {
                    return Err(SettingsError::InvalidConfig(
                        "grid needs at least one active order per side".to_string(),
                    ));
                }
                Ok(())
            }
            (_, kind) => Err(SettingsError::InvalidConfig(format!(
                "parameters do not belong to strategy type {}",
                kind
            ))),
        }
    }
}

/// Typed CRUD over settings rows with optimistic versioning
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(
        &self,
        account_id: AccountId,
        strategy_type: StrategyType,
    ) -> Result<Option<StrategySettings>, StoreError>;

    /// Insert `settings` unless a row already exists; returns the stored row
    async fn insert_if_absent(
        &self,
        settings: &StrategySettings,
    ) -> Result<StrategySettings, StoreError>;

    /// Save `settings` if the stored version still equals `settings.version`
    ///
    /// On success the returned row carries the bumped version. A mismatch is
    /// reported as `StoreError::Conflict`.
    async fn save(&self, settings: &StrategySettings) -> Result<StrategySettings, StoreError>;

    /// Every row of every strategy family
    async fn list_all(&self) -> Result<Vec<StrategySettings>, StoreError>;

    async fn list_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<StrategySettings>, StoreError> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|s| s.account_id == account_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_inactive_and_valid() {
        for kind in StrategyType::ALL {
            let settings = StrategySettings::defaults(1, kind);
            assert!(!settings.active);
            assert_eq!(settings.version, 0);
            assert!(settings.validate().is_ok(), "{} defaults invalid", kind);
        }
    }

    #[test]
    fn test_zero_order_size_is_invalid() {
        let mut settings = StrategySettings::defaults(1, StrategyType::Band);
        if let StrategyParams::Band(p) = &mut settings.params {
            p.order_size = Decimal::ZERO;
        }

        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("order size"));
    }

    #[test]
    fn test_mismatched_params_are_invalid() {
        let mut settings = StrategySettings::defaults(1, StrategyType::Band);
        settings.params = StrategyParams::Grid(GridParams::default());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_params_serialize_with_kind_tag() {
        let params = StrategyParams::Grid(GridParams::default());
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("\"kind\":\"grid\""));

        let back: StrategyParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }
}
