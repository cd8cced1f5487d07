// Strategy units driven by the supervisor
pub mod band;
pub mod grid;

pub use band::BandStrategy;
pub use grid::GridStrategy;

use crate::execution::OrderExecutionService;
use crate::models::{AccountId, StrategyType};
use crate::settings::{SettingsStore, StrategySettings};
use crate::venue::CandleProvider;
use crate::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

/// One strategy family
///
/// A single unit serves every account; per-account state lives inside the
/// unit and exists between `start` and `stop`.
#[async_trait]
pub trait StrategyUnit: Send + Sync {
    fn strategy_type(&self) -> StrategyType;

    /// Load and validate the account's settings and open a session
    async fn start(&self, account_id: AccountId) -> Result<()>;

    /// Drop the account's session; must succeed when nothing is running
    async fn stop(&self, account_id: AccountId) -> Result<()>;

    /// Latest price of the session's symbol
    async fn current_price(&self, account_id: AccountId) -> Result<Decimal>;

    async fn on_price_update(&self, account_id: AccountId, price: Decimal) -> Result<()>;
}

/// Collaborators shared by every strategy family
#[derive(Clone)]
pub struct StrategyContext {
    pub settings: Arc<dyn SettingsStore>,
    pub execution: Arc<OrderExecutionService>,
    pub candles: Arc<dyn CandleProvider>,
}

impl StrategyContext {
    /// Load the row (family defaults if it was never written) and validate it
    pub async fn load_settings(
        &self,
        account_id: AccountId,
        strategy_type: StrategyType,
    ) -> Result<StrategySettings> {
        let settings = match self.settings.load(account_id, strategy_type).await? {
            Some(settings) => settings,
            None => StrategySettings::defaults(account_id, strategy_type),
        };
        settings.validate()?;
        Ok(settings)
    }
}

/// Strategy families resolved once at startup
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    units: HashMap<StrategyType, Arc<dyn StrategyUnit>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in family
    pub fn standard(context: StrategyContext) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BandStrategy::new(context.clone())));
        registry.register(Arc::new(GridStrategy::new(context)));
        registry
    }

    pub fn register(&mut self, unit: Arc<dyn StrategyUnit>) {
        self.units.insert(unit.strategy_type(), unit);
    }

    pub fn get(&self, strategy_type: StrategyType) -> Option<Arc<dyn StrategyUnit>> {
        self.units.get(&strategy_type).cloned()
    }

    pub fn types(&self) -> Vec<StrategyType> {
        StrategyType::ALL
            .into_iter()
            .filter(|t| self.units.contains_key(t))
            .collect()
    }
}
