use super::{StrategyContext, StrategyUnit};
use crate::models::{AccountId, OrderSide, OrderStatus, StrategyType};
use crate::settings::GridParams;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::Mutex;

const PRICE_DP: u32 = 8;

#[derive(Debug, Clone)]
struct GridSession {
    symbol: String,
    params: GridParams,
}

/// Resting limit orders on both sides of the market
///
/// Every tick adds at most one BUY at `price * (1 - step)` and one SELL at
/// `price * (1 + step)`, each only while that side has fewer NEW orders than
/// `max_active_per_side`.
pub struct GridStrategy {
    context: StrategyContext,
    sessions: Mutex<HashMap<AccountId, GridSession>>,
}

impl GridStrategy {
    pub fn new(context: StrategyContext) -> Self {
        Self {
            context,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn session(&self, account_id: AccountId) -> Result<GridSession> {
        self.sessions
            .lock()
            .await
            .get(&account_id)
            .cloned()
            .ok_or_else(|| format!("grid strategy not started for account {}", account_id).into())
    }

    /// Best-effort cancel of every NEW order the account has on `symbol`
    async fn cancel_open(&self, account_id: AccountId, symbol: &str) -> Result<usize> {
        let execution = &self.context.execution;
        let venue = execution.venue();
        let store = execution.store();
        let mut cancelled = 0;

        for mut record in store.list_open(account_id, symbol).await? {
            match venue.cancel_order(symbol, &record.venue_order_id).await {
                Ok(true) => {
                    record.status = OrderStatus::Canceled;
                    record.updated_at = Utc::now();
                    store.upsert(&record).await?;
                    cancelled += 1;
                }
                Ok(false) => tracing::debug!(
                    account = account_id,
                    "Order {} was not open at the venue",
                    record.venue_order_id
                ),
                Err(e) => tracing::warn!(
                    account = account_id,
                    "Failed to cancel grid order {}: {}",
                    record.venue_order_id,
                    e
                ),
            }
        }

        Ok(cancelled)
    }
}

#[async_trait]
impl StrategyUnit for GridStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::Grid
    }

    async fn start(&self, account_id: AccountId) -> Result<()> {
        let settings = self
            .context
            .load_settings(account_id, StrategyType::Grid)
            .await?;
        let params = settings
            .grid()
            .cloned()
            .ok_or("grid strategy started with non-grid parameters")?;

        tracing::info!(
            account = account_id,
            "Grid strategy started on {} (step {}%, {} per side)",
            settings.symbol,
            params.step_pct,
            params.max_active_per_side
        );
        self.sessions.lock().await.insert(
            account_id,
            GridSession {
                symbol: settings.symbol,
                params,
            },
        );
        Ok(())
    }

    async fn stop(&self, account_id: AccountId) -> Result<()> {
        let Some(session) = self.sessions.lock().await.remove(&account_id) else {
            return Ok(());
        };

        let cancelled = self.cancel_open(account_id, &session.symbol).await?;
        tracing::info!(
            account = account_id,
            "Grid strategy stopped, {} resting orders cancelled on {}",
            cancelled,
            session.symbol
        );
        Ok(())
    }

    async fn current_price(&self, account_id: AccountId) -> Result<Decimal> {
        let session = self.session(account_id).await?;
        Ok(self
            .context
            .execution
            .venue()
            .get_price(&session.symbol)
            .await?)
    }

    async fn on_price_update(&self, account_id: AccountId, price: Decimal) -> Result<()> {
        let session = self.session(account_id).await?;
        let params = &session.params;
        let execution = &self.context.execution;

        let open = execution.store().list_open(account_id, &session.symbol).await?;
        let buys = open.iter().filter(|r| r.side == OrderSide::Buy).count();
        let sells = open.len() - buys;

        let step = Decimal::from_f64(params.step_pct / 100.0)
            .ok_or_else(|| format!("grid step {} is not representable", params.step_pct))?;

        for (side, active, level) in [
            (OrderSide::Buy, buys, price * (Decimal::ONE - step)),
            (OrderSide::Sell, sells, price * (Decimal::ONE + step)),
        ] {
            if active >= params.max_active_per_side {
                tracing::debug!(
                    account = account_id,
                    "Grid {} side full ({}/{})",
                    side,
                    active,
                    params.max_active_per_side
                );
                continue;
            }

            let level = level.round_dp(PRICE_DP).normalize();
            let order = execution
                .place_limit(account_id, &session.symbol, side, level, params.order_size)
                .await;
            if order.rejected {
                tracing::warn!(
                    account = account_id,
                    "Grid {} @ {} rejected: {}",
                    side,
                    level,
                    order.reason.unwrap_or_default()
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{InMemoryOrderStore, OrderExecutionService, OrderStore};
    use crate::settings::{InMemorySettingsStore, SettingsStore, StrategyParams, StrategySettings};
    use crate::venue::{PaperVenue, SymbolConstraints};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    async fn setup(max_per_side: usize) -> (Arc<PaperVenue>, Arc<InMemoryOrderStore>, GridStrategy) {
        let venue = Arc::new(PaperVenue::new("testnet", dec!(0)));
        venue.set_price("BTCUSDT", dec!(100));
        venue.set_constraints(
            "BTCUSDT",
            SymbolConstraints {
                step_size: dec!(0.001),
                min_qty: dec!(0.001),
                min_notional: dec!(0),
            },
        );

        let settings_store = Arc::new(InMemorySettingsStore::new());
        let mut settings = StrategySettings::defaults(3, StrategyType::Grid);
        if let StrategyParams::Grid(p) = &mut settings.params {
            p.step_pct = 1.0;
            p.order_size = dec!(0.01);
            p.max_active_per_side = max_per_side;
        }
        settings_store.insert_if_absent(&settings).await.unwrap();

        let orders = Arc::new(InMemoryOrderStore::new());
        let strategy = GridStrategy::new(StrategyContext {
            settings: settings_store,
            execution: Arc::new(OrderExecutionService::new(venue.clone(), orders.clone())),
            candles: venue.clone(),
        });
        strategy.start(3).await.unwrap();
        (venue, orders, strategy)
    }

    #[tokio::test]
    async fn test_places_one_order_per_side_around_price() {
        let (_venue, orders, strategy) = setup(2).await;

        strategy.on_price_update(3, dec!(100)).await.unwrap();

        let open = orders.list_open(3, "BTCUSDT").await.unwrap();
        assert_eq!(open.len(), 2);
        let buy = open.iter().find(|r| r.side == OrderSide::Buy).unwrap();
        let sell = open.iter().find(|r| r.side == OrderSide::Sell).unwrap();
        assert_eq!(buy.price, dec!(99));
        assert_eq!(sell.price, dec!(101));
    }

    #[tokio::test]
    async fn test_stops_adding_at_cap() {
        let (venue, orders, strategy) = setup(2).await;

        for _ in 0..4 {
            strategy.on_price_update(3, dec!(100)).await.unwrap();
        }

        assert_eq!(orders.list_open(3, "BTCUSDT").await.unwrap().len(), 4);
        assert_eq!(venue.placed_count(), 4);
    }

    #[tokio::test]
    async fn test_stop_cancels_resting_orders() {
        let (venue, orders, strategy) = setup(1).await;
        strategy.on_price_update(3, dec!(100)).await.unwrap();

        strategy.stop(3).await.unwrap();

        assert!(orders.list_open(3, "BTCUSDT").await.unwrap().is_empty());
        assert!(venue.open_order_ids("BTCUSDT").is_empty());
        let history = orders.list_for(3, "BTCUSDT").await.unwrap();
        assert!(history.iter().all(|r| r.status == OrderStatus::Canceled));
    }
}
