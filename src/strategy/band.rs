use super::{StrategyContext, StrategyUnit};
use crate::indicators::calculate_bands;
use crate::models::{AccountId, OrderSide, Position, PositionSide, StrategyType};
use crate::settings::BandParams;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct BandSession {
    symbol: String,
    timeframe: String,
    history_window_size: usize,
    params: BandParams,
    position: Option<Position>,
}

/// Band-following strategy
///
/// FLAT enters LONG when the price touches the lower band and SHORT when it
/// touches the upper band (each only if enabled). An open position is closed
/// at take-profit or stop-loss; no entry is considered while one is open.
/// All orders are market orders.
pub struct BandStrategy {
    context: StrategyContext,
    sessions: Mutex<HashMap<AccountId, BandSession>>,
}

impl BandStrategy {
    pub fn new(context: StrategyContext) -> Self {
        Self {
            context,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open position of the account, if any
    pub async fn position(&self, account_id: AccountId) -> Option<Position> {
        self.sessions
            .lock()
            .await
            .get(&account_id)
            .and_then(|s| s.position.clone())
    }

    async fn session(&self, account_id: AccountId) -> Result<BandSession> {
        self.sessions
            .lock()
            .await
            .get(&account_id)
            .cloned()
            .ok_or_else(|| format!("band strategy not started for account {}", account_id).into())
    }

    async fn set_position(&self, account_id: AccountId, position: Option<Position>) {
        // A stop that raced this tick wins: the session is gone
        if let Some(session) = self.sessions.lock().await.get_mut(&account_id) {
            session.position = position;
        }
    }

    async fn evaluate_exit(
        &self,
        account_id: AccountId,
        session: &BandSession,
        position: &Position,
        price: Decimal,
    ) -> Result<()> {
        let p = &session.params;
        let price_f = price.to_f64().unwrap_or(0.0);
        let entry = position.entry_price.to_f64().unwrap_or(0.0);

        let (take_profit, stop_loss, hit_tp, hit_sl) = match position.side {
            PositionSide::Long => {
                let tp = entry * (1.0 + p.take_profit_pct / 100.0);
                let sl = entry * (1.0 - p.stop_loss_pct / 100.0);
                (tp, sl, price_f >= tp, p.stop_loss_pct > 0.0 && price_f <= sl)
            }
            PositionSide::Short => {
                let tp = entry * (1.0 - p.take_profit_pct / 100.0);
                let sl = entry * (1.0 + p.stop_loss_pct / 100.0);
                (tp, sl, price_f <= tp, p.stop_loss_pct > 0.0 && price_f >= sl)
            }
        };

        if !hit_tp && !hit_sl {
            tracing::debug!(
                account = account_id,
                "{:?} {} @ {} holding (price {}, tp {:.4}, sl {:.4})",
                position.side,
                session.symbol,
                position.entry_price,
                price,
                take_profit,
                stop_loss
            );
            return Ok(());
        }

        let close_side = match position.side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        };
        let order = self
            .context
            .execution
            .place_market(
                account_id,
                &session.symbol,
                close_side,
                Some(price),
                position.quantity,
            )
            .await;

        if order.rejected {
            tracing::warn!(
                account = account_id,
                "Exit order for {:?} {} rejected, position kept: {}",
                position.side,
                session.symbol,
                order.reason.unwrap_or_default()
            );
            return Ok(());
        }

        tracing::info!(
            account = account_id,
            "Closed {:?} {} entry {} exit {} ({})",
            position.side,
            session.symbol,
            position.entry_price,
            order.price,
            if hit_tp { "take profit" } else { "stop loss" }
        );
        self.set_position(account_id, None).await;
        Ok(())
    }

    async fn evaluate_entry(
        &self,
        account_id: AccountId,
        session: &BandSession,
        price: Decimal,
    ) -> Result<()> {
        let p = &session.params;
        let candles = self
            .context
            .candles
            .get_candles(
                account_id,
                &session.symbol,
                &session.timeframe,
                session.history_window_size,
            )
            .await?;
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let Some(bands) = calculate_bands(&closes, p.period, p.multiplier) else {
            tracing::debug!(
                account = account_id,
                "Insufficient history for {} ({} of {} closes), skipping tick",
                session.symbol,
                closes.len(),
                p.period
            );
            return Ok(());
        };

        let price_f = price.to_f64().unwrap_or(0.0);
        let (side, position_side) = if p.allow_long && price_f <= bands.lower {
            (OrderSide::Buy, PositionSide::Long)
        } else if p.allow_short && price_f >= bands.upper {
            (OrderSide::Sell, PositionSide::Short)
        } else {
            tracing::debug!(
                account = account_id,
                "{} {} inside bands [{:.4}, {:.4}]",
                session.symbol,
                price,
                bands.lower,
                bands.upper
            );
            return Ok(());
        };

        let order = self
            .context
            .execution
            .place_market(account_id, &session.symbol, side, Some(price), p.order_size)
            .await;

        if order.rejected {
            tracing::warn!(
                account = account_id,
                "Entry order for {} rejected: {}",
                session.symbol,
                order.reason.unwrap_or_default()
            );
            return Ok(());
        }

        let entry_price = if order.price > Decimal::ZERO {
            order.price
        } else {
            price
        };
        tracing::info!(
            account = account_id,
            "Opened {:?} {} {} @ {} (bands {:.4} / {:.4})",
            position_side,
            order.volume,
            session.symbol,
            entry_price,
            bands.lower,
            bands.upper
        );

        self.set_position(
            account_id,
            Some(Position {
                side: position_side,
                entry_price,
                quantity: order.volume,
                opened_at: Utc::now(),
            }),
        )
        .await;
        Ok(())
    }
}

#[async_trait]
impl StrategyUnit for BandStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::Band
    }

    async fn start(&self, account_id: AccountId) -> Result<()> {
        let settings = self
            .context
            .load_settings(account_id, StrategyType::Band)
            .await?;
        let params = settings
            .band()
            .cloned()
            .ok_or("band strategy started with non-band parameters")?;

        let session = BandSession {
            symbol: settings.symbol.clone(),
            timeframe: settings.timeframe.clone(),
            history_window_size: settings.history_window_size as usize,
            params,
            position: None,
        };

        tracing::info!(
            account = account_id,
            "Band strategy started on {} {} (period {}, k {})",
            session.symbol,
            session.timeframe,
            session.params.period,
            session.params.multiplier
        );
        self.sessions.lock().await.insert(account_id, session);
        Ok(())
    }

    async fn stop(&self, account_id: AccountId) -> Result<()> {
        if let Some(session) = self.sessions.lock().await.remove(&account_id) {
            if let Some(position) = session.position {
                tracing::info!(
                    account = account_id,
                    "Band strategy stopped with open {:?} {} {}; position dropped",
                    position.side,
                    position.quantity,
                    session.symbol
                );
            } else {
                tracing::info!(account = account_id, "Band strategy stopped");
            }
        }
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

        match &session.position {
            Some(position) => {
                self.evaluate_exit(account_id, &session, position, price)
                    .await
            }
            None => self.evaluate_entry(account_id, &session, price).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{InMemoryOrderStore, OrderExecutionService, OrderStore};
    use crate::models::OrderStatus;
    use crate::settings::{InMemorySettingsStore, SettingsStore, StrategyParams, StrategySettings};
    use crate::venue::{PaperVenue, SymbolConstraints};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    struct Harness {
        venue: Arc<PaperVenue>,
        orders: Arc<InMemoryOrderStore>,
        strategy: BandStrategy,
    }

    async fn harness(configure: impl FnOnce(&mut BandParams)) -> Harness {
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
        // mean 100, population stddev 2
        let closes: Vec<f64> = (0..20).map(|i| if i % 2 == 0 { 98.0 } else { 102.0 }).collect();
        venue.set_closes("BTCUSDT", &closes);

        let settings_store = Arc::new(InMemorySettingsStore::new());
        let mut settings = StrategySettings::defaults(1, StrategyType::Band);
        if let StrategyParams::Band(p) = &mut settings.params {
            p.order_size = dec!(0.01);
            configure(p);
        }
        settings_store.insert_if_absent(&settings).await.unwrap();

        let orders = Arc::new(InMemoryOrderStore::new());
        let context = StrategyContext {
            settings: settings_store,
            execution: Arc::new(OrderExecutionService::new(venue.clone(), orders.clone())),
            candles: venue.clone(),
        };

        let strategy = BandStrategy::new(context);
        strategy.start(1).await.unwrap();
        Harness {
            venue,
            orders,
            strategy,
        }
    }

    #[tokio::test]
    async fn test_long_entry_below_lower_band() {
        let h = harness(|_| {}).await;
        h.venue.set_price("BTCUSDT", dec!(95));

        h.strategy.on_price_update(1, dec!(95)).await.unwrap();

        let position = h.strategy.position(1).await.unwrap();
        assert_eq!(position.side, PositionSide::Long);
        assert_eq!(position.entry_price, dec!(95));
        assert_eq!(position.quantity, dec!(0.01));

        let records = h.orders.list_for(1, "BTCUSDT").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].side, OrderSide::Buy);
    }

    #[tokio::test]
    async fn test_no_entry_inside_bands() {
        let h = harness(|_| {}).await;

        h.strategy.on_price_update(1, dec!(97)).await.unwrap();

        assert!(h.strategy.position(1).await.is_none());
        assert_eq!(h.venue.placed_count(), 0);
    }

    #[tokio::test]
    async fn test_short_entry_requires_short_enabled() {
        let h = harness(|_| {}).await;
        h.strategy.on_price_update(1, dec!(105)).await.unwrap();
        assert!(h.strategy.position(1).await.is_none());

        let h = harness(|p| p.allow_short = true).await;
        h.venue.set_price("BTCUSDT", dec!(105));
        h.strategy.on_price_update(1, dec!(105)).await.unwrap();
        assert_eq!(
            h.strategy.position(1).await.unwrap().side,
            PositionSide::Short
        );
    }

    #[tokio::test]
    async fn test_second_entry_signal_is_ignored() {
        let h = harness(|_| {}).await;
        h.venue.set_price("BTCUSDT", dec!(95));
        h.strategy.on_price_update(1, dec!(95)).await.unwrap();

        // Still below the lower band, but inside tp/sl of the open position
        h.venue.set_price("BTCUSDT", dec!(94.8));
        h.strategy.on_price_update(1, dec!(94.8)).await.unwrap();

        assert_eq!(h.venue.placed_count(), 1);
        assert_eq!(h.strategy.position(1).await.unwrap().entry_price, dec!(95));
    }

    #[tokio::test]
    async fn test_take_profit_closes_long() {
        let h = harness(|_| {}).await;
        h.venue.set_price("BTCUSDT", dec!(95));
        h.strategy.on_price_update(1, dec!(95)).await.unwrap();

        h.venue.set_price("BTCUSDT", dec!(96));
        h.strategy.on_price_update(1, dec!(96)).await.unwrap();

        assert!(h.strategy.position(1).await.is_none());
        let records = h.orders.list_for(1, "BTCUSDT").await.unwrap();
        assert_eq!(records.len(), 2);
        let exit = records.iter().find(|r| r.side == OrderSide::Sell).unwrap();
        assert_eq!(exit.status, OrderStatus::Filled);
        assert_eq!(exit.price, dec!(96));
    }

    #[tokio::test]
    async fn test_stop_loss_closes_long() {
        let h = harness(|_| {}).await;
        h.venue.set_price("BTCUSDT", dec!(95));
        h.strategy.on_price_update(1, dec!(95)).await.unwrap();

        h.venue.set_price("BTCUSDT", dec!(94.5));
        h.strategy.on_price_update(1, dec!(94.5)).await.unwrap();

        assert!(h.strategy.position(1).await.is_none());
        assert_eq!(h.venue.placed_count(), 2);
    }

    async fn short_at_105() -> Harness {
        let h = harness(|p| p.allow_short = true).await;
        h.venue.set_price("BTCUSDT", dec!(105));
        h.strategy.on_price_update(1, dec!(105)).await.unwrap();
        assert_eq!(
            h.strategy.position(1).await.unwrap().side,
            PositionSide::Short
        );
        h
    }

    #[tokio::test]
    async fn test_take_profit_closes_short() {
        let h = short_at_105().await;

        // tp at 103.95
        h.venue.set_price("BTCUSDT", dec!(104));
        h.strategy.on_price_update(1, dec!(104)).await.unwrap();
        assert!(h.strategy.position(1).await.is_some());

        h.venue.set_price("BTCUSDT", dec!(103.9));
        h.strategy.on_price_update(1, dec!(103.9)).await.unwrap();

        assert!(h.strategy.position(1).await.is_none());
        let records = h.orders.list_for(1, "BTCUSDT").await.unwrap();
        assert_eq!(records.len(), 2);
        let exit = records.iter().find(|r| r.side == OrderSide::Buy).unwrap();
        assert_eq!(exit.status, OrderStatus::Filled);
        assert_eq!(exit.price, dec!(103.9));
        assert_eq!(exit.executed_qty, dec!(0.01));
    }

    #[tokio::test]
    async fn test_stop_loss_closes_short() {
        let h = short_at_105().await;

        // sl at 105.525
        h.venue.set_price("BTCUSDT", dec!(105.5));
        h.strategy.on_price_update(1, dec!(105.5)).await.unwrap();
        assert!(h.strategy.position(1).await.is_some());

        h.venue.set_price("BTCUSDT", dec!(106));
        h.strategy.on_price_update(1, dec!(106)).await.unwrap();

        assert!(h.strategy.position(1).await.is_none());
        let records = h.orders.list_for(1, "BTCUSDT").await.unwrap();
        let exit = records.iter().find(|r| r.side == OrderSide::Buy).unwrap();
        assert_eq!(exit.price, dec!(106));
        assert_eq!(h.venue.placed_count(), 2);
    }

    #[tokio::test]
    async fn test_zero_stop_loss_never_stops_out() {
        let h = harness(|p| {
            p.allow_short = true;
            p.stop_loss_pct = 0.0;
        })
        .await;
        h.venue.set_price("BTCUSDT", dec!(105));
        h.strategy.on_price_update(1, dec!(105)).await.unwrap();

        for price in [dec!(105), dec!(110), dec!(200)] {
            h.venue.set_price("BTCUSDT", price);
            h.strategy.on_price_update(1, price).await.unwrap();
        }
        assert_eq!(
            h.strategy.position(1).await.unwrap().side,
            PositionSide::Short
        );
        assert_eq!(h.venue.placed_count(), 1);

        // Take-profit still applies
        h.venue.set_price("BTCUSDT", dec!(103.9));
        h.strategy.on_price_update(1, dec!(103.9)).await.unwrap();
        assert!(h.strategy.position(1).await.is_none());
        let records = h.orders.list_for(1, "BTCUSDT").await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|r| r.side == OrderSide::Buy));
    }

    #[tokio::test]
    async fn test_insufficient_history_skips_tick() {
        let h = harness(|p| p.period = 50).await;

        h.strategy.on_price_update(1, dec!(50)).await.unwrap();

        assert!(h.strategy.position(1).await.is_none());
        assert_eq!(h.venue.placed_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_drops_position_without_orders() {
        let h = harness(|_| {}).await;
        h.venue.set_price("BTCUSDT", dec!(95));
        h.strategy.on_price_update(1, dec!(95)).await.unwrap();

        h.strategy.stop(1).await.unwrap();
        h.strategy.stop(1).await.unwrap();

        assert!(h.strategy.position(1).await.is_none());
        assert_eq!(h.venue.placed_count(), 1);
        assert!(h.strategy.on_price_update(1, dec!(95)).await.is_err());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_settings() {
        let h = harness(|_| {}).await;
        let mut settings = h
            .strategy
            .context
            .settings
            .load(1, StrategyType::Band)
            .await
            .unwrap()
            .unwrap();
        if let StrategyParams::Band(p) = &mut settings.params {
            p.order_size = dec!(0);
        }
        h.strategy.context.settings.save(&settings).await.unwrap();

        assert!(h.strategy.start(1).await.is_err());
    }
}
