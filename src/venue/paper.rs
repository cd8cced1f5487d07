use super::{CandleProvider, MarketData, OrderRequest, SymbolConstraints, Venue, VenueOrderReport};
use crate::error::VenueError;
use crate::models::{AccountId, Candle, OrderSide, OrderType};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct PaperOrder {
    symbol: String,
    side: OrderSide,
    quantity: Decimal,
    limit_price: Decimal,
    status: &'static str,
    executed_qty: Decimal,
    fill_price: Option<Decimal>,
    fee: Decimal,
}

impl PaperOrder {
    fn report(&self, venue_order_id: &str) -> VenueOrderReport {
        VenueOrderReport {
            venue_order_id: venue_order_id.to_string(),
            status: self.status.to_string(),
            executed_qty: self.executed_qty,
            price: self.fill_price,
            quote_qty: self.fill_price.map(|p| p * self.executed_qty),
            fee: Some(self.fee),
        }
    }
}

#[derive(Default)]
struct PaperBook {
    prices: HashMap<String, Decimal>,
    constraints: HashMap<String, SymbolConstraints>,
    candles: HashMap<String, Vec<Candle>>,
    orders: HashMap<String, PaperOrder>,
    reject_reason: Option<String>,
    fail_cancels: bool,
}

/// In-process simulated venue
///
/// Market orders fill in full at the current price. Limit orders that do
/// not cross rest as NEW until a later price update crosses them. Prices
/// and constraints come from the seeded tables, or from `upstream` when one
/// is attached.
pub struct PaperVenue {
    name: String,
    network: String,
    fee_rate: Decimal,
    upstream: Option<Arc<dyn MarketData>>,
    book: Mutex<PaperBook>,
    next_id: AtomicU64,
    placed: AtomicUsize,
    cancel_calls: AtomicUsize,
}

impl PaperVenue {
    pub fn new(network: impl Into<String>, fee_rate: Decimal) -> Self {
        Self {
            name: "paper".to_string(),
            network: network.into(),
            fee_rate,
            upstream: None,
            book: Mutex::new(PaperBook::default()),
            next_id: AtomicU64::new(1),
            placed: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
        }
    }

    /// Read prices and constraints from a live market data source
    pub fn with_upstream(mut self, upstream: Arc<dyn MarketData>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    fn book(&self) -> Result<MutexGuard<'_, PaperBook>, VenueError> {
        self.book
            .lock()
            .map_err(|e| VenueError::Network(format!("paper book lock poisoned: {}", e)))
    }

    /// Set the current price and fill any resting orders it crosses
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        if let Ok(mut book) = self.book() {
            Self::apply_price(&mut book, self.fee_rate, symbol, price);
        }
    }

    pub fn set_constraints(&self, symbol: &str, constraints: SymbolConstraints) {
        if let Ok(mut book) = self.book() {
            book.constraints.insert(symbol.to_string(), constraints);
        }
    }

    /// Seed candle history from a list of closes, one minute apart
    pub fn set_closes(&self, symbol: &str, closes: &[f64]) {
        let start = Utc::now() - chrono::Duration::minutes(closes.len() as i64);
        let candles = closes
            .iter()
            .enumerate()
            .map(|(i, close)| Candle {
                symbol: symbol.to_string(),
                open_time: start + chrono::Duration::minutes(i as i64),
                open: *close,
                high: *close,
                low: *close,
                close: *close,
                volume: 1.0,
            })
            .collect();

        if let Ok(mut book) = self.book() {
            book.candles.insert(symbol.to_string(), candles);
        }
    }

    /// Make every subsequent placement fail with `reason` (`None` restores fills)
    pub fn set_reject_orders(&self, reason: Option<&str>) {
        if let Ok(mut book) = self.book() {
            book.reject_reason = reason.map(str::to_string);
        }
    }

    /// Make cancellations fail at the venue
    pub fn set_fail_cancels(&self, fail: bool) {
        if let Ok(mut book) = self.book() {
            book.fail_cancels = fail;
        }
    }

    /// Number of placements that reached the venue
    pub fn placed_count(&self) -> usize {
        self.placed.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    /// Ids of orders still resting at the venue
    pub fn open_order_ids(&self, symbol: &str) -> Vec<String> {
        let Ok(book) = self.book() else {
            return Vec::new();
        };
        let mut ids: Vec<String> = book
            .orders
            .iter()
            .filter(|(_, o)| o.symbol == symbol && o.status == "NEW")
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn apply_price(book: &mut PaperBook, fee_rate: Decimal, symbol: &str, price: Decimal) {
        book.prices.insert(symbol.to_string(), price);

        for order in book.orders.values_mut() {
            if order.symbol != symbol || order.status != "NEW" {
                continue;
            }
            let crossed = match order.side {
                OrderSide::Buy => price <= order.limit_price,
                OrderSide::Sell => price >= order.limit_price,
            };
            if crossed {
                order.status = "FILLED";
                order.executed_qty = order.quantity;
                order.fill_price = Some(order.limit_price);
                order.fee = order.limit_price * order.quantity * fee_rate;
            }
        }
    }

    fn seeded_price(&self, symbol: &str) -> Result<Option<Decimal>, VenueError> {
        Ok(self.book()?.prices.get(symbol).copied())
    }
}

#[async_trait]
impl MarketData for PaperVenue {
    async fn get_price(&self, symbol: &str) -> Result<Decimal, VenueError> {
        if let Some(upstream) = &self.upstream {
            let price = upstream.get_price(symbol).await?;
            let mut book = self.book()?;
            Self::apply_price(&mut book, self.fee_rate, symbol, price);
            return Ok(price);
        }

        self.seeded_price(symbol)?
            .ok_or_else(|| VenueError::UnknownSymbol(symbol.to_string()))
    }

    async fn get_symbol_constraints(&self, symbol: &str) -> Result<SymbolConstraints, VenueError> {
        let seeded = self.book()?.constraints.get(symbol).copied();
        if let Some(constraints) = seeded {
            return Ok(constraints);
        }

        match &self.upstream {
            Some(upstream) => {
                let constraints = upstream.get_symbol_constraints(symbol).await?;
                self.book()?
                    .constraints
                    .insert(symbol.to_string(), constraints);
                Ok(constraints)
            }
            None => Err(VenueError::UnknownSymbol(symbol.to_string())),
        }
    }
}

#[async_trait]
impl Venue for PaperVenue {
    fn name(&self) -> &str {
        &self.name
    }

    fn network(&self) -> &str {
        &self.network
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<VenueOrderReport, VenueError> {
        let reject_reason = self.book()?.reject_reason.clone();
        if let Some(reason) = reject_reason {
            return Err(VenueError::Rejected(reason));
        }

        let market_price = self.get_price(&request.symbol).await?;
        self.placed.fetch_add(1, Ordering::SeqCst);

        let venue_order_id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();

        let (limit_price, fills_now) = match (request.order_type, request.price) {
            (OrderType::Market, _) => (market_price, true),
            (OrderType::Limit, Some(limit)) => {
                let crosses = match request.side {
                    OrderSide::Buy => market_price <= limit,
                    OrderSide::Sell => market_price >= limit,
                };
                (limit, crosses)
            }
            (OrderType::Limit, None) => {
                return Err(VenueError::Rejected("limit order without price".to_string()))
            }
        };

        let order = if fills_now {
            let fill_price = if request.order_type == OrderType::Market {
                market_price
            } else {
                limit_price
            };
            PaperOrder {
                symbol: request.symbol.clone(),
                side: request.side,
                quantity: request.quantity,
                limit_price,
                status: "FILLED",
                executed_qty: request.quantity,
                fill_price: Some(fill_price),
                fee: fill_price * request.quantity * self.fee_rate,
            }
        } else {
            PaperOrder {
                symbol: request.symbol.clone(),
                side: request.side,
                quantity: request.quantity,
                limit_price,
                status: "NEW",
                executed_qty: Decimal::ZERO,
                fill_price: None,
                fee: Decimal::ZERO,
            }
        };

        let report = order.report(&venue_order_id);
        self.book()?.orders.insert(venue_order_id, order);

        Ok(report)
    }

    async fn cancel_order(&self, _symbol: &str, venue_order_id: &str) -> Result<bool, VenueError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        let mut book = self.book()?;

        if book.fail_cancels {
            return Err(VenueError::Network("cancel timed out".to_string()));
        }

        match book.orders.get_mut(venue_order_id) {
            Some(order) if order.status == "NEW" => {
                order.status = "CANCELED";
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn order_status(
        &self,
        _symbol: &str,
        venue_order_id: &str,
    ) -> Result<Option<VenueOrderReport>, VenueError> {
        Ok(self
            .book()?
            .orders
            .get(venue_order_id)
            .map(|o| o.report(venue_order_id)))
    }
}

#[async_trait]
impl CandleProvider for PaperVenue {
    async fn get_candles(
        &self,
        _account_id: AccountId,
        symbol: &str,
        _timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, VenueError> {
        let book = self.book()?;
        let candles = book.candles.get(symbol).cloned().unwrap_or_default();
        let skip = candles.len().saturating_sub(limit);
        Ok(candles.into_iter().skip(skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn venue() -> PaperVenue {
        let venue = PaperVenue::new("testnet", dec!(0.001));
        venue.set_price("BTCUSDT", dec!(100));
        venue
    }

    fn limit(side: OrderSide, price: Decimal) -> OrderRequest {
        OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side,
            order_type: OrderType::Limit,
            quantity: dec!(1),
            price: Some(price),
        }
    }

    #[tokio::test]
    async fn test_market_order_fills_at_current_price() {
        let venue = venue();
        let report = venue
            .place_order(&OrderRequest {
                symbol: "BTCUSDT".to_string(),
                side: OrderSide::Buy,
                order_type: OrderType::Market,
                quantity: dec!(2),
                price: None,
            })
            .await
            .unwrap();

        assert_eq!(report.status, "FILLED");
        assert_eq!(report.executed_qty, dec!(2));
        assert_eq!(report.price, Some(dec!(100)));
        assert_eq!(report.fee, Some(dec!(0.2)));
    }

    #[tokio::test]
    async fn test_resting_limit_fills_when_crossed() {
        let venue = venue();
        let report = venue.place_order(&limit(OrderSide::Buy, dec!(95))).await.unwrap();
        assert_eq!(report.status, "NEW");
        assert_eq!(venue.open_order_ids("BTCUSDT"), vec![report.venue_order_id.clone()]);

        venue.set_price("BTCUSDT", dec!(94));

        let status = venue
            .order_status("BTCUSDT", &report.venue_order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.status, "FILLED");
        assert_eq!(status.price, Some(dec!(95)));
        assert!(venue.open_order_ids("BTCUSDT").is_empty());
    }

    #[tokio::test]
    async fn test_cancel_only_acknowledges_resting_orders() {
        let venue = venue();
        let report = venue.place_order(&limit(OrderSide::Sell, dec!(110))).await.unwrap();

        assert!(venue.cancel_order("BTCUSDT", &report.venue_order_id).await.unwrap());
        assert!(!venue.cancel_order("BTCUSDT", &report.venue_order_id).await.unwrap());
        assert!(!venue.cancel_order("BTCUSDT", "missing").await.unwrap());
        assert_eq!(venue.cancel_calls(), 3);
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_an_error() {
        let venue = venue();
        assert!(matches!(
            venue.get_price("ETHUSDT").await,
            Err(VenueError::UnknownSymbol(_))
        ));
        assert!(venue.get_symbol_constraints("ETHUSDT").await.is_err());
    }

    #[tokio::test]
    async fn test_candles_respect_limit() {
        let venue = venue();
        venue.set_closes("BTCUSDT", &[1.0, 2.0, 3.0, 4.0]);

        let candles = venue.get_candles(1, "BTCUSDT", "1m", 2).await.unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, 3.0);
        assert_eq!(candles[1].close, 4.0);
        assert!(candles[0].open_time < candles[1].open_time);
    }
}
