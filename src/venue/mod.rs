// Collaborator contracts for the trading venue and candle history
pub mod paper;

pub use paper::PaperVenue;

use crate::error::VenueError;
use crate::models::{AccountId, Candle, OrderSide, OrderType};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Trading rules a venue enforces for one symbol
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolConstraints {
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    /// Limit price; `None` for market orders
    pub price: Option<Decimal>,
}

/// What the venue reports back for a placed or queried order
#[derive(Debug, Clone, PartialEq)]
pub struct VenueOrderReport {
    pub venue_order_id: String,
    /// Raw venue status string, e.g. "FILLED" or "PARTIALLY FILLED"
    pub status: String,
    pub executed_qty: Decimal,
    pub price: Option<Decimal>,
    pub quote_qty: Option<Decimal>,
    pub fee: Option<Decimal>,
}

/// Read-only market data
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn get_price(&self, symbol: &str) -> Result<Decimal, VenueError>;

    async fn get_symbol_constraints(&self, symbol: &str) -> Result<SymbolConstraints, VenueError>;
}

/// Order-capable venue adapter
///
/// Every call may fail with a network or business error; callers treat
/// those as rejections, never as crashes.
#[async_trait]
pub trait Venue: MarketData {
    fn name(&self) -> &str;

    fn network(&self) -> &str;

    async fn place_order(&self, request: &OrderRequest) -> Result<VenueOrderReport, VenueError>;

    /// Returns whether the venue acknowledged the cancellation
    async fn cancel_order(&self, symbol: &str, venue_order_id: &str) -> Result<bool, VenueError>;

    /// Current state of a previously placed order; `None` if the venue has no record
    async fn order_status(
        &self,
        symbol: &str,
        venue_order_id: &str,
    ) -> Result<Option<VenueOrderReport>, VenueError>;
}

/// Candle history source
///
/// Returns at most `limit` candles ascending by open time; fewer are
/// returned when the history is short.
#[async_trait]
pub trait CandleProvider: Send + Sync {
    async fn get_candles(
        &self,
        account_id: AccountId,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, VenueError>;
}
