use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Tenant identity (one chat/user) that owns settings, strategies and orders
pub type AccountId = i64;

/// Strategy family a settings row and a running task belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyType {
    /// Band-following entry/exit with take-profit / stop-loss
    Band,
    /// Resting limit orders on both sides of the market
    Grid,
}

impl StrategyType {
    pub const ALL: [StrategyType; 2] = [StrategyType::Band, StrategyType::Grid];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyType::Band => "band",
            StrategyType::Grid => "grid",
        }
    }
}

impl fmt::Display for StrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "band" | "bollinger" => Ok(StrategyType::Band),
            "grid" => Ok(StrategyType::Grid),
            other => Err(format!("Unknown strategy type: {}", other)),
        }
    }
}

/// Identity of a strategy instance: one account paired with one strategy family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrategyKey {
    pub account_id: AccountId,
    pub strategy_type: StrategyType,
}

impl StrategyKey {
    pub fn new(account_id: AccountId, strategy_type: StrategyType) -> Self {
        Self {
            account_id,
            strategy_type,
        }
    }
}

impl fmt::Display for StrategyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account_id, self.strategy_type)
    }
}

/// OHLCV candlestick, ascending by `open_time` when returned in a sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            other => Err(format!("Invalid order side: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        }
    }
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MARKET" => Ok(OrderType::Market),
            "LIMIT" => Ok(OrderType::Limit),
            other => Err(format!("Invalid order type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        }
    }

    /// Map a status string reported by a venue onto the internal enum
    ///
    /// "FILLED" and "PARTIALLY FILLED" are matched verbatim; anything else is
    /// normalized by dropping spaces/underscores and upper-casing. Unknown
    /// values map to `New` so the record stays visible to housekeeping.
    pub fn from_venue_str(raw: &str) -> Self {
        match raw {
            "FILLED" => return OrderStatus::Filled,
            "PARTIALLY FILLED" => return OrderStatus::PartiallyFilled,
            _ => {}
        }

        let normalized: String = raw
            .chars()
            .filter(|c| *c != ' ' && *c != '_')
            .collect::<String>()
            .to_uppercase();

        match normalized.as_str() {
            "NEW" => OrderStatus::New,
            "PARTIALLYFILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" | "CANCELLED" => OrderStatus::Canceled,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" => OrderStatus::Expired,
            _ => {
                tracing::warn!("Unknown venue order status '{}', treating as NEW", raw);
                OrderStatus::New
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(OrderStatus::New),
            "PARTIALLY_FILLED" => Ok(OrderStatus::PartiallyFilled),
            "FILLED" => Ok(OrderStatus::Filled),
            "CANCELED" => Ok(OrderStatus::Canceled),
            "REJECTED" => Ok(OrderStatus::Rejected),
            "EXPIRED" => Ok(OrderStatus::Expired),
            other => Err(format!("Invalid order status: {}", other)),
        }
    }
}

/// Persisted trail of one placement attempt
///
/// Unique by (account_id, venue, network, venue_order_id). Rejections carry a
/// synthetic `venue_order_id` and a `reason`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: Uuid,
    pub account_id: AccountId,
    pub venue: String,
    pub network: String,
    pub venue_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub price: Decimal,
    pub quantity: Decimal,
    pub executed_qty: Decimal,
    pub quote_qty: Decimal,
    pub fee: Decimal,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Normalized placement result handed back to strategy code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub volume: Decimal,
    pub status: OrderStatus,
    pub filled: bool,
    pub cancelled: bool,
    pub closed: bool,
    pub rejected: bool,
    pub reason: Option<String>,
}

impl Order {
    pub fn from_record(record: &OrderRecord) -> Self {
        let status = record.status;
        let volume = if record.executed_qty > Decimal::ZERO {
            record.executed_qty
        } else {
            record.quantity
        };

        Self {
            id: record.venue_order_id.clone(),
            symbol: record.symbol.clone(),
            side: record.side,
            price: record.price,
            volume,
            status,
            filled: status == OrderStatus::Filled,
            cancelled: matches!(status, OrderStatus::Canceled | OrderStatus::Expired),
            closed: status.is_terminal(),
            rejected: status == OrderStatus::Rejected,
            reason: record.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

/// Strategy-local open position; never persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub opened_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record_with_status(status: OrderStatus) -> OrderRecord {
        OrderRecord {
            id: Uuid::new_v4(),
            account_id: 7,
            venue: "paper".to_string(),
            network: "testnet".to_string(),
            venue_order_id: "42".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            status,
            price: dec!(100),
            quantity: dec!(0.5),
            executed_qty: dec!(0),
            quote_qty: dec!(0),
            fee: dec!(0),
            reason: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_venue_status_mapping() {
        assert_eq!(OrderStatus::from_venue_str("FILLED"), OrderStatus::Filled);
        assert_eq!(
            OrderStatus::from_venue_str("PARTIALLY FILLED"),
            OrderStatus::PartiallyFilled
        );
        assert_eq!(
            OrderStatus::from_venue_str("partially_filled"),
            OrderStatus::PartiallyFilled
        );
        assert_eq!(OrderStatus::from_venue_str("Canceled"), OrderStatus::Canceled);
        assert_eq!(OrderStatus::from_venue_str("EXPIRED"), OrderStatus::Expired);
        assert_eq!(OrderStatus::from_venue_str("whatever"), OrderStatus::New);
    }

    #[test]
    fn test_order_flags_follow_status() {
        let filled = Order::from_record(&record_with_status(OrderStatus::Filled));
        assert!(filled.filled && filled.closed && !filled.rejected && !filled.cancelled);

        let rejected = Order::from_record(&record_with_status(OrderStatus::Rejected));
        assert!(rejected.rejected && rejected.closed && !rejected.filled);

        let open = Order::from_record(&record_with_status(OrderStatus::New));
        assert!(!open.filled && !open.closed && !open.rejected && !open.cancelled);

        let expired = Order::from_record(&record_with_status(OrderStatus::Expired));
        assert!(expired.cancelled && expired.closed);
    }

    #[test]
    fn test_strategy_type_round_trip_names() {
        for kind in StrategyType::ALL {
            assert_eq!(kind.as_str().parse::<StrategyType>().unwrap(), kind);
        }
        assert!("ml".parse::<StrategyType>().is_err());
    }
}
