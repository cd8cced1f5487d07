use crate::models::{OrderRecord, OrderSide, OrderStatus};
use rust_decimal::Decimal;
use serde::Serialize;

/// Realized PnL of an (account, symbol) order trail, average-cost method
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PnlSummary {
    pub realized_pnl: Decimal,
    pub fees: Decimal,
    /// Base quantity traded across all fills
    pub volume: Decimal,
    pub trades: usize,
    /// Signed open quantity: positive long, negative short
    pub position: Decimal,
    pub average_cost: Decimal,
}

impl PnlSummary {
    pub fn net_pnl(&self) -> Decimal {
        self.realized_pnl - self.fees
    }
}

/// Replay filled quantities in record order
///
/// Only FILLED and PARTIALLY_FILLED records with a positive executed
/// quantity contribute. Records are expected oldest first.
pub fn summarize(records: &[OrderRecord]) -> PnlSummary {
    let mut summary = PnlSummary::default();

    for record in records {
        if !matches!(
            record.status,
            OrderStatus::Filled | OrderStatus::PartiallyFilled
        ) || record.executed_qty <= Decimal::ZERO
        {
            continue;
        }

        let qty = record.executed_qty;
        let price = record.price;
        let signed = match record.side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };

        summary.trades += 1;
        summary.volume += qty;
        summary.fees += record.fee;

        let position = summary.position;
        let same_direction = position.is_zero() || position.is_sign_positive() == signed.is_sign_positive();

        if same_direction {
            let held = position.abs();
            summary.average_cost = (summary.average_cost * held + price * qty) / (held + qty);
            summary.position += signed;
            continue;
        }

        let closing = qty.min(position.abs());
        let per_unit = if position.is_sign_positive() {
            price - summary.average_cost
        } else {
            summary.average_cost - price
        };
        summary.realized_pnl += per_unit * closing;
        summary.position += signed;

        if summary.position.is_zero() {
            summary.average_cost = Decimal::ZERO;
        } else if qty > closing {
            // Flipped through flat: the remainder opened at this fill's price
            summary.average_cost = price;
        }
    }

    summary
}
