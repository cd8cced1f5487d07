use super::store::OrderStore;
use crate::models::{AccountId, Order, OrderRecord, OrderSide, OrderStatus, OrderType};
use crate::venue::{OrderRequest, SymbolConstraints, Venue, VenueOrderReport};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// Validates, places and records orders
///
/// Every placement attempt produces exactly one persisted record, including
/// local and venue rejections. Placement failures are never returned as
/// errors; callers inspect `Order::rejected` instead.
pub struct OrderExecutionService {
    venue: Arc<dyn Venue>,
    store: Arc<dyn OrderStore>,
}

impl OrderExecutionService {
    pub fn new(venue: Arc<dyn Venue>, store: Arc<dyn OrderStore>) -> Self {
        Self { venue, store }
    }

    pub fn venue(&self) -> Arc<dyn Venue> {
        self.venue.clone()
    }

    pub fn store(&self) -> Arc<dyn OrderStore> {
        self.store.clone()
    }

    pub async fn place_limit(
        &self,
        account_id: AccountId,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
    ) -> Order {
        let request = OrderRequest {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
        };
        self.execute(account_id, request, Some(price)).await
    }

    /// Place a market order
    ///
    /// `last_price` is used for the notional check and as the fill price
    /// when the venue does not report one.
    pub async fn place_market(
        &self,
        account_id: AccountId,
        symbol: &str,
        side: OrderSide,
        last_price: Option<Decimal>,
        quantity: Decimal,
    ) -> Order {
        let request = OrderRequest {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
        };
        self.execute(account_id, request, last_price).await
    }

    async fn execute(
        &self,
        account_id: AccountId,
        mut request: OrderRequest,
        reference_price: Option<Decimal>,
    ) -> Order {
        let constraints = match self.venue.get_symbol_constraints(&request.symbol).await {
            Ok(c) => c,
            Err(e) => {
                let reason = format!("Symbol constraints unavailable: {}", e);
                return self
                    .reject(account_id, &request, reference_price, reason)
                    .await;
            }
        };

        let Some(quantity) = round_to_step(request.quantity, constraints.step_size) else {
            let reason = format!(
                "Quantity {} overflows step size {}",
                request.quantity, constraints.step_size
            );
            return self
                .reject(account_id, &request, reference_price, reason)
                .await;
        };
        if let Some(reason) = check_constraints(quantity, reference_price, &constraints) {
            request.quantity = quantity;
            return self
                .reject(account_id, &request, reference_price, reason.to_string())
                .await;
        }
        request.quantity = quantity;

        match self.venue.place_order(&request).await {
            Ok(report) => {
                self.record_fill(account_id, &request, reference_price, report)
                    .await
            }
            Err(e) => {
                self.reject(account_id, &request, reference_price, e.to_string())
                    .await
            }
        }
    }

    async fn record_fill(
        &self,
        account_id: AccountId,
        request: &OrderRequest,
        reference_price: Option<Decimal>,
        report: VenueOrderReport,
    ) -> Order {
        let status = OrderStatus::from_venue_str(&report.status);
        let price = match resolve_price(&report, reference_price) {
            Some(p) => p,
            None => self
                .venue
                .get_price(&request.symbol)
                .await
                .unwrap_or(Decimal::ZERO),
        };
        let quote_qty = report
            .quote_qty
            .or_else(|| price.checked_mul(report.executed_qty))
            .unwrap_or(Decimal::ZERO);

        let now = Utc::now();
        let record = OrderRecord {
            id: Uuid::new_v4(),
            account_id,
            venue: self.venue.name().to_string(),
            network: self.venue.network().to_string(),
            venue_order_id: report.venue_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            status,
            price,
            quantity: request.quantity,
            executed_qty: report.executed_qty,
            quote_qty,
            fee: report.fee.unwrap_or(Decimal::ZERO),
            reason: None,
            created_at: now,
            updated_at: now,
        };

        tracing::info!(
            account = account_id,
            "{} {} {} {} @ {} -> {} (venue id {})",
            record.order_type.as_str(),
            record.side,
            record.quantity,
            record.symbol,
            record.price,
            record.status,
            record.venue_order_id
        );

        self.persist(record).await
    }

    async fn reject(
        &self,
        account_id: AccountId,
        request: &OrderRequest,
        reference_price: Option<Decimal>,
        reason: String,
    ) -> Order {
        tracing::warn!(
            account = account_id,
            "Rejected {} {} {} {}: {}",
            request.order_type.as_str(),
            request.side,
            request.quantity,
            request.symbol,
            reason
        );

        let now = Utc::now();
        let record = OrderRecord {
            id: Uuid::new_v4(),
            account_id,
            venue: self.venue.name().to_string(),
            network: self.venue.network().to_string(),
            venue_order_id: format!("REJECTED-{}", Uuid::new_v4()),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            status: OrderStatus::Rejected,
            price: request.price.or(reference_price).unwrap_or(Decimal::ZERO),
            quantity: request.quantity,
            executed_qty: Decimal::ZERO,
            quote_qty: Decimal::ZERO,
            fee: Decimal::ZERO,
            reason: Some(reason),
            created_at: now,
            updated_at: now,
        };

        self.persist(record).await
    }

    async fn persist(&self, record: OrderRecord) -> Order {
        match self.store.upsert(&record).await {
            Ok(stored) => Order::from_record(&stored),
            Err(e) => {
                tracing::error!(
                    account = record.account_id,
                    "Failed to persist order {}: {}",
                    record.venue_order_id,
                    e
                );
                Order::from_record(&record)
            }
        }
    }

    /// Poll the venue for every NEW record of (account, symbol)
    ///
    /// Records whose venue state moved on are updated in place. Returns the
    /// number of records updated; venue errors leave the record untouched.
    pub async fn refresh_open_orders(
        &self,
        account_id: AccountId,
        symbol: &str,
    ) -> crate::Result<usize> {
        let open = self.store.list_open(account_id, symbol).await?;
        let mut updated = 0;

        for mut record in open {
            if record.venue != self.venue.name() || record.network != self.venue.network() {
                continue;
            }

            let report = match self
                .venue
                .order_status(symbol, &record.venue_order_id)
                .await
            {
                Ok(Some(report)) => report,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(
                        account = account_id,
                        "Status poll failed for order {}: {}",
                        record.venue_order_id,
                        e
                    );
                    continue;
                }
            };

            let status = OrderStatus::from_venue_str(&report.status);
            if status == record.status && report.executed_qty == record.executed_qty {
                continue;
            }

            if let Some(price) = resolve_price(&report, None) {
                record.price = price;
            }
            if let Some(quote_qty) = report.quote_qty {
                record.quote_qty = quote_qty;
            }
            if let Some(fee) = report.fee {
                record.fee = fee;
            }
            record.status = status;
            record.executed_qty = report.executed_qty;
            record.updated_at = Utc::now();

            self.store.upsert(&record).await?;
            updated += 1;

            tracing::info!(
                account = account_id,
                "Order {} on {} is now {}",
                record.venue_order_id,
                symbol,
                record.status
            );
        }

        Ok(updated)
    }
}

/// Largest multiple of `step` not exceeding `quantity`, `None` on overflow
pub fn round_to_step(quantity: Decimal, step: Decimal) -> Option<Decimal> {
    if step <= Decimal::ZERO {
        return Some(quantity);
    }
    let steps = quantity.checked_div(step)?.floor();
    Some(steps.checked_mul(step)?.normalize())
}

fn check_constraints(
    quantity: Decimal,
    price: Option<Decimal>,
    constraints: &SymbolConstraints,
) -> Option<&'static str> {
    if quantity <= Decimal::ZERO {
        return Some("Quantity rounds to zero");
    }
    if quantity < constraints.min_qty {
        return Some("Quantity < minQty");
    }
    if let Some(price) = price {
        if price > Decimal::ZERO {
            match price.checked_mul(quantity) {
                Some(notional) if notional < constraints.min_notional => {
                    return Some("Notional < minNotional")
                }
                Some(_) => {}
                None => return Some("Notional overflows"),
            }
        }
    }
    None
}

/// Fill price: venue price, then quote/executed ratio, then the fallback
fn resolve_price(report: &VenueOrderReport, fallback: Option<Decimal>) -> Option<Decimal> {
    if let Some(price) = report.price.filter(|p| *p > Decimal::ZERO) {
        return Some(price);
    }
    if let Some(quote_qty) = report.quote_qty {
        if report.executed_qty > Decimal::ZERO && quote_qty > Decimal::ZERO {
            if let Some(price) = quote_qty.checked_div(report.executed_qty) {
                return Some(price);
            }
        }
    }
    fallback.filter(|p| *p > Decimal::ZERO)
}
