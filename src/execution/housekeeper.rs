use super::order_service::OrderExecutionService;
use crate::models::{AccountId, OrderRecord, OrderSide, StrategyType};
use crate::settings::SettingsStore;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Outcome of one housekeeping pass over an (account, symbol)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub buy_active: usize,
    pub sell_active: usize,
    /// Local records deleted (duplicates plus cap overflow)
    pub removed_from_store: usize,
    /// Venue cancellations attempted, failed ones included
    pub cancelled: usize,
    /// Cancellations the venue refused or errored on
    pub cancel_failures: usize,
}

/// Repairs drift in the persisted set of open orders
///
/// Local consistency wins over remote truth: a record whose venue
/// cancellation fails is still deleted. Such failures are counted so venue
/// side leaks can be spotted.
pub struct OrderHousekeeper {
    execution: Arc<OrderExecutionService>,
    price_scale: u32,
    cancel_failures: AtomicU64,
}

impl OrderHousekeeper {
    pub fn new(execution: Arc<OrderExecutionService>, price_scale: u32) -> Self {
        Self {
            execution,
            price_scale,
            cancel_failures: AtomicU64::new(0),
        }
    }

    /// Cancellation failures since startup
    pub fn cancel_failures_total(&self) -> u64 {
        self.cancel_failures.load(Ordering::Relaxed)
    }

    /// Per-side cap for (account, symbol)
    ///
    /// An active grid row trading `symbol` keeps its own number of resting
    /// orders per side, and housekeeping must not trim below it. Every other
    /// pair gets `default_cap`.
    pub async fn cap_for(
        &self,
        settings: &dyn SettingsStore,
        account_id: AccountId,
        symbol: &str,
        default_cap: usize,
    ) -> usize {
        match settings.load(account_id, StrategyType::Grid).await {
            Ok(Some(row)) if row.active && row.symbol == symbol => row
                .grid()
                .map(|p| p.max_active_per_side)
                .unwrap_or(default_cap),
            Ok(_) => default_cap,
            Err(e) => {
                tracing::warn!(
                    account = account_id,
                    "Could not read grid settings, capping {} at {}: {}",
                    symbol,
                    default_cap,
                    e
                );
                default_cap
            }
        }
    }

    /// Housekeep every (account, symbol) that has open orders
    ///
    /// A failing pair is logged and skipped.
    pub async fn sweep(
        &self,
        settings: &dyn SettingsStore,
        default_cap: usize,
    ) -> crate::Result<Vec<(AccountId, String, HousekeepingReport)>> {
        let pairs = self.execution.store().open_pairs().await?;
        let mut reports = Vec::with_capacity(pairs.len());

        for (account_id, symbol) in pairs {
            let cap = self.cap_for(settings, account_id, &symbol, default_cap).await;
            match self.reconcile(account_id, &symbol, cap).await {
                Ok(report) => reports.push((account_id, symbol, report)),
                Err(e) => {
                    tracing::error!(account = account_id, "Housekeeping {} failed: {}", symbol, e);
                }
            }
        }

        Ok(reports)
    }

    /// Dedup and cap the NEW orders of (account, symbol)
    pub async fn reconcile(
        &self,
        account_id: AccountId,
        symbol: &str,
        max_active_per_side: usize,
    ) -> crate::Result<HousekeepingReport> {
        if let Err(e) = self.execution.refresh_open_orders(account_id, symbol).await {
            tracing::warn!(
                account = account_id,
                "Status refresh before housekeeping {} failed: {}",
                symbol,
                e
            );
        }

        let store = self.execution.store();
        let open = store.list_open(account_id, symbol).await?;
        let mut report = HousekeepingReport::default();

        let (kept, duplicates) = self.split_duplicates(open);
        for record in &duplicates {
            tracing::info!(
                account = account_id,
                "Removing duplicate {} order {} @ {}",
                record.side,
                record.venue_order_id,
                record.price
            );
            self.remove(record, &mut report).await?;
        }

        let (mut buys, mut sells): (Vec<OrderRecord>, Vec<OrderRecord>) =
            kept.into_iter().partition(|r| r.side == OrderSide::Buy);

        // Unfavorable first: the cap keeps the head of each list
        buys.sort_by(|a, b| b.price.cmp(&a.price).then(b.updated_at.cmp(&a.updated_at)));
        sells.sort_by(|a, b| a.price.cmp(&b.price).then(b.updated_at.cmp(&a.updated_at)));

        for side in [&mut buys, &mut sells] {
            if side.len() <= max_active_per_side {
                continue;
            }
            for record in side.split_off(max_active_per_side) {
                tracing::info!(
                    account = account_id,
                    "Over cap {}: removing {} order {} @ {}",
                    max_active_per_side,
                    record.side,
                    record.venue_order_id,
                    record.price
                );
                self.remove(&record, &mut report).await?;
            }
        }

        report.buy_active = buys.len();
        report.sell_active = sells.len();

        if report.removed_from_store > 0 || report.cancelled > 0 {
            tracing::info!(
                account = account_id,
                "Housekept {}: {} buy / {} sell active, {} removed, {} cancelled ({} failed)",
                symbol,
                report.buy_active,
                report.sell_active,
                report.removed_from_store,
                report.cancelled,
                report.cancel_failures
            );
        } else {
            tracing::debug!(
                account = account_id,
                "Housekept {}: {} buy / {} sell active, nothing to do",
                symbol,
                report.buy_active,
                report.sell_active
            );
        }

        Ok(report)
    }

    /// Keep the most recently updated record of every (side, price) bucket
    fn split_duplicates(&self, open: Vec<OrderRecord>) -> (Vec<OrderRecord>, Vec<OrderRecord>) {
        let mut buckets: HashMap<(OrderSide, Decimal), Vec<OrderRecord>> = HashMap::new();
        for record in open {
            let price = record
                .price
                .round_dp_with_strategy(self.price_scale, RoundingStrategy::ToNegativeInfinity)
                .normalize();
            buckets.entry((record.side, price)).or_default().push(record);
        }

        let mut kept = Vec::new();
        let mut duplicates = Vec::new();
        for (_, mut bucket) in buckets {
            bucket.sort_by(|a, b| {
                b.updated_at
                    .cmp(&a.updated_at)
                    .then(b.created_at.cmp(&a.created_at))
                    .then(b.id.cmp(&a.id))
            });
            let mut rest = bucket.into_iter();
            if let Some(newest) = rest.next() {
                kept.push(newest);
            }
            duplicates.extend(rest);
        }

        (kept, duplicates)
    }

    async fn remove(
        &self,
        record: &OrderRecord,
        report: &mut HousekeepingReport,
    ) -> crate::Result<()> {
        let venue = self.execution.venue();
        let acknowledged = match venue
            .cancel_order(&record.symbol, &record.venue_order_id)
            .await
        {
            Ok(acknowledged) => acknowledged,
            Err(e) => {
                tracing::warn!(
                    account = record.account_id,
                    "Cancel of order {} failed: {}",
                    record.venue_order_id,
                    e
                );
                false
            }
        };

        report.cancelled += 1;
        if !acknowledged {
            report.cancel_failures += 1;
            let total = self.cancel_failures.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                account = record.account_id,
                "Venue did not confirm cancel of {}; dropping local record anyway ({} unconfirmed so far)",
                record.venue_order_id,
                total
            );
        }

        if self.execution.store().delete(record.id).await? {
            report.removed_from_store += 1;
        }

        Ok(())
    }
}
