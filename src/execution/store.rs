use crate::error::StoreError;
use crate::models::{AccountId, OrderRecord, OrderStatus};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use uuid::Uuid;

/// Persisted order trail
///
/// Records are unique by (account_id, venue, network, venue_order_id).
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert the record, or overwrite the row with the same unique key
    ///
    /// Returns the stored row; an overwritten row keeps its original `id`
    /// and `created_at`.
    async fn upsert(&self, record: &OrderRecord) -> Result<OrderRecord, StoreError>;

    /// NEW records of one (account, symbol), oldest first
    async fn list_open(
        &self,
        account_id: AccountId,
        symbol: &str,
    ) -> Result<Vec<OrderRecord>, StoreError>;

    /// Every record of one (account, symbol), oldest first
    async fn list_for(
        &self,
        account_id: AccountId,
        symbol: &str,
    ) -> Result<Vec<OrderRecord>, StoreError>;

    /// Returns false when the row was already gone
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Distinct (account, symbol) pairs that have at least one NEW record
    async fn open_pairs(&self) -> Result<Vec<(AccountId, String)>, StoreError>;
}

/// Process-local order store used without a database and in tests
#[derive(Default)]
pub struct InMemoryOrderStore {
    rows: RwLock<HashMap<Uuid, OrderRecord>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
        StoreError::Backend(format!("order store lock poisoned: {}", e))
    }

    fn same_key(a: &OrderRecord, b: &OrderRecord) -> bool {
        a.account_id == b.account_id
            && a.venue == b.venue
            && a.network == b.network
            && a.venue_order_id == b.venue_order_id
    }

    fn select<F>(&self, filter: F) -> Result<Vec<OrderRecord>, StoreError>
    where
        F: Fn(&OrderRecord) -> bool,
    {
        let rows = self.rows.read().map_err(Self::poisoned)?;
        let mut selected: Vec<OrderRecord> = rows.values().filter(|r| filter(r)).cloned().collect();
        selected.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(selected)
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn upsert(&self, record: &OrderRecord) -> Result<OrderRecord, StoreError> {
        let mut rows = self.rows.write().map_err(Self::poisoned)?;

        let existing = rows
            .values()
            .find(|r| Self::same_key(r, record))
            .map(|r| (r.id, r.created_at));

        let mut stored = record.clone();
        if let Some((id, created_at)) = existing {
            stored.id = id;
            stored.created_at = created_at;
        }
        rows.insert(stored.id, stored.clone());

        Ok(stored)
    }

    async fn list_open(
        &self,
        account_id: AccountId,
        symbol: &str,
    ) -> Result<Vec<OrderRecord>, StoreError> {
        self.select(|r| {
            r.account_id == account_id && r.symbol == symbol && r.status == OrderStatus::New
        })
    }

    async fn list_for(
        &self,
        account_id: AccountId,
        symbol: &str,
    ) -> Result<Vec<OrderRecord>, StoreError> {
        self.select(|r| r.account_id == account_id && r.symbol == symbol)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut rows = self.rows.write().map_err(Self::poisoned)?;
        Ok(rows.remove(&id).is_some())
    }

    async fn open_pairs(&self) -> Result<Vec<(AccountId, String)>, StoreError> {
        let rows = self.rows.read().map_err(Self::poisoned)?;
        let pairs: BTreeSet<(AccountId, String)> = rows
            .values()
            .filter(|r| r.status == OrderStatus::New)
            .map(|r| (r.account_id, r.symbol.clone()))
            .collect();
        Ok(pairs.into_iter().collect())
    }
}
