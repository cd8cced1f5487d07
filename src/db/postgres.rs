use crate::error::StoreError;
use crate::execution::OrderStore;
use crate::models::{AccountId, OrderRecord, OrderStatus, StrategyType};
use crate::settings::{SettingsCommitted, SettingsStore, StrategyParams, StrategySettings};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgListener, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Channel the `strategy_settings` trigger notifies on every committed write
pub const SETTINGS_COMMIT_CHANNEL: &str = "strategy_settings_committed";

const SETTINGS_COLUMNS: &str = "account_id, strategy_type, symbol, timeframe, \
     history_window_size, params, active, version, updated_at";

const ORDER_COLUMNS: &str = "id, account_id, venue, network, venue_order_id, symbol, side, \
     order_type, status, price, quantity, executed_qty, quote_qty, fee, reason, \
     created_at, updated_at";

/// Postgres persistence for settings rows and the order trail
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to Postgres and run pending migrations
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres");

        Ok(Self { pool })
    }

    /// Delete every row of both tables (tests only)
    pub async fn clear_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM orders").execute(&self.pool).await?;
        sqlx::query("DELETE FROM strategy_settings")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Dedicated connection listening for committed settings writes
    ///
    /// Writes from any process sharing the database show up here, including
    /// this one's.
    pub async fn commit_listener(&self) -> Result<PgListener> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(SETTINGS_COMMIT_CHANNEL).await?;
        Ok(listener)
    }

    pub fn parse_commit_payload(payload: &str) -> std::result::Result<SettingsCommitted, StoreError> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Forward notifications from `listener` into `commits` until the
    /// receiving side goes away
    ///
    /// Malformed payloads are logged and skipped. Connection loss is retried
    /// by `PgListener` itself; notifications sent while disconnected are lost
    /// and left to the periodic scan.
    pub async fn relay_commits(
        mut listener: PgListener,
        commits: mpsc::UnboundedSender<SettingsCommitted>,
    ) {
        tracing::info!("📡 Listening on '{}'", SETTINGS_COMMIT_CHANNEL);

        loop {
            let notification = match listener.recv().await {
                Ok(notification) => notification,
                Err(e) => {
                    tracing::error!("Settings commit listener error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            let event = match Self::parse_commit_payload(notification.payload()) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(
                        "Ignoring malformed settings notification '{}': {}",
                        notification.payload(),
                        e
                    );
                    continue;
                }
            };

            tracing::debug!("Settings commit {} v{} from Postgres", event.key, event.version);
            if commits.send(event).is_err() {
                tracing::info!("Settings commit consumer gone, listener stopping");
                return;
            }
        }
    }

    fn parse<T: FromStr<Err = String>>(raw: &str) -> std::result::Result<T, StoreError> {
        T::from_str(raw).map_err(StoreError::Backend)
    }

    fn history_window_column(settings: &StrategySettings) -> std::result::Result<i32, StoreError> {
        i32::try_from(settings.history_window_size).map_err(|_| {
            StoreError::Backend(format!(
                "history window {} does not fit the column",
                settings.history_window_size
            ))
        })
    }

    fn settings_from_row(row: &PgRow) -> std::result::Result<StrategySettings, StoreError> {
        let strategy_type: String = row.try_get("strategy_type")?;
        let history_window_size: i32 = row.try_get("history_window_size")?;
        let params: Json<StrategyParams> = row.try_get("params")?;

        Ok(StrategySettings {
            account_id: row.try_get("account_id")?,
            strategy_type: Self::parse::<StrategyType>(&strategy_type)?,
            symbol: row.try_get("symbol")?,
            timeframe: row.try_get("timeframe")?,
            history_window_size: u32::try_from(history_window_size).map_err(|_| {
                StoreError::Backend(format!("negative history window {}", history_window_size))
            })?,
            params: params.0,
            active: row.try_get("active")?,
            version: row.try_get("version")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn order_from_row(row: &PgRow) -> std::result::Result<OrderRecord, StoreError> {
        let side: String = row.try_get("side")?;
        let order_type: String = row.try_get("order_type")?;
        let status: String = row.try_get("status")?;

        Ok(OrderRecord {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            venue: row.try_get("venue")?,
            network: row.try_get("network")?,
            venue_order_id: row.try_get("venue_order_id")?,
            symbol: row.try_get("symbol")?,
            side: Self::parse(&side)?,
            order_type: Self::parse(&order_type)?,
            status: Self::parse(&status)?,
            price: row.try_get::<Decimal, _>("price")?,
            quantity: row.try_get::<Decimal, _>("quantity")?,
            executed_qty: row.try_get::<Decimal, _>("executed_qty")?,
            quote_qty: row.try_get::<Decimal, _>("quote_qty")?,
            fee: row.try_get::<Decimal, _>("fee")?,
            reason: row.try_get("reason")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }
}

#[async_trait]
impl SettingsStore for PostgresStore {
    async fn load(
        &self,
        account_id: AccountId,
        strategy_type: StrategyType,
    ) -> std::result::Result<Option<StrategySettings>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM strategy_settings WHERE account_id = $1 AND strategy_type = $2",
            SETTINGS_COLUMNS
        ))
        .bind(account_id)
        .bind(strategy_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::settings_from_row).transpose()
    }

    async fn insert_if_absent(
        &self,
        settings: &StrategySettings,
    ) -> std::result::Result<StrategySettings, StoreError> {
        let history_window = Self::history_window_column(settings)?;
        sqlx::query(
            r#"
            INSERT INTO strategy_settings (
                account_id, strategy_type, symbol, timeframe,
                history_window_size, params, active, version, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (account_id, strategy_type) DO NOTHING
            "#,
        )
        .bind(settings.account_id)
        .bind(settings.strategy_type.as_str())
        .bind(&settings.symbol)
        .bind(&settings.timeframe)
        .bind(history_window)
        .bind(Json(&settings.params))
        .bind(settings.active)
        .bind(settings.version)
        .bind(settings.updated_at)
        .execute(&self.pool)
        .await?;

        self.load(settings.account_id, settings.strategy_type)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("settings {}", settings.key())))
    }

    async fn save(
        &self,
        settings: &StrategySettings,
    ) -> std::result::Result<StrategySettings, StoreError> {
        let history_window = Self::history_window_column(settings)?;
        let row = sqlx::query(&format!(
            r#"
            UPDATE strategy_settings SET
                symbol = $3,
                timeframe = $4,
                history_window_size = $5,
                params = $6,
                active = $7,
                version = version + 1,
                updated_at = NOW()
            WHERE account_id = $1 AND strategy_type = $2 AND version = $8
            RETURNING {}
            "#,
            SETTINGS_COLUMNS
        ))
        .bind(settings.account_id)
        .bind(settings.strategy_type.as_str())
        .bind(&settings.symbol)
        .bind(&settings.timeframe)
        .bind(history_window)
        .bind(Json(&settings.params))
        .bind(settings.active)
        .bind(settings.version)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Self::settings_from_row(&row);
        }

        match self.load(settings.account_id, settings.strategy_type).await? {
            Some(_) => Err(StoreError::Conflict {
                account_id: settings.account_id,
                strategy_type: settings.strategy_type,
                expected: settings.version,
            }),
            None => Err(StoreError::NotFound(format!("settings {}", settings.key()))),
        }
    }

    async fn list_all(&self) -> std::result::Result<Vec<StrategySettings>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM strategy_settings ORDER BY account_id, strategy_type",
            SETTINGS_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::settings_from_row).collect()
    }

    async fn list_for_account(
        &self,
        account_id: AccountId,
    ) -> std::result::Result<Vec<StrategySettings>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM strategy_settings WHERE account_id = $1 ORDER BY strategy_type",
            SETTINGS_COLUMNS
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::settings_from_row).collect()
    }
}

#[async_trait]
impl OrderStore for PostgresStore {
    async fn upsert(&self, record: &OrderRecord) -> std::result::Result<OrderRecord, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO orders (
                id, account_id, venue, network, venue_order_id, symbol, side,
                order_type, status, price, quantity, executed_qty, quote_qty, fee,
                reason, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (account_id, venue, network, venue_order_id) DO UPDATE SET
                status = EXCLUDED.status,
                price = EXCLUDED.price,
                quantity = EXCLUDED.quantity,
                executed_qty = EXCLUDED.executed_qty,
                quote_qty = EXCLUDED.quote_qty,
                fee = EXCLUDED.fee,
                reason = EXCLUDED.reason,
                updated_at = EXCLUDED.updated_at
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(record.id)
        .bind(record.account_id)
        .bind(&record.venue)
        .bind(&record.network)
        .bind(&record.venue_order_id)
        .bind(&record.symbol)
        .bind(record.side.as_str())
        .bind(record.order_type.as_str())
        .bind(record.status.as_str())
        .bind(record.price)
        .bind(record.quantity)
        .bind(record.executed_qty)
        .bind(record.quote_qty)
        .bind(record.fee)
        .bind(&record.reason)
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(
            "Saved order {} ({}) for account {}",
            record.venue_order_id,
            record.status,
            record.account_id
        );

        Self::order_from_row(&row)
    }

    async fn list_open(
        &self,
        account_id: AccountId,
        symbol: &str,
    ) -> std::result::Result<Vec<OrderRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM orders
            WHERE account_id = $1 AND symbol = $2 AND status = $3
            ORDER BY created_at ASC, id ASC
            "#,
            ORDER_COLUMNS
        ))
        .bind(account_id)
        .bind(symbol)
        .bind(OrderStatus::New.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::order_from_row).collect()
    }

    async fn list_for(
        &self,
        account_id: AccountId,
        symbol: &str,
    ) -> std::result::Result<Vec<OrderRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM orders
            WHERE account_id = $1 AND symbol = $2
            ORDER BY created_at ASC, id ASC
            "#,
            ORDER_COLUMNS
        ))
        .bind(account_id)
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::order_from_row).collect()
    }

    async fn delete(&self, id: Uuid) -> std::result::Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM orders WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn open_pairs(&self) -> std::result::Result<Vec<(AccountId, String)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT account_id, symbol FROM orders
            WHERE status = $1
            ORDER BY account_id, symbol
            "#,
        )
        .bind(OrderStatus::New.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut pairs = Vec::with_capacity(rows.len());
        for row in &rows {
            pairs.push((row.try_get("account_id")?, row.try_get("symbol")?));
        }
        Ok(pairs)
    }
}
