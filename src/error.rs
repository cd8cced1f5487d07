use crate::models::{AccountId, StrategyType};
use thiserror::Error;

/// Failures of the settings and order stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Version conflict saving {strategy_type} settings for account {account_id} (expected version {expected})")]
    Conflict {
        account_id: AccountId,
        strategy_type: StrategyType,
        expected: i64,
    },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Failures reported by a venue adapter or market data source
#[derive(Debug, Error)]
pub enum VenueError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Venue rejected request: {0}")]
    Rejected(String),

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Malformed venue response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for VenueError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            VenueError::Decode(e.to_string())
        } else {
            VenueError::Network(e.to_string())
        }
    }
}

/// Failures of the settings write path
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Invalid strategy configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SettingsError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, SettingsError::Store(e) if e.is_conflict())
    }
}
