use super::{SettingsStore, StrategySettings};
use crate::error::StoreError;
use crate::models::{AccountId, StrategyKey, StrategyType};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;

/// Process-local settings store
///
/// Used when no database is configured and by tests. Applies the same
/// version check as the Postgres store.
#[derive(Default)]
pub struct InMemorySettingsStore {
    rows: RwLock<HashMap<StrategyKey, StrategySettings>>,
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
        StoreError::Backend(format!("settings lock poisoned: {}", e))
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn load(
        &self,
        account_id: AccountId,
        strategy_type: StrategyType,
    ) -> Result<Option<StrategySettings>, StoreError> {
        let rows = self.rows.read().map_err(Self::poisoned)?;
        Ok(rows
            .get(&StrategyKey::new(account_id, strategy_type))
            .cloned())
    }

    async fn insert_if_absent(
        &self,
        settings: &StrategySettings,
    ) -> Result<StrategySettings, StoreError> {
        let mut rows = self.rows.write().map_err(Self::poisoned)?;
        Ok(rows
            .entry(settings.key())
            .or_insert_with(|| settings.clone())
            .clone())
    }

    async fn save(&self, settings: &StrategySettings) -> Result<StrategySettings, StoreError> {
        let mut rows = self.rows.write().map_err(Self::poisoned)?;
        let key = settings.key();

        let stored = rows
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("settings {}", key)))?;

        if stored.version != settings.version {
            return Err(StoreError::Conflict {
                account_id: settings.account_id,
                strategy_type: settings.strategy_type,
                expected: settings.version,
            });
        }

        let mut next = settings.clone();
        next.version += 1;
        next.updated_at = Utc::now();
        *stored = next.clone();

        Ok(next)
    }

    async fn list_all(&self) -> Result<Vec<StrategySettings>, StoreError> {
        let rows = self.rows.read().map_err(Self::poisoned)?;
        let mut all: Vec<StrategySettings> = rows.values().cloned().collect();
        all.sort_by_key(|s| (s.account_id, s.strategy_type.as_str()));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_if_absent_keeps_existing_row() {
        let store = InMemorySettingsStore::new();
        let mut first = StrategySettings::defaults(1, StrategyType::Band);
        first.symbol = "ETHUSDT".to_string();
        store.insert_if_absent(&first).await.unwrap();

        let second = StrategySettings::defaults(1, StrategyType::Band);
        let stored = store.insert_if_absent(&second).await.unwrap();
        assert_eq!(stored.symbol, "ETHUSDT");
    }

    #[tokio::test]
    async fn test_save_bumps_version() {
        let store = InMemorySettingsStore::new();
        let row = store
            .insert_if_absent(&StrategySettings::defaults(1, StrategyType::Grid))
            .await
            .unwrap();

        let saved = store.save(&row).await.unwrap();
        assert_eq!(saved.version, 1);

        let loaded = store.load(1, StrategyType::Grid).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_stale_save_conflicts() {
        let store = InMemorySettingsStore::new();
        let row = store
            .insert_if_absent(&StrategySettings::defaults(1, StrategyType::Band))
            .await
            .unwrap();

        store.save(&row).await.unwrap();
        let err = store.save(&row).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_save_missing_row_is_not_found() {
        let store = InMemorySettingsStore::new();
        let err = store
            .save(&StrategySettings::defaults(9, StrategyType::Band))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
