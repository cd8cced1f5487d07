use super::retry::{retry_on_conflict, RetryPolicy};
use super::{SettingsStore, StrategySettings};
use crate::error::SettingsError;
use crate::models::{AccountId, StrategyKey, StrategyType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Emitted after a settings write has been committed to the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsCommitted {
    pub key: StrategyKey,
    pub version: i64,
}

/// The only write path for strategy settings
///
/// Mutations are re-applied to a freshly loaded row on every attempt, so a
/// version conflict can be retried safely. Commit notifications are sent
/// only once `save` has returned successfully.
pub struct SettingsService {
    store: Arc<dyn SettingsStore>,
    retry: RetryPolicy,
    commits: Option<mpsc::UnboundedSender<SettingsCommitted>>,
}

impl SettingsService {
    pub fn new(store: Arc<dyn SettingsStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            commits: None,
        }
    }

    /// Open the stream of commit notifications consumed by the reconciler
    ///
    /// Replaces any previous subscriber.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SettingsCommitted> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.commits = Some(tx);
        rx
    }

    pub fn store(&self) -> Arc<dyn SettingsStore> {
        self.store.clone()
    }

    /// Load the row, creating it with family defaults on first access
    pub async fn get_or_create(
        &self,
        account_id: AccountId,
        strategy_type: StrategyType,
    ) -> Result<StrategySettings, SettingsError> {
        if let Some(existing) = self.store.load(account_id, strategy_type).await? {
            return Ok(existing);
        }

        let defaults = StrategySettings::defaults(account_id, strategy_type);
        let stored = self.store.insert_if_absent(&defaults).await?;
        tracing::info!(
            account = account_id,
            strategy = %strategy_type,
            "Created default settings"
        );
        Ok(stored)
    }

    /// Apply `mutate` to the current row and save it
    ///
    /// An active row must pass validation; otherwise the write is refused
    /// and the stored row is left untouched.
    pub async fn update<F>(
        &self,
        account_id: AccountId,
        strategy_type: StrategyType,
        mutate: F,
    ) -> Result<StrategySettings, SettingsError>
    where
        F: Fn(&mut StrategySettings) + Send + Sync,
    {
        let saved = retry_on_conflict(self.retry, |_| {
            self.try_update(account_id, strategy_type, &mutate)
        })
        .await?;

        tracing::info!(
            account = account_id,
            strategy = %strategy_type,
            version = saved.version,
            active = saved.active,
            "Settings committed"
        );
        self.notify(&saved);

        Ok(saved)
    }

    pub async fn set_active(
        &self,
        account_id: AccountId,
        strategy_type: StrategyType,
        active: bool,
    ) -> Result<StrategySettings, SettingsError> {
        self.update(account_id, strategy_type, |s| s.active = active)
            .await
    }

    async fn try_update<F>(
        &self,
        account_id: AccountId,
        strategy_type: StrategyType,
        mutate: &F,
    ) -> Result<StrategySettings, SettingsError>
    where
        F: Fn(&mut StrategySettings) + Send + Sync,
    {
        let mut settings = self.get_or_create(account_id, strategy_type).await?;
        mutate(&mut settings);

        // Identity is not editable
        settings.account_id = account_id;
        settings.strategy_type = strategy_type;

        if settings.active {
            if let Err(e) = settings.validate() {
                tracing::warn!(
                    account = account_id,
                    strategy = %strategy_type,
                    "Refusing settings write: {}",
                    e
                );
                return Err(e);
            }
        }

        Ok(self.store.save(&settings).await?)
    }

    fn notify(&self, saved: &StrategySettings) {
        if let Some(tx) = &self.commits {
            let event = SettingsCommitted {
                key: saved.key(),
                version: saved.version,
            };
            if tx.send(event).is_err() {
                tracing::debug!("No reconciler listening for settings commits");
            }
        }
    }
}
