// In-memory executor of per-(account, strategy) tick loops
pub mod tasks;

pub use tasks::RunningTasks;

use crate::models::{AccountId, StrategyKey, StrategyType};
use crate::strategy::{StrategyRegistry, StrategyUnit};
use crate::Result;
use std::sync::Arc;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

/// Starts, stops and ticks strategy instances
///
/// Lifecycle calls are serialized, so concurrent start/stop from the
/// reconciler and from manual commands can never register two loops for
/// one key. Nothing here is persisted.
pub struct StrategySupervisor {
    registry: StrategyRegistry,
    tasks: RunningTasks,
    tick_interval: Duration,
    lifecycle: tokio::sync::Mutex<()>,
}

impl StrategySupervisor {
    pub fn new(registry: StrategyRegistry, tick_interval: Duration) -> Self {
        Self {
            registry,
            tasks: RunningTasks::new(),
            tick_interval,
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    fn unit(&self, strategy_type: StrategyType) -> Result<Arc<dyn StrategyUnit>> {
        self.registry
            .get(strategy_type)
            .ok_or_else(|| format!("No strategy unit registered for {}", strategy_type).into())
    }

    /// Start ticking the strategy for the account
    ///
    /// Returns `Ok(false)` when it was already running. If the unit's start
    /// hook fails nothing is registered and the error is returned.
    pub async fn start(&self, account_id: AccountId, strategy_type: StrategyType) -> Result<bool> {
        let _lifecycle = self.lifecycle.lock().await;
        let key = StrategyKey::new(account_id, strategy_type);

        if self.tasks.is_live(&key) {
            tracing::info!(account = account_id, strategy = %strategy_type, "Already running");
            return Ok(false);
        }

        let unit = self.unit(strategy_type)?;
        if let Err(e) = unit.start(account_id).await {
            tracing::warn!(
                account = account_id,
                strategy = %strategy_type,
                "Start refused: {}",
                e
            );
            return Err(e);
        }

        let handle = tokio::spawn(tick_loop(unit, account_id, self.tick_interval));
        if let Err(duplicate) = self.tasks.insert_if_absent(key, handle) {
            duplicate.abort();
            return Ok(false);
        }

        tracing::info!(
            account = account_id,
            strategy = %strategy_type,
            "Strategy started, ticking every {:?}",
            self.tick_interval
        );
        Ok(true)
    }

    /// Cancel the tick loop (if any) and run the unit's cleanup
    ///
    /// Returns whether a loop was registered. A tick already in flight is not
    /// interrupted and may still complete after this returns.
    pub async fn stop(&self, account_id: AccountId, strategy_type: StrategyType) -> Result<bool> {
        let _lifecycle = self.lifecycle.lock().await;
        let key = StrategyKey::new(account_id, strategy_type);

        let removed = self.tasks.remove(&key);
        if let Some(handle) = &removed {
            handle.abort();
        }

        let unit = self.unit(strategy_type)?;
        if let Err(e) = unit.stop(account_id).await {
            tracing::warn!(
                account = account_id,
                strategy = %strategy_type,
                "Cleanup after stop failed: {}",
                e
            );
        }

        if removed.is_some() {
            tracing::info!(account = account_id, strategy = %strategy_type, "Strategy stopped");
        } else {
            tracing::debug!(account = account_id, strategy = %strategy_type, "Stop on idle strategy");
        }
        Ok(removed.is_some())
    }

    /// Stop then start, picking up the latest settings
    pub async fn restart(&self, account_id: AccountId, strategy_type: StrategyType) -> Result<bool> {
        self.stop(account_id, strategy_type).await?;
        self.start(account_id, strategy_type).await
    }

    pub fn is_running(&self, account_id: AccountId, strategy_type: StrategyType) -> bool {
        self.tasks
            .is_live(&StrategyKey::new(account_id, strategy_type))
    }

    pub fn running_keys(&self) -> Vec<StrategyKey> {
        self.tasks.live_keys()
    }

    /// Stop every running strategy
    pub async fn shutdown(&self) {
        for key in self.running_keys() {
            if let Err(e) = self.stop(key.account_id, key.strategy_type).await {
                tracing::warn!("Failed to stop {} during shutdown: {}", key, e);
            }
        }
    }
}

/// Tick forever: fetch the price and hand it to the unit
///
/// Each tick runs in its own task so a failing or panicking tick is logged
/// and the schedule carries on.
async fn tick_loop(unit: Arc<dyn StrategyUnit>, account_id: AccountId, every: Duration) {
    let strategy_type = unit.strategy_type();
    let mut ticker = interval_at(Instant::now(), every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let tick_unit = unit.clone();
        let tick = tokio::spawn(async move {
            let price = tick_unit.current_price(account_id).await?;
            tracing::debug!(account = account_id, "Tick @ {}", price);
            tick_unit.on_price_update(account_id, price).await
        });

        match tick.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(
                    account = account_id,
                    strategy = %strategy_type,
                    "Tick failed: {}",
                    e
                );
            }
            Err(e) if e.is_panic() => {
                tracing::error!(
                    account = account_id,
                    strategy = %strategy_type,
                    "Tick panicked: {}",
                    e
                );
            }
            Err(_) => {}
        }
    }
}
