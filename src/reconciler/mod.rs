// Keeps the supervisor's running set in line with persisted settings
use crate::models::StrategyKey;
use crate::settings::{SettingsCommitted, SettingsStore};
use crate::supervisor::StrategySupervisor;
use crate::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

/// What one full scan changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<StrategyKey>,
    pub stopped: Vec<StrategyKey>,
    /// Desired keys whose start was refused
    pub failed: Vec<StrategyKey>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.failed.is_empty()
    }
}

/// Action taken for one committed settings write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAction {
    Restarted,
    Started,
    Stopped,
    Unchanged,
}

/// Two convergent paths over the same idempotent supervisor calls
///
/// The periodic scan rebuilds the running set from storage alone and is the
/// correctness backstop. The commit path reacts to a single write right away.
pub struct SettingsReconciler {
    supervisor: Arc<StrategySupervisor>,
    settings: Arc<dyn SettingsStore>,
}

impl SettingsReconciler {
    pub fn new(supervisor: Arc<StrategySupervisor>, settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            supervisor,
            settings,
        }
    }

    /// Start every active row that is not running and stop every running
    /// key that is not an active row
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let registered = self.supervisor.registry().types();
        let desired: Vec<StrategyKey> = self
            .settings
            .list_all()
            .await?
            .into_iter()
            .filter(|s| s.active && registered.contains(&s.strategy_type))
            .map(|s| s.key())
            .collect();
        let running = self.supervisor.running_keys();

        let mut report = ReconcileReport::default();

        for key in running.iter().filter(|k| !desired.contains(k)) {
            match self.supervisor.stop(key.account_id, key.strategy_type).await {
                Ok(_) => report.stopped.push(*key),
                Err(e) => tracing::warn!("Reconcile could not stop {}: {}", key, e),
            }
        }

        for key in desired.iter().filter(|k| !running.contains(k)) {
            match self.supervisor.start(key.account_id, key.strategy_type).await {
                Ok(_) => report.started.push(*key),
                Err(e) => {
                    tracing::warn!("Reconcile could not start {}: {}", key, e);
                    report.failed.push(*key);
                }
            }
        }

        if report.is_noop() {
            tracing::debug!("Reconcile: {} running, nothing to do", desired.len());
        } else {
            tracing::info!(
                "Reconcile: {} started, {} stopped, {} failed",
                report.started.len(),
                report.stopped.len(),
                report.failed.len()
            );
        }

        Ok(report)
    }

    /// React to one committed write using the persisted `active` flag
    pub async fn on_settings_committed(&self, event: &SettingsCommitted) -> Result<CommitAction> {
        let key = event.key;
        let desired = self
            .settings
            .load(key.account_id, key.strategy_type)
            .await?
            .map(|s| s.active)
            .unwrap_or(false);
        let running = self
            .supervisor
            .is_running(key.account_id, key.strategy_type);

        let action = match (desired, running) {
            (true, true) => {
                self.supervisor
                    .restart(key.account_id, key.strategy_type)
                    .await?;
                CommitAction::Restarted
            }
            (true, false) => {
                self.supervisor
                    .start(key.account_id, key.strategy_type)
                    .await?;
                CommitAction::Started
            }
            (false, true) => {
                self.supervisor
                    .stop(key.account_id, key.strategy_type)
                    .await?;
                CommitAction::Stopped
            }
            (false, false) => CommitAction::Unchanged,
        };

        tracing::info!(
            account = key.account_id,
            strategy = %key.strategy_type,
            version = event.version,
            "Settings commit handled: {:?}",
            action
        );
        Ok(action)
    }

    /// Full scan on a fixed cadence, the first one immediately
    pub async fn run_periodic(self: Arc<Self>, every: Duration) {
        tracing::info!("Settings reconcile loop starting, every {:?}", every);

        let mut ticker = interval_at(Instant::now(), every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = self.reconcile_once().await {
                tracing::error!("Reconcile scan failed: {}", e);
            }
        }
    }

    /// Consume commit notifications until the sender side is dropped
    pub async fn run_events(self: Arc<Self>, mut commits: mpsc::UnboundedReceiver<SettingsCommitted>) {
        while let Some(event) = commits.recv().await {
            if let Err(e) = self.on_settings_committed(&event).await {
                tracing::warn!(
                    "Commit of {} (v{}) not applied, periodic scan will retry: {}",
                    event.key,
                    event.version,
                    e
                );
            }
        }
        tracing::info!("Settings commit stream closed");
    }
}
