use crate::models::StrategyKey;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Running tick loops keyed by (account, strategy type)
///
/// At most one live handle per key. A handle whose task has finished counts
/// as absent and is replaced on the next insert.
#[derive(Default)]
pub struct RunningTasks {
    handles: Mutex<HashMap<StrategyKey, JoinHandle<()>>>,
}

impl RunningTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<StrategyKey, JoinHandle<()>>> {
        // Nothing panics while holding the lock, but never let poisoning stop a shutdown
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `handle` unless a live one exists; otherwise hand it back
    pub fn insert_if_absent(
        &self,
        key: StrategyKey,
        handle: JoinHandle<()>,
    ) -> Result<(), JoinHandle<()>> {
        let mut handles = self.handles();
        match handles.get(&key) {
            Some(existing) if !existing.is_finished() => Err(handle),
            _ => {
                handles.insert(key, handle);
                Ok(())
            }
        }
    }

    /// Remove and return the handle, live or not
    pub fn remove(&self, key: &StrategyKey) -> Option<JoinHandle<()>> {
        self.handles().remove(key)
    }

    pub fn is_live(&self, key: &StrategyKey) -> bool {
        self.handles()
            .get(key)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Keys with a live handle, sorted
    pub fn live_keys(&self) -> Vec<StrategyKey> {
        let mut keys: Vec<StrategyKey> = self
            .handles()
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(k, _)| *k)
            .collect();
        keys.sort_by_key(|k| (k.account_id, k.strategy_type.as_str()));
        keys
    }
}
