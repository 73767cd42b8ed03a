//! Periodic housekeeping for the long-lived stores
//!
//! Each store gets its own timer and touches nothing else, so the tasks need no
//! coordination. All of them stop when the handle is shut down or dropped.

use crate::cache::SemanticCache;
use crate::healing::{DriftDetector, HealingMemory, ProceduralMemory};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub episodic_prune_ms: u64,
    pub procedural_decay_ms: u64,
    pub drift_prune_ms: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self { episodic_prune_ms: 60 * 60 * 1000, procedural_decay_ms: 24 * 60 * 60 * 1000, drift_prune_ms: 60 * 60 * 1000 }
    }
}

/// Stores to look after; unset ones get no task
#[derive(Default, Clone)]
pub struct MaintenanceTargets {
    pub memory: Option<Arc<HealingMemory>>,
    pub procedural: Option<Arc<ProceduralMemory>>,
    pub drift: Option<Arc<DriftDetector>>,
    pub cache: Option<Arc<SemanticCache>>,
}

impl MaintenanceTargets {
    pub fn with_memory(mut self, memory: Arc<HealingMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_procedural(mut self, procedural: Arc<ProceduralMemory>) -> Self {
        self.procedural = Some(procedural);
        self
    }

    pub fn with_drift(mut self, drift: Arc<DriftDetector>) -> Self {
        self.drift = Some(drift);
        self
    }

    pub fn with_cache(mut self, cache: Arc<SemanticCache>) -> Self {
        self.cache = Some(cache);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub runs: u64,
    /// Entries pruned, decayed or swept over all runs
    pub affected: u64,
}

type StatsMap = Arc<Mutex<BTreeMap<&'static str, TaskStats>>>;

/// Handle to the running maintenance tasks
pub struct Maintenance {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    stats: StatsMap,
}

impl Maintenance {
    /// Start one task per configured target. Must be called inside a tokio runtime.
    pub fn spawn(config: MaintenanceConfig, targets: MaintenanceTargets, cancel: CancellationToken) -> Self {
        let mut maintenance = Self { cancel, tasks: JoinSet::new(), stats: StatsMap::default() };

        if let Some(memory) = targets.memory {
            maintenance.every("episodic_prune", config.episodic_prune_ms, move || memory.prune_expired());
        }
        if let Some(procedural) = targets.procedural {
            maintenance.every("procedural_decay", config.procedural_decay_ms, move || procedural.apply_decay());
        }
        if let Some(drift) = targets.drift {
            maintenance.every("drift_prune", config.drift_prune_ms, move || drift.prune_idle());
        }
        if let Some(cache) = targets.cache {
            let period = cache.config().clean_interval_ms;
            maintenance.every("cache_sweep", period, move || cache.sweep_expired());
        }

        log::debug!("Started {} maintenance tasks", maintenance.tasks.len());
        maintenance
    }

    fn every<F>(&mut self, name: &'static str, period_ms: u64, mut job: F)
    where
        F: FnMut() -> usize + Send + 'static,
    {
        let period = Duration::from_millis(period_ms.max(1));
        let cancel = self.cancel.clone();
        let stats = self.stats.clone();
        stats.lock().insert(name, TaskStats::default());

        self.tasks.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let affected = job();
                        if affected > 0 {
                            log::debug!("Maintenance '{}' touched {} entries", name, affected);
                        }
                        let mut stats = stats.lock();
                        let entry = stats.entry(name).or_default();
                        entry.runs += 1;
                        entry.affected += affected as u64;
                    }
                }
            }
        });
    }

    pub fn stats(&self) -> BTreeMap<&'static str, TaskStats> {
        self.stats.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tasks.is_empty()
    }

    /// Stop every task and wait for them to finish
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Err(e) if !e.is_cancelled() => log::warn!("Maintenance task failed: {}", e),
                _ => {}
            }
        }
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SemanticCacheConfig;

    #[tokio::test(start_paused = true)]
    async fn test_tasks_run_on_their_own_period() {
        let cache = Arc::new(SemanticCache::new(SemanticCacheConfig { clean_interval_ms: 1_000, ..Default::default() }));
        let config = MaintenanceConfig { episodic_prune_ms: 4_000, ..Default::default() };
        let targets = MaintenanceTargets::default()
            .with_memory(Arc::new(HealingMemory::default()))
            .with_cache(cache);
        let maintenance = Maintenance::spawn(config, targets, CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(4_500)).await;
        let stats = maintenance.stats();

        assert_eq!(stats.len(), 2);
        assert_eq!(stats["cache_sweep"].runs, 4);
        assert_eq!(stats["episodic_prune"].runs, 1);
        assert!(!stats.contains_key("drift_prune"));
        maintenance.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_tasks() {
        let cancel = CancellationToken::new();
        let targets = MaintenanceTargets::default().with_drift(Arc::new(DriftDetector::default()));
        let maintenance =
            Maintenance::spawn(MaintenanceConfig { drift_prune_ms: 100, ..Default::default() }, targets, cancel.clone());
        assert!(maintenance.is_running());

        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        assert_eq!(maintenance.stats()["drift_prune"].runs, 2);
        assert!(!maintenance.is_running());
    }
}
