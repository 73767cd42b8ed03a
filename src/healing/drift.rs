//! Locator drift detection
//!
//! Every (locator, strategy) pair keeps a capped usage history. Health is derived
//! on demand from that history, so it can flag a locator that is going bad before
//! it fails outright and let the caller heal it proactively.

use crate::selector::SelectorStrategy;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorHealth {
    Healthy,
    Degrading,
    Critical,
    Failed,
}

impl SelectorHealth {
    /// 0 for healthy up to 3 for failed
    pub fn severity(&self) -> u8 {
        match self {
            SelectorHealth::Healthy => 0,
            SelectorHealth::Degrading => 1,
            SelectorHealth::Critical => 2,
            SelectorHealth::Failed => 3,
        }
    }
}

impl fmt::Display for SelectorHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SelectorHealth::Healthy => "healthy",
            SelectorHealth::Degrading => "degrading",
            SelectorHealth::Critical => "critical",
            SelectorHealth::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorUsage {
    pub selector: String,
    pub strategy: SelectorStrategy,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl SelectorUsage {
    pub fn new(selector: impl Into<String>, strategy: SelectorStrategy, success: bool, duration_ms: u64) -> Self {
        Self { selector: selector.into(), strategy, timestamp: Utc::now(), success, duration_ms, url: None }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    pub recent_window_ms: u64,
    pub degrading_threshold: f64,
    pub critical_threshold: f64,
    pub consecutive_failure_threshold: u32,
    pub drift_score_threshold: f64,
    /// Recent samples needed before a locator can be declared failed
    pub min_usages_for_metrics: usize,
    pub max_history_per_selector: usize,
    /// Locators unused for this long are forgotten by [`DriftDetector::prune_idle`]
    pub idle_retention_ms: u64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            recent_window_ms: 5 * 60 * 1000,
            degrading_threshold: 0.7,
            critical_threshold: 0.5,
            consecutive_failure_threshold: 3,
            drift_score_threshold: 0.3,
            min_usages_for_metrics: 5,
            max_history_per_selector: 100,
            idle_retention_ms: 24 * 60 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectorHealthMetrics {
    pub selector: String,
    pub strategy: SelectorStrategy,
    pub health: SelectorHealth,
    pub success_rate: f64,
    pub recent_success_rate: f64,
    pub total_usages: usize,
    pub recent_usages: usize,
    /// Mean duration of successful usages
    pub average_duration_ms: f64,
    /// |overall rate - recent rate|
    pub drift_score: f64,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub needs_healing: bool,
}

impl SelectorHealthMetrics {
    fn unseen(selector: &str, strategy: SelectorStrategy) -> Self {
        Self {
            selector: selector.to_string(),
            strategy,
            health: SelectorHealth::Healthy,
            success_rate: 1.0,
            recent_success_rate: 1.0,
            total_usages: 0,
            recent_usages: 0,
            average_duration_ms: 0.0,
            drift_score: 0.0,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            needs_healing: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftEventType {
    Degrading,
    Critical,
    Failed,
    Recovered,
}

impl DriftEventType {
    fn between(previous: SelectorHealth, current: SelectorHealth) -> Self {
        if current.severity() < previous.severity() {
            return DriftEventType::Recovered;
        }
        match current {
            SelectorHealth::Failed => DriftEventType::Failed,
            SelectorHealth::Critical => DriftEventType::Critical,
            _ => DriftEventType::Degrading,
        }
    }
}

/// Emitted when a locator moves to a different health class
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftEvent {
    pub event_type: DriftEventType,
    pub selector: String,
    pub strategy: SelectorStrategy,
    pub previous_health: SelectorHealth,
    pub current_health: SelectorHealth,
    pub metrics: SelectorHealthMetrics,
    pub at: DateTime<Utc>,
}

pub type DriftListener = Arc<dyn Fn(&DriftEvent) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DriftStats {
    pub tracked_selectors: usize,
    pub healthy: usize,
    pub degrading: usize,
    pub critical: usize,
    pub failed: usize,
    pub needing_healing: usize,
}

struct TrackedSelector {
    selector: String,
    strategy: SelectorStrategy,
    history: VecDeque<SelectorUsage>,
    last_health: SelectorHealth,
}

fn selector_key(selector: &str, strategy: SelectorStrategy) -> String {
    format!("{}:{}", strategy, selector)
}

/// Shared drift detector; one lock over the per-locator histories
pub struct DriftDetector {
    config: DriftConfig,
    tracked: RwLock<HashMap<String, TrackedSelector>>,
    listeners: RwLock<Vec<DriftListener>>,
}

impl Default for DriftDetector {
    fn default() -> Self {
        Self::new(DriftConfig::default())
    }
}

impl DriftDetector {
    pub fn new(config: DriftConfig) -> Self {
        Self { config, tracked: RwLock::new(HashMap::new()), listeners: RwLock::new(Vec::new()) }
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    pub fn on_drift(&self, listener: DriftListener) {
        self.listeners.write().push(listener);
    }

    pub fn record_success(&self, selector: &str, strategy: SelectorStrategy, duration_ms: u64) {
        self.record_usage(SelectorUsage::new(selector, strategy, true, duration_ms));
    }

    pub fn record_failure(&self, selector: &str, strategy: SelectorStrategy, duration_ms: u64) {
        self.record_usage(SelectorUsage::new(selector, strategy, false, duration_ms));
    }

    pub fn record_usage(&self, usage: SelectorUsage) -> SelectorHealthMetrics {
        self.record_usage_at(usage, Utc::now())
    }

    /// Append a usage and reclassify the locator as of `now`
    pub fn record_usage_at(&self, usage: SelectorUsage, now: DateTime<Utc>) -> SelectorHealthMetrics {
        let key = selector_key(&usage.selector, usage.strategy);
        let (metrics, event) = {
            let mut tracked = self.tracked.write();
            let entry = tracked.entry(key).or_insert_with(|| TrackedSelector {
                selector: usage.selector.clone(),
                strategy: usage.strategy,
                history: VecDeque::new(),
                last_health: SelectorHealth::Healthy,
            });
            entry.history.push_back(usage);
            while entry.history.len() > self.config.max_history_per_selector.max(1) {
                entry.history.pop_front();
            }

            let metrics = self.metrics_for(&entry.selector, entry.strategy, &entry.history, now);
            let previous = entry.last_health;
            entry.last_health = metrics.health;
            let event = (previous != metrics.health).then(|| DriftEvent {
                event_type: DriftEventType::between(previous, metrics.health),
                selector: metrics.selector.clone(),
                strategy: metrics.strategy,
                previous_health: previous,
                current_health: metrics.health,
                metrics: metrics.clone(),
                at: now,
            });
            (metrics, event)
        };

        if let Some(event) = event {
            match event.event_type {
                DriftEventType::Recovered | DriftEventType::Degrading => log::info!(
                    "Locator {}:{} {} -> {}",
                    event.strategy,
                    event.selector,
                    event.previous_health,
                    event.current_health
                ),
                _ => log::warn!(
                    "Locator {}:{} {} -> {}",
                    event.strategy,
                    event.selector,
                    event.previous_health,
                    event.current_health
                ),
            }
            let listeners = self.listeners.read().clone();
            for listener in &listeners {
                listener(&event);
            }
        }
        metrics
    }

    /// Health as of now
    pub fn get_health(&self, selector: &str, strategy: SelectorStrategy) -> SelectorHealthMetrics {
        self.calculate_health_at(selector, strategy, Utc::now())
    }

    /// Pure function of the stored history and `now`
    pub fn calculate_health_at(
        &self,
        selector: &str,
        strategy: SelectorStrategy,
        now: DateTime<Utc>,
    ) -> SelectorHealthMetrics {
        let tracked = self.tracked.read();
        match tracked.get(&selector_key(selector, strategy)) {
            Some(entry) => self.metrics_for(selector, strategy, &entry.history, now),
            None => SelectorHealthMetrics::unseen(selector, strategy),
        }
    }

    fn metrics_for(
        &self,
        selector: &str,
        strategy: SelectorStrategy,
        history: &VecDeque<SelectorUsage>,
        now: DateTime<Utc>,
    ) -> SelectorHealthMetrics {
        if history.is_empty() {
            return SelectorHealthMetrics::unseen(selector, strategy);
        }
        let cutoff = now - Duration::milliseconds(self.config.recent_window_ms.min(i64::MAX as u64) as i64);

        let total_usages = history.len();
        let successes = history.iter().filter(|u| u.success).count();
        let success_rate = successes as f64 / total_usages as f64;

        let recent: Vec<&SelectorUsage> = history.iter().filter(|u| u.timestamp > cutoff).collect();
        let recent_usages = recent.len();
        let recent_successes = recent.iter().filter(|u| u.success).count();
        let recent_success_rate =
            if recent_usages > 0 { recent_successes as f64 / recent_usages as f64 } else { success_rate };

        let average_duration_ms = if successes > 0 {
            history.iter().filter(|u| u.success).map(|u| u.duration_ms as f64).sum::<f64>() / successes as f64
        } else {
            0.0
        };
        let drift_score = (success_rate - recent_success_rate).abs();
        let consecutive_failures = history.iter().rev().take_while(|u| !u.success).count() as u32;

        let health = if recent_usages >= self.config.min_usages_for_metrics && recent_successes == 0 {
            SelectorHealth::Failed
        } else if recent_success_rate < self.config.critical_threshold {
            SelectorHealth::Critical
        } else if recent_success_rate < self.config.degrading_threshold || drift_score > self.config.drift_score_threshold
        {
            SelectorHealth::Degrading
        } else {
            SelectorHealth::Healthy
        };
        let needs_healing = consecutive_failures >= self.config.consecutive_failure_threshold
            || matches!(health, SelectorHealth::Critical | SelectorHealth::Failed);

        SelectorHealthMetrics {
            selector: selector.to_string(),
            strategy,
            health,
            success_rate,
            recent_success_rate,
            total_usages,
            recent_usages,
            average_duration_ms,
            drift_score,
            consecutive_failures,
            last_success: history.iter().filter(|u| u.success).map(|u| u.timestamp).max(),
            last_failure: history.iter().filter(|u| !u.success).map(|u| u.timestamp).max(),
            needs_healing,
        }
    }

    pub fn all_health(&self) -> Vec<SelectorHealthMetrics> {
        let now = Utc::now();
        let tracked = self.tracked.read();
        tracked.values().map(|e| self.metrics_for(&e.selector, e.strategy, &e.history, now)).collect()
    }

    /// Locators needing healing, most severe first, then by consecutive failures
    pub fn selectors_needing_healing(&self) -> Vec<SelectorHealthMetrics> {
        let mut needing: Vec<_> = self.all_health().into_iter().filter(|m| m.needs_healing).collect();
        needing.sort_by(|a, b| {
            b.health
                .severity()
                .cmp(&a.health.severity())
                .then(b.consecutive_failures.cmp(&a.consecutive_failures))
                .then(a.selector.cmp(&b.selector))
        });
        needing
    }

    /// Healthy with enough evidence to trust it
    pub fn is_stable(&self, selector: &str, strategy: SelectorStrategy) -> bool {
        let metrics = self.get_health(selector, strategy);
        metrics.health == SelectorHealth::Healthy && metrics.total_usages >= self.config.min_usages_for_metrics
    }

    pub fn stats(&self) -> DriftStats {
        let mut stats = DriftStats::default();
        for metrics in self.all_health() {
            stats.tracked_selectors += 1;
            match metrics.health {
                SelectorHealth::Healthy => stats.healthy += 1,
                SelectorHealth::Degrading => stats.degrading += 1,
                SelectorHealth::Critical => stats.critical += 1,
                SelectorHealth::Failed => stats.failed += 1,
            }
            if metrics.needs_healing {
                stats.needing_healing += 1;
            }
        }
        stats
    }

    /// Forget one locator's history, e.g. after it was healed and replaced
    pub fn clear_history(&self, selector: &str, strategy: SelectorStrategy) {
        self.tracked.write().remove(&selector_key(selector, strategy));
    }

    pub fn clear_all(&self) {
        self.tracked.write().clear();
    }

    pub fn prune_idle(&self) -> usize {
        self.prune_idle_at(Utc::now())
    }

    /// Drop locators whose latest usage is older than `idle_retention_ms`
    pub fn prune_idle_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::milliseconds(self.config.idle_retention_ms.min(i64::MAX as u64) as i64);
        let mut tracked = self.tracked.write();
        let before = tracked.len();
        tracked.retain(|_, entry| entry.history.back().is_some_and(|u| u.timestamp >= cutoff));
        before - tracked.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    const SEL: &str = "#submit";

    fn usage(success: bool, at: DateTime<Utc>) -> SelectorUsage {
        SelectorUsage::new(SEL, SelectorStrategy::Css, success, 120).at(at)
    }

    #[test]
    fn test_unseen_locator_is_healthy() {
        let detector = DriftDetector::default();
        let metrics = detector.get_health(SEL, SelectorStrategy::Css);
        assert_eq!(metrics.health, SelectorHealth::Healthy);
        assert!(!metrics.needs_healing);
    }

    #[test]
    fn test_recent_degradation_is_critical() {
        let detector = DriftDetector::default();
        let now = Utc::now();
        for _ in 0..5 {
            detector.record_usage_at(usage(true, now - Duration::minutes(30)), now);
        }
        detector.record_usage_at(usage(true, now - Duration::minutes(2)), now);
        detector.record_usage_at(usage(false, now - Duration::minutes(1)), now);
        let metrics = detector.record_usage_at(usage(false, now), now);

        assert_eq!(metrics.recent_usages, 3);
        assert_eq!(metrics.health, SelectorHealth::Critical);
        assert_eq!(metrics.consecutive_failures, 2);
        assert!(metrics.needs_healing);
        assert!((metrics.drift_score - (0.75 - 1.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_failed_needs_enough_samples() {
        let detector = DriftDetector::default();
        let now = Utc::now();
        for _ in 0..4 {
            detector.record_usage_at(usage(false, now), now);
        }
        // four recent failures: critical, not yet failed
        assert_eq!(detector.calculate_health_at(SEL, SelectorStrategy::Css, now).health, SelectorHealth::Critical);
        detector.record_usage_at(usage(false, now), now);
        assert_eq!(detector.calculate_health_at(SEL, SelectorStrategy::Css, now).health, SelectorHealth::Failed);
    }

    #[test]
    fn test_drift_score_alone_degrades() {
        let detector = DriftDetector::default();
        let now = Utc::now();
        for _ in 0..6 {
            detector.record_usage_at(usage(false, now - Duration::hours(1)), now);
        }
        for _ in 0..4 {
            detector.record_usage_at(usage(true, now), now);
        }
        // overall 0.4, recent 1.0
        let metrics = detector.calculate_health_at(SEL, SelectorStrategy::Css, now);
        assert_eq!(metrics.health, SelectorHealth::Degrading);
        assert!(!metrics.needs_healing);
    }

    #[test]
    fn test_calculate_health_is_pure() {
        let detector = DriftDetector::default();
        let now = Utc::now();
        detector.record_usage_at(usage(true, now), now);
        detector.record_usage_at(usage(false, now), now);
        let a = detector.calculate_health_at(SEL, SelectorStrategy::Css, now);
        let b = detector.calculate_health_at(SEL, SelectorStrategy::Css, now);
        assert_eq!(a, b);
    }

    #[test]
    fn test_events_only_on_class_change() {
        let detector = DriftDetector::default();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        detector.on_drift(Arc::new(move |e: &DriftEvent| sink.lock().push((e.previous_health, e.current_health))));

        let now = Utc::now();
        detector.record_usage_at(usage(true, now), now);
        detector.record_usage_at(usage(true, now), now);
        detector.record_usage_at(usage(false, now), now); // 2/3 -> degrading
        detector.record_usage_at(usage(false, now), now); // 2/4 -> degrading
        detector.record_usage_at(usage(false, now), now); // 2/5 -> critical
        for _ in 0..6 {
            detector.record_usage_at(usage(true, now), now); // 8/11 -> healthy
        }

        assert_eq!(
            *events.lock(),
            vec![
                (SelectorHealth::Healthy, SelectorHealth::Degrading),
                (SelectorHealth::Degrading, SelectorHealth::Critical),
                (SelectorHealth::Critical, SelectorHealth::Degrading),
                (SelectorHealth::Degrading, SelectorHealth::Healthy),
            ]
        );
    }

    #[test]
    fn test_needing_healing_sorted_by_severity() {
        let detector = DriftDetector::default();
        let now = Utc::now();
        for _ in 0..5 {
            detector.record_usage_at(SelectorUsage::new("#dead", SelectorStrategy::Css, false, 10).at(now), now);
        }
        detector.record_usage_at(SelectorUsage::new("#flaky", SelectorStrategy::Css, true, 10).at(now), now);
        detector.record_usage_at(SelectorUsage::new("#flaky", SelectorStrategy::Css, false, 10).at(now), now);
        detector.record_usage_at(SelectorUsage::new("#flaky", SelectorStrategy::Css, false, 10).at(now), now);
        detector.record_success("#fine", SelectorStrategy::Css, 10);

        let needing: Vec<String> = detector.selectors_needing_healing().into_iter().map(|m| m.selector).collect();
        assert_eq!(needing, vec!["#dead".to_string(), "#flaky".to_string()]);
        assert_eq!(detector.stats().tracked_selectors, 3);
    }

    #[test]
    fn test_history_cap_and_idle_prune() {
        let detector = DriftDetector::new(DriftConfig { max_history_per_selector: 3, ..Default::default() });
        let start = Utc::now() - Duration::days(2);
        for _ in 0..5 {
            detector.record_usage_at(usage(true, start), start);
        }
        assert_eq!(detector.calculate_health_at(SEL, SelectorStrategy::Css, start).total_usages, 3);
        assert_eq!(detector.prune_idle_at(start + Duration::hours(23)), 0);
        assert_eq!(detector.prune_idle_at(start + Duration::hours(25)), 1);
        assert_eq!(detector.stats().tracked_selectors, 0);
    }
}
