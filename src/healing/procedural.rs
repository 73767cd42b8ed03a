//! Procedural tier: durable healing patterns indexed for direct reuse
//!
//! Patterns are indexed at once by domain, element type, context fingerprint and
//! generalized original selector. Reliability decays with calendar time since the
//! last successful use, independent of how often a pattern is looked up.

use crate::error::{ResilienceError, Result};
use crate::selector::Selector;
use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
};

const MS_PER_DAY: f64 = 24.0 * 60.0 * 60.0 * 1000.0;

static GENERALIZATIONS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [(r"\d+", "#"), (r#""[^"]*""#, "\"...\""), (r"'[^']*'", "'...'"), (r"\[[^\]]*=[^\]]*\]", "[attr=...]")]
        .into_iter()
        .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
        .collect()
});

/// Generalize a selector into its structural shape, e.g.
/// `input[name="q2"]` becomes `input[attr=...]` and `#item-42` becomes `#item-#`
pub fn extract_pattern(selector: &str) -> String {
    GENERALIZATIONS
        .iter()
        .fold(selector.to_string(), |shape, (re, replacement)| re.replace_all(&shape, *replacement).into_owned())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingPattern {
    pub id: String,
    pub original_pattern: String,
    pub original_selector: String,
    pub healed_selector: Selector,
    pub domain: String,
    pub element_type: String,
    pub action_type: String,
    pub context_fingerprint: String,
    /// Episodic record this pattern mirrors, if it came from a promotion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_record_id: Option<String>,
    pub use_count: u32,
    pub success_rate: f64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub last_success_at: DateTime<Utc>,
    pub decay_factor: f64,
}

impl HealingPattern {
    pub fn new(
        original_selector: impl Into<String>,
        healed_selector: Selector,
        domain: impl Into<String>,
        element_type: impl Into<String>,
        action_type: impl Into<String>,
        context_fingerprint: impl Into<String>,
    ) -> Self {
        let original_selector = original_selector.into();
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            original_pattern: extract_pattern(&original_selector),
            original_selector,
            healed_selector,
            domain: domain.into(),
            element_type: element_type.into(),
            action_type: action_type.into(),
            context_fingerprint: context_fingerprint.into(),
            source_record_id: None,
            use_count: 1,
            success_rate: 1.0,
            created_at: now,
            last_used_at: now,
            last_success_at: now,
            decay_factor: 1.0,
        }
    }

    pub fn with_source_record(mut self, record_id: impl Into<String>) -> Self {
        self.source_record_id = Some(record_id.into());
        self
    }

    /// Eviction key: lowest goes first under capacity pressure
    pub fn value(&self) -> f64 {
        self.decay_factor * self.success_rate
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProceduralMemoryConfig {
    pub max_patterns: usize,
    pub daily_decay_rate: f64,
    pub min_decay_factor: f64,
    pub min_success_rate: f64,
    /// Uses after which a pattern's success rate is trusted (and enforced)
    pub min_uses_for_reliable: u32,
    pub match_score_threshold: f64,
    pub ema_alpha: f64,
}

impl Default for ProceduralMemoryConfig {
    fn default() -> Self {
        Self {
            max_patterns: 1000,
            daily_decay_rate: 0.05,
            min_decay_factor: 0.3,
            min_success_rate: 0.7,
            min_uses_for_reliable: 3,
            match_score_threshold: 0.6,
            ema_alpha: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    /// Same generalized original selector
    Exact,
    /// Same context fingerprint
    Contextual,
    /// Same domain and element type
    Similar,
}

impl MatchType {
    fn base_score(&self) -> f64 {
        match self {
            MatchType::Exact => 0.4,
            MatchType::Contextual => 0.3,
            MatchType::Similar => 0.2,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PatternQuery {
    pub original_selector: String,
    pub domain: Option<String>,
    pub element_type: Option<String>,
    pub action_type: Option<String>,
    pub context_fingerprint: Option<String>,
}

impl PatternQuery {
    pub fn new(original_selector: impl Into<String>) -> Self {
        Self { original_selector: original_selector.into(), ..Default::default() }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_element_type(mut self, element_type: impl Into<String>) -> Self {
        self.element_type = Some(element_type.into());
        self
    }

    pub fn with_action_type(mut self, action_type: impl Into<String>) -> Self {
        self.action_type = Some(action_type.into());
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.context_fingerprint = Some(fingerprint.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternMatch {
    pub pattern: HealingPattern,
    pub match_score: f64,
    pub match_type: MatchType,
}

impl PatternMatch {
    fn rank(&self) -> f64 {
        self.match_score * self.pattern.decay_factor * self.pattern.success_rate
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProceduralStats {
    pub total_patterns: usize,
    pub domains: usize,
    pub element_types: usize,
    pub average_success_rate: f64,
    pub average_decay_factor: f64,
    pub reliable_patterns: usize,
}

#[derive(Default)]
struct PatternStore {
    patterns: IndexMap<String, HealingPattern>,
    by_domain: HashMap<String, IndexSet<String>>,
    by_element_type: HashMap<String, IndexSet<String>>,
    by_fingerprint: HashMap<String, IndexSet<String>>,
    by_original_pattern: HashMap<String, IndexSet<String>>,
    by_source: HashMap<String, String>,
}

fn index_insert(index: &mut HashMap<String, IndexSet<String>>, key: &str, id: &str) {
    index.entry(key.to_string()).or_default().insert(id.to_string());
}

fn index_remove(index: &mut HashMap<String, IndexSet<String>>, key: &str, id: &str) {
    if let Some(ids) = index.get_mut(key) {
        ids.shift_remove(id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

impl PatternStore {
    fn insert(&mut self, pattern: HealingPattern) {
        let id = pattern.id.clone();
        index_insert(&mut self.by_domain, &pattern.domain, &id);
        index_insert(&mut self.by_element_type, &pattern.element_type, &id);
        index_insert(&mut self.by_fingerprint, &pattern.context_fingerprint, &id);
        index_insert(&mut self.by_original_pattern, &pattern.original_pattern, &id);
        if let Some(source) = &pattern.source_record_id {
            self.by_source.insert(source.clone(), id.clone());
        }
        self.patterns.insert(id, pattern);
    }

    fn remove(&mut self, id: &str) -> Option<HealingPattern> {
        let pattern = self.patterns.shift_remove(id)?;
        index_remove(&mut self.by_domain, &pattern.domain, id);
        index_remove(&mut self.by_element_type, &pattern.element_type, id);
        index_remove(&mut self.by_fingerprint, &pattern.context_fingerprint, id);
        index_remove(&mut self.by_original_pattern, &pattern.original_pattern, id);
        if let Some(source) = &pattern.source_record_id {
            self.by_source.remove(source);
        }
        Some(pattern)
    }

    fn lowest_value(&self) -> Option<String> {
        self.patterns
            .values()
            .min_by(|a, b| a.value().partial_cmp(&b.value()).unwrap_or(Ordering::Equal))
            .map(|p| p.id.clone())
    }
}

/// Shared procedural pattern store
pub struct ProceduralMemory {
    config: ProceduralMemoryConfig,
    store: RwLock<PatternStore>,
}

impl Default for ProceduralMemory {
    fn default() -> Self {
        Self::new(ProceduralMemoryConfig::default())
    }
}

impl ProceduralMemory {
    pub fn new(config: ProceduralMemoryConfig) -> Self {
        Self { config, store: RwLock::new(PatternStore::default()) }
    }

    pub fn config(&self) -> &ProceduralMemoryConfig {
        &self.config
    }

    /// Store a pattern, evicting the least valuable one when full. Returns its id.
    pub fn store(&self, pattern: HealingPattern) -> String {
        let mut store = self.store.write();
        if let Some(existing) = store.remove(&pattern.id) {
            log::debug!("Replacing procedural pattern {}", existing.id);
        }
        while store.patterns.len() >= self.config.max_patterns.max(1) {
            match store.lowest_value() {
                Some(victim) => {
                    store.remove(&victim);
                    log::debug!("Evicted procedural pattern {} (capacity)", victim);
                }
                None => break,
            }
        }
        let id = pattern.id.clone();
        store.insert(pattern);
        id
    }

    /// Patterns matching the query, best `score × decay × success` first
    pub fn find_matches(&self, query: &PatternQuery) -> Vec<PatternMatch> {
        let store = self.store.read();
        let mut matches: Vec<PatternMatch> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        let mut consider = |ids: Vec<&String>, match_type: MatchType, matches: &mut Vec<PatternMatch>| {
            for id in ids {
                if seen.contains(id) {
                    continue;
                }
                if let Some(pattern) = store.patterns.get(id) {
                    let score = self.match_score(pattern, query, match_type);
                    if score >= self.config.match_score_threshold {
                        seen.insert(id.clone());
                        matches.push(PatternMatch { pattern: pattern.clone(), match_score: score, match_type });
                    }
                }
            }
        };

        let original = extract_pattern(&query.original_selector);
        if let Some(ids) = store.by_original_pattern.get(&original) {
            consider(ids.iter().collect(), MatchType::Exact, &mut matches);
        }

        if let Some(ids) = query.context_fingerprint.as_ref().and_then(|fp| store.by_fingerprint.get(fp)) {
            consider(ids.iter().collect(), MatchType::Contextual, &mut matches);
        }

        if let (Some(domain), Some(element)) = (&query.domain, &query.element_type) {
            if let (Some(by_domain), Some(by_element)) =
                (store.by_domain.get(domain), store.by_element_type.get(element))
            {
                let both: Vec<&String> = by_domain.iter().filter(|id| by_element.contains(*id)).collect();
                consider(both, MatchType::Similar, &mut matches);
            }
        }

        matches.sort_by(|a, b| b.rank().partial_cmp(&a.rank()).unwrap_or(Ordering::Equal));
        matches
    }

    pub fn find_best_match(&self, query: &PatternQuery) -> Option<PatternMatch> {
        self.find_matches(query).into_iter().next()
    }

    fn match_score(&self, pattern: &HealingPattern, query: &PatternQuery, match_type: MatchType) -> f64 {
        let mut score = match_type.base_score();
        if query.domain.as_deref() == Some(pattern.domain.as_str()) {
            score += 0.2;
        }
        if query.element_type.as_deref() == Some(pattern.element_type.as_str()) {
            score += 0.15;
        }
        if query.action_type.as_deref() == Some(pattern.action_type.as_str()) {
            score += 0.15;
        }
        if pattern.use_count >= self.config.min_uses_for_reliable {
            score += 0.1;
        }
        score.min(1.0)
    }

    /// Record a reuse. Unreliable patterns are evicted once they have enough uses.
    pub fn record_usage(&self, id: &str, success: bool) {
        self.record_usage_at(id, success, Utc::now())
    }

    pub fn record_usage_at(&self, id: &str, success: bool, now: DateTime<Utc>) {
        let mut store = self.store.write();
        let alpha = self.config.ema_alpha;
        let evict = match store.patterns.get_mut(id) {
            Some(pattern) => {
                pattern.use_count += 1;
                pattern.last_used_at = now;
                pattern.success_rate = alpha * if success { 1.0 } else { 0.0 } + (1.0 - alpha) * pattern.success_rate;
                if success {
                    pattern.last_success_at = now;
                    pattern.decay_factor = 1.0;
                }
                pattern.use_count >= self.config.min_uses_for_reliable
                    && pattern.success_rate < self.config.min_success_rate
            }
            None => return,
        };
        if evict {
            store.remove(id);
            log::info!("Evicted procedural pattern {} (success rate below floor)", id);
        }
    }

    /// Recompute every decay factor from the time since last use and evict
    /// patterns below the floor. Returns the number evicted.
    pub fn apply_decay(&self) -> usize {
        self.apply_decay_at(Utc::now())
    }

    pub fn apply_decay_at(&self, now: DateTime<Utc>) -> usize {
        let mut store = self.store.write();
        let mut expired = Vec::new();
        for pattern in store.patterns.values_mut() {
            let days = (now - pattern.last_used_at).num_milliseconds().max(0) as f64 / MS_PER_DAY;
            pattern.decay_factor = (1.0 - days * self.config.daily_decay_rate).clamp(0.0, 1.0);
            if pattern.decay_factor < self.config.min_decay_factor {
                expired.push(pattern.id.clone());
            }
        }
        for id in &expired {
            store.remove(id);
        }
        if !expired.is_empty() {
            log::debug!("Procedural decay evicted {} patterns", expired.len());
        }
        expired.len()
    }

    pub fn get(&self, id: &str) -> Option<HealingPattern> {
        self.store.read().patterns.get(id).cloned()
    }

    /// Pattern mirrored from the given episodic record
    pub fn get_by_source(&self, record_id: &str) -> Option<HealingPattern> {
        let store = self.store.read();
        store.by_source.get(record_id).and_then(|id| store.patterns.get(id)).cloned()
    }

    pub fn by_domain(&self, domain: &str) -> Vec<HealingPattern> {
        let store = self.store.read();
        store
            .by_domain
            .get(domain)
            .map(|ids| ids.iter().filter_map(|id| store.patterns.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn remove(&self, id: &str) -> bool {
        self.store.write().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.store.read().patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        *self.store.write() = PatternStore::default();
    }

    pub fn stats(&self) -> ProceduralStats {
        let store = self.store.read();
        let total = store.patterns.len();
        if total == 0 {
            return ProceduralStats::default();
        }
        let patterns = store.patterns.values();
        ProceduralStats {
            total_patterns: total,
            domains: store.by_domain.len(),
            element_types: store.by_element_type.len(),
            average_success_rate: patterns.clone().map(|p| p.success_rate).sum::<f64>() / total as f64,
            average_decay_factor: patterns.clone().map(|p| p.decay_factor).sum::<f64>() / total as f64,
            reliable_patterns: patterns
                .filter(|p| {
                    p.use_count >= self.config.min_uses_for_reliable && p.success_rate >= self.config.min_success_rate
                })
                .count(),
        }
    }

    pub fn export(&self) -> Vec<HealingPattern> {
        self.store.read().patterns.values().cloned().collect()
    }

    /// Validate every pattern, then insert them all. Nothing is inserted on error.
    pub fn import(&self, patterns: Vec<HealingPattern>) -> Result<usize> {
        validate_patterns(&patterns)?;
        let count = patterns.len();
        for pattern in patterns {
            self.store(pattern);
        }
        Ok(count)
    }
}

pub(crate) fn validate_patterns(patterns: &[HealingPattern]) -> Result<()> {
    let mut ids = IndexSet::new();
    for pattern in patterns {
        if pattern.id.is_empty() || pattern.original_selector.is_empty() || pattern.healed_selector.value.is_empty() {
            return Err(ResilienceError::InvalidImport(format!("pattern '{}' has empty fields", pattern.id)));
        }
        if !(0.0..=1.0).contains(&pattern.success_rate) || !(0.0..=1.0).contains(&pattern.decay_factor) {
            return Err(ResilienceError::InvalidImport(format!("pattern '{}' has rates outside [0, 1]", pattern.id)));
        }
        if !ids.insert(pattern.id.as_str()) {
            return Err(ResilienceError::InvalidImport(format!("duplicate pattern id '{}'", pattern.id)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn pattern(original: &str, healed: &str) -> HealingPattern {
        HealingPattern::new(original, Selector::css(healed), "shop.example.com", "button", "click", "text:buy_now")
    }

    #[test]
    fn test_extract_pattern() {
        assert_eq!(extract_pattern("#item-42"), "#item-#");
        assert_eq!(extract_pattern("input[name=\"q2\"]"), "input[attr=...]");
        assert_eq!(extract_pattern("//a[text()='Next']"), "//a[attr=...]");
        assert_eq!(extract_pattern(".btn.primary"), ".btn.primary");
    }

    #[test]
    fn test_find_matches_by_every_index() {
        let memory = ProceduralMemory::default();
        memory.store(pattern("#buy-1", "[data-testid=\"buy\"]"));

        // same shape of original selector
        let exact = memory.find_best_match(
            &PatternQuery::new("#buy-7").with_domain("shop.example.com").with_element_type("button"),
        );
        assert_eq!(exact.unwrap().match_type, MatchType::Exact);

        // different selector, same fingerprint
        let contextual = memory.find_best_match(
            &PatternQuery::new(".totally-different")
                .with_fingerprint("text:buy_now")
                .with_domain("shop.example.com")
                .with_action_type("click"),
        );
        assert_eq!(contextual.unwrap().match_type, MatchType::Contextual);

        // only domain and element type line up
        let similar = memory.find_best_match(
            &PatternQuery::new(".other")
                .with_domain("shop.example.com")
                .with_element_type("button")
                .with_action_type("click"),
        );
        let similar = similar.unwrap();
        assert_eq!(similar.match_type, MatchType::Similar);
        assert!((similar.match_score - 0.7).abs() < 1e-9);

        // below threshold
        assert!(memory.find_best_match(&PatternQuery::new(".other").with_domain("shop.example.com")).is_none());
    }

    #[test]
    fn test_capacity_evicts_lowest_value() {
        let memory = ProceduralMemory::new(ProceduralMemoryConfig { max_patterns: 2, ..Default::default() });
        let mut weak = pattern("#a", "#a2");
        weak.success_rate = 0.2;
        let weak_id = memory.store(weak);
        let strong_id = memory.store(pattern("#b", "#b2"));
        memory.store(pattern("#c", "#c2"));

        assert_eq!(memory.len(), 2);
        assert!(memory.get(&weak_id).is_none());
        assert!(memory.get(&strong_id).is_some());
    }

    #[test]
    fn test_decay_is_idempotent_and_evicts() {
        let memory = ProceduralMemory::default();
        let id = memory.store(pattern("#a", "#b"));
        let created = memory.get(&id).unwrap().last_success_at;

        assert_eq!(memory.apply_decay_at(created + Duration::days(4)), 0);
        assert_eq!(memory.apply_decay_at(created + Duration::days(4)), 0);
        let decayed = memory.get(&id).unwrap().decay_factor;
        assert!((decayed - 0.8).abs() < 1e-9);

        // 1 - 15 × 0.05 = 0.25, below the 0.3 floor
        assert_eq!(memory.apply_decay_at(created + Duration::days(15)), 1);
        assert!(memory.is_empty());
    }

    #[test]
    fn test_success_resets_decay() {
        let memory = ProceduralMemory::default();
        let id = memory.store(pattern("#a", "#b"));
        let start = memory.get(&id).unwrap().last_success_at;

        memory.apply_decay_at(start + Duration::days(10));
        memory.record_usage_at(&id, true, start + Duration::days(10));
        assert_eq!(memory.get(&id).unwrap().decay_factor, 1.0);
        memory.apply_decay_at(start + Duration::days(12));
        assert!((memory.get(&id).unwrap().decay_factor - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_failed_use_counts_as_use_for_decay() {
        let memory = ProceduralMemory::default();
        let id = memory.store(pattern("#a", "#b"));
        let start = memory.get(&id).unwrap().last_used_at;

        memory.record_usage_at(&id, false, start + Duration::days(10));
        assert_eq!(memory.apply_decay_at(start + Duration::days(12)), 0);
        assert!((memory.get(&id).unwrap().decay_factor - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_unreliable_pattern_evicted() {
        let memory = ProceduralMemory::default();
        let id = memory.store(pattern("#a", "#b"));
        // 1.0 -> 0.7 -> 0.49: third use makes it reliable and below 0.7
        memory.record_usage(&id, false);
        assert!(memory.get(&id).is_some());
        memory.record_usage(&id, false);
        assert!(memory.get(&id).is_none());
    }

    #[test]
    fn test_import_validates_first() {
        let memory = ProceduralMemory::default();
        let good = pattern("#a", "#b");
        let mut bad = pattern("#c", "#d");
        bad.success_rate = 1.5;

        assert!(matches!(memory.import(vec![good.clone(), bad]), Err(ResilienceError::InvalidImport(_))));
        assert!(memory.is_empty());

        assert!(memory.import(vec![good.clone(), good.clone()]).is_err());
        assert_eq!(memory.import(vec![good]).unwrap(), 1);
        assert_eq!(memory.stats().total_patterns, 1);
        assert_eq!(memory.by_domain("shop.example.com").len(), 1);
    }
}
