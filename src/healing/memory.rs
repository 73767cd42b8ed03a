//! Four-tier healing memory
//!
//! - working: the last few healed locators on the current page, cleared on navigation
//! - episodic: every successful healing, forgotten after `episodic_decay_ms`
//! - semantic: the best promoted record per element description, grouped by domain
//! - procedural: promoted records mirrored into [`ProceduralMemory`]

use crate::error::{ResilienceError, Result};
use crate::healing::context::{ElementContext, extract_domain, word_jaccard};
use crate::healing::procedural::{HealingPattern, ProceduralMemory, validate_patterns};
use crate::selector::Selector;
use chrono::{DateTime, Duration, Utc};
use indexmap::{IndexMap, IndexSet};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

pub const EXPORT_VERSION: u32 = 1;

/// One observed broken → healed mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingRecord {
    pub id: String,
    pub broken_selector: String,
    pub healed_selector: Selector,
    pub context: ElementContext,
    pub url_pattern: String,
    pub timestamp: DateTime<Utc>,
    pub reuse_count: u32,
    /// Exponential moving average over reuses
    pub success_rate: f64,
    pub element_description: String,
}

impl HealingRecord {
    pub fn new(
        broken_selector: impl Into<String>,
        healed_selector: Selector,
        context: ElementContext,
        url_pattern: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            broken_selector: broken_selector.into(),
            element_description: context.describe_element(),
            healed_selector,
            context,
            url_pattern: url_pattern.into(),
            timestamp: Utc::now(),
            reuse_count: 0,
            success_rate: 1.0,
        }
    }

    pub fn domain(&self) -> String {
        extract_domain(&self.url_pattern)
    }
}

/// Weights of the episodic similarity score; they sum to 1.0 by default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityWeights {
    pub selector_pattern: f64,
    pub action: f64,
    pub near_text: f64,
    pub expected_tag: f64,
    pub domain: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self { selector_pattern: 0.3, action: 0.2, near_text: 0.2, expected_tag: 0.15, domain: 0.15 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingMemoryConfig {
    pub working_memory_size: usize,
    pub episodic_decay_ms: u64,
    pub promotion_threshold: f64,
    pub promotion_min_reuses: u32,
    pub ema_alpha: f64,
    /// Records must score strictly above this to be returned as similar
    pub similarity_threshold: f64,
    pub weights: SimilarityWeights,
}

impl Default for HealingMemoryConfig {
    fn default() -> Self {
        Self {
            working_memory_size: 7,
            episodic_decay_ms: 24 * 60 * 60 * 1000,
            promotion_threshold: 0.8,
            promotion_min_reuses: 3,
            ema_alpha: 0.3,
            similarity_threshold: 0.5,
            weights: SimilarityWeights::default(),
        }
    }
}

/// Coarse shape of a locator, used to compare broken selectors
pub fn selector_category(selector: &str) -> &'static str {
    let selector = selector.trim_start();
    if selector.starts_with('#') {
        "id"
    } else if selector.starts_with('.') {
        "class"
    } else if selector.starts_with('[') {
        "attribute"
    } else if selector.starts_with("//") {
        "xpath"
    } else if selector.starts_with("text=") {
        "text"
    } else {
        "tag"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub working_size: usize,
    pub episodic_size: usize,
    pub semantic_domains: usize,
    pub semantic_records: usize,
    pub procedural_patterns: usize,
    pub average_success_rate: f64,
}

/// Persisted form of the episodic, semantic and procedural tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryExport {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub episodic: Vec<HealingRecord>,
    pub semantic: BTreeMap<String, Vec<HealingRecord>>,
    pub procedural: Vec<HealingPattern>,
}

/// Shared, internally synchronised healing memory
pub struct HealingMemory {
    config: HealingMemoryConfig,
    working: Mutex<IndexMap<String, Selector>>,
    episodic: RwLock<IndexMap<String, HealingRecord>>,
    semantic: RwLock<HashMap<String, Vec<HealingRecord>>>,
    procedural: Arc<ProceduralMemory>,
}

impl Default for HealingMemory {
    fn default() -> Self {
        Self::new(HealingMemoryConfig::default(), Arc::new(ProceduralMemory::default()))
    }
}

impl HealingMemory {
    pub fn new(config: HealingMemoryConfig, procedural: Arc<ProceduralMemory>) -> Self {
        Self {
            config,
            working: Mutex::new(IndexMap::new()),
            episodic: RwLock::new(IndexMap::new()),
            semantic: RwLock::new(HashMap::new()),
            procedural,
        }
    }

    pub fn config(&self) -> &HealingMemoryConfig {
        &self.config
    }

    pub fn procedural(&self) -> &Arc<ProceduralMemory> {
        &self.procedural
    }

    // Working tier

    /// Remember a selector for the current page; oldest entry goes first when full
    pub fn set_working_selector(&self, key: impl Into<String>, selector: Selector) {
        let key = key.into();
        let mut working = self.working.lock();
        if !working.contains_key(&key) && working.len() >= self.config.working_memory_size.max(1) {
            working.shift_remove_index(0);
        }
        working.insert(key, selector);
    }

    pub fn get_working_selector(&self, key: &str) -> Option<Selector> {
        self.working.lock().get(key).cloned()
    }

    pub fn forget_working_selector(&self, key: &str) -> Option<Selector> {
        self.working.lock().shift_remove(key)
    }

    /// Page navigation boundary
    pub fn clear_working_memory(&self) {
        self.working.lock().clear();
    }

    // Episodic tier

    pub fn record_healing(
        &self,
        broken_selector: impl Into<String>,
        healed_selector: Selector,
        context: ElementContext,
        url_pattern: impl Into<String>,
    ) -> HealingRecord {
        let record = HealingRecord::new(broken_selector, healed_selector, context, url_pattern);
        log::debug!("Recorded healing {} -> {}", record.broken_selector, record.healed_selector);
        self.episodic.write().insert(record.id.clone(), record.clone());
        record
    }

    pub fn get_record(&self, id: &str) -> Option<HealingRecord> {
        self.episodic.read().get(id).cloned()
    }

    /// Live records resembling the query, best `score × success_rate` first
    pub fn find_similar_healings(&self, broken_selector: &str, context: &ElementContext, url: &str) -> Vec<HealingRecord> {
        self.prune_expired();
        let domain = extract_domain(url);
        let episodic = self.episodic.read();
        let mut scored: Vec<(f64, &HealingRecord)> = episodic
            .values()
            .map(|record| (self.similarity(record, broken_selector, context, &domain), record))
            .filter(|(score, _)| *score > self.config.similarity_threshold)
            .collect();
        scored.sort_by(|a, b| {
            (b.0 * b.1.success_rate).partial_cmp(&(a.0 * a.1.success_rate)).unwrap_or(Ordering::Equal)
        });
        scored.into_iter().map(|(_, record)| record.clone()).collect()
    }

    /// Weighted similarity of a stored record to a query
    pub fn similarity(&self, record: &HealingRecord, broken_selector: &str, context: &ElementContext, domain: &str) -> f64 {
        let weights = &self.config.weights;
        let mut score = 0.0;
        if selector_category(&record.broken_selector) == selector_category(broken_selector) {
            score += weights.selector_pattern;
        }
        if record.context.action == context.action {
            score += weights.action;
        }
        if let (Some(a), Some(b)) = (&record.context.near_text, &context.near_text) {
            score += word_jaccard(a, b) * weights.near_text;
        }
        if record.context.expected_tag == context.expected_tag {
            score += weights.expected_tag;
        }
        if record.domain() == domain {
            score += weights.domain;
        }
        score
    }

    /// Update a record's success EMA after reusing it, promoting it when it proved reliable
    pub fn mark_reused(&self, id: &str, success: bool) {
        let alpha = self.config.ema_alpha;
        let promoted = {
            let mut episodic = self.episodic.write();
            let Some(record) = episodic.get_mut(id) else {
                return;
            };
            record.reuse_count += 1;
            record.success_rate = alpha * if success { 1.0 } else { 0.0 } + (1.0 - alpha) * record.success_rate;
            let eligible = record.reuse_count >= self.config.promotion_min_reuses
                && record.success_rate >= self.config.promotion_threshold;
            eligible.then(|| record.clone())
        };

        match self.procedural.get_by_source(id) {
            Some(mirror) => self.procedural.record_usage(&mirror.id, success),
            None => {
                if let Some(record) = &promoted {
                    self.mirror_into_procedural(record);
                }
            }
        }
        if let Some(record) = promoted {
            self.upsert_semantic(record);
        }
    }

    fn mirror_into_procedural(&self, record: &HealingRecord) {
        let mut pattern = HealingPattern::new(
            record.broken_selector.clone(),
            record.healed_selector.clone(),
            record.domain(),
            record.context.expected_tag.clone().unwrap_or_else(|| "element".to_string()),
            record.context.action.as_str(),
            record.context.fingerprint(),
        )
        .with_source_record(record.id.clone());
        pattern.use_count = record.reuse_count;
        pattern.success_rate = record.success_rate;
        log::info!("Promoted healing {} ({}) to procedural memory", record.id, record.element_description);
        self.procedural.store(pattern);
    }

    fn upsert_semantic(&self, record: HealingRecord) {
        let mut semantic = self.semantic.write();
        let records = semantic.entry(record.domain()).or_default();
        match records
            .iter_mut()
            .find(|r| r.id == record.id || r.element_description == record.element_description)
        {
            Some(existing) if existing.id == record.id || record.success_rate > existing.success_rate => {
                *existing = record;
            }
            Some(_) => {}
            None => records.push(record),
        }
    }

    // Semantic tier

    /// Promoted records for the URL's domain
    pub fn get_domain_patterns(&self, url: &str) -> Vec<HealingRecord> {
        self.semantic.read().get(&extract_domain(url)).cloned().unwrap_or_default()
    }

    // Maintenance

    pub fn prune_expired(&self) -> usize {
        self.prune_expired_at(Utc::now())
    }

    /// Forget episodic records older than the decay window
    pub fn prune_expired_at(&self, now: DateTime<Utc>) -> usize {
        let max_age = Duration::milliseconds(self.config.episodic_decay_ms.min(i64::MAX as u64) as i64);
        let mut episodic = self.episodic.write();
        let before = episodic.len();
        episodic.retain(|_, record| now - record.timestamp <= max_age);
        let pruned = before - episodic.len();
        if pruned > 0 {
            log::debug!("Pruned {} expired healing records", pruned);
        }
        pruned
    }

    pub fn stats(&self) -> MemoryStats {
        let working_size = self.working.lock().len();
        let (episodic_size, average_success_rate) = {
            let episodic = self.episodic.read();
            let total: f64 = episodic.values().map(|r| r.success_rate).sum();
            let average = if episodic.is_empty() { 0.0 } else { total / episodic.len() as f64 };
            (episodic.len(), average)
        };
        let (semantic_domains, semantic_records) = {
            let semantic = self.semantic.read();
            (semantic.len(), semantic.values().map(Vec::len).sum::<usize>())
        };
        MemoryStats {
            working_size,
            episodic_size,
            semantic_domains,
            semantic_records,
            procedural_patterns: self.procedural.len(),
            average_success_rate,
        }
    }

    // Persistence

    pub fn export_memory(&self) -> MemoryExport {
        MemoryExport {
            version: EXPORT_VERSION,
            exported_at: Utc::now(),
            episodic: self.episodic.read().values().cloned().collect(),
            semantic: self.semantic.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            procedural: self.procedural.export(),
        }
    }

    /// Validate the whole export, then load it. On error nothing is loaded.
    pub fn import_memory(&self, data: MemoryExport) -> Result<()> {
        if data.version > EXPORT_VERSION {
            return Err(ResilienceError::InvalidImport(format!("unsupported export version {}", data.version)));
        }
        validate_records(&data.episodic)?;
        for records in data.semantic.values() {
            validate_records(records)?;
        }
        validate_patterns(&data.procedural)?;

        {
            let mut episodic = self.episodic.write();
            for record in data.episodic {
                episodic.insert(record.id.clone(), record);
            }
        }
        for record in data.semantic.into_values().flatten() {
            self.upsert_semantic(record);
        }
        self.procedural.import(data.procedural)?;
        Ok(())
    }

    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export_memory())?)
    }

    pub fn import_json(&self, json: &str) -> Result<()> {
        let data: MemoryExport =
            serde_json::from_str(json).map_err(|e| ResilienceError::InvalidImport(format!("malformed export: {}", e)))?;
        self.import_memory(data)
    }
}

fn validate_records(records: &[HealingRecord]) -> Result<()> {
    let mut ids = IndexSet::new();
    for record in records {
        if record.id.is_empty() || record.broken_selector.is_empty() || record.healed_selector.value.is_empty() {
            return Err(ResilienceError::InvalidImport(format!("record '{}' has empty fields", record.id)));
        }
        if !(0.0..=1.0).contains(&record.success_rate) {
            return Err(ResilienceError::InvalidImport(format!(
                "record '{}' has success rate {} outside [0, 1]",
                record.id, record.success_rate
            )));
        }
        if !ids.insert(record.id.as_str()) {
            return Err(ResilienceError::InvalidImport(format!("duplicate record id '{}'", record.id)));
        }
    }
    Ok(())
}
