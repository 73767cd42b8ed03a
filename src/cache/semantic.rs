//! Cache of compiled mission plans
//!
//! Lookup tries the content hash of the normalised mission text first, then the
//! most similar live entry by token Jaccard similarity. Entries are kept in
//! access order so the least recently used one is evicted first.

use crate::mission::MissionAction;
use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticCacheConfig {
    pub max_entries: usize,
    pub ttl_ms: u64,
    pub similarity_threshold: f64,
    pub enable_similarity: bool,
    /// Period of the background TTL sweep, see [`crate::maintenance`]
    pub clean_interval_ms: u64,
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl_ms: 60 * 60 * 1000,
            similarity_threshold: 0.95,
            enable_similarity: true,
            clean_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedCompilation {
    pub key: String,
    pub mission: String,
    pub actions: Vec<MissionAction>,
    pub route: String,
    pub complexity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub hit_count: u64,
}

impl CachedCompilation {
    /// Rough in-memory footprint
    pub fn estimated_size(&self) -> usize {
        let actions = serde_json::to_string(&self.actions).map(|s| s.len()).unwrap_or_default();
        self.key.len()
            + self.mission.len()
            + self.route.len()
            + actions
            + self.embedding.as_ref().map(|e| e.len() * 4).unwrap_or_default()
            + 100
    }
}

/// Plan to pre-populate the cache with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmEntry {
    pub mission: String,
    pub actions: Vec<MissionAction>,
    pub route: String,
    pub complexity: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub memory_bytes: usize,
}

#[derive(Default)]
struct CacheInner {
    entries: IndexMap<String, CachedCompilation>,
    hits: u64,
    misses: u64,
}

pub struct SemanticCache {
    config: SemanticCacheConfig,
    inner: Mutex<CacheInner>,
}

impl Default for SemanticCache {
    fn default() -> Self {
        Self::new(SemanticCacheConfig::default())
    }
}

impl SemanticCache {
    pub fn new(config: SemanticCacheConfig) -> Self {
        Self { config, inner: Mutex::new(CacheInner::default()) }
    }

    pub fn config(&self) -> &SemanticCacheConfig {
        &self.config
    }

    pub fn lookup(&self, mission: &str) -> Option<CachedCompilation> {
        self.lookup_at(mission, Utc::now())
    }

    pub fn lookup_at(&self, mission: &str, now: DateTime<Utc>) -> Option<CachedCompilation> {
        let key = cache_key(mission);
        let mut inner = self.inner.lock();

        let exact = inner.entries.get(&key).filter(|e| !self.is_expired(e, now)).map(|_| key.clone());
        let found = exact.or_else(|| {
            if !self.config.enable_similarity {
                return None;
            }
            let tokens = tokenize(mission);
            inner
                .entries
                .values()
                .filter(|e| !self.is_expired(e, now))
                .map(|e| (jaccard(&tokens, &tokenize(&e.mission)), e))
                .filter(|(score, _)| *score >= self.config.similarity_threshold)
                .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(_, e)| e.key.clone())
        });

        let Some(found) = found else {
            inner.misses += 1;
            log::debug!("Cache miss for mission key {}", key);
            return None;
        };

        inner.hits += 1;
        let mut entry = inner.entries.shift_remove(&found)?;
        entry.hit_count += 1;
        entry.last_accessed_at = now;
        inner.entries.insert(found.clone(), entry.clone());
        log::debug!("Cache hit for mission key {} (entry {})", key, found);
        Some(entry)
    }

    pub fn store(
        &self,
        mission: &str,
        actions: Vec<MissionAction>,
        route: impl Into<String>,
        complexity: f64,
        embedding: Option<Vec<f32>>,
    ) -> CachedCompilation {
        self.store_at(mission, actions, route, complexity, embedding, Utc::now())
    }

    pub fn store_at(
        &self,
        mission: &str,
        actions: Vec<MissionAction>,
        route: impl Into<String>,
        complexity: f64,
        embedding: Option<Vec<f32>>,
        now: DateTime<Utc>,
    ) -> CachedCompilation {
        let key = cache_key(mission);
        let entry = CachedCompilation {
            key: key.clone(),
            mission: mission.to_string(),
            actions,
            route: route.into(),
            complexity,
            embedding,
            created_at: now,
            last_accessed_at: now,
            hit_count: 0,
        };

        let mut inner = self.inner.lock();
        inner.entries.shift_remove(&key);
        while inner.entries.len() >= self.config.max_entries.max(1) {
            if let Some((evicted, _)) = inner.entries.shift_remove_index(0) {
                log::debug!("Evicted least recently used cache entry {}", evicted);
            }
        }
        inner.entries.insert(key, entry.clone());
        entry
    }

    pub fn contains(&self, mission: &str) -> bool {
        let now = Utc::now();
        self.inner.lock().entries.get(&cache_key(mission)).is_some_and(|e| !self.is_expired(e, now))
    }

    pub fn invalidate(&self, mission: &str) -> bool {
        self.inner.lock().entries.shift_remove(&cache_key(mission)).is_some()
    }

    pub fn warm_up(&self, entries: Vec<WarmEntry>) {
        for entry in entries {
            self.store(&entry.mission, entry.actions, entry.route, entry.complexity, None);
        }
    }

    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    /// Drop every expired entry regardless of access
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !self.is_expired(e, now));
        let swept = before - inner.entries.len();
        if swept > 0 {
            log::debug!("Swept {} expired cache entries", swept);
        }
        swept
    }

    pub fn clear(&self) {
        *self.inner.lock() = CacheInner::default();
    }

    pub fn entries(&self) -> Vec<CachedCompilation> {
        self.inner.lock().entries.values().cloned().collect()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let total = inner.hits + inner.misses;
        CacheStats {
            size: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total > 0 { inner.hits as f64 / total as f64 } else { 0.0 },
            memory_bytes: inner.entries.values().map(CachedCompilation::estimated_size).sum(),
        }
    }

    fn is_expired(&self, entry: &CachedCompilation, now: DateTime<Utc>) -> bool {
        now - entry.created_at > Duration::milliseconds(self.config.ttl_ms.min(i64::MAX as u64) as i64)
    }
}

/// Lowercase, punctuation stripped, whitespace collapsed
pub fn normalize_mission(mission: &str) -> String {
    mission
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// SHA-256 of the normalised mission, hex encoded
pub fn cache_key(mission: &str) -> String {
    format!("intent_{}", hex::encode(Sha256::digest(normalize_mission(mission).as_bytes())))
}

/// Words longer than two characters plus adjacent-word bigrams
pub fn tokenize(text: &str) -> HashSet<String> {
    let normalized = normalize_mission(text);
    let words: Vec<&str> = normalized.split(' ').filter(|w| w.chars().count() > 2).collect();
    let bigrams = words.windows(2).map(|pair| format!("{}_{}", pair[0], pair[1]));
    words.iter().map(|w| w.to_string()).chain(bigrams).collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}
