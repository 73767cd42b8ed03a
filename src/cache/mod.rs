//! Caching in front of mission compilation

pub mod semantic;

pub use semantic::{
    CacheStats, CachedCompilation, SemanticCache, SemanticCacheConfig, WarmEntry, cache_key, normalize_mission, tokenize,
};
