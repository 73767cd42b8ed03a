//! Selector healing
//!
//! - [`HealingMemory`] / [`ProceduralMemory`]: what healed before, and how reliably
//! - [`DriftDetector`]: per-locator health from usage history
//! - [`CragEngine`]: confidence-gated choice between committing, trying several, or going visual
//! - [`HealingOrchestrator`]: runs the registered strategy executors
//! - [`SelfHealer`]: the whole pipeline with memory write-back

pub mod context;
pub mod crag;
pub mod drift;
pub mod memory;
pub mod orchestrator;
pub mod pipeline;
pub mod procedural;

pub use context::{ActionKind, ElementContext, extract_domain};
pub use crag::{
    ActionDistribution, ActionSuccessRates, CragAction, CragConfig, CragContext, CragDecision, CragEngine,
    CragMetrics, CragThresholds, CragTuning, build_visual_query,
};
pub use drift::{
    DriftConfig, DriftDetector, DriftEvent, DriftEventType, DriftListener, DriftStats, SelectorHealth,
    SelectorHealthMetrics, SelectorUsage,
};
pub use memory::{HealingMemory, HealingMemoryConfig, HealingRecord, MemoryExport, MemoryStats, SimilarityWeights};
pub use orchestrator::{
    AttemptListener, HealingOrchestrator, HealingOrchestratorBuilder, HealingOutcome, HealingRequest,
    OrchestratorConfig, ProbeExecutor, StrategyAttempt, StrategyExecutor, StrategyRequest,
};
pub use pipeline::{HealRequest, HealResult, HealSource, SelfHealer};
pub use procedural::{
    HealingPattern, MatchType, PatternMatch, PatternQuery, ProceduralMemory, ProceduralMemoryConfig, ProceduralStats,
    extract_pattern,
};
