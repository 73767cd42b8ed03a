//! Confidence-gated escalation (CRAG)
//!
//! Candidate confidence plus a bounded historical boost selects one of three
//! actions: commit to the best locator ([`CragAction::Generate`]), try several
//! cheap locators ([`CragAction::Decompose`]), or escalate to visual
//! identification ([`CragAction::Websearch`]).

use crate::healing::context::ElementContext;
use crate::healing::memory::HealingRecord;
use crate::selector::{Selector, SelectorCandidate, SelectorStrategy, parse_text_locator};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::{HashSet, VecDeque},
    fmt,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CragAction {
    Generate,
    Decompose,
    Websearch,
}

impl fmt::Display for CragAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CragAction::Generate => "GENERATE",
            CragAction::Decompose => "DECOMPOSE",
            CragAction::Websearch => "WEBSEARCH",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CragDecision {
    pub action: CragAction,
    pub confidence: f64,
    pub reason: String,
    /// Committed locator for GENERATE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<Selector>,
    /// Locators to try for DECOMPOSE, at most one per strategy from fresh candidates
    #[serde(default)]
    pub strategies_to_try: Vec<Selector>,
    /// Natural-language description for the visual provider on WEBSEARCH
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual_query: Option<String>,
}

impl CragDecision {
    /// Locators the decision proposes, in order
    pub fn proposed(&self) -> Vec<Selector> {
        self.selected.iter().cloned().chain(self.strategies_to_try.iter().cloned()).collect()
    }
}

/// Inputs for one decision
#[derive(Debug, Clone, Copy)]
pub struct CragContext<'a> {
    /// Fresh candidates, best first
    pub candidates: &'a [SelectorCandidate],
    /// Similar past healings, best first
    pub history: &'a [HealingRecord],
    pub element: Option<&'a ElementContext>,
    /// Whether a visual executor is available for WEBSEARCH
    pub visual_available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CragThresholds {
    pub generate: f64,
    pub decompose: f64,
}

impl Default for CragThresholds {
    fn default() -> Self {
        Self { generate: 0.7, decompose: 0.4 }
    }
}

/// Step sizes, bounds and guards for [`CragEngine::auto_tune_thresholds`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CragTuning {
    /// GENERATE success below this raises the generate threshold
    pub generate_target_rate: f64,
    pub generate_raise_step: f64,
    pub generate_max: f64,
    /// DECOMPOSE success above this, while underused, lowers the generate threshold
    pub decompose_success_rate: f64,
    pub decompose_underuse_ratio: f64,
    pub generate_lower_step: f64,
    pub generate_min: f64,
    /// WEBSEARCH share above this lowers the decompose threshold
    pub websearch_ratio: f64,
    pub decompose_lower_step: f64,
    pub decompose_min: f64,
    pub min_decisions_between_tunes: u64,
    /// Consecutive opposite signals needed before reversing the last adjustment
    pub reversal_confirmations: u32,
}

impl Default for CragTuning {
    fn default() -> Self {
        Self {
            generate_target_rate: 0.7,
            generate_raise_step: 0.05,
            generate_max: 0.9,
            decompose_success_rate: 0.8,
            decompose_underuse_ratio: 0.3,
            generate_lower_step: 0.02,
            generate_min: 0.6,
            websearch_ratio: 0.3,
            decompose_lower_step: 0.05,
            decompose_min: 0.3,
            min_decisions_between_tunes: 20,
            reversal_confirmations: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CragConfig {
    pub thresholds: CragThresholds,
    /// Candidates contributing to the rank-weighted confidence
    pub max_weighted_candidates: usize,
    pub max_historical_boost: f64,
    /// Only history above this success rate boosts confidence
    pub historical_success_floor: f64,
    pub decompose_max_candidates: usize,
    pub decompose_max_total: usize,
    /// Candidates kept when WEBSEARCH degrades to DECOMPOSE
    pub degraded_decompose_candidates: usize,
    pub history_size: usize,
    pub tuning: CragTuning,
}

impl Default for CragConfig {
    fn default() -> Self {
        Self {
            thresholds: CragThresholds::default(),
            max_weighted_candidates: 5,
            max_historical_boost: 0.15,
            historical_success_floor: 0.7,
            decompose_max_candidates: 4,
            decompose_max_total: 5,
            degraded_decompose_candidates: 3,
            history_size: 100,
            tuning: CragTuning::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionSummary {
    pub action: CragAction,
    pub confidence: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CragMetrics {
    pub total_decisions: u64,
    pub generate_count: u64,
    pub decompose_count: u64,
    pub websearch_count: u64,
    pub average_confidence: f64,
    /// Most recent decisions, oldest first
    pub recent: VecDeque<DecisionSummary>,
}

/// Share of decisions per action
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ActionDistribution {
    pub generate: f64,
    pub decompose: f64,
    pub websearch: f64,
}

/// Observed real-world success rate per action, supplied by the caller
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActionSuccessRates {
    pub generate: f64,
    pub decompose: f64,
    pub websearch: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

#[derive(Debug, Default)]
struct TuningState {
    decisions_at_last_tune: u64,
    last_generate_direction: Option<Direction>,
    pending_reversals: u32,
}

pub struct CragEngine {
    config: CragConfig,
    thresholds: RwLock<CragThresholds>,
    metrics: Mutex<CragMetrics>,
    tuning: Mutex<TuningState>,
}

impl Default for CragEngine {
    fn default() -> Self {
        Self::new(CragConfig::default())
    }
}

impl CragEngine {
    pub fn new(config: CragConfig) -> Self {
        Self {
            thresholds: RwLock::new(config.thresholds),
            config,
            metrics: Mutex::new(CragMetrics::default()),
            tuning: Mutex::new(TuningState::default()),
        }
    }

    pub fn config(&self) -> &CragConfig {
        &self.config
    }

    pub fn thresholds(&self) -> CragThresholds {
        *self.thresholds.read()
    }

    pub fn decide(&self, ctx: &CragContext<'_>) -> CragDecision {
        let candidate_confidence = self.candidate_confidence(ctx.candidates);
        let boost = self.historical_boost(ctx.history);
        let confidence = (candidate_confidence + boost).clamp(0.0, 1.0);
        let thresholds = self.thresholds();

        let decision = if confidence > thresholds.generate {
            self.generate(ctx, confidence).unwrap_or_else(|| self.decompose(ctx, confidence))
        } else if confidence > thresholds.decompose {
            self.decompose(ctx, confidence)
        } else if ctx.visual_available {
            CragDecision {
                action: CragAction::Websearch,
                confidence,
                reason: "Low confidence in selectors, using visual identification".to_string(),
                selected: None,
                strategies_to_try: Vec::new(),
                visual_query: Some(build_visual_query(ctx.candidates, ctx.history, ctx.element)),
            }
        } else {
            let strategies_to_try: Vec<Selector> = if ctx.candidates.is_empty() {
                ctx.history.iter().take(self.config.degraded_decompose_candidates).map(|r| r.healed_selector.clone()).collect()
            } else {
                ctx.candidates.iter().take(self.config.degraded_decompose_candidates).map(|c| c.selector.clone()).collect()
            };
            CragDecision {
                action: CragAction::Decompose,
                confidence,
                reason: "Low confidence and no visual fallback, trying best available candidates".to_string(),
                selected: None,
                strategies_to_try,
                visual_query: None,
            }
        };

        log::debug!(
            "CRAG {} at {:.3} ({} candidates, {} historical)",
            decision.action,
            decision.confidence,
            ctx.candidates.len(),
            ctx.history.len()
        );
        self.record(&decision);
        decision
    }

    fn generate(&self, ctx: &CragContext<'_>, confidence: f64) -> Option<CragDecision> {
        let (selected, reason) = match ctx.candidates.first() {
            Some(best) => (best.selector.clone(), format!("High confidence in best candidate ({})", best.reason)),
            None => {
                let record = ctx
                    .history
                    .iter()
                    .max_by(|a, b| a.success_rate.partial_cmp(&b.success_rate).unwrap_or(Ordering::Equal))?;
                (record.healed_selector.clone(), "High confidence in historical healing".to_string())
            }
        };
        Some(CragDecision {
            action: CragAction::Generate,
            confidence,
            reason,
            selected: Some(selected),
            strategies_to_try: Vec::new(),
            visual_query: None,
        })
    }

    fn decompose(&self, ctx: &CragContext<'_>, confidence: f64) -> CragDecision {
        let mut used: HashSet<SelectorStrategy> = HashSet::new();
        let mut selectors = Vec::new();

        for candidate in ctx.candidates {
            if selectors.len() >= self.config.decompose_max_candidates {
                break;
            }
            if used.insert(candidate.strategy()) {
                selectors.push(candidate.selector.clone());
            }
        }
        for record in ctx.history {
            if selectors.len() >= self.config.decompose_max_total {
                break;
            }
            if used.insert(record.healed_selector.strategy) {
                selectors.push(record.healed_selector.clone());
            }
        }

        CragDecision {
            action: CragAction::Decompose,
            confidence,
            reason: format!("Moderate confidence, trying {} strategies", selectors.len()),
            selected: None,
            strategies_to_try: selectors,
            visual_query: None,
        }
    }

    /// Rank-weighted mean of `confidence × stability` over the top candidates
    pub fn candidate_confidence(&self, candidates: &[SelectorCandidate]) -> f64 {
        let (sum, weights) = candidates
            .iter()
            .take(self.config.max_weighted_candidates)
            .enumerate()
            .fold((0.0, 0.0), |(sum, weights), (i, c)| {
                let weight = 1.0 / (i as f64 + 1.0);
                (sum + c.confidence() * c.stability_score * weight, weights + weight)
            });
        if weights > 0.0 { sum / weights } else { 0.0 }
    }

    /// Bounded boost from reliable past healings
    pub fn historical_boost(&self, history: &[HealingRecord]) -> f64 {
        let reliable: Vec<f64> = history
            .iter()
            .map(|r| r.success_rate)
            .filter(|rate| *rate > self.config.historical_success_floor)
            .collect();
        if reliable.is_empty() {
            return 0.0;
        }
        let average = reliable.iter().sum::<f64>() / reliable.len() as f64;
        (average * self.config.max_historical_boost).min(self.config.max_historical_boost)
    }

    fn record(&self, decision: &CragDecision) {
        let mut metrics = self.metrics.lock();
        metrics.total_decisions += 1;
        match decision.action {
            CragAction::Generate => metrics.generate_count += 1,
            CragAction::Decompose => metrics.decompose_count += 1,
            CragAction::Websearch => metrics.websearch_count += 1,
        }
        let n = metrics.total_decisions as f64;
        metrics.average_confidence += (decision.confidence - metrics.average_confidence) / n;
        metrics.recent.push_back(DecisionSummary { action: decision.action, confidence: decision.confidence, at: Utc::now() });
        while metrics.recent.len() > self.config.history_size.max(1) {
            metrics.recent.pop_front();
        }
    }

    pub fn metrics(&self) -> CragMetrics {
        self.metrics.lock().clone()
    }

    pub fn distribution(&self) -> ActionDistribution {
        let metrics = self.metrics.lock();
        distribution_of(&metrics)
    }

    pub fn reset_metrics(&self) {
        *self.metrics.lock() = CragMetrics::default();
        self.tuning.lock().decisions_at_last_tune = 0;
    }

    /// Nudge thresholds from observed success rates. Returns true when a threshold moved.
    ///
    /// Skipped until `min_decisions_between_tunes` new decisions arrived; reversing the
    /// previous generate adjustment needs `reversal_confirmations` consecutive signals.
    pub fn auto_tune_thresholds(&self, rates: ActionSuccessRates) -> bool {
        let tuning_config = &self.config.tuning;
        let (total, share) = {
            let metrics = self.metrics.lock();
            (metrics.total_decisions, distribution_of(&metrics))
        };

        let mut state = self.tuning.lock();
        if total.saturating_sub(state.decisions_at_last_tune) < tuning_config.min_decisions_between_tunes {
            return false;
        }
        state.decisions_at_last_tune = total;

        let mut thresholds = self.thresholds.write();
        let before = *thresholds;

        let signal = if rates.generate < tuning_config.generate_target_rate && thresholds.generate < tuning_config.generate_max
        {
            Some(Direction::Up)
        } else if rates.decompose > tuning_config.decompose_success_rate
            && share.decompose < tuning_config.decompose_underuse_ratio
            && thresholds.generate > tuning_config.generate_min
        {
            Some(Direction::Down)
        } else {
            None
        };

        if let Some(direction) = signal {
            let reversal = state.last_generate_direction.is_some_and(|last| last != direction);
            let apply = if reversal {
                state.pending_reversals += 1;
                state.pending_reversals >= tuning_config.reversal_confirmations
            } else {
                true
            };
            if apply {
                state.pending_reversals = 0;
                state.last_generate_direction = Some(direction);
                thresholds.generate = match direction {
                    Direction::Up => (thresholds.generate + tuning_config.generate_raise_step).min(tuning_config.generate_max),
                    Direction::Down => {
                        (thresholds.generate - tuning_config.generate_lower_step).max(tuning_config.generate_min)
                    }
                };
            }
        } else {
            state.pending_reversals = 0;
        }

        if share.websearch > tuning_config.websearch_ratio {
            thresholds.decompose =
                (thresholds.decompose - tuning_config.decompose_lower_step).max(tuning_config.decompose_min);
        }

        let changed = *thresholds != before;
        if changed {
            log::info!(
                "CRAG thresholds tuned: generate {:.2} -> {:.2}, decompose {:.2} -> {:.2}",
                before.generate,
                thresholds.generate,
                before.decompose,
                thresholds.decompose
            );
        }
        changed
    }
}

fn distribution_of(metrics: &CragMetrics) -> ActionDistribution {
    if metrics.total_decisions == 0 {
        return ActionDistribution::default();
    }
    let total = metrics.total_decisions as f64;
    ActionDistribution {
        generate: metrics.generate_count as f64 / total,
        decompose: metrics.decompose_count as f64 / total,
        websearch: metrics.websearch_count as f64 / total,
    }
}

/// Describe the lost element for the visual provider
pub fn build_visual_query(
    candidates: &[SelectorCandidate],
    history: &[HealingRecord],
    element: Option<&ElementContext>,
) -> String {
    let mut parts = Vec::new();

    if let Some(best) = candidates.first() {
        match best.strategy() {
            SelectorStrategy::Text => {
                let (text, _) = parse_text_locator(best.value());
                parts.push(format!("element with text containing \"{}\"", text));
            }
            SelectorStrategy::Aria => parts.push("element with accessibility label".to_string()),
            _ => {}
        }
    }

    let hint = history.first().map(|r| &r.context).or(element);
    if let Some(context) = hint {
        if let Some(near) = context.near_text.as_deref().filter(|t| !t.trim().is_empty()) {
            parts.push(format!("near text \"{}\"", near.trim()));
        }
        if let Some(tag) = &context.expected_tag {
            parts.push(format!("{} element", tag));
        }
    }

    if parts.is_empty() { "interactive element matching the action context".to_string() } else { parts.join(", ") }
}
