//! Self-healing pipeline
//!
//! Glue from a broken locator to a working one: working memory, then procedural
//! and episodic history, then fresh candidates through CRAG and the orchestrator.
//! Successful healings are written back so the next break heals cheaper.

use crate::error::Result;
use crate::dom::ElementInfo;
use crate::healing::context::{ElementContext, extract_domain};
use crate::healing::crag::{CragContext, CragDecision, CragEngine};
use crate::healing::drift::DriftDetector;
use crate::healing::memory::{HealingMemory, HealingRecord};
use crate::healing::orchestrator::{HealingOrchestrator, HealingOutcome, HealingRequest};
use crate::healing::procedural::{PatternMatch, PatternQuery};
use crate::selector::{Selector, SelectorEngine, SelectorProbe};
use serde::Serialize;
use std::{collections::HashSet, sync::Arc};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct HealRequest {
    pub broken: Selector,
    pub context: ElementContext,
    /// Last known description of the element, used for fresh candidates
    pub element: Option<ElementInfo>,
    pub url: String,
}

impl HealRequest {
    pub fn new(broken: Selector, context: ElementContext, url: impl Into<String>) -> Self {
        Self { broken, context, element: None, url: url.into() }
    }

    pub fn with_element(mut self, element: ElementInfo) -> Self {
        self.element = Some(element);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealSource {
    /// Reused from working memory for the current page
    Working,
    Orchestrated,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealResult {
    pub selector: Selector,
    pub source: HealSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<CragDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<HealingOutcome>,
}

pub struct SelfHealer {
    engine: SelectorEngine,
    memory: Arc<HealingMemory>,
    drift: Arc<DriftDetector>,
    crag: Arc<CragEngine>,
    orchestrator: Arc<HealingOrchestrator>,
    probe: Option<Arc<dyn SelectorProbe>>,
}

impl SelfHealer {
    pub fn new(
        engine: SelectorEngine,
        memory: Arc<HealingMemory>,
        drift: Arc<DriftDetector>,
        crag: Arc<CragEngine>,
        orchestrator: Arc<HealingOrchestrator>,
    ) -> Self {
        Self { engine, memory, drift, crag, orchestrator, probe: None }
    }

    /// Verify working-memory hits and fresh candidates against a live page
    pub fn with_probe(mut self, probe: Arc<dyn SelectorProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn memory(&self) -> &Arc<HealingMemory> {
        &self.memory
    }

    pub fn drift(&self) -> &Arc<DriftDetector> {
        &self.drift
    }

    pub fn crag(&self) -> &Arc<CragEngine> {
        &self.crag
    }

    pub async fn heal(&self, request: &HealRequest, cancel: &CancellationToken) -> Result<HealResult> {
        if let Some(selector) = self.working_hit(request).await {
            log::debug!("Working memory hit for '{}': {}", request.broken.value, selector);
            return Ok(HealResult { selector, source: HealSource::Working, decision: None, outcome: None });
        }

        let pattern = self.memory.procedural().find_best_match(&pattern_query(request));
        let history = self.history(request, pattern.as_ref());

        let candidates = match (&request.element, &self.probe) {
            (Some(element), Some(probe)) => self.engine.generate_verified(element, probe.as_ref()).await,
            (Some(element), None) => self.engine.generate(element),
            (None, _) => Vec::new(),
        };

        let decision = self.crag.decide(&CragContext {
            candidates: &candidates,
            history: &history,
            element: Some(&request.context),
            visual_available: self.orchestrator.has_visual(),
        });

        let healing_request = HealingRequest {
            broken_selector: request.broken.value.clone(),
            context: request.context.clone(),
            url: request.url.clone(),
            candidates,
            history,
            decision: decision.clone(),
        };
        let outcome = self.orchestrator.orchestrate(&healing_request, cancel).await;

        match outcome.healed_selector.clone().filter(|_| outcome.success) {
            Some(selector) => {
                self.write_back(request, &healing_request.history, pattern.as_ref(), &outcome, &selector);
                Ok(HealResult { selector, source: HealSource::Orchestrated, decision: Some(decision), outcome: Some(outcome) })
            }
            None => {
                self.mark_failed(&healing_request.history, pattern.as_ref(), &outcome);
                let health = self.drift.get_health(&request.broken.value, request.broken.strategy).health;
                outcome.into_result(Some(health)).map(|selector| HealResult {
                    selector,
                    source: HealSource::Orchestrated,
                    decision: None,
                    outcome: None,
                })
            }
        }
    }

    /// A healed locator failed when used: drop it from working memory and lower its record
    pub fn reject(&self, request: &HealRequest, healed: &Selector) {
        if self.memory.get_working_selector(&request.broken.value).is_some_and(|s| s.value == healed.value) {
            self.memory.forget_working_selector(&request.broken.value);
        }
        for record in self.memory.find_similar_healings(&request.broken.value, &request.context, &request.url) {
            if record.broken_selector == request.broken.value && record.healed_selector.value == healed.value {
                self.memory.mark_reused(&record.id, false);
            }
        }
    }

    async fn working_hit(&self, request: &HealRequest) -> Option<Selector> {
        let selector = self.memory.get_working_selector(&request.broken.value)?;
        let Some(probe) = &self.probe else {
            return Some(selector);
        };
        match probe.count_matches(&selector).await {
            Ok(count) if count > 0 => Some(selector),
            _ => {
                self.memory.forget_working_selector(&request.broken.value);
                None
            }
        }
    }

    /// Procedural match first, then similar episodic records, one per healed locator
    fn history(&self, request: &HealRequest, pattern: Option<&PatternMatch>) -> Vec<HealingRecord> {
        let mut seen = HashSet::new();
        let from_pattern = pattern.map(|m| {
            let pattern = &m.pattern;
            let mut record = HealingRecord::new(
                pattern.original_selector.clone(),
                pattern.healed_selector.clone(),
                request.context.clone(),
                request.url.clone(),
            );
            record.id = pattern.source_record_id.clone().unwrap_or_else(|| pattern.id.clone());
            record.reuse_count = pattern.use_count;
            record.success_rate = pattern.success_rate * pattern.decay_factor;
            record
        });

        from_pattern
            .into_iter()
            .chain(self.memory.find_similar_healings(&request.broken.value, &request.context, &request.url))
            .filter(|r| seen.insert(r.healed_selector.value.clone()))
            .collect()
    }

    fn write_back(
        &self,
        request: &HealRequest,
        history: &[HealingRecord],
        pattern: Option<&PatternMatch>,
        outcome: &HealingOutcome,
        healed: &Selector,
    ) {
        let reused = history.iter().find(|r| r.healed_selector.value == healed.value);
        match reused.filter(|r| self.memory.get_record(&r.id).is_some()) {
            Some(record) => self.memory.mark_reused(&record.id, true),
            None => {
                self.memory.record_healing(
                    request.broken.value.clone(),
                    healed.clone(),
                    request.context.clone(),
                    request.url.clone(),
                );
            }
        }

        // mirrored patterns are updated through their episodic record
        if let Some(m) = pattern.filter(|m| !self.is_mirrored(m)) {
            if m.pattern.healed_selector.value == healed.value {
                self.memory.procedural().record_usage(&m.pattern.id, true);
            } else if attempted_and_failed(outcome, &m.pattern.healed_selector) {
                self.memory.procedural().record_usage(&m.pattern.id, false);
            }
        }

        self.memory.set_working_selector(request.broken.value.clone(), healed.clone());
        log::info!(
            "Healed '{}' on {} -> {} ({:?})",
            request.broken.value,
            extract_domain(&request.url),
            healed,
            outcome.crag_action
        );
    }

    fn mark_failed(&self, history: &[HealingRecord], pattern: Option<&PatternMatch>, outcome: &HealingOutcome) {
        for record in history.iter().filter(|r| attempted_and_failed(outcome, &r.healed_selector)) {
            if self.memory.get_record(&record.id).is_some() {
                self.memory.mark_reused(&record.id, false);
            }
        }
        if let Some(m) = pattern.filter(|m| !self.is_mirrored(m)) {
            if attempted_and_failed(outcome, &m.pattern.healed_selector) {
                self.memory.procedural().record_usage(&m.pattern.id, false);
            }
        }
    }

    fn is_mirrored(&self, m: &PatternMatch) -> bool {
        m.pattern.source_record_id.as_deref().is_some_and(|id| self.memory.get_record(id).is_some())
    }
}

fn pattern_query(request: &HealRequest) -> PatternQuery {
    let context = &request.context;
    PatternQuery::new(request.broken.value.clone())
        .with_domain(extract_domain(&request.url))
        .with_element_type(context.expected_tag.clone().unwrap_or_else(|| "element".to_string()))
        .with_action_type(context.action.as_str())
        .with_fingerprint(context.fingerprint())
}

fn attempted_and_failed(outcome: &HealingOutcome, selector: &Selector) -> bool {
    outcome.attempts.iter().any(|a| a.strategy == selector.strategy && !a.success && !a.cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResilienceError;
    use crate::healing::context::ActionKind;
    use crate::healing::orchestrator::{StrategyExecutor, StrategyRequest};
    use crate::selector::{SelectorEngineConfig, SelectorStrategy};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Accepts exactly one locator value, recording every request
    struct AcceptOne {
        value: String,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl StrategyExecutor for AcceptOne {
        async fn attempt(&self, request: &StrategyRequest) -> Result<Option<Selector>> {
            *self.calls.lock() += 1;
            Ok(request.selectors.iter().find(|s| s.value == self.value).cloned())
        }
    }

    fn healer(accept: &str) -> (SelfHealer, Arc<AcceptOne>) {
        let executor = Arc::new(AcceptOne { value: accept.to_string(), calls: Mutex::new(0) });
        let orchestrator = HealingOrchestrator::builder().dom_executor(executor.clone()).build();
        let healer = SelfHealer::new(
            SelectorEngine::new(SelectorEngineConfig::default()),
            Arc::new(HealingMemory::default()),
            Arc::new(DriftDetector::default()),
            Arc::new(CragEngine::default()),
            Arc::new(orchestrator),
        );
        (healer, executor)
    }

    fn request() -> HealRequest {
        let element = ElementInfo::new("button").with_attribute("data-testid", "checkout").with_text("Checkout");
        HealRequest::new(
            Selector::css("#checkout-btn-3f9a"),
            ElementContext::new(ActionKind::Click).with_expected_tag("button").with_near_text("Checkout"),
            "https://shop.example.com/cart",
        )
        .with_element(element)
    }

    #[tokio::test]
    async fn test_heal_writes_back_and_reuses_working_memory() {
        let (healer, executor) = healer("[data-testid=\"checkout\"]");
        let request = request();

        let first = healer.heal(&request, &CancellationToken::new()).await.unwrap();
        assert_eq!(first.source, HealSource::Orchestrated);
        assert_eq!(first.selector.strategy, SelectorStrategy::TestId);
        assert_eq!(healer.memory().stats().episodic_size, 1);

        let calls = *executor.calls.lock();
        let second = healer.heal(&request, &CancellationToken::new()).await.unwrap();
        assert_eq!(second.source, HealSource::Working);
        assert_eq!(second.selector, first.selector);
        assert_eq!(*executor.calls.lock(), calls);
    }

    #[tokio::test]
    async fn test_heal_reuses_episodic_record() {
        let (healer, _) = healer("[data-testid=\"checkout\"]");
        let request = request();

        healer.heal(&request, &CancellationToken::new()).await.unwrap();
        healer.memory().clear_working_memory();
        let result = healer.heal(&request, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.source, HealSource::Orchestrated);
        let records = healer.memory().export_memory().episodic;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reuse_count, 1);
    }

    #[tokio::test]
    async fn test_heal_failure_reports_health() {
        let (healer, _) = healer("nothing-matches");
        let request = request();
        healer.drift().record_failure(&request.broken.value, SelectorStrategy::Css, 10);

        match healer.heal(&request, &CancellationToken::new()).await {
            Err(ResilienceError::HealingExhausted { selector, attempts, health, .. }) => {
                assert_eq!(selector, "#checkout-btn-3f9a");
                assert!(!attempts.is_empty());
                assert!(health.is_some());
            }
            other => panic!("unexpected result: {:?}", other.map(|r| r.selector)),
        }
        assert_eq!(healer.memory().stats().episodic_size, 0);
    }

    #[tokio::test]
    async fn test_reject_forgets_working_selector() {
        let (healer, _) = healer("[data-testid=\"checkout\"]");
        let request = request();
        let healed = healer.heal(&request, &CancellationToken::new()).await.unwrap().selector;

        healer.reject(&request, &healed);
        assert!(healer.memory().get_working_selector(&request.broken.value).is_none());
        let record = &healer.memory().export_memory().episodic[0];
        assert!(record.success_rate < 1.0);
    }
}
