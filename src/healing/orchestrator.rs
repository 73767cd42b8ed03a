//! Escalation pipeline for one broken locator
//!
//! Strategies are tried in the order implied by the CRAG decision, then the fixed
//! priority order. Executors are registered per [`SelectorStrategy`] when the
//! orchestrator is built; visual identification is always the last resort.

use crate::error::{ResilienceError, Result};
use crate::healing::context::ElementContext;
use crate::healing::crag::{CragAction, CragDecision, build_visual_query};
use crate::healing::drift::SelectorHealth;
use crate::healing::memory::HealingRecord;
use crate::selector::{Selector, SelectorCandidate, SelectorProbe, SelectorStrategy};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::{task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;

/// One strategy invocation handed to an executor
#[derive(Debug, Clone)]
pub struct StrategyRequest {
    pub strategy: SelectorStrategy,
    pub broken_selector: String,
    pub context: ElementContext,
    /// Locators of this strategy to try, best first. Empty for visual.
    pub selectors: Vec<Selector>,
    pub visual_query: Option<String>,
}

/// Resolves a [`StrategyRequest`] against the page
#[async_trait]
pub trait StrategyExecutor: Send + Sync {
    /// `Ok(Some(_))` is a working locator, `Ok(None)` means nothing matched
    async fn attempt(&self, request: &StrategyRequest) -> Result<Option<Selector>>;
}

/// Outcome of one strategy attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyAttempt {
    pub strategy: SelectorStrategy,
    pub selector: Option<Selector>,
    pub success: bool,
    pub duration_ms: u64,
    pub confidence: f64,
    pub error: Option<String>,
    /// Aborted before finishing (fan-out winner found, cancellation, or timeout)
    pub cancelled: bool,
}

impl StrategyAttempt {
    fn cancelled(strategy: SelectorStrategy, reason: &str) -> Self {
        Self {
            strategy,
            selector: None,
            success: false,
            duration_ms: 0,
            confidence: 0.0,
            error: Some(reason.to_string()),
            cancelled: true,
        }
    }

    fn failed(strategy: SelectorStrategy, reason: String) -> Self {
        Self { cancelled: false, error: Some(reason), ..Self::cancelled(strategy, "") }
    }
}

pub type AttemptListener = Arc<dyn Fn(&StrategyAttempt) + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_strategies: usize,
    pub healing_timeout_ms: u64,
    /// A success at or above this confidence ends healing even when collecting
    pub early_exit_confidence: f64,
    /// Fan out cheap strategies concurrently for DECOMPOSE decisions
    pub parallel: bool,
    pub stop_on_first_success: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_strategies: 5,
            healing_timeout_ms: 10_000,
            early_exit_confidence: 0.9,
            parallel: false,
            stop_on_first_success: true,
        }
    }
}

/// Everything the orchestrator needs to heal one locator
#[derive(Debug, Clone)]
pub struct HealingRequest {
    pub broken_selector: String,
    pub context: ElementContext,
    pub url: String,
    pub candidates: Vec<SelectorCandidate>,
    pub history: Vec<HealingRecord>,
    pub decision: CragDecision,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealingOutcome {
    pub success: bool,
    pub original_selector: String,
    pub healed_selector: Option<Selector>,
    pub attempts: Vec<StrategyAttempt>,
    pub crag_action: CragAction,
    /// Confidence of the winning attempt
    pub confidence: f64,
    pub decision_confidence: f64,
    pub total_duration_ms: u64,
}

impl HealingOutcome {
    /// Healed locator, or the full decision trail as [`ResilienceError::HealingExhausted`]
    pub fn into_result(self, health: Option<SelectorHealth>) -> Result<Selector> {
        match self.healed_selector {
            Some(selector) if self.success => Ok(selector),
            _ => Err(ResilienceError::HealingExhausted {
                selector: self.original_selector,
                attempts: self.attempts,
                confidence: self.decision_confidence,
                health,
            }),
        }
    }
}

pub struct HealingOrchestratorBuilder {
    config: OrchestratorConfig,
    executors: HashMap<SelectorStrategy, Arc<dyn StrategyExecutor>>,
}

impl HealingOrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn executor(mut self, strategy: SelectorStrategy, executor: Arc<dyn StrategyExecutor>) -> Self {
        self.executors.insert(strategy, executor);
        self
    }

    /// Register one executor for every cheap strategy
    pub fn dom_executor(mut self, executor: Arc<dyn StrategyExecutor>) -> Self {
        for strategy in SelectorStrategy::PRIORITY.into_iter().filter(SelectorStrategy::is_cheap) {
            self.executors.insert(strategy, executor.clone());
        }
        self
    }

    pub fn build(self) -> HealingOrchestrator {
        HealingOrchestrator { config: self.config, executors: self.executors, listeners: RwLock::new(Vec::new()) }
    }
}

pub struct HealingOrchestrator {
    config: OrchestratorConfig,
    executors: HashMap<SelectorStrategy, Arc<dyn StrategyExecutor>>,
    listeners: RwLock<Vec<AttemptListener>>,
}

impl HealingOrchestrator {
    pub fn builder() -> HealingOrchestratorBuilder {
        HealingOrchestratorBuilder { config: OrchestratorConfig::default(), executors: HashMap::new() }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn has_visual(&self) -> bool {
        self.executors.contains_key(&SelectorStrategy::Visual)
    }

    /// Observe every attempt, successful or not
    pub fn on_attempt(&self, listener: AttemptListener) {
        self.listeners.write().push(listener);
    }

    /// Strategies in execution order for this request
    pub fn plan(&self, request: &HealingRequest) -> Vec<SelectorStrategy> {
        let decision = &request.decision;
        let preferred: Vec<SelectorStrategy> = match decision.action {
            CragAction::Generate | CragAction::Decompose => decision.proposed().iter().map(|s| s.strategy).collect(),
            CragAction::Websearch => Vec::new(),
        };

        let mut seen = HashSet::new();
        let mut cheap: Vec<SelectorStrategy> = preferred
            .into_iter()
            .chain(SelectorStrategy::PRIORITY)
            .filter(|s| s.is_cheap() && seen.insert(*s))
            .filter(|s| self.executors.contains_key(s) && !selectors_for(request, *s).is_empty())
            .collect();

        if self.has_visual() {
            cheap.truncate(self.config.max_strategies.saturating_sub(1));
            if self.config.max_strategies > 0 {
                cheap.push(SelectorStrategy::Visual);
            }
        } else {
            cheap.truncate(self.config.max_strategies);
        }
        cheap
    }

    pub async fn orchestrate(&self, request: &HealingRequest, cancel: &CancellationToken) -> HealingOutcome {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.config.healing_timeout_ms);
        let plan = self.plan(request);
        log::debug!(
            "Healing '{}' with {} via {:?}",
            request.broken_selector,
            request.decision.action,
            plan.iter().map(SelectorStrategy::as_str).collect::<Vec<_>>()
        );

        let (cheap, visual): (Vec<SelectorStrategy>, Vec<SelectorStrategy>) =
            plan.into_iter().partition(SelectorStrategy::is_cheap);

        let mut attempts = if self.config.parallel && request.decision.action == CragAction::Decompose {
            self.run_parallel(&cheap, request, deadline, cancel).await
        } else {
            self.run_sequential(&cheap, request, deadline, cancel).await
        };

        if !self.satisfied(&attempts) {
            attempts.extend(self.run_sequential(&visual, request, deadline, cancel).await);
        }

        let winner = attempts
            .iter()
            .filter(|a| a.success)
            .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal));
        let healed_selector = winner.and_then(|a| a.selector.clone());
        let confidence = winner.map(|a| a.confidence).unwrap_or(0.0);
        let total_duration_ms = started.elapsed().as_millis() as u64;

        match &healed_selector {
            Some(selector) => log::info!(
                "Healed '{}' -> {} after {} attempts in {}ms",
                request.broken_selector,
                selector,
                attempts.len(),
                total_duration_ms
            ),
            None => log::warn!(
                "Healing exhausted for '{}' after {} attempts",
                request.broken_selector,
                attempts.len()
            ),
        }

        HealingOutcome {
            success: healed_selector.is_some(),
            original_selector: request.broken_selector.clone(),
            healed_selector,
            attempts,
            crag_action: request.decision.action,
            confidence,
            decision_confidence: request.decision.confidence,
            total_duration_ms,
        }
    }

    fn satisfied(&self, attempts: &[StrategyAttempt]) -> bool {
        attempts.iter().any(|a| {
            a.success && (self.config.stop_on_first_success || a.confidence >= self.config.early_exit_confidence)
        })
    }

    async fn run_sequential(
        &self,
        strategies: &[SelectorStrategy],
        request: &HealingRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Vec<StrategyAttempt> {
        let mut attempts = Vec::new();
        for strategy in strategies {
            if cancel.is_cancelled() {
                attempts.push(StrategyAttempt::cancelled(*strategy, "cancelled"));
                self.emit(attempts.last());
                break;
            }
            if Instant::now() >= deadline {
                log::debug!("Healing timeout reached before trying {}", strategy);
                break;
            }
            let Some(executor) = self.executors.get(strategy) else {
                continue;
            };

            let attempt =
                run_attempt(executor.clone(), strategy_request(request, *strategy), deadline, cancel.clone()).await;
            let stop = attempt.success
                && (self.config.stop_on_first_success || attempt.confidence >= self.config.early_exit_confidence);
            let interrupted = attempt.cancelled;
            attempts.push(attempt);
            self.emit(attempts.last());
            if stop || interrupted {
                break;
            }
        }
        attempts
    }

    async fn run_parallel(
        &self,
        strategies: &[SelectorStrategy],
        request: &HealingRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Vec<StrategyAttempt> {
        let fan_out = cancel.child_token();
        let mut set = JoinSet::new();
        let mut spawned: HashMap<tokio::task::Id, SelectorStrategy> = HashMap::new();
        for strategy in strategies {
            if let Some(executor) = self.executors.get(strategy) {
                let handle =
                    set.spawn(run_attempt(executor.clone(), strategy_request(request, *strategy), deadline, fan_out.clone()));
                spawned.insert(handle.id(), *strategy);
            }
        }

        let mut attempts: Vec<StrategyAttempt> = Vec::new();
        let mut satisfied = false;
        while let Some(joined) = set.join_next().await {
            let attempt = match joined {
                Ok(attempt) => attempt,
                Err(e) => {
                    log::warn!("Strategy task failed: {}", e);
                    let Some(strategy) = spawned.get(&e.id()).copied() else { continue };
                    if e.is_panic() {
                        StrategyAttempt::failed(strategy, format!("strategy task panicked: {}", e))
                    } else {
                        StrategyAttempt::cancelled(strategy, "strategy task cancelled")
                    }
                }
            };
            satisfied = self.satisfied(std::slice::from_ref(&attempt));
            attempts.push(attempt);
            self.emit(attempts.last());
            if satisfied {
                fan_out.cancel();
                set.abort_all();
                break;
            }
        }

        if satisfied {
            let finished: HashSet<SelectorStrategy> = attempts.iter().map(|a| a.strategy).collect();
            for strategy in strategies.iter().filter(|s| spawned.values().any(|v| v == *s) && !finished.contains(*s)) {
                attempts.push(StrategyAttempt::cancelled(*strategy, "aborted after another strategy succeeded"));
                self.emit(attempts.last());
            }
        }
        attempts
    }

    fn emit(&self, attempt: Option<&StrategyAttempt>) {
        let Some(attempt) = attempt else { return };
        log::debug!(
            "Strategy {} {} in {}ms{}",
            attempt.strategy,
            if attempt.success { "succeeded" } else { "failed" },
            attempt.duration_ms,
            attempt.error.as_deref().map(|e| format!(": {}", e)).unwrap_or_default()
        );
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(attempt);
        }
    }
}

/// Locators of `strategy` drawn from the decision, fresh candidates and history, deduplicated
fn selectors_for(request: &HealingRequest, strategy: SelectorStrategy) -> Vec<Selector> {
    let mut seen = HashSet::new();
    request
        .decision
        .proposed()
        .into_iter()
        .chain(request.candidates.iter().map(|c| c.selector.clone()))
        .chain(request.history.iter().map(|r| r.healed_selector.clone()))
        .filter(|s| s.strategy == strategy && seen.insert(s.value.clone()))
        .collect()
}

fn strategy_request(request: &HealingRequest, strategy: SelectorStrategy) -> StrategyRequest {
    let visual_query = (strategy == SelectorStrategy::Visual).then(|| {
        request.decision.visual_query.clone().unwrap_or_else(|| {
            build_visual_query(&request.candidates, &request.history, Some(&request.context))
        })
    });
    StrategyRequest {
        strategy,
        broken_selector: request.broken_selector.clone(),
        context: request.context.clone(),
        selectors: selectors_for(request, strategy),
        visual_query,
    }
}

async fn run_attempt(
    executor: Arc<dyn StrategyExecutor>,
    request: StrategyRequest,
    deadline: Instant,
    cancel: CancellationToken,
) -> StrategyAttempt {
    let started = Instant::now();
    let strategy = request.strategy;

    let result = tokio::select! {
        _ = cancel.cancelled() => return StrategyAttempt::cancelled(strategy, "cancelled"),
        result = tokio::time::timeout_at(deadline, executor.attempt(&request)) => result,
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    let mut attempt = StrategyAttempt {
        strategy,
        selector: None,
        success: false,
        duration_ms,
        confidence: 0.0,
        error: None,
        cancelled: false,
    };
    match result {
        Ok(Ok(Some(selector))) => {
            attempt.confidence = selector.confidence;
            attempt.selector = Some(selector);
            attempt.success = true;
        }
        Ok(Ok(None)) => attempt.error = Some("no matching element".to_string()),
        Ok(Err(e)) => attempt.error = Some(e.to_string()),
        Err(_) => {
            attempt.error = Some("healing timeout reached".to_string());
            attempt.cancelled = true;
        }
    }
    attempt
}

/// Cheap-strategy executor backed by a live page probe
///
/// Returns the first locator matching exactly one element, else the first matching any.
pub struct ProbeExecutor {
    probe: Arc<dyn SelectorProbe>,
}

impl ProbeExecutor {
    pub fn new(probe: Arc<dyn SelectorProbe>) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl StrategyExecutor for ProbeExecutor {
    async fn attempt(&self, request: &StrategyRequest) -> Result<Option<Selector>> {
        let mut fallback = None;
        let mut last_error = None;
        let mut probed = 0;

        for selector in &request.selectors {
            match self.probe.count_matches(selector).await {
                Ok(1) => return Ok(Some(selector.clone())),
                Ok(0) => probed += 1,
                Ok(_) => {
                    probed += 1;
                    if fallback.is_none() {
                        fallback = Some(selector.clone());
                    }
                }
                Err(e) => {
                    log::debug!("Probe failed for {}: {}", selector, e);
                    last_error = Some(e);
                }
            }
        }

        match (fallback, last_error) {
            (Some(selector), _) => Ok(Some(selector)),
            (None, Some(e)) if probed == 0 => Err(e),
            _ => Ok(None),
        }
    }
}
