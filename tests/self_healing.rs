//! Missions against a scripted page: reactive and proactive healing, the visual
//! fallback, memory reuse and the driver circuit.

use async_trait::async_trait;
use browser_heal::dom::{BoundingBox, ElementInfo};
use browser_heal::error::{ResilienceError, Result};
use browser_heal::healing::{
    CragAction, CragEngine, DriftDetector, HealSource, HealingMemory, HealingOrchestrator, ProbeExecutor, SelfHealer,
    SelectorHealth, StrategyAttempt,
};
use browser_heal::mission::{
    MissionAction, MissionConfig, MissionControl, MissionRunner, MissionState, MissionStateMachine, StepDriver,
};
use browser_heal::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use browser_heal::selector::{
    Prior, Selector, SelectorEngine, SelectorEngineConfig, SelectorPriors, SelectorProbe, SelectorStrategy,
};
use browser_heal::visual::{ScreenshotSource, VisualExecutor, VisualLocator, VisualMatch, VisualRequest};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Page whose DOM resolves a fixed set of locators, plus any coordinate locator
struct ScriptedPage {
    present: Vec<String>,
    accept_coords: bool,
    offline: bool,
    attempts: Mutex<HashMap<String, usize>>,
    performed: Mutex<Vec<String>>,
}

impl ScriptedPage {
    fn new(present: &[&str]) -> Self {
        Self {
            present: present.iter().map(|s| s.to_string()).collect(),
            accept_coords: false,
            offline: false,
            attempts: Mutex::new(HashMap::new()),
            performed: Mutex::new(Vec::new()),
        }
    }

    fn resolves(&self, selector: &Selector) -> bool {
        self.present.contains(&selector.value) || (self.accept_coords && selector.value.starts_with("coords="))
    }

    fn attempts_for(&self, value: &str) -> usize {
        self.attempts.lock().get(value).copied().unwrap_or_default()
    }
}

#[async_trait]
impl StepDriver for ScriptedPage {
    async fn perform(&self, action: &MissionAction, selector: Option<&Selector>) -> Result<Option<serde_json::Value>> {
        let key = selector.map(|s| s.value.clone()).unwrap_or_else(|| action.kind.as_str().to_string());
        *self.attempts.lock().entry(key.clone()).or_default() += 1;

        if self.offline {
            return Err(ResilienceError::ConnectionFailed("ECONNRESET".to_string()));
        }
        if let Some(selector) = selector.filter(|s| !self.resolves(s)) {
            return Err(ResilienceError::ElementNotFound(selector.value.clone()));
        }
        self.performed.lock().push(key);
        Ok(None)
    }

    async fn current_url(&self) -> Result<String> {
        Ok("https://studio.example.com/videos".to_string())
    }
}

#[async_trait]
impl SelectorProbe for ScriptedPage {
    async fn count_matches(&self, selector: &Selector) -> Result<usize> {
        Ok(usize::from(self.resolves(selector)))
    }
}

#[async_trait]
impl ScreenshotSource for ScriptedPage {
    async fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }
}

struct FixedLocator {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl VisualLocator for FixedLocator {
    async fn locate(&self, request: &VisualRequest) -> Result<VisualMatch> {
        self.calls.lock().push(request.query.clone());
        Ok(VisualMatch { found: true, bounding_box: Some(BoundingBox::new(40.0, 300.0, 120.0, 36.0)), confidence: 0.8 })
    }
}

struct Harness {
    page: Arc<ScriptedPage>,
    healer: Arc<SelfHealer>,
    breaker: Arc<CircuitBreaker>,
    locator: Arc<FixedLocator>,
    attempts: Arc<Mutex<Vec<StrategyAttempt>>>,
}

impl Harness {
    fn new(page: ScriptedPage, breaker: CircuitBreakerConfig) -> Self {
        Self::with_engine(page, breaker, SelectorEngine::default())
    }

    fn with_engine(page: ScriptedPage, breaker: CircuitBreakerConfig, engine: SelectorEngine) -> Self {
        let page = Arc::new(page);
        let locator = Arc::new(FixedLocator { calls: Mutex::new(Vec::new()) });
        let orchestrator = HealingOrchestrator::builder()
            .dom_executor(Arc::new(ProbeExecutor::new(page.clone())))
            .executor(SelectorStrategy::Visual, Arc::new(VisualExecutor::new(locator.clone(), page.clone())))
            .build();

        let attempts = Arc::new(Mutex::new(Vec::new()));
        let sink = attempts.clone();
        orchestrator.on_attempt(Arc::new(move |attempt: &StrategyAttempt| sink.lock().push(attempt.clone())));

        let healer = SelfHealer::new(
            engine,
            Arc::new(HealingMemory::default()),
            Arc::new(DriftDetector::default()),
            Arc::new(CragEngine::default()),
            Arc::new(orchestrator),
        )
        .with_probe(page.clone());

        Self {
            page,
            healer: Arc::new(healer),
            breaker: Arc::new(CircuitBreaker::new("driver", breaker)),
            locator,
            attempts,
        }
    }

    fn runner(&self) -> MissionRunner {
        MissionRunner::new(self.page.clone(), self.healer.clone(), self.breaker.clone())
    }
}

fn mission(actions: Vec<MissionAction>) -> MissionStateMachine {
    let mut machine = MissionStateMachine::create(MissionConfig::default());
    machine.initialize(actions);
    machine
}

fn upload_button() -> MissionAction {
    MissionAction::click(Selector::css("#upload-btn"))
        .with_element(ElementInfo::new("button").with_attribute("id", "upload-btn").with_text("Upload"))
        .with_description("click upload")
}

#[tokio::test]
async fn test_visual_fallback_heals_when_no_locator_resolves() {
    let mut page = ScriptedPage::new(&[]);
    page.accept_coords = true;
    let harness = Harness::new(page, CircuitBreakerConfig::default());
    let mut machine = mission(vec![MissionAction::navigate("https://studio.example.com/videos"), upload_button()]);

    let progress = harness.runner().run(&mut machine, &MissionControl::new()).await.unwrap();

    assert_eq!(progress.state, MissionState::Completed);
    let result = machine.steps()[1].result.clone().unwrap();
    assert!(result.healed);
    let used = result.selector_used.unwrap();
    assert_eq!(used.strategy, SelectorStrategy::Visual);
    assert_eq!(used.value, "coords=40,300,120,36");

    assert_eq!(harness.locator.calls.lock().len(), 1);
    let attempts = harness.attempts.lock();
    assert_eq!(attempts.last().map(|a| a.strategy), Some(SelectorStrategy::Visual));
    assert!(attempts.iter().filter(|a| a.strategy != SelectorStrategy::Visual).all(|a| !a.success));
    assert_eq!(harness.healer.memory().stats().episodic_size, 1);
}

#[tokio::test]
async fn test_second_mission_reuses_working_memory() {
    let mut page = ScriptedPage::new(&[]);
    page.accept_coords = true;
    let harness = Harness::new(page, CircuitBreakerConfig::default());

    let mut first = mission(vec![upload_button()]);
    harness.runner().run(&mut first, &MissionControl::new()).await.unwrap();

    let request = browser_heal::healing::HealRequest::new(
        Selector::css("#upload-btn"),
        upload_button().element_context(),
        "https://studio.example.com/videos",
    );
    let reused = harness.healer.heal(&request, &tokio_util::sync::CancellationToken::new()).await.unwrap();
    assert_eq!(reused.source, HealSource::Working);

    let mut second = mission(vec![upload_button()]);
    harness.runner().run(&mut second, &MissionControl::new()).await.unwrap();

    assert_eq!(second.state(), MissionState::Completed);
    assert_eq!(harness.locator.calls.lock().len(), 1);
    assert_eq!(harness.page.attempts_for("coords=40,300,120,36"), 2);
}

#[tokio::test]
async fn test_drifting_locator_is_healed_before_use() {
    let harness = Harness::new(ScriptedPage::new(&["[data-testid=\"save\"]"]), CircuitBreakerConfig::default());
    let drift = harness.healer.drift();
    for _ in 0..3 {
        drift.record_failure("#save-x12", SelectorStrategy::Css, 40);
    }
    assert!(drift.get_health("#save-x12", SelectorStrategy::Css).needs_healing);

    let action = MissionAction::click(Selector::css("#save-x12"))
        .with_element(ElementInfo::new("button").with_attribute("data-testid", "save").with_text("Save"));
    let mut machine = mission(vec![action]);
    harness.runner().run(&mut machine, &MissionControl::new()).await.unwrap();

    assert_eq!(harness.page.attempts_for("#save-x12"), 0);
    let result = machine.steps()[0].result.clone().unwrap();
    assert!(result.healed);
    assert_eq!(result.selector_used.unwrap().value, "[data-testid=\"save\"]");
    assert!(harness.locator.calls.lock().is_empty());
}

/// Every locator kind starts from the same prior, so CRAG sees exactly 0.55
fn flat_engine() -> SelectorEngine {
    let prior = Prior::new(0.55, 1.0);
    let priors = SelectorPriors {
        test_id: prior,
        aria_label: prior,
        aria_labelledby: prior,
        role_name: prior,
        css_id: prior,
        css_classes: prior,
        css_attribute: prior,
        css_nth_child: prior,
        xpath_contains: prior,
        xpath_exact: prior,
        xpath_id: prior,
        text_exact: prior,
        text_partial: prior,
    };
    SelectorEngine::new(SelectorEngineConfig { priors, ..Default::default() })
}

#[tokio::test]
async fn test_three_step_mission_heals_critical_locator() {
    let page = ScriptedPage::new(&["input[name=\"title\"]", "[data-testid=\"publish\"]"]);
    let harness = Harness::with_engine(page, CircuitBreakerConfig::default(), flat_engine());
    let drift = harness.healer.drift();
    for _ in 0..3 {
        drift.record_failure("#publish-7f3a", SelectorStrategy::Css, 25);
    }
    let health = drift.get_health("#publish-7f3a", SelectorStrategy::Css);
    assert_eq!(health.health, SelectorHealth::Critical);
    assert!(health.needs_healing);

    let mut machine = mission(vec![
        MissionAction::type_text(Selector::css("input[name=\"title\"]"), "Release notes"),
        MissionAction::click(Selector::css("#publish-7f3a"))
            .with_element(ElementInfo::new("button").with_attribute("data-testid", "publish")),
        MissionAction::navigate("https://studio.example.com/videos"),
    ]);
    let progress = harness.runner().run(&mut machine, &MissionControl::new()).await.unwrap();

    assert_eq!(progress.state, MissionState::Completed);
    assert_eq!(harness.page.attempts_for("#publish-7f3a"), 0);

    let metrics = harness.healer.crag().metrics();
    assert_eq!(metrics.decompose_count, 1);
    let decision = metrics.recent.back().unwrap();
    assert_eq!(decision.action, CragAction::Decompose);
    assert!((decision.confidence - 0.55).abs() < 1e-9);

    let attempts = harness.attempts.lock();
    assert!(!attempts.is_empty() && attempts.len() <= 4);
    assert!(attempts.last().unwrap().success);

    let result = machine.steps()[1].result.clone().unwrap();
    assert!(result.healed);
    assert_eq!(result.selector_used.unwrap().value, "[data-testid=\"publish\"]");
    assert!(harness.locator.calls.lock().is_empty());

    let memory = harness.healer.memory();
    assert_eq!(memory.stats().episodic_size, 1);
}

#[tokio::test(start_paused = true)]
async fn test_driver_circuit_opens_and_fails_mission() {
    let mut page = ScriptedPage::new(&[]);
    page.offline = true;
    let harness = Harness::new(page, CircuitBreakerConfig { failure_threshold: 2, ..Default::default() });
    let mut machine = mission(vec![MissionAction::navigate("https://studio.example.com")]);

    let err = harness.runner().run(&mut machine, &MissionControl::new()).await.unwrap_err();

    match err {
        ResilienceError::StepFailed { reason, .. } => assert!(reason.contains("Circuit 'driver' is open")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(harness.breaker.state(), CircuitState::Open);
    assert_eq!(harness.page.attempts_for("navigate"), 2);
    assert_eq!(machine.state(), MissionState::Failed);
}
