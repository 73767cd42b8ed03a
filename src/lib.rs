//! # browser-heal
//!
//! Resilience core for browser automation: keeps multi-step missions correct and
//! recoverable while the page structure drifts and downstream calls fail.
//!
//! ## Features
//!
//! - **Fault isolation**: per call path circuit breakers and bounded exponential-backoff retries
//! - **Selector generation**: test-id, ARIA, CSS, XPath and text locators ranked by stability
//! - **Self-healing**: drift detection, tiered healing memory, confidence-gated (CRAG) strategy
//!   selection and an orchestrator that only reaches for the visual fallback last
//! - **Missions**: a state machine with checkpoints, pause/resume/cancel, progress and ETA,
//!   plus a runner that drives it against a browser
//! - **Semantic cache** for compiled mission plans
//! - **Chrome adapter** built on `headless_chrome`
//!
//! ## Healing a broken selector
//!
//! ```rust,no_run
//! use browser_heal::browser::{BrowserSession, LaunchOptions};
//! use browser_heal::healing::{
//!     ActionKind, CragEngine, DriftDetector, ElementContext, HealRequest, HealingMemory, HealingOrchestrator,
//!     ProbeExecutor, SelfHealer,
//! };
//! use browser_heal::{ElementInfo, Selector, SelectorEngine};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> browser_heal::Result<()> {
//! let session = Arc::new(BrowserSession::launch(LaunchOptions::default())?);
//! session.navigate("https://example.com")?;
//!
//! let orchestrator = HealingOrchestrator::builder().dom_executor(Arc::new(ProbeExecutor::new(session.clone()))).build();
//! let healer = SelfHealer::new(
//!     SelectorEngine::default(),
//!     Arc::new(HealingMemory::default()),
//!     Arc::new(DriftDetector::default()),
//!     Arc::new(CragEngine::default()),
//!     Arc::new(orchestrator),
//! )
//! .with_probe(session.clone());
//!
//! let element = ElementInfo::new("a").with_text("More information...");
//! let context = ElementContext::new(ActionKind::Click).with_near_text("More information");
//! let request = HealRequest::new(Selector::css("#more-info"), context, "https://example.com").with_element(element);
//!
//! let healed = healer.heal(&request, &CancellationToken::new()).await?;
//! println!("Use {} from now on", healed.selector);
//! # Ok(())
//! # }
//! ```
//!
//! ## Running a mission
//!
//! ```rust,no_run
//! # use browser_heal::browser::BrowserSession;
//! # use browser_heal::healing::SelfHealer;
//! # use std::sync::Arc;
//! use browser_heal::mission::{MissionAction, MissionConfig, MissionControl, MissionRunner, MissionStateMachine};
//! use browser_heal::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry};
//! use browser_heal::Selector;
//!
//! # async fn run(session: Arc<BrowserSession>, healer: Arc<SelfHealer>) -> browser_heal::Result<()> {
//! let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
//! let runner = MissionRunner::new(session, healer, breakers.get("driver"));
//!
//! let mut mission = MissionStateMachine::create(MissionConfig::default());
//! mission.initialize(vec![
//!     MissionAction::navigate("https://example.com"),
//!     MissionAction::click(Selector::css("a")),
//! ]);
//!
//! let progress = runner.run(&mut mission, &MissionControl::default()).await?;
//! println!("{} of {} steps done", progress.completed_steps, progress.total_steps);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`resilience`]: circuit breakers and the retry engine
//! - [`selector`]: locator types and the multi-strategy engine
//! - [`healing`]: memory tiers, drift detection, CRAG, orchestration and the healing pipeline
//! - [`mission`]: mission state machine and runner
//! - [`cache`]: semantic cache of compiled missions
//! - [`visual`]: visual fallback seam and screenshot diffing
//! - [`browser`]: Chrome session and driver adapter
//! - [`maintenance`]: periodic pruning, decay and TTL sweeps
//! - [`error`]: error types and result aliases

pub mod browser;
pub mod cache;
pub mod dom;
pub mod error;
pub mod healing;
pub mod maintenance;
pub mod mission;
pub mod resilience;
pub mod selector;
pub mod visual;

pub use browser::{BrowserSession, ConnectionOptions, LaunchOptions};
pub use cache::{CachedCompilation, SemanticCache, SemanticCacheConfig};
pub use dom::{BoundingBox, ElementInfo};
pub use error::{ResilienceError, Result};
pub use healing::{
    CragAction, CragEngine, DriftDetector, ElementContext, HealRequest, HealResult, HealingMemory,
    HealingOrchestrator, ProceduralMemory, SelectorHealth, SelfHealer, StrategyExecutor,
};
pub use maintenance::{Maintenance, MaintenanceConfig, MaintenanceTargets};
pub use mission::{MissionAction, MissionControl, MissionRunner, MissionState, MissionStateMachine, StepDriver};
pub use resilience::{CircuitBreaker, CircuitBreakerRegistry, RetryConfig, RetryEngine, RetryPreset};
pub use selector::{Selector, SelectorCandidate, SelectorEngine, SelectorProbe, SelectorStrategy};
pub use visual::{PixelDiffEngine, ScreenshotSource, VisualExecutor, VisualLocator};
