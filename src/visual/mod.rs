//! Visual fallback and verification
//!
//! The visual strategy is the last resort of the healing pipeline: a screenshot
//! and a natural-language query go to an external [`VisualLocator`], and the
//! bounding box it returns becomes a coordinate locator. [`pixel_diff`] compares
//! screenshots before and after an action.

pub mod pixel_diff;

pub use pixel_diff::{ChangeRegion, PixelDiff, PixelDiffConfig, PixelDiffEngine, PixelRect};

use crate::dom::BoundingBox;
use crate::error::{ResilienceError, Result};
use crate::healing::orchestrator::{StrategyExecutor, StrategyRequest};
use crate::resilience::CircuitBreaker;
use crate::selector::{Selector, SelectorStrategy};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Prefix of locators produced by the visual strategy
pub const COORDS_PREFIX: &str = "coords=";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualRequest {
    pub screenshot_base64: String,
    pub query: String,
}

impl VisualRequest {
    pub fn new(screenshot: &[u8], query: impl Into<String>) -> Self {
        Self {
            screenshot_base64: base64::engine::general_purpose::STANDARD.encode(screenshot),
            query: query.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualMatch {
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
    pub confidence: f64,
}

impl VisualMatch {
    pub fn not_found() -> Self {
        Self { found: false, bounding_box: None, confidence: 0.0 }
    }
}

/// External vision provider
#[async_trait]
pub trait VisualLocator: Send + Sync {
    async fn locate(&self, request: &VisualRequest) -> Result<VisualMatch>;
}

/// Anything that can capture the current page
#[async_trait]
pub trait ScreenshotSource: Send + Sync {
    /// PNG bytes of the visible viewport
    async fn screenshot(&self) -> Result<Vec<u8>>;
}

/// Plugs a [`VisualLocator`] into the orchestrator as the `visual` strategy
pub struct VisualExecutor {
    locator: Arc<dyn VisualLocator>,
    screenshots: Arc<dyn ScreenshotSource>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl VisualExecutor {
    pub fn new(locator: Arc<dyn VisualLocator>, screenshots: Arc<dyn ScreenshotSource>) -> Self {
        Self { locator, screenshots, breaker: None }
    }

    /// Gate provider calls behind a breaker, usually the registry's `vision` path
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    async fn locate(&self, request: &VisualRequest) -> Result<VisualMatch> {
        match &self.breaker {
            Some(breaker) => breaker.execute(|| self.locator.locate(request)).await,
            None => self.locator.locate(request).await,
        }
    }
}

#[async_trait]
impl StrategyExecutor for VisualExecutor {
    async fn attempt(&self, request: &StrategyRequest) -> Result<Option<Selector>> {
        let query = request.visual_query.clone().unwrap_or_else(|| request.context.describe_element());
        let screenshot = self.screenshots.screenshot().await?;
        let found = self.locate(&VisualRequest::new(&screenshot, query.as_str())).await?;

        match found.bounding_box.filter(|_| found.found) {
            Some(bounds) => {
                log::debug!("Visual provider located '{}' at {:?} ({:.2})", query, bounds, found.confidence);
                Ok(Some(coords_selector(&bounds, found.confidence)))
            }
            None => Ok(None),
        }
    }
}

pub fn coords_selector(bounds: &BoundingBox, confidence: f64) -> Selector {
    Selector::new(
        format!("{}{},{},{},{}", COORDS_PREFIX, bounds.x, bounds.y, bounds.width, bounds.height),
        SelectorStrategy::Visual,
        confidence,
    )
}

/// Bounding box encoded in a visual locator
pub fn parse_coords(value: &str) -> Result<BoundingBox> {
    let invalid = || ResilienceError::StrategyFailed {
        strategy: SelectorStrategy::Visual.as_str().to_string(),
        reason: format!("malformed coordinate locator '{}'", value),
    };
    let parts = value
        .strip_prefix(COORDS_PREFIX)
        .ok_or_else(invalid)?
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| invalid())?;

    match parts[..] {
        [x, y, width, height] => Ok(BoundingBox::new(x, y, width, height)),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healing::context::{ActionKind, ElementContext};
    use crate::resilience::CircuitBreakerConfig;
    use parking_lot::Mutex;

    struct StaticLocator {
        result: Option<VisualMatch>,
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VisualLocator for StaticLocator {
        async fn locate(&self, request: &VisualRequest) -> Result<VisualMatch> {
            self.queries.lock().push(request.query.clone());
            self.result.clone().ok_or_else(|| ResilienceError::VisualProvider("quota exceeded".to_string()))
        }
    }

    struct Blank;

    #[async_trait]
    impl ScreenshotSource for Blank {
        async fn screenshot(&self) -> Result<Vec<u8>> {
            Ok(vec![0x89, b'P', b'N', b'G'])
        }
    }

    fn request(query: Option<&str>) -> StrategyRequest {
        StrategyRequest {
            strategy: SelectorStrategy::Visual,
            broken_selector: "#buy".to_string(),
            context: ElementContext::new(ActionKind::Click).with_near_text("Buy now"),
            selectors: Vec::new(),
            visual_query: query.map(str::to_string),
        }
    }

    fn locator(result: Option<VisualMatch>) -> Arc<StaticLocator> {
        Arc::new(StaticLocator { result, queries: Mutex::new(Vec::new()) })
    }

    #[test]
    fn test_request_encodes_screenshot() {
        let request = VisualRequest::new(b"png", "the buy button");
        assert_eq!(request.screenshot_base64, "cG5n");
    }

    #[test]
    fn test_coords_round_trip() {
        let selector = coords_selector(&BoundingBox::new(10.0, 20.5, 80.0, 24.0), 0.8);
        assert_eq!(selector.value, "coords=10,20.5,80,24");
        assert_eq!(parse_coords(&selector.value).unwrap(), BoundingBox::new(10.0, 20.5, 80.0, 24.0));
        assert!(parse_coords("coords=1,2,3").is_err());
        assert!(parse_coords("#buy").is_err());
    }

    #[tokio::test]
    async fn test_executor_returns_coordinate_locator() {
        let hit = VisualMatch { found: true, bounding_box: Some(BoundingBox::new(5.0, 5.0, 40.0, 20.0)), confidence: 0.75 };
        let locator = locator(Some(hit));
        let executor = VisualExecutor::new(locator.clone(), Arc::new(Blank));

        let selector = executor.attempt(&request(Some("Find the buy button"))).await.unwrap().unwrap();
        assert_eq!(selector.strategy, SelectorStrategy::Visual);
        assert_eq!(selector.confidence, 0.75);
        assert_eq!(locator.queries.lock().as_slice(), ["Find the buy button"]);
    }

    #[tokio::test]
    async fn test_executor_falls_back_to_context_description() {
        let locator = locator(Some(VisualMatch::not_found()));
        let executor = VisualExecutor::new(locator.clone(), Arc::new(Blank));

        assert!(executor.attempt(&request(None)).await.unwrap().is_none());
        assert!(locator.queries.lock()[0].contains("Buy now"));
    }

    #[tokio::test]
    async fn test_provider_failures_trip_breaker() {
        let breaker = Arc::new(CircuitBreaker::new(
            "vision",
            CircuitBreakerConfig { failure_threshold: 1, ..Default::default() },
        ));
        let executor = VisualExecutor::new(locator(None), Arc::new(Blank)).with_breaker(breaker.clone());

        assert!(executor.attempt(&request(None)).await.is_err());
        assert!(matches!(executor.attempt(&request(None)).await, Err(ResilienceError::CircuitOpen { .. })));
    }
}
