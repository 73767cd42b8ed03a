use crate::error::{ResilienceError, Result};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Locator family a selector belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorStrategy {
    TestId,
    Aria,
    Css,
    XPath,
    Text,
    Visual,
}

impl SelectorStrategy {
    /// Fixed fallback order, cheapest and most stable first
    pub const PRIORITY: [SelectorStrategy; 6] = [
        SelectorStrategy::TestId,
        SelectorStrategy::Aria,
        SelectorStrategy::Css,
        SelectorStrategy::XPath,
        SelectorStrategy::Text,
        SelectorStrategy::Visual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SelectorStrategy::TestId => "testid",
            SelectorStrategy::Aria => "aria",
            SelectorStrategy::Css => "css",
            SelectorStrategy::XPath => "xpath",
            SelectorStrategy::Text => "text",
            SelectorStrategy::Visual => "visual",
        }
    }

    /// Position in [`Self::PRIORITY`]
    pub fn priority(&self) -> usize {
        Self::PRIORITY.iter().position(|s| s == self).unwrap_or(Self::PRIORITY.len())
    }

    /// Everything except visual identification runs against the DOM only
    pub fn is_cheap(&self) -> bool {
        *self != SelectorStrategy::Visual
    }
}

impl fmt::Display for SelectorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectorStrategy {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self> {
        SelectorStrategy::PRIORITY
            .into_iter()
            .find(|strategy| strategy.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ResilienceError::InvalidConfig(format!("Unknown selector strategy '{}'", s)))
    }
}

/// A locator for one element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    pub value: String,
    pub strategy: SelectorStrategy,
    pub confidence: f64,
}

impl Selector {
    pub fn new(value: impl Into<String>, strategy: SelectorStrategy, confidence: f64) -> Self {
        Self { value: value.into(), strategy, confidence: confidence.clamp(0.0, 1.0) }
    }

    pub fn css(value: impl Into<String>) -> Self {
        Self::new(value, SelectorStrategy::Css, 1.0)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.strategy, self.value)
    }
}

/// A generated selector with ranking metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorCandidate {
    #[serde(flatten)]
    pub selector: Selector,

    /// Why the engine produced this candidate
    pub reason: String,

    pub is_unique: bool,

    /// Number of matching elements, when verified against a live page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_count: Option<usize>,

    /// Prior on surviving a DOM change (test-ids highest, nth-child lowest)
    pub stability_score: f64,
}

impl SelectorCandidate {
    pub fn new(
        value: impl Into<String>,
        strategy: SelectorStrategy,
        confidence: f64,
        stability_score: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            selector: Selector::new(value, strategy, confidence),
            reason: reason.into(),
            is_unique: false,
            match_count: None,
            stability_score: stability_score.clamp(0.0, 1.0),
        }
    }

    /// Builder method: mark as expected to match one element
    pub fn unique(mut self, is_unique: bool) -> Self {
        self.is_unique = is_unique;
        self
    }

    pub fn value(&self) -> &str {
        &self.selector.value
    }

    pub fn strategy(&self) -> SelectorStrategy {
        self.selector.strategy
    }

    pub fn confidence(&self) -> f64 {
        self.selector.confidence
    }

    /// Ranking key: confidence weighted by stability
    pub fn score(&self) -> f64 {
        self.selector.confidence * self.stability_score
    }
}
