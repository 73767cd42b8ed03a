use crate::healing::{drift::SelectorHealth, orchestrator::StrategyAttempt};
use crate::resilience::retry::AttemptRecord;
use thiserror::Error;

/// Errors surfaced by the resilience core and its browser adapter
#[derive(Error, Debug)]
pub enum ResilienceError {
    #[error("Failed to launch browser: {0}")]
    LaunchFailed(String),

    #[error("Failed to connect to browser: {0}")]
    ConnectionFailed(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("JavaScript evaluation failed: {0}")]
    EvaluationFailed(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Selector strategy '{0}' is not supported by this driver")]
    UnsupportedStrategy(String),

    /// Refused before trying: the protected call path is failing fast
    #[error("Circuit '{path}' is open, retry after {retry_after_ms}ms")]
    CircuitOpen { path: String, retry_after_ms: u64 },

    #[error("Attempt timed out after {0}ms")]
    AttemptTimeout(u64),

    /// Tried and failed: carries every attempt for diagnostics
    #[error("Retries exhausted after {} attempts: {last_error}", .attempts.len())]
    RetryExhausted { attempts: Vec<AttemptRecord>, last_error: String },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Every healing strategy failed, including the visual fallback
    #[error("Healing exhausted for '{selector}' after {} strategies (confidence {confidence:.2})", .attempts.len())]
    HealingExhausted {
        selector: String,
        attempts: Vec<StrategyAttempt>,
        confidence: f64,
        health: Option<SelectorHealth>,
    },

    #[error("Strategy '{strategy}' failed: {reason}")]
    StrategyFailed { strategy: String, reason: String },

    #[error("Visual provider error: {0}")]
    VisualProvider(String),

    #[error("Image dimensions differ: {left:?} vs {right:?}")]
    DimensionMismatch { left: (u32, u32), right: (u32, u32) },

    #[error("Failed to decode image: {0}")]
    ImageDecode(String),

    #[error("Invalid memory import: {0}")]
    InvalidImport(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Step '{step}' failed: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ResilienceError {
    /// Whether a caller may reasonably try the same operation again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResilienceError::ConnectionFailed(_)
                | ResilienceError::NavigationFailed(_)
                | ResilienceError::EvaluationFailed(_)
                | ResilienceError::AttemptTimeout(_)
                | ResilienceError::VisualProvider(_)
        )
    }

    /// Locator-not-found is the trigger for healing rather than a hard failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, ResilienceError::ElementNotFound(_))
    }

    /// Stable short name, used in logs and step failure records
    pub fn kind(&self) -> &'static str {
        match self {
            ResilienceError::LaunchFailed(_) => "launch_failed",
            ResilienceError::ConnectionFailed(_) => "connection_failed",
            ResilienceError::NavigationFailed(_) => "navigation_failed",
            ResilienceError::EvaluationFailed(_) => "evaluation_failed",
            ResilienceError::ElementNotFound(_) => "element_not_found",
            ResilienceError::UnsupportedStrategy(_) => "unsupported_strategy",
            ResilienceError::CircuitOpen { .. } => "circuit_open",
            ResilienceError::AttemptTimeout(_) => "attempt_timeout",
            ResilienceError::RetryExhausted { .. } => "retry_exhausted",
            ResilienceError::Cancelled(_) => "cancelled",
            ResilienceError::HealingExhausted { .. } => "healing_exhausted",
            ResilienceError::StrategyFailed { .. } => "strategy_failed",
            ResilienceError::VisualProvider(_) => "visual_provider",
            ResilienceError::DimensionMismatch { .. } => "dimension_mismatch",
            ResilienceError::ImageDecode(_) => "image_decode",
            ResilienceError::InvalidImport(_) => "invalid_import",
            ResilienceError::InvalidConfig(_) => "invalid_config",
            ResilienceError::StepFailed { .. } => "step_failed",
            ResilienceError::Serialization(_) => "serialization",
        }
    }
}

/// Result type alias for resilience operations
pub type Result<T> = std::result::Result<T, ResilienceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_open_message() {
        let err = ResilienceError::CircuitOpen { path: "driver".to_string(), retry_after_ms: 1500 };
        assert_eq!(err.to_string(), "Circuit 'driver' is open, retry after 1500ms");
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "circuit_open");
    }

    #[test]
    fn test_retry_exhausted_counts_attempts() {
        let err = ResilienceError::RetryExhausted { attempts: Vec::new(), last_error: "ECONNRESET".to_string() };
        assert_eq!(err.to_string(), "Retries exhausted after 0 attempts: ECONNRESET");
    }

    #[test]
    fn test_not_found_is_healing_trigger() {
        let err = ResilienceError::ElementNotFound("#submit".to_string());
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }
}
