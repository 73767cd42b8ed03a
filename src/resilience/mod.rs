//! Fault isolation for calls that leave the process
//!
//! - [`CircuitBreaker`]: per call path fail-fast gate, handed out by a [`CircuitBreakerRegistry`]
//! - [`RetryEngine`]: bounded exponential backoff with jitter, presets and attempt diagnostics

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerState, CircuitMetrics, CircuitState,
    StateChange, StateListener,
};
pub use retry::{
    AttemptRecord, BackoffDelay, RetryConfig, RetryContext, RetryEngine, RetryOutcome, RetryPreset, StopReason,
};
