use crate::error::{ResilienceError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, future::Future, str::FromStr, time::Duration};
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

const NETWORK_ERRORS: &[&str] =
    &["ETIMEDOUT", "ECONNRESET", "ECONNREFUSED", "EPIPE", "ENOTFOUND", "ENETUNREACH", "EAI_AGAIN"];

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub enable_jitter: bool,
    /// Jitter range as a fraction of the computed delay, applied both ways
    pub jitter_factor: f64,
    pub timeout_per_attempt_ms: u64,
    pub total_timeout_ms: u64,
    /// Substrings marking an error as worth retrying
    pub retryable_errors: Vec<String>,
    /// Substrings that abort immediately; checked before `retryable_errors`
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let mut retryable = strings(NETWORK_ERRORS);
        retryable.extend(strings(&["TimeoutError", "NetworkError", "FetchError", "AbortError", "AttemptTimeout"]));
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            enable_jitter: true,
            jitter_factor: 0.25,
            timeout_per_attempt_ms: 10_000,
            total_timeout_ms: 60_000,
            retryable_errors: retryable,
            non_retryable_errors: strings(&[
                "ValidationError",
                "AuthenticationError",
                "AuthorizationError",
                "NotFoundError",
                "BadRequestError",
                "CircuitOpen",
                "Cancelled",
            ]),
        }
    }
}

/// Named fixed configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPreset {
    Conservative,
    Aggressive,
    Fast,
    Network,
    Dom,
}

impl RetryPreset {
    pub const ALL: [RetryPreset; 5] =
        [RetryPreset::Conservative, RetryPreset::Aggressive, RetryPreset::Fast, RetryPreset::Network, RetryPreset::Dom];

    pub fn config(&self) -> RetryConfig {
        let base = RetryConfig::default();
        match self {
            RetryPreset::Conservative => RetryConfig {
                max_attempts: 2,
                initial_delay_ms: 2000,
                max_delay_ms: 30_000,
                backoff_multiplier: 2.0,
                jitter_factor: 0.2,
                ..base
            },
            RetryPreset::Aggressive => RetryConfig {
                max_attempts: 5,
                initial_delay_ms: 500,
                max_delay_ms: 10_000,
                backoff_multiplier: 1.5,
                jitter_factor: 0.3,
                ..base
            },
            RetryPreset::Fast => RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 100,
                max_delay_ms: 2000,
                backoff_multiplier: 2.0,
                jitter_factor: 0.1,
                ..base
            },
            RetryPreset::Network => RetryConfig {
                max_attempts: 4,
                initial_delay_ms: 1000,
                max_delay_ms: 30_000,
                backoff_multiplier: 2.0,
                jitter_factor: 0.25,
                retryable_errors: strings(NETWORK_ERRORS),
                ..base
            },
            RetryPreset::Dom => RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 500,
                max_delay_ms: 5000,
                backoff_multiplier: 2.0,
                jitter_factor: 0.2,
                retryable_errors: strings(&[
                    "ElementNotFoundError",
                    "ElementNotVisibleError",
                    "ElementNotInteractableError",
                    "StaleElementError",
                    "TimeoutError",
                    "AttemptTimeout",
                ]),
                ..base
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RetryPreset::Conservative => "conservative",
            RetryPreset::Aggressive => "aggressive",
            RetryPreset::Fast => "fast",
            RetryPreset::Network => "network",
            RetryPreset::Dom => "dom",
        }
    }
}

impl fmt::Display for RetryPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetryPreset {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self> {
        RetryPreset::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ResilienceError::InvalidConfig(format!("Unknown retry preset '{}'", s)))
    }
}

/// Computed delay for one retry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffDelay {
    /// Retry number, 1-based (the delay before attempt `attempt + 1`)
    pub attempt: u32,
    pub delay_ms: u64,
    pub delay_with_jitter_ms: u64,
}

/// Outcome of one attempt, kept for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub success: bool,
    pub duration_ms: u64,
    pub delay_before_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub timed_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Succeeded,
    NonRetryable,
    AttemptsExhausted,
    TotalTimeout,
    Deadline,
    Cancelled,
}

/// Everything a retried call produced
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: Vec<AttemptRecord>,
    pub stop_reason: StopReason,
    pub total_duration: Duration,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Collapse into a plain result.
    ///
    /// Non-retryable errors and cancellation pass through unchanged so callers can
    /// tell "refused" from "tried and failed"; exhaustion becomes
    /// [`ResilienceError::RetryExhausted`] carrying every attempt.
    pub fn into_result(self) -> Result<T> {
        match (self.result, self.stop_reason) {
            (Ok(value), _) => Ok(value),
            (Err(e), StopReason::NonRetryable | StopReason::Cancelled) => Err(e),
            (Err(e), _) => Err(ResilienceError::RetryExhausted { attempts: self.attempts, last_error: e.to_string() }),
        }
    }
}

/// Caller-side bounds for one retried operation
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    pub cancel: Option<CancellationToken>,
    pub deadline: Option<Instant>,
}

impl RetryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }
}

/// Bounded exponential-backoff executor
#[derive(Debug, Clone, Default)]
pub struct RetryEngine {
    config: RetryConfig,
}

impl RetryEngine {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn preset(preset: RetryPreset) -> Self {
        Self::new(preset.config())
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Pre-jitter delay for retry `attempt` (1-based): `min(max, initial × multiplier^(attempt-1))`
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.config.initial_delay_ms as f64 * self.config.backoff_multiplier.powi(exponent);
        delay.min(self.config.max_delay_ms as f64).max(0.0) as u64
    }

    /// Delay for retry `attempt`, with an independent jitter draw
    pub fn calculate_backoff(&self, attempt: u32) -> BackoffDelay {
        let delay_ms = self.base_delay_ms(attempt);
        let delay_with_jitter_ms = if self.config.enable_jitter && self.config.jitter_factor > 0.0 {
            let factor = self.config.jitter_factor;
            let offset = rand::thread_rng().gen_range(-factor..=factor);
            (delay_ms as f64 * (1.0 + offset)).max(0.0).round() as u64
        } else {
            delay_ms
        };
        BackoffDelay { attempt, delay_ms, delay_with_jitter_ms }
    }

    /// Jittered delays for every retry the configuration allows
    pub fn delay_sequence(&self) -> Vec<u64> {
        (1..self.config.max_attempts.max(1)).map(|n| self.calculate_backoff(n).delay_with_jitter_ms).collect()
    }

    /// Worst-case wall time, ignoring jitter
    pub fn max_duration(&self) -> Duration {
        let attempts = self.config.max_attempts.max(1) as u64;
        let waits: u64 = (1..attempts as u32).map(|n| self.base_delay_ms(n)).sum();
        let total = attempts * self.config.timeout_per_attempt_ms + waits;
        Duration::from_millis(total.min(self.config.total_timeout_ms))
    }

    /// Classify by substring match against the error's message and variant name
    pub fn is_retryable(&self, error: &ResilienceError) -> bool {
        let haystack = format!("{} {:?}", error, error);
        if self.config.non_retryable_errors.iter().any(|p| haystack.contains(p.as_str())) {
            return false;
        }
        if self.config.retryable_errors.iter().any(|p| haystack.contains(p.as_str())) {
            return true;
        }
        // unknown errors are retried
        true
    }

    pub async fn execute<F, Fut, T>(&self, operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with(&RetryContext::default(), operation).await
    }

    /// Run `operation` (given the 1-based attempt number) until it succeeds or a bound is hit.
    ///
    /// The tightest of `total_timeout_ms`, the per-attempt timeout and the caller's
    /// deadline applies. Cancellation is checked between attempts and during backoff.
    pub async fn execute_with<F, Fut, T>(&self, ctx: &RetryContext, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let total_deadline = started + Duration::from_millis(self.config.total_timeout_ms);
        let (deadline, deadline_reason) = match ctx.deadline {
            Some(caller) if caller < total_deadline => (caller, StopReason::Deadline),
            _ => (total_deadline, StopReason::TotalTimeout),
        };

        let mut attempts = Vec::new();
        let mut last_error: Option<ResilienceError> = None;
        let mut stop_reason = StopReason::AttemptsExhausted;

        for attempt in 1..=self.config.max_attempts.max(1) {
            if Instant::now() >= deadline {
                stop_reason = deadline_reason;
                break;
            }

            let mut delay_before_ms = 0;
            if attempt > 1 {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let delay = Duration::from_millis(self.calculate_backoff(attempt - 1).delay_with_jitter_ms).min(remaining);
                delay_before_ms = delay.as_millis() as u64;
                log::debug!("Retry attempt {} in {}ms", attempt, delay_before_ms);

                match &ctx.cancel {
                    Some(token) => {
                        tokio::select! {
                            _ = token.cancelled() => {}
                            _ = sleep(delay) => {}
                        }
                    }
                    None => sleep(delay).await,
                }

                if Instant::now() >= deadline {
                    stop_reason = deadline_reason;
                    break;
                }
            }

            if ctx.is_cancelled() {
                stop_reason = StopReason::Cancelled;
                last_error = Some(ResilienceError::Cancelled(format!("cancelled before attempt {}", attempt)));
                break;
            }

            let budget = Duration::from_millis(self.config.timeout_per_attempt_ms)
                .min(deadline.saturating_duration_since(Instant::now()));
            let attempt_started = Instant::now();
            let outcome = match timeout(budget, operation(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(ResilienceError::AttemptTimeout(budget.as_millis() as u64)),
            };
            let duration_ms = attempt_started.elapsed().as_millis() as u64;

            match outcome {
                Ok(value) => {
                    attempts.push(AttemptRecord {
                        attempt,
                        success: true,
                        duration_ms,
                        delay_before_ms,
                        error: None,
                        timed_out: false,
                    });
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                        stop_reason: StopReason::Succeeded,
                        total_duration: started.elapsed(),
                    };
                }
                Err(e) => {
                    log::warn!("Attempt {}/{} failed: {}", attempt, self.config.max_attempts, e);
                    attempts.push(AttemptRecord {
                        attempt,
                        success: false,
                        duration_ms,
                        delay_before_ms,
                        error: Some(e.to_string()),
                        timed_out: matches!(e, ResilienceError::AttemptTimeout(_)),
                    });
                    let retryable = self.is_retryable(&e);
                    last_error = Some(e);
                    if !retryable {
                        stop_reason = StopReason::NonRetryable;
                        break;
                    }
                }
            }
        }

        let error = last_error.unwrap_or_else(|| match stop_reason {
            StopReason::Deadline => ResilienceError::AttemptTimeout(0),
            _ => ResilienceError::AttemptTimeout(self.config.total_timeout_ms),
        });
        RetryOutcome { result: Err(error), attempts, stop_reason, total_duration: started.elapsed() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    fn no_jitter(config: RetryConfig) -> RetryEngine {
        RetryEngine::new(RetryConfig { enable_jitter: false, ..config })
    }

    #[test]
    fn test_backoff_bound() {
        let engine = RetryEngine::new(RetryConfig { max_attempts: 8, max_delay_ms: 10_000, ..Default::default() });
        for n in 1..=8u32 {
            let expected = (1000.0 * 2f64.powi(n as i32 - 1)).min(10_000.0) as u64;
            let backoff = engine.calculate_backoff(n);
            assert_eq!(backoff.delay_ms, expected);
            let low = (expected as f64 * 0.75).floor() as u64;
            let high = (expected as f64 * 1.25).ceil() as u64;
            assert!(backoff.delay_with_jitter_ms >= low && backoff.delay_with_jitter_ms <= high);
        }
    }

    #[test]
    fn test_presets() {
        let aggressive = RetryPreset::Aggressive.config();
        assert_eq!(aggressive.max_attempts, 5);
        assert_eq!(aggressive.backoff_multiplier, 1.5);
        assert_eq!("dom".parse::<RetryPreset>().unwrap(), RetryPreset::Dom);
        assert!("slow".parse::<RetryPreset>().is_err());

        let engine = no_jitter(RetryPreset::Fast.config());
        assert_eq!(engine.delay_sequence(), vec![100, 200]);
    }

    #[test]
    fn test_max_duration() {
        let engine = no_jitter(RetryConfig::default());
        // 3 × 10s attempts + 1s + 2s of backoff
        assert_eq!(engine.max_duration(), Duration::from_millis(33_000));
    }

    #[test]
    fn test_classification() {
        let engine = RetryEngine::default();
        assert!(engine.is_retryable(&ResilienceError::NavigationFailed("read ECONNRESET".to_string())));
        assert!(engine.is_retryable(&ResilienceError::EvaluationFailed("something odd".to_string())));
        assert!(!engine.is_retryable(&ResilienceError::CircuitOpen { path: "llm".to_string(), retry_after_ms: 10 }));
        assert!(!engine.is_retryable(&ResilienceError::Cancelled("mission".to_string())));
        assert!(!engine.is_retryable(&ResilienceError::StepFailed {
            step: "login".to_string(),
            reason: "AuthenticationError: bad password".to_string()
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let engine = no_jitter(RetryConfig::default());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let outcome = engine
            .execute(move |_| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ResilienceError::NavigationFailed("ETIMEDOUT".to_string()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(outcome.stop_reason, StopReason::Succeeded);
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(outcome.attempts[1].delay_before_ms, 1000);
        assert_eq!(outcome.attempts[2].delay_before_ms, 2000);
        assert_eq!(outcome.into_result().unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_aborts_immediately() {
        let engine = no_jitter(RetryConfig::default());
        let outcome: RetryOutcome<()> = engine
            .execute(|_| async { Err(ResilienceError::CircuitOpen { path: "driver".to_string(), retry_after_ms: 5 }) })
            .await;

        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.stop_reason, StopReason::NonRetryable);
        assert!(matches!(outcome.into_result(), Err(ResilienceError::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_carries_attempts() {
        let engine = no_jitter(RetryConfig::default());
        let outcome: RetryOutcome<()> =
            engine.execute(|n| async move { Err(ResilienceError::NavigationFailed(format!("ECONNRESET #{}", n))) }).await;

        assert_eq!(outcome.stop_reason, StopReason::AttemptsExhausted);
        match outcome.into_result() {
            Err(ResilienceError::RetryExhausted { attempts, last_error }) => {
                assert_eq!(attempts.len(), 3);
                assert!(attempts.iter().all(|a| !a.success));
                assert!(last_error.contains("ECONNRESET #3"));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_attempt_timeout() {
        let engine = no_jitter(RetryConfig { max_attempts: 2, timeout_per_attempt_ms: 100, ..Default::default() });
        let outcome: RetryOutcome<()> = engine
            .execute(|_| async {
                sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert_eq!(outcome.attempts.len(), 2);
        assert!(outcome.attempts.iter().all(|a| a.timed_out));
        assert_eq!(outcome.stop_reason, StopReason::AttemptsExhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_timeout_stops_retries() {
        let engine = no_jitter(RetryConfig {
            max_attempts: 10,
            initial_delay_ms: 1000,
            total_timeout_ms: 2500,
            ..Default::default()
        });
        let outcome: RetryOutcome<()> =
            engine.execute(|_| async { Err(ResilienceError::NavigationFailed("ETIMEDOUT".to_string())) }).await;

        // attempts at t=0 and t=1s; the 2s backoff is clipped by the total budget
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.stop_reason, StopReason::TotalTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_deadline_wins() {
        let engine = no_jitter(RetryConfig::default());
        let ctx = RetryContext::new().with_deadline(Instant::now() + Duration::from_millis(500));
        let outcome: RetryOutcome<()> = engine
            .execute_with(&ctx, |_| async { Err(ResilienceError::NavigationFailed("ETIMEDOUT".to_string())) })
            .await;

        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.stop_reason, StopReason::Deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_between_attempts() {
        let engine = no_jitter(RetryConfig::default());
        let token = CancellationToken::new();
        let ctx = RetryContext::new().with_cancel(token.clone());

        let outcome: RetryOutcome<()> = engine
            .execute_with(&ctx, |_| {
                let token = token.clone();
                async move {
                    token.cancel();
                    Err(ResilienceError::NavigationFailed("ECONNRESET".to_string()))
                }
            })
            .await;

        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
        assert!(matches!(outcome.into_result(), Err(ResilienceError::Cancelled(_))));
    }
}
