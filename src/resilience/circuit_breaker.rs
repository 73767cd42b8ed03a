use crate::error::{ResilienceError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, future::Future, sync::Arc, time::Duration};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Thresholds for one protected call path
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures inside the window that trip the breaker
    pub failure_threshold: u32,
    /// Time spent open before probing in half-open
    pub recovery_timeout_ms: u64,
    /// Consecutive half-open successes needed to close again
    pub success_threshold: u32,
    pub half_open_max_attempts: u32,
    /// Failures older than this no longer count
    pub failure_window_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_ms: 30_000,
            success_threshold: 2,
            half_open_max_attempts: 3,
            failure_window_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }
}

/// Snapshot of a breaker's finite-state record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    /// Failures inside the trailing window
    pub failures: u32,
    /// Consecutive successes while half-open
    pub successes: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub trips: u64,
    pub recoveries: u64,
    pub last_state_change: Option<DateTime<Utc>>,
}

/// Emitted on every state transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub path: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

pub type StateListener = Arc<dyn Fn(&StateChange) + Send + Sync>;

struct BreakerInner {
    state: CircuitState,
    failure_times: VecDeque<Instant>,
    half_open_successes: u32,
    half_open_attempts: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    total_calls: u64,
    total_failures: u64,
    metrics: CircuitMetrics,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_times: VecDeque::new(),
            half_open_successes: 0,
            half_open_attempts: 0,
            opened_at: None,
            opened_at_wall: None,
            last_failure: None,
            last_success: None,
            total_calls: 0,
            total_failures: 0,
            metrics: CircuitMetrics::default(),
        }
    }
}

/// Fail-fast gate for one protected call path (driver, vision provider, LLM, ...)
pub struct CircuitBreaker {
    path: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    listeners: RwLock<Vec<StateListener>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("path", &self.path)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(path: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            path: path.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Register an observer for state transitions
    pub fn on_state_change(&self, listener: StateListener) {
        self.listeners.write().push(listener);
    }

    /// Cheap synchronous admission check. Never blocks on I/O.
    pub fn can_execute(&self) -> bool {
        let mut changes = Vec::new();
        let allowed = {
            let mut inner = self.inner.lock();
            self.refresh(&mut inner, &mut changes);
            match inner.state {
                CircuitState::Closed => true,
                CircuitState::Open => false,
                CircuitState::HalfOpen => {
                    if inner.half_open_attempts < self.config.half_open_max_attempts {
                        inner.half_open_attempts += 1;
                        true
                    } else {
                        self.transition(&mut inner, CircuitState::Open, "half-open attempt budget exhausted", &mut changes);
                        false
                    }
                }
            }
        };
        self.emit(changes);
        allowed
    }

    /// Run `operation` behind the gate.
    ///
    /// Returns [`ResilienceError::CircuitOpen`] when refused, and also when the
    /// failure just recorded tripped the breaker. Otherwise the operation's own
    /// error is passed through.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_classified(operation, |_| true).await
    }

    /// Like [`execute`](Self::execute), but only errors for which `counts_as_failure`
    /// returns true move the breaker towards open. Other errors count as a healthy
    /// round trip (the path answered, the answer was just negative).
    pub async fn execute_classified<F, Fut, T, C>(&self, operation: F, counts_as_failure: C) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&ResilienceError) -> bool,
    {
        self.inner.lock().metrics.total_requests += 1;

        if !self.can_execute() {
            self.inner.lock().metrics.rejected_requests += 1;
            log::debug!("Circuit '{}' rejected call", self.path);
            return Err(self.open_error());
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) if !counts_as_failure(&e) => {
                self.record_success();
                Err(e)
            }
            Err(e) => {
                if self.record_failure() {
                    log::debug!("Circuit '{}' tripped by: {}", self.path, e);
                    Err(self.open_error())
                } else {
                    Err(e)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut changes = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.total_calls += 1;
            inner.metrics.successful_requests += 1;
            inner.last_success = Some(Utc::now());

            if inner.state == CircuitState::HalfOpen {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.metrics.recoveries += 1;
                    self.transition(&mut inner, CircuitState::Closed, "recovered in half-open", &mut changes);
                }
            }
        }
        self.emit(changes);
    }

    /// Record a failed call. Returns true when this failure tripped the breaker.
    pub fn record_failure(&self) -> bool {
        let mut changes = Vec::new();
        let tripped = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            inner.total_calls += 1;
            inner.total_failures += 1;
            inner.metrics.failed_requests += 1;
            inner.last_failure = Some(Utc::now());
            inner.failure_times.push_back(now);
            self.prune_failures(&mut inner, now);

            match inner.state {
                CircuitState::HalfOpen => {
                    self.transition(&mut inner, CircuitState::Open, "failure while half-open", &mut changes);
                    true
                }
                CircuitState::Closed if inner.failure_times.len() as u32 >= self.config.failure_threshold => {
                    self.transition(&mut inner, CircuitState::Open, "failure threshold reached", &mut changes);
                    true
                }
                _ => false,
            }
        };
        self.emit(changes);
        tripped
    }

    /// Current state, applying the open to half-open timeout if it elapsed
    pub fn state(&self) -> CircuitState {
        let mut changes = Vec::new();
        let state = {
            let mut inner = self.inner.lock();
            self.refresh(&mut inner, &mut changes);
            inner.state
        };
        self.emit(changes);
        state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let mut changes = Vec::new();
        let snapshot = {
            let mut inner = self.inner.lock();
            self.refresh(&mut inner, &mut changes);
            self.prune_failures(&mut inner, Instant::now());
            CircuitBreakerState {
                state: inner.state,
                failures: inner.failure_times.len() as u32,
                successes: inner.half_open_successes,
                total_calls: inner.total_calls,
                total_failures: inner.total_failures,
                last_failure: inner.last_failure,
                last_success: inner.last_success,
                opened_at: inner.opened_at_wall,
            }
        };
        self.emit(changes);
        snapshot
    }

    pub fn metrics(&self) -> CircuitMetrics {
        self.inner.lock().metrics.clone()
    }

    /// Milliseconds until an open breaker will admit a probe; zero otherwise
    pub fn retry_after_ms(&self) -> u64 {
        let inner = self.inner.lock();
        self.remaining_open(&inner)
    }

    /// Manually close the breaker and forget recent failures
    pub fn reset(&self) {
        let mut changes = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.failure_times.clear();
            self.transition(&mut inner, CircuitState::Closed, "manual reset", &mut changes);
        }
        self.emit(changes);
    }

    /// Manually open the breaker
    pub fn trip(&self) {
        let mut changes = Vec::new();
        {
            let mut inner = self.inner.lock();
            self.transition(&mut inner, CircuitState::Open, "manual trip", &mut changes);
        }
        self.emit(changes);
    }

    fn open_error(&self) -> ResilienceError {
        ResilienceError::CircuitOpen { path: self.path.clone(), retry_after_ms: self.retry_after_ms() }
    }

    fn remaining_open(&self, inner: &BreakerInner) -> u64 {
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                self.config.recovery_timeout().saturating_sub(opened_at.elapsed()).as_millis() as u64
            }
            _ => 0,
        }
    }

    fn refresh(&self, inner: &mut BreakerInner, changes: &mut Vec<StateChange>) {
        if inner.state == CircuitState::Open && self.remaining_open(inner) == 0 {
            self.transition(inner, CircuitState::HalfOpen, "recovery timeout elapsed", changes);
        }
    }

    fn prune_failures(&self, inner: &mut BreakerInner, now: Instant) {
        let window = self.config.failure_window();
        while let Some(oldest) = inner.failure_times.front() {
            if now.duration_since(*oldest) > window {
                inner.failure_times.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, reason: &str, changes: &mut Vec<StateChange>) {
        let from = inner.state;
        if from == to && to != CircuitState::Open {
            return;
        }

        inner.state = to;
        inner.half_open_successes = 0;
        inner.half_open_attempts = 0;
        let at = Utc::now();
        inner.metrics.last_state_change = Some(at);

        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.opened_at_wall = Some(at);
                if from != CircuitState::Open {
                    inner.metrics.trips += 1;
                }
            }
            CircuitState::Closed => {
                inner.failure_times.clear();
                inner.opened_at = None;
                inner.opened_at_wall = None;
            }
            CircuitState::HalfOpen => {}
        }

        if from != to {
            log::info!("Circuit '{}' {:?} -> {:?} ({})", self.path, from, to, reason);
            changes.push(StateChange { path: self.path.clone(), from, to, reason: reason.to_string(), at });
        }
    }

    fn emit(&self, changes: Vec<StateChange>) {
        if changes.is_empty() {
            return;
        }
        let listeners = self.listeners.read().clone();
        for change in &changes {
            for listener in &listeners {
                listener(change);
            }
        }
    }
}

/// One breaker per protected call path, created on first use
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    listeners: RwLock<Vec<StateListener>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self { default_config, breakers: DashMap::new(), listeners: RwLock::new(Vec::new()) }
    }

    /// Breaker for `path`, created with the registry defaults if missing
    pub fn get(&self, path: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(path) {
            return existing.clone();
        }
        self.insert(path, self.default_config.clone())
    }

    /// Breaker for `path` with its own thresholds; an existing breaker is kept
    pub fn get_with_config(&self, path: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(path) {
            return existing.clone();
        }
        self.insert(path, config)
    }

    fn insert(&self, path: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(path.to_string())
            .or_insert_with(|| {
                let breaker = CircuitBreaker::new(path, config);
                for listener in self.listeners.read().iter() {
                    breaker.on_state_change(listener.clone());
                }
                Arc::new(breaker)
            })
            .clone()
    }

    /// Observe every current and future breaker
    pub fn on_state_change(&self, listener: StateListener) {
        for entry in self.breakers.iter() {
            entry.value().on_state_change(listener.clone());
        }
        self.listeners.write().push(listener);
    }

    pub fn snapshots(&self) -> Vec<(String, CircuitBreakerState)> {
        let mut all: Vec<_> = self.breakers.iter().map(|e| (e.key().clone(), e.value().snapshot())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}
