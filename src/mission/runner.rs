//! Drives a [`MissionStateMachine`] through its steps against a [`StepDriver`]
//!
//! Each driver call is retried by the [`RetryEngine`] and gated by the `driver`
//! circuit. Locators flagged by the drift detector are healed before use; a
//! locator that stops resolving is healed after the failure.

use crate::error::{ResilienceError, Result};
use crate::healing::pipeline::{HealRequest, SelfHealer};
use crate::mission::state_machine::MissionStateMachine;
use crate::mission::types::{ActionType, MissionAction, MissionProgress, MissionState, StepResult};
use crate::resilience::{CircuitBreaker, RetryConfig, RetryContext, RetryEngine, RetryPreset};
use crate::selector::Selector;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

/// Browser-facing side of step execution
#[async_trait]
pub trait StepDriver: Send + Sync {
    /// Perform the action, using `selector` in place of the action's own locator
    async fn perform(&self, action: &MissionAction, selector: Option<&Selector>) -> Result<Option<serde_json::Value>>;

    /// Check the page reflects the action
    async fn verify(&self, _action: &MissionAction, _output: Option<&serde_json::Value>) -> Result<bool> {
        Ok(true)
    }

    async fn current_url(&self) -> Result<String>;
}

/// External handle to pause, resume or cancel a running mission
#[derive(Clone)]
pub struct MissionControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl Default for MissionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl MissionControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self { cancel: CancellationToken::new(), paused: Arc::new(paused) }
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until resumed. Returns false if cancelled while waiting.
    pub async fn wait_while_paused(&self) -> bool {
        let mut rx = self.paused.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            resumed = rx.wait_for(|paused| !*paused) => resumed.map(|_| ()).is_ok() && !self.cancel.is_cancelled(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub retry: RetryConfig,
    /// Heal locators the drift detector flags before using them
    pub proactive_healing: bool,
    pub verify_steps: bool,
    /// Re-executions allowed after a failed verification
    pub max_verification_retries: u32,
    /// Checkpoint before every step so callers can roll back
    pub checkpoint_steps: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let mut retry = RetryPreset::Dom.config();
        // a missing element goes to healing, not another identical attempt
        retry.non_retryable_errors.push("ElementNotFound".to_string());
        Self { retry, proactive_healing: true, verify_steps: true, max_verification_retries: 1, checkpoint_steps: true }
    }
}

pub struct MissionRunner {
    driver: Arc<dyn StepDriver>,
    healer: Arc<SelfHealer>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryEngine,
    config: RunnerConfig,
}

impl MissionRunner {
    pub fn new(driver: Arc<dyn StepDriver>, healer: Arc<SelfHealer>, breaker: Arc<CircuitBreaker>) -> Self {
        Self::with_config(driver, healer, breaker, RunnerConfig::default())
    }

    pub fn with_config(
        driver: Arc<dyn StepDriver>,
        healer: Arc<SelfHealer>,
        breaker: Arc<CircuitBreaker>,
        config: RunnerConfig,
    ) -> Self {
        Self { driver, healer, breaker, retry: RetryEngine::new(config.retry.clone()), config }
    }

    /// Run the mission to a terminal state.
    ///
    /// Pause and cancel requests on `control` are honoured between steps and at
    /// retry/healing boundaries. A failed step fails the mission with
    /// [`ResilienceError::StepFailed`].
    pub async fn run(&self, machine: &mut MissionStateMachine, control: &MissionControl) -> Result<MissionProgress> {
        if machine.state() == MissionState::Pending {
            machine.start_compiling();
        }
        if machine.state() == MissionState::Compiling {
            machine.start_executing();
        }
        if machine.state() == MissionState::Paused {
            machine.resume();
        }

        let cancel = control.token();
        while let Some(step) = machine.current_step() {
            if machine.state() == MissionState::Verifying {
                machine.start_executing();
            }
            if control.is_cancelled() {
                return self.cancelled(machine);
            }
            if control.is_paused() {
                machine.pause();
                if !control.wait_while_paused().await {
                    return self.cancelled(machine);
                }
                machine.resume();
            }

            if self.config.checkpoint_steps {
                machine.create_checkpoint(serde_json::Value::Null);
            }
            machine.mark_step_executing();

            let label = step.action.label();
            let mut verification_retries = 0;
            loop {
                let result = match self.execute_step(&step.action, &cancel).await {
                    Ok(result) => result,
                    Err(ResilienceError::Cancelled(_)) if cancel.is_cancelled() => return self.cancelled(machine),
                    Err(e) => return self.step_failed(machine, &label, e.to_string()),
                };

                if !self.config.verify_steps {
                    machine.mark_step_completed(result);
                    break;
                }

                machine.start_verifying();
                match self.driver.verify(&step.action, result.output.as_ref()).await {
                    Ok(true) => {
                        machine.mark_step_completed(result);
                        break;
                    }
                    Ok(false) if verification_retries < self.config.max_verification_retries => {
                        verification_retries += 1;
                        machine.transition(MissionState::Executing, format!("Verification failed, retrying {}", label));
                    }
                    Ok(false) => return self.step_failed(machine, &label, "verification failed".to_string()),
                    Err(e) => return self.step_failed(machine, &label, e.to_string()),
                }
            }
        }

        if machine.state() == MissionState::Executing {
            machine.start_verifying();
        }
        machine.complete();
        Ok(machine.progress())
    }

    /// Execute one action, healing its locator when needed
    pub async fn execute_step(&self, action: &MissionAction, cancel: &CancellationToken) -> Result<StepResult> {
        let started = Instant::now();

        let Some(original) = action.selector.clone() else {
            let output = self.perform(action, None, cancel).await?;
            if action.kind == ActionType::Navigate {
                self.healer.memory().clear_working_memory();
            }
            return Ok(StepResult::success(started.elapsed().as_millis() as u64).with_output(output));
        };

        let drift = self.healer.drift().clone();
        let url = self.driver.current_url().await.unwrap_or_default();
        let mut request = HealRequest::new(original.clone(), action.element_context(), url);
        if let Some(element) = &action.element {
            request = request.with_element(element.clone());
        }

        let mut selector = original.clone();
        if self.config.proactive_healing && drift.get_health(&original.value, original.strategy).needs_healing {
            log::info!("Locator {} is drifting, healing before use", original);
            match self.healer.heal(&request, cancel).await {
                Ok(healed) => selector = healed.selector,
                Err(e) => log::warn!("Proactive healing failed for {}: {}", original, e),
            }
        }

        let attempt_started = Instant::now();
        let output = match self.perform(action, Some(&selector), cancel).await {
            Ok(output) => {
                drift.record_success(&selector.value, selector.strategy, attempt_started.elapsed().as_millis() as u64);
                output
            }
            Err(e) if e.is_not_found() => {
                drift.record_failure(&selector.value, selector.strategy, attempt_started.elapsed().as_millis() as u64);
                if selector != original {
                    self.healer.reject(&request, &selector);
                }
                let healed = self.healer.heal(&request, cancel).await?.selector;
                log::info!("Reactively healed {} -> {}", original, healed);

                let retry_started = Instant::now();
                match self.perform(action, Some(&healed), cancel).await {
                    Ok(output) => {
                        drift.record_success(&healed.value, healed.strategy, retry_started.elapsed().as_millis() as u64);
                        selector = healed;
                        output
                    }
                    Err(e) => {
                        drift.record_failure(&healed.value, healed.strategy, retry_started.elapsed().as_millis() as u64);
                        self.healer.reject(&request, &healed);
                        return Err(e);
                    }
                }
            }
            Err(e) => return Err(e),
        };

        let healed = selector != original;
        Ok(StepResult::success(started.elapsed().as_millis() as u64)
            .with_selector(selector, healed)
            .with_output(output))
    }

    async fn perform(
        &self,
        action: &MissionAction,
        selector: Option<&Selector>,
        cancel: &CancellationToken,
    ) -> Result<Option<serde_json::Value>> {
        let ctx = RetryContext::new().with_cancel(cancel.clone());
        self.retry
            .execute_with(&ctx, |_| {
                self.breaker
                    .execute_classified(|| self.driver.perform(action, selector), |e: &ResilienceError| !e.is_not_found())
            })
            .await
            .into_result()
    }

    fn cancelled(&self, machine: &mut MissionStateMachine) -> Result<MissionProgress> {
        machine.cancel(None);
        Err(ResilienceError::Cancelled(format!("mission {}", machine.mission_id())))
    }

    fn step_failed(&self, machine: &mut MissionStateMachine, label: &str, reason: String) -> Result<MissionProgress> {
        machine.mark_step_failed(reason.clone());
        machine.fail(&reason);
        Err(ResilienceError::StepFailed { step: label.to_string(), reason })
    }
}
