//! Mission lifecycle
//!
//! `pending → compiling → executing → verifying → completed`, with `executing ⇄ paused`
//! and `verifying → executing` as the only back-edges. One machine per mission, owned
//! by the single worker driving it, so no internal locking.

use crate::mission::types::{
    Checkpoint, MissionAction, MissionProgress, MissionState, MissionStep, StateTransition, StepResult, StepStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub type TransitionListener = Box<dyn Fn(&StateTransition) + Send + Sync>;
pub type StepListener = Box<dyn Fn(&MissionStep) + Send + Sync>;
pub type ProgressListener = Box<dyn Fn(&MissionProgress) + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MissionConfig {
    /// Feed completed step durations into the ETA
    pub track_timing: bool,
    pub max_history_size: usize,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self { track_timing: true, max_history_size: 100 }
    }
}

pub struct MissionStateMachine {
    mission_id: String,
    config: MissionConfig,
    state: MissionState,
    version: u64,
    steps: Vec<Arc<MissionStep>>,
    current: usize,
    started_at: Option<Instant>,
    paused_at: Option<Instant>,
    total_paused: Duration,
    step_timings: Vec<u64>,
    history: VecDeque<StateTransition>,
    checkpoints: BTreeMap<usize, Checkpoint>,
    cancel: CancellationToken,
    on_state_change: Vec<TransitionListener>,
    on_step_complete: Vec<StepListener>,
    on_progress: Vec<ProgressListener>,
}

impl MissionStateMachine {
    pub fn new(mission_id: impl Into<String>, config: MissionConfig) -> Self {
        Self {
            mission_id: mission_id.into(),
            config,
            state: MissionState::Pending,
            version: 0,
            steps: Vec::new(),
            current: 0,
            started_at: None,
            paused_at: None,
            total_paused: Duration::ZERO,
            step_timings: Vec::new(),
            history: VecDeque::new(),
            checkpoints: BTreeMap::new(),
            cancel: CancellationToken::new(),
            on_state_change: Vec::new(),
            on_step_complete: Vec::new(),
            on_progress: Vec::new(),
        }
    }

    /// New machine with a generated mission id
    pub fn create(config: MissionConfig) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), config)
    }

    /// Load compiled actions as pending steps and reset the cursor
    pub fn initialize(&mut self, actions: Vec<MissionAction>) {
        self.steps = actions.into_iter().enumerate().map(|(i, a)| Arc::new(MissionStep::new(i, a))).collect();
        self.current = 0;
        self.version += 1;
    }

    // Transitions

    /// Move to `to`. Returns false, changing nothing, when the transition is not allowed.
    pub fn transition(&mut self, to: MissionState, reason: impl Into<String>) -> bool {
        let from = self.state;
        if !from.can_transition_to(to) {
            log::warn!(
                "Mission {}: invalid transition {} -> {} (allowed: {:?})",
                self.mission_id,
                from,
                to,
                from.allowed_transitions()
            );
            return false;
        }

        let transition =
            StateTransition { from, to, timestamp: Utc::now(), reason: reason.into(), step_index: self.current };
        self.state = to;
        self.version += 1;
        self.history.push_back(transition.clone());
        while self.history.len() > self.config.max_history_size.max(1) {
            self.history.pop_front();
        }

        let now = Instant::now();
        if to == MissionState::Compiling && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to == MissionState::Paused {
            self.paused_at = Some(now);
        }
        if from == MissionState::Paused {
            if let Some(paused_at) = self.paused_at.take() {
                self.total_paused += now.saturating_duration_since(paused_at);
            }
        }
        if to == MissionState::Cancelled {
            self.cancel.cancel();
        }

        log::debug!("Mission {}: {} -> {} ({})", self.mission_id, from, to, transition.reason);
        for listener in &self.on_state_change {
            listener(&transition);
        }
        true
    }

    pub fn start_compiling(&mut self) -> bool {
        self.transition(MissionState::Compiling, "Starting mission compilation")
    }

    pub fn start_executing(&mut self) -> bool {
        self.transition(MissionState::Executing, "Starting mission execution")
    }

    pub fn start_verifying(&mut self) -> bool {
        self.transition(MissionState::Verifying, "Verifying action result")
    }

    pub fn complete(&mut self) -> bool {
        self.transition(MissionState::Completed, "Mission completed successfully")
    }

    pub fn fail(&mut self, error: &str) -> bool {
        self.transition(MissionState::Failed, format!("Mission failed: {}", error))
    }

    pub fn pause(&mut self) -> bool {
        self.transition(MissionState::Paused, "Mission paused")
    }

    pub fn resume(&mut self) -> bool {
        self.transition(MissionState::Executing, "Mission resumed")
    }

    pub fn cancel(&mut self, reason: Option<&str>) -> bool {
        self.transition(MissionState::Cancelled, reason.unwrap_or("Mission cancelled by user"))
    }

    // Steps

    pub fn current_step(&self) -> Option<Arc<MissionStep>> {
        self.steps.get(self.current).cloned()
    }

    fn replace_step(&mut self, index: usize, step: MissionStep) -> Arc<MissionStep> {
        let step = Arc::new(step);
        self.steps[index] = step.clone();
        self.version += 1;
        step
    }

    pub fn mark_step_executing(&mut self) {
        if let Some(step) = self.current_step() {
            self.replace_step(self.current, step.with_status(StepStatus::Executing));
        }
    }

    /// Record the result on the current step and advance
    pub fn mark_step_completed(&mut self, result: StepResult) {
        let Some(step) = self.current_step() else { return };
        if self.config.track_timing {
            self.step_timings.push(result.duration_ms);
        }
        let updated = self.replace_step(self.current, step.with_result(StepStatus::Completed, result));
        for listener in &self.on_step_complete {
            listener(&updated);
        }
        self.current += 1;
        self.emit_progress();
    }

    /// Record a failure on the current step.
    ///
    /// Unlike [`Self::mark_step_completed`] and [`Self::skip_step`] the cursor
    /// stays on the failed step, so the caller decides whether to retry it, skip
    /// it or roll back to a checkpoint.
    pub fn mark_step_failed(&mut self, error: impl Into<String>) {
        let Some(step) = self.current_step() else { return };
        let result = StepResult::failure(error, 0);
        let updated = self.replace_step(self.current, step.with_result(StepStatus::Failed, result));
        for listener in &self.on_step_complete {
            listener(&updated);
        }
        self.emit_progress();
    }

    pub fn skip_step(&mut self, reason: &str) {
        let Some(step) = self.current_step() else { return };
        log::debug!("Mission {}: skipping step {} ({})", self.mission_id, self.current, reason);
        self.replace_step(self.current, step.with_status(StepStatus::Skipped));
        self.current += 1;
        self.emit_progress();
    }

    pub fn is_complete(&self) -> bool {
        self.current >= self.steps.len()
    }

    pub fn has_failed(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    // Checkpoints

    /// Snapshot the cursor (and caller state) at the current step
    pub fn create_checkpoint(&mut self, state: serde_json::Value) -> Checkpoint {
        let checkpoint = Checkpoint { step_index: self.current, timestamp: Utc::now(), state };
        self.checkpoints.insert(self.current, checkpoint.clone());
        if let Some(step) = self.current_step() {
            self.replace_step(self.current, step.with_checkpoint(checkpoint.clone()));
        }
        checkpoint
    }

    pub fn checkpoint(&self, step_index: usize) -> Option<&Checkpoint> {
        self.checkpoints.get(&step_index)
    }

    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints.values().cloned().collect()
    }

    /// Move the cursor back to a checkpoint. Recorded step results are kept.
    pub fn rollback_to(&mut self, step_index: usize) -> bool {
        if self.state.is_terminal() || !self.checkpoints.contains_key(&step_index) {
            return false;
        }
        self.current = step_index;
        self.version += 1;
        if matches!(self.state, MissionState::Paused | MissionState::Verifying | MissionState::Compiling) {
            self.transition(MissionState::Executing, format!("Rolled back to step {}", step_index));
        }
        log::debug!("Mission {}: rolled back to step {}", self.mission_id, step_index);
        true
    }

    // Progress

    pub fn progress(&self) -> MissionProgress {
        let count = |status: StepStatus| self.steps.iter().filter(|s| s.status == status).count();

        let elapsed_ms = self
            .started_at
            .map(|started| {
                let now = Instant::now();
                let paused_now = self.paused_at.map(|p| now.saturating_duration_since(p)).unwrap_or_default();
                now.saturating_duration_since(started).saturating_sub(self.total_paused + paused_now)
            })
            .unwrap_or_default()
            .as_millis() as u64;

        let avg_step_duration_ms = if self.step_timings.is_empty() {
            0.0
        } else {
            self.step_timings.iter().sum::<u64>() as f64 / self.step_timings.len() as f64
        };
        let remaining = self.steps.len().saturating_sub(self.current);

        MissionProgress {
            mission_id: self.mission_id.clone(),
            state: self.state,
            version: self.version,
            current_step_index: self.current,
            total_steps: self.steps.len(),
            completed_steps: count(StepStatus::Completed),
            failed_steps: count(StepStatus::Failed),
            skipped_steps: count(StepStatus::Skipped),
            elapsed_ms,
            avg_step_duration_ms,
            estimated_remaining_ms: avg_step_duration_ms * remaining as f64,
        }
    }

    pub fn eta_ms(&self) -> f64 {
        self.progress().estimated_remaining_ms
    }

    fn emit_progress(&self) {
        if self.on_progress.is_empty() {
            return;
        }
        let progress = self.progress();
        for listener in &self.on_progress {
            listener(&progress);
        }
    }

    // Observers

    pub fn on_state_change(&mut self, listener: TransitionListener) {
        self.on_state_change.push(listener);
    }

    pub fn on_step_complete(&mut self, listener: StepListener) {
        self.on_step_complete.push(listener);
    }

    pub fn on_progress(&mut self, listener: ProgressListener) {
        self.on_progress.push(listener);
    }

    // Accessors

    pub fn mission_id(&self) -> &str {
        &self.mission_id
    }

    pub fn state(&self) -> MissionState {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn steps(&self) -> &[Arc<MissionStep>] {
        &self.steps
    }

    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.history.iter()
    }

    /// Cancelled when the mission enters `cancelled`
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn can_pause(&self) -> bool {
        self.state == MissionState::Executing
    }

    pub fn can_resume(&self) -> bool {
        self.state == MissionState::Paused
    }

    pub fn can_cancel(&self) -> bool {
        !self.is_terminal()
    }
}
