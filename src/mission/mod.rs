//! Mission execution
//!
//! [`MissionStateMachine`] owns a mission's lifecycle, steps, timing and
//! checkpoints. [`MissionRunner`] drives it against a [`StepDriver`] with retries,
//! the driver circuit and selector healing.

pub mod runner;
pub mod state_machine;
pub mod types;

pub use runner::{MissionControl, MissionRunner, RunnerConfig, StepDriver};
pub use state_machine::{MissionConfig, MissionStateMachine, ProgressListener, StepListener, TransitionListener};
pub use types::{
    ActionType, Checkpoint, MissionAction, MissionProgress, MissionState, MissionStep, StateTransition, StepResult,
    StepStatus,
};
