use crate::dom::ElementInfo;
use crate::healing::context::{ActionKind, ElementContext};
use crate::selector::Selector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mission lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissionState {
    #[default]
    Pending,
    Compiling,
    Executing,
    Verifying,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl MissionState {
    /// States reachable from this one
    pub fn allowed_transitions(&self) -> &'static [MissionState] {
        use MissionState::*;
        match self {
            Pending => &[Compiling, Cancelled],
            Compiling => &[Executing, Failed, Cancelled],
            Executing => &[Verifying, Paused, Failed, Cancelled],
            Verifying => &[Executing, Completed, Failed, Cancelled],
            Paused => &[Executing, Cancelled],
            Completed | Failed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, to: MissionState) -> bool {
        self.allowed_transitions().contains(&to)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MissionState::Completed | MissionState::Failed | MissionState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MissionState::Pending => "pending",
            MissionState::Compiling => "compiling",
            MissionState::Executing => "executing",
            MissionState::Verifying => "verifying",
            MissionState::Paused => "paused",
            MissionState::Completed => "completed",
            MissionState::Failed => "failed",
            MissionState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for MissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Navigate,
    Click,
    Type,
    Select,
    Hover,
    Extract,
    Wait,
    Scroll,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Navigate => "navigate",
            ActionType::Click => "click",
            ActionType::Type => "type",
            ActionType::Select => "select",
            ActionType::Hover => "hover",
            ActionType::Extract => "extract",
            ActionType::Wait => "wait",
            ActionType::Scroll => "scroll",
        }
    }

    fn action_kind(&self) -> ActionKind {
        match self {
            ActionType::Click => ActionKind::Click,
            ActionType::Type => ActionKind::Type,
            ActionType::Select => ActionKind::Select,
            ActionType::Hover => ActionKind::Hover,
            ActionType::Extract => ActionKind::Extract,
            ActionType::Scroll => ActionKind::Scroll,
            ActionType::Navigate | ActionType::Wait => ActionKind::Other,
        }
    }
}

/// One compiled step of a mission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionAction {
    #[serde(rename = "type")]
    pub kind: ActionType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Selector>,

    /// URL for navigate, text for type/select, milliseconds for wait
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default)]
    pub description: String,

    /// Last known description of the target, used for healing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<ElementInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ElementContext>,
}

impl MissionAction {
    pub fn new(kind: ActionType) -> Self {
        Self { kind, selector: None, value: None, description: String::new(), element: None, context: None }
    }

    pub fn navigate(url: impl Into<String>) -> Self {
        Self::new(ActionType::Navigate).with_value(url)
    }

    pub fn click(selector: Selector) -> Self {
        Self::new(ActionType::Click).with_selector(selector)
    }

    pub fn type_text(selector: Selector, text: impl Into<String>) -> Self {
        Self::new(ActionType::Type).with_selector(selector).with_value(text)
    }

    pub fn extract(selector: Selector) -> Self {
        Self::new(ActionType::Extract).with_selector(selector)
    }

    pub fn wait(ms: u64) -> Self {
        Self::new(ActionType::Wait).with_value(ms.to_string())
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_element(mut self, element: ElementInfo) -> Self {
        self.element = Some(element);
        self
    }

    pub fn with_context(mut self, context: ElementContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Explicit context, or one derived from the action and last known element
    pub fn element_context(&self) -> ElementContext {
        if let Some(context) = &self.context {
            return context.clone();
        }
        let mut context = ElementContext::new(self.kind.action_kind());
        if let Some(element) = &self.element {
            context = context.with_expected_tag(element.tag());
            let text = element.text().trim();
            if !text.is_empty() {
                context = context.with_near_text(text);
            }
            for name in ["name", "type", "role", "placeholder"] {
                if let Some(value) = element.get_attribute(name) {
                    context = context.with_attribute(name, value);
                }
            }
        }
        context
    }

    /// Label for logs and errors
    pub fn label(&self) -> String {
        if !self.description.is_empty() {
            return self.description.clone();
        }
        match &self.selector {
            Some(selector) => format!("{} {}", self.kind.as_str(), selector.value),
            None => format!("{} {}", self.kind.as_str(), self.value.as_deref().unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Executing,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub duration_ms: u64,
    /// Locator that actually worked, which differs from the action's after healing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector_used: Option<Selector>,
    #[serde(default)]
    pub healed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn success(duration_ms: u64) -> Self {
        Self { success: true, duration_ms, selector_used: None, healed: false, output: None, error: None }
    }

    pub fn failure(error: impl Into<String>, duration_ms: u64) -> Self {
        Self { success: false, error: Some(error.into()), ..Self::success(duration_ms) }
    }

    pub fn with_selector(mut self, selector: Selector, healed: bool) -> Self {
        self.selector_used = Some(selector);
        self.healed = healed;
        self
    }

    pub fn with_output(mut self, output: Option<serde_json::Value>) -> Self {
        self.output = output;
        self
    }
}

/// Saved cursor position plus caller state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step_index: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub state: serde_json::Value,
}

/// Immutable step snapshot; the state machine replaces steps instead of mutating them
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissionStep {
    pub index: usize,
    pub action: MissionAction,
    pub status: StepStatus,
    pub result: Option<StepResult>,
    pub checkpoint: Option<Checkpoint>,
}

impl MissionStep {
    pub fn new(index: usize, action: MissionAction) -> Self {
        Self { index, action, status: StepStatus::Pending, result: None, checkpoint: None }
    }

    pub(crate) fn with_status(&self, status: StepStatus) -> Self {
        Self { status, ..self.clone() }
    }

    pub(crate) fn with_result(&self, status: StepStatus, result: StepResult) -> Self {
        Self { status, result: Some(result), ..self.clone() }
    }

    pub(crate) fn with_checkpoint(&self, checkpoint: Checkpoint) -> Self {
        Self { checkpoint: Some(checkpoint), ..self.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub from: MissionState,
    pub to: MissionState,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub step_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissionProgress {
    pub mission_id: String,
    pub state: MissionState,
    pub version: u64,
    pub current_step_index: usize,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    /// Wall time since compiling started, minus time spent paused
    pub elapsed_ms: u64,
    pub avg_step_duration_ms: f64,
    pub estimated_remaining_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        for state in [MissionState::Completed, MissionState::Failed, MissionState::Cancelled] {
            assert!(state.is_terminal());
            assert!(state.allowed_transitions().is_empty());
        }
        assert!(MissionState::Verifying.can_transition_to(MissionState::Executing));
        assert!(!MissionState::Executing.can_transition_to(MissionState::Completed));
    }

    #[test]
    fn test_element_context_from_element() {
        let action = MissionAction::click(Selector::css("#buy"))
            .with_element(ElementInfo::new("BUTTON").with_text(" Buy now ").with_attribute("name", "buy"));
        let context = action.element_context();

        assert_eq!(context.action, ActionKind::Click);
        assert_eq!(context.expected_tag.as_deref(), Some("button"));
        assert_eq!(context.near_text.as_deref(), Some("Buy now"));
        assert_eq!(context.attributes.get("name").map(String::as_str), Some("buy"));
    }

    #[test]
    fn test_action_serialization() {
        let action = MissionAction::type_text(Selector::css("input[name=\"q\"]"), "rust");
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "type");
        assert_eq!(json["value"], "rust");
        assert_eq!(json["selector"]["strategy"], "css");
    }
}
