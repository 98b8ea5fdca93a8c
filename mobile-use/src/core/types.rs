//! Shared deterministic types for the agent core.
//!
//! These types define stable contracts between the loop stages. They carry no
//! I/O handles and serialize into the session transcript unchanged.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Natural-language instruction driving one session. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Goal(String);

impl Goal {
    pub fn new(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("goal must not be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
    Unknown,
}

/// Closed element vocabulary shared by every driver dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Button,
    Text,
    TextField,
    Image,
    Checkbox,
    Switch,
    List,
    Tab,
    Link,
    Container,
    Other,
}

impl ElementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ElementKind::Button => "button",
            ElementKind::Text => "text",
            ElementKind::TextField => "text_field",
            ElementKind::Image => "image",
            ElementKind::Checkbox => "checkbox",
            ElementKind::Switch => "switch",
            ElementKind::List => "list",
            ElementKind::Tab => "tab",
            ElementKind::Link => "link",
            ElementKind::Container => "container",
            ElementKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// Screen-space rectangle in device pixels (`right`/`bottom` exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Bounds {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i32 {
        (self.right - self.left).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.bottom - self.top).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn center(&self) -> Point {
        Point {
            x: self.left + self.width() / 2,
            y: self.top + self.height() / 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSize {
    pub width: i32,
    pub height: i32,
}

/// One element of the canonical UI tree, stored in pre-order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiElement {
    pub index: usize,
    pub kind: ElementKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub bounds: Bounds,
    pub enabled: bool,
    pub visible: bool,
    #[serde(default)]
    pub focused: bool,
    #[serde(default)]
    pub clickable: bool,
    #[serde(default)]
    pub scrollable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked: Option<bool>,
    #[serde(default)]
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<usize>,
}

impl UiElement {
    /// Text and content description joined, for matching and display.
    pub fn label(&self) -> String {
        match (&self.text, &self.description) {
            (Some(text), Some(desc)) if text != desc => format!("{text} / {desc}"),
            (Some(text), _) => text.clone(),
            (None, Some(desc)) => desc.clone(),
            (None, None) => String::new(),
        }
    }

    pub fn mentions(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        [&self.text, &self.description]
            .into_iter()
            .flatten()
            .any(|value| value.to_lowercase().contains(&needle))
    }
}

/// Reference to the visual artifact captured alongside a snapshot.
///
/// The PNG bytes are kept in memory for model calls but never serialized; trace
/// recording writes them next to the transcript and fills `path`, relative to the
/// trace directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screenshot {
    pub bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip)]
    pub png: Arc<Vec<u8>>,
}

/// Canonical, driver-agnostic snapshot of the device UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Monotonically increasing within a session, starting at 1.
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    pub platform: Platform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<ScreenSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focused_app: Option<String>,
    pub elements: Vec<UiElement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<Screenshot>,
    /// Set when the element tree could not be fully enumerated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<String>,
    /// Stable digest of the element tree and focused app.
    pub digest: String,
}

impl DeviceState {
    pub fn element(&self, index: usize) -> Option<&UiElement> {
        self.elements.iter().find(|el| el.index == index)
    }

    pub fn find_by_text(&self, needle: &str) -> Option<&UiElement> {
        let lowered = needle.to_lowercase();
        self.elements
            .iter()
            .filter(|el| el.visible)
            .find(|el| {
                [&el.text, &el.description]
                    .into_iter()
                    .flatten()
                    .any(|value| value.to_lowercase() == lowered)
            })
            .or_else(|| self.elements.iter().filter(|el| el.visible).find(|el| el.mentions(needle)))
    }

    pub fn find_by_resource_id(&self, id: &str) -> Option<&UiElement> {
        self.elements
            .iter()
            .find(|el| el.resource_id.as_deref() == Some(id))
    }

    pub fn mentions(&self, needle: &str) -> bool {
        self.elements
            .iter()
            .filter(|el| el.visible)
            .any(|el| el.mentions(needle))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Key {
    Back,
    Home,
    Enter,
    Delete,
    AppSwitch,
}

/// How an action addresses the screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Target {
    Element { index: usize },
    Text { text: String },
    ResourceId { id: String },
    Coordinates { x: i32, y: i32 },
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Element { index } => write!(f, "#{index}"),
            Target::Text { text } => write!(f, "\"{text}\""),
            Target::ResourceId { id } => write!(f, "id={id}"),
            Target::Coordinates { x, y } => write!(f, "({x},{y})"),
        }
    }
}

/// Logical action vocabulary the planner chooses from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Tap {
        target: Target,
    },
    LongPress {
        target: Target,
        #[serde(default = "default_long_press_ms")]
        duration_ms: u64,
    },
    Swipe {
        from: Point,
        to: Point,
        #[serde(default = "default_swipe_ms")]
        duration_ms: u64,
    },
    Scroll {
        direction: Direction,
    },
    TypeText {
        text: String,
    },
    PressKey {
        key: Key,
    },
    LaunchApp {
        package: String,
    },
    Wait {
        duration_ms: u64,
    },
    DeclareDone {
        summary: String,
    },
    DeclareStuck {
        reason: String,
    },
}

fn default_long_press_ms() -> u64 {
    800
}

fn default_swipe_ms() -> u64 {
    300
}

impl Action {
    pub fn is_declaration(&self) -> bool {
        matches!(self, Action::DeclareDone { .. } | Action::DeclareStuck { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Tap { .. } => "tap",
            Action::LongPress { .. } => "long_press",
            Action::Swipe { .. } => "swipe",
            Action::Scroll { .. } => "scroll",
            Action::TypeText { .. } => "type_text",
            Action::PressKey { .. } => "press_key",
            Action::LaunchApp { .. } => "launch_app",
            Action::Wait { .. } => "wait",
            Action::DeclareDone { .. } => "declare_done",
            Action::DeclareStuck { .. } => "declare_stuck",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Tap { target } => write!(f, "tap {target}"),
            Action::LongPress {
                target,
                duration_ms,
            } => write!(f, "long_press {target} {duration_ms}ms"),
            Action::Swipe { from, to, .. } => {
                write!(f, "swipe ({},{})->({},{})", from.x, from.y, to.x, to.y)
            }
            Action::Scroll { direction } => write!(f, "scroll {direction:?}"),
            Action::TypeText { text } => write!(f, "type \"{text}\""),
            Action::PressKey { key } => write!(f, "press {key:?}"),
            Action::LaunchApp { package } => write!(f, "launch {package}"),
            Action::Wait { duration_ms } => write!(f, "wait {duration_ms}ms"),
            Action::DeclareDone { summary } => write!(f, "declare_done: {summary}"),
            Action::DeclareStuck { reason } => write!(f, "declare_stuck: {reason}"),
        }
    }
}

/// Planner's stated expectation for the post-action screen.
///
/// `description` is always present; the optional predicates let the
/// deterministic rule set decide cheap cases without a model call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedEffect {
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub visible_texts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub absent_texts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_changes: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focused_app: Option<String>,
}

impl ExpectedEffect {
    pub fn has_predicates(&self) -> bool {
        !self.visible_texts.is_empty()
            || !self.absent_texts.is_empty()
            || self.screen_changes.is_some()
            || self.focused_app.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionProposal {
    pub action: Action,
    pub rationale: String,
    pub expected: ExpectedEffect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchStatus {
    Dispatched,
    Rejected { reason: String },
    /// Declarations never reach the driver.
    NotDispatched,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub dispatch: DispatchStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub latency_ms: u64,
    /// Sequence number of the snapshot captured right after dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_state_seq: Option<u64>,
}

impl ActionResult {
    pub fn is_rejected(&self) -> bool {
        matches!(self.dispatch, DispatchStatus::Rejected { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Confirmed,
    Contradicted,
    Inconclusive,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Confirmed => "confirmed",
            Verdict::Contradicted => "contradicted",
            Verdict::Inconclusive => "inconclusive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationSource {
    Rules,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub verdict: Verdict,
    pub rationale: String,
    pub source: VerificationSource,
}

/// Recovery controller decision recorded with each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Continue,
    RetryStep,
    Replan,
    TerminateSuccess,
    TerminateFailure,
}

/// One appended entry of the session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Logical step (advances on continue and replan).
    pub step: u32,
    /// 0 for the first attempt of a step, incremented on each retry.
    pub attempt: u32,
    pub pre_state: DeviceState,
    pub proposal: ActionProposal,
    pub result: ActionResult,
    /// Absent when the dispatch was rejected or the planner declared stuck.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationOutcome>,
    pub transition: Transition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoPath,
    ProviderUnavailable,
    ProviderUnconfigured,
    DriverUnavailable,
    ReplanBudgetExhausted,
    StepLimit,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::NoPath => "no_path",
            FailureReason::ProviderUnavailable => "provider_unavailable",
            FailureReason::ProviderUnconfigured => "provider_unconfigured",
            FailureReason::DriverUnavailable => "driver_unavailable",
            FailureReason::ReplanBudgetExhausted => "replan_budget_exhausted",
            FailureReason::StepLimit => "step_limit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    Cancelled,
    DeadlineExceeded,
}

impl AbortReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AbortReason::Cancelled => "cancelled",
            AbortReason::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

/// Terminal value of a session, produced exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionOutcome {
    Succeeded {
        summary: String,
    },
    Failed {
        reason: FailureReason,
        detail: String,
    },
    Aborted {
        reason: AbortReason,
        detail: String,
    },
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Succeeded { .. })
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Succeeded { summary } => write!(f, "succeeded: {summary}"),
            SessionOutcome::Failed { reason, detail } => {
                write!(f, "failed({}): {detail}", reason.as_str())
            }
            SessionOutcome::Aborted { reason, detail } => {
                write!(f, "aborted({}): {detail}", reason.as_str())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goal_rejects_blank_input() {
        assert!(Goal::new("   ").is_err());
        assert_eq!(Goal::new("  open settings ").unwrap().as_str(), "open settings");
    }

    #[test]
    fn action_uses_tagged_representation() {
        let action: Action = serde_json::from_value(serde_json::json!({
            "type": "tap",
            "target": {"by": "element", "index": 4}
        }))
        .expect("parse action");
        assert_eq!(
            action,
            Action::Tap {
                target: Target::Element { index: 4 }
            }
        );

        let wait: Action =
            serde_json::from_value(serde_json::json!({"type": "wait", "duration_ms": 500}))
                .expect("parse wait");
        assert_eq!(wait.name(), "wait");
        assert!(!wait.is_declaration());
    }

    #[test]
    fn outcome_serializes_status_and_reason() {
        let outcome = SessionOutcome::Failed {
            reason: FailureReason::NoPath,
            detail: "planner declared stuck".to_string(),
        };
        let json = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["reason"], "no_path");
    }

    #[test]
    fn bounds_center_is_midpoint() {
        let bounds = Bounds::new(100, 200, 300, 260);
        assert_eq!(bounds.center(), Point { x: 200, y: 230 });
        assert!(!bounds.is_empty());
        assert!(Bounds::new(5, 5, 5, 9).is_empty());
    }
}
