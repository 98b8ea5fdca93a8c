//! Test-only doubles and builders.
//!
//! [`ScriptedDriver`] and [`ScriptedProvider`] replay predetermined screens and
//! model replies so whole sessions run without a device or a model.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;

use crate::core::normalize::{Dialect, digest};
use crate::core::types::{
    Action, ActionProposal, ActionResult, Bounds, DeviceState, DispatchStatus, ElementKind,
    ExpectedEffect, Platform, UiElement,
};
use crate::io::cancel::CancelToken;
use crate::io::driver::{DeviceDriver, DriverError, PrimitiveAction, RawDispatch, RawSnapshot};
use crate::io::gateway::{ModelProvider, ModelRequest, ProviderErrorKind, ProviderFailure, Role};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scratch directory for trace and config fixtures, removed on drop.
pub fn scratch_dir() -> TempDir {
    tempfile::tempdir().expect("create scratch dir")
}

fn text_elements(texts: &[&str]) -> Vec<UiElement> {
    texts
        .iter()
        .enumerate()
        .map(|(i, text)| {
            let top = 100 + 80 * i as i32;
            UiElement {
                index: i,
                kind: ElementKind::Button,
                text: Some((*text).to_string()),
                description: None,
                resource_id: None,
                bounds: Bounds::new(0, top, 1080, top + 60),
                enabled: true,
                visible: true,
                focused: false,
                clickable: true,
                scrollable: false,
                checked: None,
                depth: 0,
                parent: None,
            }
        })
        .collect()
}

/// Deterministic state whose elements are buttons labelled `texts`.
pub fn state_with_texts(seq: u64, texts: &[&str]) -> DeviceState {
    let elements = text_elements(texts);
    DeviceState {
        seq,
        captured_at: Utc::now(),
        platform: Platform::Android,
        screen: None,
        focused_app: Some("com.example".to_string()),
        digest: digest(Some("com.example"), &elements),
        elements,
        screenshot: None,
        partial: None,
    }
}

/// Raw canonical capture with one button per text.
pub fn canonical_screen(texts: &[&str]) -> RawSnapshot {
    let payload = json!({
        "platform": "android",
        "focused_app": "com.example",
        "elements": text_elements(texts),
    });
    RawSnapshot {
        dialect: Dialect::Canonical,
        payload: payload.to_string(),
        screenshot_png: None,
        focused_app: None,
        screen: None,
    }
}

/// `raw` with `png` attached as its screenshot.
pub fn with_screenshot(raw: RawSnapshot, png: &[u8]) -> RawSnapshot {
    RawSnapshot {
        screenshot_png: Some(png.to_vec()),
        ..raw
    }
}

pub fn proposal(action: Action, expected: ExpectedEffect) -> ActionProposal {
    ActionProposal {
        action,
        rationale: "test".to_string(),
        expected,
    }
}

pub fn dispatched() -> ActionResult {
    result(DispatchStatus::Dispatched)
}

pub fn rejected(reason: &str) -> ActionResult {
    result(DispatchStatus::Rejected {
        reason: reason.to_string(),
    })
}

fn result(dispatch: DispatchStatus) -> ActionResult {
    let now = Utc::now();
    ActionResult {
        dispatch,
        started_at: now,
        ended_at: now,
        latency_ms: 0,
        post_state_seq: None,
    }
}

/// Ordered record of calls across doubles, shared to assert interleaving.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        lock(&self.0).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.0).clone()
    }
}

/// One scripted capture.
#[derive(Debug, Clone)]
pub enum CaptureScript {
    Screen(RawSnapshot),
    Unavailable(String),
}

/// One scripted dispatch outcome.
#[derive(Debug, Clone)]
pub enum DispatchScript {
    Accept,
    Refuse(String),
    Unavailable(String),
}

#[derive(Debug, Default)]
struct DriverState {
    captures: VecDeque<CaptureScript>,
    last_screen: Option<RawSnapshot>,
    dispatches: VecDeque<DispatchScript>,
    dispatched: Vec<PrimitiveAction>,
    capture_count: usize,
}

/// Driver replaying scripted captures; the last screen repeats once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedDriver {
    state: Mutex<DriverState>,
    log: Option<CallLog>,
}

impl ScriptedDriver {
    pub fn new(screens: Vec<RawSnapshot>) -> Self {
        Self::scripted(screens.into_iter().map(CaptureScript::Screen).collect())
    }

    pub fn scripted(captures: Vec<CaptureScript>) -> Self {
        Self {
            state: Mutex::new(DriverState {
                captures: captures.into(),
                ..DriverState::default()
            }),
            log: None,
        }
    }

    pub fn from_payloads(payloads: Vec<(Dialect, String)>) -> Self {
        Self::new(
            payloads
                .into_iter()
                .map(|(dialect, payload)| RawSnapshot {
                    dialect,
                    payload,
                    screenshot_png: None,
                    focused_app: None,
                    screen: None,
                })
                .collect(),
        )
    }

    /// Outcomes for successive dispatches; `Accept` once exhausted.
    pub fn with_dispatches(self, dispatches: Vec<DispatchScript>) -> Self {
        lock(&self.state).dispatches = dispatches.into();
        self
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn dispatched(&self) -> Vec<PrimitiveAction> {
        lock(&self.state).dispatched.clone()
    }

    pub fn capture_count(&self) -> usize {
        lock(&self.state).capture_count
    }
}

impl DeviceDriver for ScriptedDriver {
    fn capture(&self, _timeout: Duration) -> Result<RawSnapshot, DriverError> {
        if let Some(log) = &self.log {
            log.push("capture");
        }
        let mut state = lock(&self.state);
        state.capture_count += 1;
        match state.captures.pop_front() {
            Some(CaptureScript::Screen(screen)) => {
                state.last_screen = Some(screen.clone());
                Ok(screen)
            }
            Some(CaptureScript::Unavailable(msg)) => Err(DriverError::unavailable(msg)),
            None => state
                .last_screen
                .clone()
                .ok_or_else(|| DriverError::unavailable("no scripted screen")),
        }
    }

    fn dispatch(
        &self,
        action: &PrimitiveAction,
        _timeout: Duration,
    ) -> Result<RawDispatch, DriverError> {
        if let Some(log) = &self.log {
            log.push("dispatch");
        }
        let mut state = lock(&self.state);
        match state.dispatches.pop_front().unwrap_or(DispatchScript::Accept) {
            DispatchScript::Accept => {
                state.dispatched.push(action.clone());
                Ok(RawDispatch::default())
            }
            DispatchScript::Refuse(msg) => Err(DriverError::refused(msg)),
            DispatchScript::Unavailable(msg) => Err(DriverError::unavailable(msg)),
        }
    }
}

/// One scripted model reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Fail(ProviderErrorKind),
    Unconfigured,
}

impl ScriptedReply {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text(body.into())
    }

    pub fn timeout() -> Self {
        Self::Fail(ProviderErrorKind::Timeout)
    }

    /// Planner reply tapping element `index`, expecting `visible` afterwards.
    pub fn tap(index: usize, visible: &str) -> Self {
        Self::Text(
            json!({
                "action": {"type": "tap", "target": {"by": "element", "index": index}},
                "rationale": format!("tap element {index}"),
                "expected": {"description": format!("{visible} is shown"), "visible_texts": [visible]}
            })
            .to_string(),
        )
    }

    /// Planner reply declaring the goal met, proven by `visible` on screen.
    pub fn done(summary: &str, visible: &str) -> Self {
        Self::Text(
            json!({
                "action": {"type": "declare_done", "summary": summary},
                "rationale": "goal visible on screen",
                "expected": {"description": format!("{visible} is shown"), "visible_texts": [visible]}
            })
            .to_string(),
        )
    }

    pub fn stuck(reason: &str) -> Self {
        Self::Text(
            json!({
                "action": {"type": "declare_stuck", "reason": reason},
                "rationale": "no path",
                "expected": {"description": "nothing changes"}
            })
            .to_string(),
        )
    }

    pub fn verdict(verdict: &str) -> Self {
        Self::Text(json!({"verdict": verdict, "rationale": "scripted"}).to_string())
    }
}

#[derive(Debug, Default)]
struct ProviderState {
    queues: HashMap<Option<Role>, VecDeque<ScriptedReply>>,
    last: HashMap<Option<Role>, ScriptedReply>,
    prompts: Vec<String>,
    roles: Vec<Role>,
}

/// Provider replaying scripted replies, per role or from one shared queue.
///
/// An exhausted queue repeats its last reply.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    state: Mutex<ProviderState>,
    log: Option<CallLog>,
}

impl ScriptedProvider {
    /// Shared queue consumed by every role.
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        let provider = Self::default();
        lock(&provider.state).queues.insert(None, replies.into());
        provider
    }

    pub fn for_role(self, role: Role, replies: Vec<ScriptedReply>) -> Self {
        lock(&self.state).queues.insert(Some(role), replies.into());
        self
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn calls(&self) -> usize {
        lock(&self.state).prompts.len()
    }

    pub fn calls_for(&self, role: Role) -> usize {
        lock(&self.state).roles.iter().filter(|r| **r == role).count()
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.state).prompts.clone()
    }
}

impl ModelProvider for ScriptedProvider {
    fn complete(
        &self,
        request: &ModelRequest,
        _cancel: &CancelToken,
    ) -> Result<String, ProviderFailure> {
        if let Some(log) = &self.log {
            log.push(format!("model:{}", request.role));
        }
        let mut state = lock(&self.state);
        state.prompts.push(request.prompt.clone());
        state.roles.push(request.role);
        let key = if state.queues.contains_key(&Some(request.role)) {
            Some(request.role)
        } else {
            None
        };
        let next = state.queues.get_mut(&key).and_then(VecDeque::pop_front);
        let reply = match next {
            Some(reply) => {
                state.last.insert(key, reply.clone());
                reply
            }
            None => state
                .last
                .get(&key)
                .cloned()
                .ok_or_else(|| ProviderFailure::Unconfigured("no scripted reply".into()))?,
        };
        match reply {
            ScriptedReply::Text(text) => Ok(text),
            ScriptedReply::Fail(kind) => {
                Err(ProviderFailure::transient(kind, "scripted failure"))
            }
            ScriptedReply::Unconfigured => {
                Err(ProviderFailure::Unconfigured("scripted".into()))
            }
        }
    }
}
