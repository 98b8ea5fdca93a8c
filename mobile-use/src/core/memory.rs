//! Append-only session memory shared read-only with the planner and verifier.

use serde::{Deserialize, Serialize};

use crate::core::types::{Action, DeviceState, DispatchStatus, Goal, StepRecord, Verdict};

/// Failure note recorded when the controller re-plans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplanNote {
    /// Logical step that failed.
    pub step: u32,
    pub note: String,
}

/// Ordered log of every step taken in one session.
///
/// Entries are only ever appended; stages receive `&SessionRecord`.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    goal: Goal,
    steps: Vec<StepRecord>,
    replans: Vec<ReplanNote>,
    last_confirmed: Option<DeviceState>,
}

impl SessionRecord {
    pub fn new(goal: Goal) -> Self {
        Self {
            goal,
            steps: Vec::new(),
            replans: Vec::new(),
            last_confirmed: None,
        }
    }

    pub fn goal(&self) -> &Goal {
        &self.goal
    }

    /// Seed the record with the intake snapshot.
    pub fn observe_initial(&mut self, state: &DeviceState) {
        if self.last_confirmed.is_none() {
            self.last_confirmed = Some(state.clone());
        }
    }

    /// Append a step; a confirmed step promotes `post_state` to the last confirmed state.
    pub fn append(&mut self, record: StepRecord, post_state: Option<&DeviceState>) {
        let confirmed = record
            .verification
            .as_ref()
            .is_some_and(|v| v.verdict == Verdict::Confirmed);
        if confirmed && let Some(post) = post_state {
            self.last_confirmed = Some(post.clone());
        }
        self.steps.push(record);
    }

    pub fn record_replan(&mut self, step: u32, note: String) {
        self.replans.push(ReplanNote { step, note });
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The most recent `window` step records, oldest first.
    pub fn recent(&self, window: usize) -> &[StepRecord] {
        let start = self.steps.len().saturating_sub(window);
        &self.steps[start..]
    }

    pub fn replan_notes(&self) -> &[ReplanNote] {
        &self.replans
    }

    pub fn latest_replan_note(&self) -> Option<&ReplanNote> {
        self.replans.last()
    }

    pub fn last_confirmed_state(&self) -> Option<&DeviceState> {
        self.last_confirmed.as_ref()
    }

    pub fn attempted_actions(&self) -> Vec<Action> {
        self.steps.iter().map(|s| s.proposal.action.clone()).collect()
    }

    /// Actions that were rejected or not confirmed when taken from a screen with `digest`.
    pub fn falsified_at(&self, digest: &str) -> Vec<&Action> {
        let mut actions: Vec<&Action> = Vec::new();
        for step in self.steps.iter().filter(|s| s.pre_state.digest == digest) {
            if step_failed(step) && !actions.contains(&&step.proposal.action) {
                actions.push(&step.proposal.action);
            }
        }
        actions
    }

    pub fn was_falsified_at(&self, action: &Action, digest: &str) -> bool {
        self.falsified_at(digest).contains(&action)
    }
}

fn step_failed(step: &StepRecord) -> bool {
    if matches!(step.result.dispatch, DispatchStatus::Rejected { .. }) {
        return true;
    }
    step.verification
        .as_ref()
        .is_some_and(|v| v.verdict != Verdict::Confirmed)
}
