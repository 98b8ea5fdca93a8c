//! Planner agent: asks the model for the next single action.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::memory::SessionRecord;
use crate::core::types::{Action, ActionProposal, DeviceState, Target};
use crate::io::cancel::CancelToken;
use crate::io::gateway::{Gateway, GatewayError, Role, StructuredResponse};
use crate::io::prompt::{PlannerInputs, PromptBuilder};

use super::{screenshot_of, unexpected_variant};

#[derive(Debug)]
pub struct Planner<'g> {
    gateway: &'g Gateway,
    prompts: PromptBuilder,
    memory_window: usize,
    attach_screenshot: bool,
}

impl<'g> Planner<'g> {
    pub fn new(
        gateway: &'g Gateway,
        prompts: PromptBuilder,
        memory_window: usize,
        attach_screenshot: bool,
    ) -> Self {
        Self {
            gateway,
            prompts,
            memory_window,
            attach_screenshot,
        }
    }

    /// Propose the next action for `state`.
    ///
    /// A proposal that repeats an action already falsified on this screen, or
    /// that names an element index absent from it, is re-asked once with a
    /// corrective note; the second answer is accepted as-is.
    #[instrument(skip_all, fields(seq = state.seq, history = memory.len()))]
    pub fn plan(
        &self,
        state: &DeviceState,
        memory: &SessionRecord,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ActionProposal, GatewayError> {
        let avoid: Vec<String> = memory
            .falsified_at(&state.digest)
            .into_iter()
            .map(ToString::to_string)
            .collect();
        let replan_note = memory.latest_replan_note().map(|n| n.note.as_str());
        let mut inputs = PlannerInputs {
            goal: memory.goal().as_str(),
            state,
            recent: memory.recent(self.memory_window),
            replan_note,
            avoid,
            correction: None,
        };
        let images = if self.attach_screenshot {
            screenshot_of(state)
        } else {
            Vec::new()
        };

        let proposal = self.ask(&inputs, &images, timeout, cancel)?;
        let Some(problem) = proposal_problem(&proposal, state, memory) else {
            info!(action = %proposal.action, "planned");
            return Ok(proposal);
        };

        warn!(action = %proposal.action, %problem, "re-asking planner once");
        let correction = format!(
            "Your previous proposal `{}` is not acceptable: {problem}. Propose a different action.",
            proposal.action
        );
        inputs.correction = Some(&correction);
        let proposal = self.ask(&inputs, &images, timeout, cancel)?;
        info!(action = %proposal.action, "planned after correction");
        Ok(proposal)
    }

    fn ask(
        &self,
        inputs: &PlannerInputs<'_>,
        images: &[Arc<Vec<u8>>],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ActionProposal, GatewayError> {
        let prompt = self
            .prompts
            .build_planner(inputs)
            .map_err(|err| GatewayError::Unconfigured(format!("planner prompt: {err:#}")))?;
        debug!(prompt_bytes = prompt.len(), "planner prompt built");
        match self
            .gateway
            .invoke(Role::Planner, &prompt, images, timeout, cancel)?
        {
            StructuredResponse::Proposal(proposal) => Ok(proposal),
            other => Err(unexpected_variant(Role::Planner, &other)),
        }
    }
}

/// Why a proposal should be re-asked, if at all.
fn proposal_problem(
    proposal: &ActionProposal,
    state: &DeviceState,
    memory: &SessionRecord,
) -> Option<String> {
    if let Some(index) = element_index(&proposal.action)
        && state.element(index).is_none()
    {
        return Some(format!(
            "element #{index} does not exist on the current screen ({} elements)",
            state.elements.len()
        ));
    }
    if !proposal.action.is_declaration() && memory.was_falsified_at(&proposal.action, &state.digest)
    {
        return Some("it already failed on this exact screen".to_string());
    }
    None
}

fn element_index(action: &Action) -> Option<usize> {
    match action {
        Action::Tap {
            target: Target::Element { index },
        }
        | Action::LongPress {
            target: Target::Element { index },
            ..
        } => Some(*index),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ExpectedEffect, Goal, StepRecord, Transition};
    use crate::test_support::{ScriptedProvider, ScriptedReply, proposal, rejected, state_with_texts};

    fn gateway(replies: Vec<ScriptedReply>) -> (Arc<ScriptedProvider>, Gateway) {
        let provider = Arc::new(ScriptedProvider::new(replies));
        let gateway = Gateway::new(Arc::clone(&provider), Duration::from_secs(5)).expect("gateway");
        (provider, gateway)
    }

    fn memory_with_rejected_tap(state: &DeviceState) -> SessionRecord {
        let mut memory = SessionRecord::new(Goal::new("open battery").expect("goal"));
        memory.observe_initial(state);
        memory.append(
            StepRecord {
                step: 1,
                attempt: 0,
                pre_state: state.clone(),
                proposal: proposal(
                    Action::Tap {
                        target: Target::Element { index: 0 },
                    },
                    ExpectedEffect::default(),
                ),
                result: rejected("disabled"),
                verification: None,
                transition: Transition::RetryStep,
            },
            None,
        );
        memory
    }

    #[test]
    fn accepts_fresh_proposal_without_reask() {
        let state = state_with_texts(1, &["Settings", "Battery"]);
        let memory = SessionRecord::new(Goal::new("open battery").expect("goal"));
        let (provider, gateway) = gateway(vec![ScriptedReply::tap(1, "Battery level")]);
        let planner = Planner::new(&gateway, PromptBuilder::new(20_000), 8, true);

        let proposal = planner
            .plan(&state, &memory, Duration::from_secs(1), &CancelToken::new())
            .expect("plan");
        assert_eq!(
            proposal.action,
            Action::Tap {
                target: Target::Element { index: 1 }
            }
        );
        assert_eq!(provider.calls(), 1);
    }

    /// Verifies a repeated falsified action triggers exactly one corrective re-ask.
    #[test]
    fn repeated_falsified_action_is_reasked_once() {
        let state = state_with_texts(1, &["Settings", "Battery"]);
        let memory = memory_with_rejected_tap(&state);
        let (provider, gateway) = gateway(vec![
            ScriptedReply::tap(0, "Battery level"),
            ScriptedReply::tap(0, "Battery level"),
        ]);
        let planner = Planner::new(&gateway, PromptBuilder::new(20_000), 8, false);

        let proposal = planner
            .plan(&state, &memory, Duration::from_secs(1), &CancelToken::new())
            .expect("plan");
        assert_eq!(provider.calls(), 2, "one re-ask, then accepted");
        assert_eq!(
            proposal.action,
            Action::Tap {
                target: Target::Element { index: 0 }
            }
        );
        let prompts = provider.prompts();
        assert!(prompts[0].contains("tap #0"), "avoid list in first prompt");
        assert!(prompts[1].contains("already failed on this exact screen"));
    }

    #[test]
    fn out_of_range_index_is_corrected() {
        let state = state_with_texts(1, &["Settings"]);
        let memory = SessionRecord::new(Goal::new("open settings").expect("goal"));
        let (provider, gateway) = gateway(vec![
            ScriptedReply::tap(7, "Settings page"),
            ScriptedReply::tap(0, "Settings page"),
        ]);
        let planner = Planner::new(&gateway, PromptBuilder::new(20_000), 8, false);

        let proposal = planner
            .plan(&state, &memory, Duration::from_secs(1), &CancelToken::new())
            .expect("plan");
        assert_eq!(provider.calls(), 2);
        assert_eq!(
            proposal.action,
            Action::Tap {
                target: Target::Element { index: 0 }
            }
        );
    }

    #[test]
    fn provider_timeout_surfaces_as_retryable_error() {
        let state = state_with_texts(1, &["Settings"]);
        let memory = SessionRecord::new(Goal::new("open settings").expect("goal"));
        let (_provider, gateway) = gateway(vec![ScriptedReply::timeout()]);
        let planner = Planner::new(&gateway, PromptBuilder::new(20_000), 8, false);

        let err = planner
            .plan(&state, &memory, Duration::from_secs(1), &CancelToken::new())
            .expect_err("timeout");
        assert!(matches!(err, GatewayError::Provider { .. }));
    }
}
