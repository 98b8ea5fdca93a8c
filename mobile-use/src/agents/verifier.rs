//! Verifier: decides whether a step had its expected effect.

use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::core::rules::{RuleDecision, evaluate};
use crate::core::types::{
    ActionProposal, DeviceState, Goal, Verdict, VerificationOutcome, VerificationSource,
};
use crate::io::cancel::CancelToken;
use crate::io::gateway::{Gateway, GatewayError, Role, StructuredResponse};
use crate::io::prompt::{PromptBuilder, VerifierInputs};

use super::{screenshot_of, unexpected_variant};

#[derive(Debug)]
pub struct Verifier<'g> {
    gateway: &'g Gateway,
    prompts: PromptBuilder,
    model_fallback: bool,
    attach_screenshot: bool,
}

impl<'g> Verifier<'g> {
    pub fn new(
        gateway: &'g Gateway,
        prompts: PromptBuilder,
        model_fallback: bool,
        attach_screenshot: bool,
    ) -> Self {
        Self {
            gateway,
            prompts,
            model_fallback,
            attach_screenshot,
        }
    }

    /// Rules first; only undecided cases reach the model.
    ///
    /// A verdict that stays malformed after the gateway's re-ask is
    /// `inconclusive`. Transport errors propagate for the controller to retry.
    #[instrument(skip_all, fields(action = %proposal.action, pre = pre.seq, post = post.seq))]
    pub fn verify(
        &self,
        goal: &Goal,
        proposal: &ActionProposal,
        pre: &DeviceState,
        post: &DeviceState,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<VerificationOutcome, GatewayError> {
        let note = match evaluate(proposal, pre, post) {
            RuleDecision::Decided { verdict, rationale } => {
                info!(verdict = verdict.as_str(), %rationale, "decided by rules");
                return Ok(VerificationOutcome {
                    verdict,
                    rationale,
                    source: VerificationSource::Rules,
                });
            }
            RuleDecision::Undecided(note) => note,
        };

        if !self.model_fallback {
            return Ok(VerificationOutcome {
                verdict: Verdict::Inconclusive,
                rationale: format!("rules undecided ({note}) and model verification disabled"),
                source: VerificationSource::Rules,
            });
        }

        let action = proposal.action.to_string();
        let prompt = self
            .prompts
            .build_verifier(&VerifierInputs {
                goal: goal.as_str(),
                action,
                rationale: &proposal.rationale,
                expected: &proposal.expected.description,
                pre,
                post,
                rules_note: Some(&note),
            })
            .map_err(|err| GatewayError::Unconfigured(format!("verifier prompt: {err:#}")))?;
        let images = if self.attach_screenshot {
            screenshot_of(post)
        } else {
            Vec::new()
        };

        let outcome = match self
            .gateway
            .invoke(Role::Verifier, &prompt, &images, timeout, cancel)
        {
            Ok(StructuredResponse::Verdict(verdict)) => VerificationOutcome {
                verdict: verdict.verdict,
                rationale: verdict.rationale,
                source: VerificationSource::Model,
            },
            Ok(other) => inconclusive(&unexpected_variant(Role::Verifier, &other)),
            Err(err @ GatewayError::Malformed { .. }) => inconclusive(&err),
            Err(err) => return Err(err),
        };
        info!(verdict = outcome.verdict.as_str(), "decided by model");
        Ok(outcome)
    }
}

fn inconclusive(err: &GatewayError) -> VerificationOutcome {
    warn!(error = %err, "unusable verdict, failing closed");
    VerificationOutcome {
        verdict: Verdict::Inconclusive,
        rationale: err.to_string(),
        source: VerificationSource::Model,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::types::{Action, ExpectedEffect, Target};
    use crate::test_support::{ScriptedProvider, ScriptedReply, proposal, state_with_texts};

    fn gateway_with(replies: Vec<ScriptedReply>) -> (Arc<ScriptedProvider>, Gateway) {
        let provider = Arc::new(ScriptedProvider::new(replies));
        let gateway = Gateway::new(Arc::clone(&provider), Duration::from_secs(5)).expect("gateway");
        (provider, gateway)
    }

    fn tap_expecting(description: &str, visible: &[&str]) -> ActionProposal {
        proposal(
            Action::Tap {
                target: Target::Element { index: 0 },
            },
            ExpectedEffect {
                description: description.to_string(),
                visible_texts: visible.iter().map(|s| s.to_string()).collect(),
                ..ExpectedEffect::default()
            },
        )
    }

    fn goal() -> Goal {
        Goal::new("open battery").expect("goal")
    }

    #[test]
    fn rules_decide_without_model_call() {
        let (provider, gateway) = gateway_with(vec![]);
        let verifier = Verifier::new(&gateway, PromptBuilder::new(20_000), true, false);
        let pre = state_with_texts(1, &["Settings"]);
        let post = state_with_texts(2, &["Battery 80%"]);

        let outcome = verifier
            .verify(
                &goal(),
                &tap_expecting("battery page", &["Battery"]),
                &pre,
                &post,
                Duration::from_secs(1),
                &CancelToken::new(),
            )
            .expect("verify");
        assert_eq!(outcome.verdict, Verdict::Confirmed);
        assert_eq!(outcome.source, VerificationSource::Rules);
        assert_eq!(provider.calls(), 0);
    }

    #[test]
    fn undecided_cases_go_to_model() {
        let (provider, gateway) = gateway_with(vec![ScriptedReply::verdict("contradicted")]);
        let verifier = Verifier::new(&gateway, PromptBuilder::new(20_000), true, false);
        let pre = state_with_texts(1, &["Settings"]);
        let post = state_with_texts(2, &["Settings"]);

        let outcome = verifier
            .verify(
                &goal(),
                &tap_expecting("battery page opens", &[]),
                &pre,
                &post,
                Duration::from_secs(1),
                &CancelToken::new(),
            )
            .expect("verify");
        assert_eq!(outcome.verdict, Verdict::Contradicted);
        assert_eq!(outcome.source, VerificationSource::Model);
        assert_eq!(provider.calls(), 1);
        assert!(provider.prompts()[0].contains("battery page opens"));
    }

    /// Verifies a verdict that stays malformed after the re-ask is inconclusive.
    #[test]
    fn malformed_verdict_is_inconclusive() {
        let (provider, gateway) = gateway_with(vec![
            ScriptedReply::text("looks fine to me"),
            ScriptedReply::text("{\"verdict\": \"maybe\"}"),
        ]);
        let verifier = Verifier::new(&gateway, PromptBuilder::new(20_000), true, false);
        let state = state_with_texts(1, &["Settings"]);

        let outcome = verifier
            .verify(
                &goal(),
                &tap_expecting("something", &[]),
                &state,
                &state,
                Duration::from_secs(1),
                &CancelToken::new(),
            )
            .expect("verify");
        assert_eq!(outcome.verdict, Verdict::Inconclusive);
        assert_eq!(provider.calls(), 2);
    }

    #[test]
    fn disabled_model_fallback_fails_closed() {
        let (provider, gateway) = gateway_with(vec![]);
        let verifier = Verifier::new(&gateway, PromptBuilder::new(20_000), false, false);
        let state = state_with_texts(1, &["Settings"]);

        let outcome = verifier
            .verify(
                &goal(),
                &tap_expecting("something", &[]),
                &state,
                &state,
                Duration::from_secs(1),
                &CancelToken::new(),
            )
            .expect("verify");
        assert_eq!(outcome.verdict, Verdict::Inconclusive);
        assert_eq!(provider.calls(), 0);
    }

    #[test]
    fn provider_errors_propagate() {
        let (_provider, gateway) = gateway_with(vec![ScriptedReply::timeout()]);
        let verifier = Verifier::new(&gateway, PromptBuilder::new(20_000), true, false);
        let state = state_with_texts(1, &["Settings"]);

        let err = verifier
            .verify(
                &goal(),
                &tap_expecting("something", &[]),
                &state,
                &state,
                Duration::from_secs(1),
                &CancelToken::new(),
            )
            .expect_err("timeout");
        assert!(matches!(err, GatewayError::Provider { .. }));
    }
}
