//! Deterministic verification rules evaluated before any model call.

use crate::core::types::{Action, ActionProposal, DeviceState, Verdict};

/// Result of the rule pass over one `(proposal, pre, post)` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleDecision {
    Decided { verdict: Verdict, rationale: String },
    /// The rules cannot decide; the note explains why.
    Undecided(String),
}

/// Evaluate the structured expectations of `proposal` against the observed states.
///
/// Pure function of its inputs: replaying the same triple yields the same decision.
pub fn evaluate(proposal: &ActionProposal, pre: &DeviceState, post: &DeviceState) -> RuleDecision {
    let expected = &proposal.expected;
    if !expected.has_predicates() {
        return RuleDecision::Undecided("no structured expectations".to_string());
    }
    let partial = post.partial.is_some();
    let mut held = Vec::new();
    let mut uncertain = Vec::new();

    for text in &expected.visible_texts {
        if post.mentions(text) {
            held.push(format!("\"{text}\" visible"));
        } else if partial {
            uncertain.push(format!("\"{text}\" not found in partial state"));
        } else {
            return contradicted(format!("expected \"{text}\" to be visible"));
        }
    }

    for text in &expected.absent_texts {
        if post.mentions(text) {
            return contradicted(format!("expected \"{text}\" to be gone"));
        }
        if partial {
            uncertain.push(format!("absence of \"{text}\" unprovable in partial state"));
        } else {
            held.push(format!("\"{text}\" absent"));
        }
    }

    if let Some(app) = &expected.focused_app {
        match &post.focused_app {
            Some(focused) if focused.eq_ignore_ascii_case(app) => {
                held.push(format!("{app} focused"));
            }
            Some(focused) => {
                return contradicted(format!("expected {app} focused, found {focused}"));
            }
            None => uncertain.push("focused app unknown".to_string()),
        }
    }

    let declaration = matches!(proposal.action, Action::DeclareDone { .. });
    if let Some(should_change) = expected.screen_changes.filter(|_| !declaration) {
        let changed = pre.digest != post.digest;
        if changed != should_change {
            let observed = if changed { "changed" } else { "did not change" };
            return contradicted(format!("screen {observed}"));
        }
        held.push(format!("screen {}", if changed { "changed" } else { "unchanged" }));
    }

    if !uncertain.is_empty() {
        return RuleDecision::Undecided(uncertain.join("; "));
    }
    if held.is_empty() {
        let note = "screen change is not checked for declarations";
        return RuleDecision::Undecided(note.to_string());
    }
    RuleDecision::Decided {
        verdict: Verdict::Confirmed,
        rationale: held.join("; "),
    }
}

fn contradicted(rationale: String) -> RuleDecision {
    RuleDecision::Decided {
        verdict: Verdict::Contradicted,
        rationale,
    }
}
