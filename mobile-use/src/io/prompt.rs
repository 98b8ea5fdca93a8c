//! Prompt builder for planner, verifier and outputter calls.

use std::fmt::Write as _;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::types::{DeviceState, DispatchStatus, StepRecord, Transition, UiElement};

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const VERIFIER_TEMPLATE: &str = include_str!("prompts/verifier.md");
const OUTPUTTER_TEMPLATE: &str = include_str!("prompts/outputter.md");

const PLANNER_DROP_ORDER: &[&str] = &["history", "avoid", "failure"];
const VERIFIER_DROP_ORDER: &[&str] = &["goal", "before"];
const OUTPUTTER_DROP_ORDER: &[&str] = &["screen", "history"];

/// Inputs for one planner prompt.
#[derive(Debug, Clone)]
pub struct PlannerInputs<'a> {
    pub goal: &'a str,
    pub state: &'a DeviceState,
    pub recent: &'a [StepRecord],
    /// Failure note from the latest re-plan.
    pub replan_note: Option<&'a str>,
    /// Actions already falsified on this exact screen.
    pub avoid: Vec<String>,
    /// Corrective note for a re-ask.
    pub correction: Option<&'a str>,
}

/// Inputs for one verifier prompt.
#[derive(Debug, Clone)]
pub struct VerifierInputs<'a> {
    pub goal: &'a str,
    pub action: String,
    pub rationale: &'a str,
    pub expected: &'a str,
    pub pre: &'a DeviceState,
    pub post: &'a DeviceState,
    pub rules_note: Option<&'a str>,
}

/// Inputs for the final structured-output extraction.
#[derive(Debug, Clone)]
pub struct OutputterInputs<'a> {
    pub goal: &'a str,
    pub description: &'a str,
    pub outcome: String,
    pub steps: &'a [StepRecord],
    pub state: Option<&'a DeviceState>,
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("planner", PLANNER_TEMPLATE)
            .context("load planner template")?;
        env.add_template("verifier", VERIFIER_TEMPLATE)
            .context("load verifier template")?;
        env.add_template("outputter", OUTPUTTER_TEMPLATE)
            .context("load outputter template")?;
        Ok(Self { env })
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self.env.get_template(name)?;
        template
            .render(ctx)
            .with_context(|| format!("render {name} template"))
    }
}

/// Screen summary shared by every template.
#[derive(Debug, Clone, Serialize)]
struct ScreenContext {
    seq: u64,
    focused_app: Option<String>,
    partial: Option<String>,
    elements: String,
}

impl ScreenContext {
    fn from_state(state: &DeviceState) -> Self {
        Self {
            seq: state.seq,
            focused_app: state.focused_app.clone(),
            partial: state.partial.clone(),
            elements: describe_elements(&state.elements),
        }
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    /// Section identifier (e.g., "contract", "goal").
    key: String,
    /// Whether this section is required (cannot be dropped).
    required: bool,
    /// Section content without the marker.
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
    });

    let markers: Vec<_> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                caps[1].to_string(),
                &caps[2] == "required",
                whole.start(),
                whole.end(),
            ))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (key, required, _, start)) in markers.iter().enumerate() {
        let end = markers
            .get(i + 1)
            .map_or(rendered.len(), |(_, _, next_start, _)| *next_start);
        let content = rendered[*start..end].trim().to_string();
        if !content.is_empty() {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

/// Apply budget to parsed sections, dropping droppable sections in `drop_order`.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize, drop_order: &[&str]) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    if total_len(sections) <= budget {
        return;
    }

    for key in drop_order {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    // Still over budget: truncate the last section.
    if total_len(sections) <= budget {
        return;
    }
    let other_len: usize = sections
        .iter()
        .take(sections.len().saturating_sub(1))
        .map(|s| s.content.len())
        .sum();
    let allowed = budget.saturating_sub(other_len);
    if let Some(last) = sections.last_mut()
        && last.content.len() > allowed
    {
        let before_len = last.content.len();
        let marker = "\n[truncated]";
        let keep = floor_char_boundary(&last.content, allowed.saturating_sub(marker.len()));
        last.content.truncate(keep);
        if allowed > marker.len() {
            last.content.push_str(marker);
        }
        debug!(
            section = last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Render sections back to a single string.
fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds prompts within a byte budget, dropping less critical sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build_planner(&self, input: &PlannerInputs<'_>) -> Result<String> {
        let rendered = PromptEngine::new()?.render(
            "planner",
            context! {
                goal => input.goal.trim(),
                screen => ScreenContext::from_state(input.state),
                history => describe_history(input.recent),
                failure => input.replan_note.map(str::trim).filter(|s| !s.is_empty()),
                avoid => (!input.avoid.is_empty()).then(|| input.avoid.clone()),
                correction => input.correction.map(str::trim).filter(|s| !s.is_empty()),
            },
        )?;
        Ok(self.fit(&rendered, PLANNER_DROP_ORDER))
    }

    pub fn build_verifier(&self, input: &VerifierInputs<'_>) -> Result<String> {
        let rendered = PromptEngine::new()?.render(
            "verifier",
            context! {
                goal => input.goal.trim(),
                action => &input.action,
                rationale => input.rationale.trim(),
                expected => input.expected.trim(),
                before => ScreenContext::from_state(input.pre),
                after => ScreenContext::from_state(input.post),
                screen_changed => input.pre.digest != input.post.digest,
                rules_note => input.rules_note,
            },
        )?;
        Ok(self.fit(&rendered, VERIFIER_DROP_ORDER))
    }

    pub fn build_outputter(&self, input: &OutputterInputs<'_>) -> Result<String> {
        let rendered = PromptEngine::new()?.render(
            "outputter",
            context! {
                goal => input.goal.trim(),
                description => input.description.trim(),
                outcome => &input.outcome,
                history => describe_history(input.steps),
                screen => input.state.map(ScreenContext::from_state),
            },
        )?;
        Ok(self.fit(&rendered, OUTPUTTER_DROP_ORDER))
    }

    fn fit(&self, rendered: &str, drop_order: &[&str]) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes, drop_order);
        render_sections(&sections)
    }
}

/// One line per element: `[index] kind "label" id=... @(x,y) flags`.
pub fn describe_elements(elements: &[UiElement]) -> String {
    let mut out = String::new();
    for el in elements.iter().filter(|el| el.visible) {
        let indent = "  ".repeat(el.depth.min(8) as usize);
        let _ = write!(out, "{indent}[{}] {}", el.index, el.kind.as_str());
        let label = el.label();
        if !label.is_empty() {
            let _ = write!(out, " \"{label}\"");
        }
        if let Some(id) = &el.resource_id {
            let _ = write!(out, " id={id}");
        }
        let center = el.bounds.center();
        let _ = write!(out, " @({},{})", center.x, center.y);
        let mut flags = Vec::new();
        if !el.enabled {
            flags.push("disabled");
        }
        if el.focused {
            flags.push("focused");
        }
        if el.scrollable {
            flags.push("scrollable");
        }
        match el.checked {
            Some(true) => flags.push("checked"),
            Some(false) => flags.push("unchecked"),
            None => {}
        }
        if !flags.is_empty() {
            let _ = write!(out, " [{}]", flags.join(","));
        }
        out.push('\n');
    }
    if out.is_empty() {
        out.push_str("(no visible elements)\n");
    }
    out
}

fn describe_history(steps: &[StepRecord]) -> Option<String> {
    if steps.is_empty() {
        return None;
    }
    let mut out = String::new();
    for step in steps {
        let outcome = match (&step.result.dispatch, &step.verification) {
            (DispatchStatus::Rejected { reason }, _) => format!("rejected ({reason})"),
            (_, Some(v)) => format!("{} ({})", v.verdict.as_str(), v.rationale),
            (_, None) => "not verified".to_string(),
        };
        let transition = match step.transition {
            Transition::Continue => "continue",
            Transition::RetryStep => "retry",
            Transition::Replan => "replan",
            Transition::TerminateSuccess => "success",
            Transition::TerminateFailure => "failure",
        };
        let _ = writeln!(
            out,
            "- step {} attempt {}: {} -> {outcome} -> {transition}",
            step.step, step.attempt, step.proposal.action
        );
    }
    Some(out)
}
