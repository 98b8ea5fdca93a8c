//! Model invocation gateway.
//!
//! Every model call goes through [`Gateway::invoke`]: the provider's raw text is
//! stripped of code fences, parsed as JSON, validated against the role's JSON
//! Schema and deserialized into a closed [`StructuredResponse`] variant. A
//! response that fails any of those checks gets exactly one corrective re-ask.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::types::{ActionProposal, Verdict};
use crate::io::cancel::CancelToken;

const PLANNER_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/planner.schema.json"
));
const VERIFIER_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/verifier.schema.json"
));
const OUTPUTTER_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/outputter.schema.json"
));

/// Caller role; selects the JSON Schema and response variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Planner,
    Verifier,
    Outputter,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Planner, Role::Verifier, Role::Outputter];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Planner => "planner",
            Role::Verifier => "verifier",
            Role::Outputter => "outputter",
        }
    }

    pub fn schema_source(self) -> &'static str {
        match self {
            Role::Planner => PLANNER_SCHEMA,
            Role::Verifier => VERIFIER_SCHEMA,
            Role::Outputter => OUTPUTTER_SCHEMA,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Network,
    Auth,
    Timeout,
    RateLimited,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderErrorKind::Network => "network",
            ProviderErrorKind::Auth => "auth",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::RateLimited => "rate_limited",
        })
    }
}

/// Errors a transport reports back to the gateway.
#[derive(Debug, Error)]
pub enum ProviderFailure {
    #[error("{kind} error: {message}")]
    Transient {
        kind: ProviderErrorKind,
        message: String,
    },

    #[error("provider unconfigured: {0}")]
    Unconfigured(String),

    #[error("provider call cancelled")]
    Cancelled,
}

impl ProviderFailure {
    pub fn transient(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
        }
    }
}

/// Errors surfaced to the planner, verifier and outputter.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Retryable transport failure.
    #[error("provider {kind} error: {message}")]
    Provider {
        kind: ProviderErrorKind,
        message: String,
    },

    /// The response stayed invalid after one corrective re-ask.
    #[error("malformed {role} response: {detail}")]
    Malformed { role: Role, detail: String },

    #[error("provider unconfigured: {0}")]
    Unconfigured(String),

    #[error("model call cancelled")]
    Cancelled,
}

impl From<ProviderFailure> for GatewayError {
    fn from(failure: ProviderFailure) -> Self {
        match failure {
            ProviderFailure::Transient { kind, message } => GatewayError::Provider { kind, message },
            ProviderFailure::Unconfigured(msg) => GatewayError::Unconfigured(msg),
            ProviderFailure::Cancelled => GatewayError::Cancelled,
        }
    }
}

/// One request handed to a transport.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub role: Role,
    pub prompt: String,
    /// PNG screenshots attached to the prompt.
    pub images: Vec<Arc<Vec<u8>>>,
    /// JSON Schema the response must satisfy.
    pub schema: Arc<Value>,
    pub timeout: Duration,
}

/// Abstraction over model vendors.
pub trait ModelProvider: Send + Sync {
    /// Return the model's raw text reply to `request`.
    fn complete(
        &self,
        request: &ModelRequest,
        cancel: &CancelToken,
    ) -> Result<String, ProviderFailure>;
}

impl<P: ModelProvider + ?Sized> ModelProvider for Arc<P> {
    fn complete(
        &self,
        request: &ModelRequest,
        cancel: &CancelToken,
    ) -> Result<String, ProviderFailure> {
        (**self).complete(request, cancel)
    }
}

impl<P: ModelProvider + ?Sized> ModelProvider for Box<P> {
    fn complete(
        &self,
        request: &ModelRequest,
        cancel: &CancelToken,
    ) -> Result<String, ProviderFailure> {
        (**self).complete(request, cancel)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVerdict {
    pub verdict: Verdict,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct OutputEnvelope {
    output: Value,
}

/// Closed set of validated responses.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredResponse {
    Proposal(ActionProposal),
    Verdict(ModelVerdict),
    Output(Value),
}

/// Shared entry point for every model call.
///
/// Thread-safe: independent sessions may hold `&Gateway` concurrently.
pub struct Gateway {
    provider: Box<dyn ModelProvider>,
    validators: HashMap<Role, (Arc<Value>, Validator)>,
    timeout: Duration,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(provider: impl ModelProvider + 'static, timeout: Duration) -> Result<Self> {
        let mut validators = HashMap::new();
        for role in Role::ALL {
            let schema: Value = serde_json::from_str(role.schema_source())
                .with_context(|| format!("parse {role} schema"))?;
            let validator = jsonschema::options()
                .with_draft(Draft::Draft202012)
                .build(&schema)
                .with_context(|| format!("compile {role} schema"))?;
            validators.insert(role, (Arc::new(schema), validator));
        }
        Ok(Self {
            provider: Box::new(provider),
            validators,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Invoke the model for `role`, re-asking once when the reply is malformed.
    ///
    /// `timeout` is clamped to the gateway's per-call timeout.
    #[instrument(skip_all, fields(role = %role, prompt_bytes = prompt.len(), images = images.len()))]
    pub fn invoke(
        &self,
        role: Role,
        prompt: &str,
        images: &[Arc<Vec<u8>>],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<StructuredResponse, GatewayError> {
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        let (schema, validator) = self
            .validators
            .get(&role)
            .ok_or_else(|| GatewayError::Unconfigured(format!("no schema for {role}")))?;
        let mut request = ModelRequest {
            role,
            prompt: prompt.to_string(),
            images: images.to_vec(),
            schema: Arc::clone(schema),
            timeout: timeout.min(self.timeout),
        };

        let raw = self.provider.complete(&request, cancel)?;
        debug!(response_bytes = raw.len(), "provider replied");
        let detail = match parse_response(role, validator, &raw) {
            Ok(response) => return Ok(response),
            Err(detail) => detail,
        };

        warn!(%detail, "malformed response, re-asking once");
        request.prompt = corrective_prompt(prompt, &detail);
        let raw = self.provider.complete(&request, cancel)?;
        parse_response(role, validator, &raw).map_err(|detail| GatewayError::Malformed { role, detail })
    }
}

fn corrective_prompt(prompt: &str, detail: &str) -> String {
    format!(
        "{prompt}\n\n## Invalid Previous Reply\n\nYour previous reply was rejected: {detail}\n\
         Reply again with a single JSON object that satisfies the required schema, with no prose."
    )
}

/// Parse and validate one raw reply; `Err` carries a human-readable reason.
pub fn parse_response(
    role: Role,
    validator: &Validator,
    raw: &str,
) -> Result<StructuredResponse, String> {
    let body = strip_code_fences(raw);
    let value: Value =
        serde_json::from_str(body).map_err(|err| format!("reply is not valid JSON ({err})"))?;
    let violations: Vec<String> = validator
        .iter_errors(&value)
        .take(5)
        .map(|err| err.to_string())
        .collect();
    if !violations.is_empty() {
        return Err(format!("schema violations: {}", violations.join("; ")));
    }
    let typed = match role {
        Role::Planner => serde_json::from_value(value).map(StructuredResponse::Proposal),
        Role::Verifier => serde_json::from_value(value).map(StructuredResponse::Verdict),
        Role::Outputter => serde_json::from_value::<OutputEnvelope>(value)
            .map(|envelope| StructuredResponse::Output(envelope.output)),
    };
    typed.map_err(|err| format!("reply does not match the {role} shape ({err})"))
}

/// Strip a surrounding Markdown code fence (```json ... ```) and outer prose.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let body = rest.split_once('\n').map_or("", |(_, body)| body);
        return body.find("```").map_or(body, |end| &body[..end]).trim();
    }
    if let Some(start) = trimmed.find("```") {
        let inner = strip_code_fences(&trimmed[start..]);
        if !inner.is_empty() {
            return inner;
        }
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Action, Target};
    use crate::test_support::{ScriptedProvider, ScriptedReply};

    const TAP_REPLY: &str = r#"{"action": {"type": "tap", "target": {"by": "element", "index": 2}},
        "rationale": "open battery", "expected": {"description": "battery page", "visible_texts": ["Battery"]}}"#;

    fn gateway(replies: Vec<ScriptedReply>) -> (Gateway, Arc<ScriptedProvider>) {
        let provider = Arc::new(ScriptedProvider::new(replies));
        let gw = Gateway::new(Arc::clone(&provider), Duration::from_secs(5)).expect("gateway");
        (gw, provider)
    }

    #[test]
    fn strips_fences_and_prose() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(
            strip_code_fences("Here you go:\n```\n{\"a\":1}\n```\nthanks"),
            "{\"a\":1}"
        );
        assert_eq!(strip_code_fences("Sure! {\"a\":1} done"), "{\"a\":1}");
    }

    #[test]
    fn valid_planner_reply_is_typed() {
        let (gw, provider) = gateway(vec![ScriptedReply::text(format!("```json\n{TAP_REPLY}\n```"))]);
        let response = gw
            .invoke(Role::Planner, "plan", &[], Duration::from_secs(1), &CancelToken::new())
            .expect("invoke");
        let StructuredResponse::Proposal(proposal) = response else {
            panic!("expected proposal");
        };
        assert_eq!(
            proposal.action,
            Action::Tap {
                target: Target::Element { index: 2 }
            }
        );
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn malformed_reply_is_reasked_exactly_once() {
        let (gw, provider) = gateway(vec![
            ScriptedReply::text(r#"{"action": {"type": "fly"}}"#),
            ScriptedReply::text(TAP_REPLY),
        ]);
        let response = gw
            .invoke(Role::Planner, "plan", &[], Duration::from_secs(1), &CancelToken::new())
            .expect("invoke");
        assert!(matches!(response, StructuredResponse::Proposal(_)));
        assert_eq!(provider.calls(), 2);
        assert!(provider.prompts()[1].contains("Invalid Previous Reply"));
    }

    #[test]
    fn second_malformed_reply_fails() {
        let (gw, provider) = gateway(vec![
            ScriptedReply::text("not json"),
            ScriptedReply::text(r#"{"verdict": "maybe", "rationale": ""}"#),
        ]);
        let err = gw
            .invoke(Role::Verifier, "verify", &[], Duration::from_secs(1), &CancelToken::new())
            .expect_err("malformed");
        assert!(matches!(
            err,
            GatewayError::Malformed {
                role: Role::Verifier,
                ..
            }
        ));
        assert_eq!(provider.calls(), 2);
    }

    #[test]
    fn provider_timeout_is_not_reasked() {
        let (gw, provider) = gateway(vec![ScriptedReply::timeout()]);
        let err = gw
            .invoke(Role::Planner, "plan", &[], Duration::from_secs(1), &CancelToken::new())
            .expect_err("timeout");
        assert!(matches!(
            err,
            GatewayError::Provider {
                kind: ProviderErrorKind::Timeout,
                ..
            }
        ));
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn outputter_unwraps_envelope() {
        let (gw, _) = gateway(vec![ScriptedReply::text(r#"{"output": {"battery": 84}}"#)]);
        let response = gw
            .invoke(Role::Outputter, "out", &[], Duration::from_secs(1), &CancelToken::new())
            .expect("invoke");
        assert_eq!(
            response,
            StructuredResponse::Output(serde_json::json!({"battery": 84}))
        );
    }

    #[test]
    fn cancelled_token_short_circuits() {
        let (gw, provider) = gateway(vec![ScriptedReply::text(TAP_REPLY)]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = gw
            .invoke(Role::Planner, "plan", &[], Duration::from_secs(1), &cancel)
            .expect_err("cancelled");
        assert!(matches!(err, GatewayError::Cancelled));
        assert_eq!(provider.calls(), 0);
    }
}
