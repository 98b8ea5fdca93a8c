//! Structured output extraction run once after a session ends.

use std::time::Duration;

use serde_json::Value;
use tracing::{info, instrument};

use crate::core::memory::SessionRecord;
use crate::core::types::{DeviceState, SessionOutcome};
use crate::io::cancel::CancelToken;
use crate::io::gateway::{Gateway, GatewayError, Role, StructuredResponse};
use crate::io::prompt::{OutputterInputs, PromptBuilder};

use super::{screenshot_of, unexpected_variant};

#[derive(Debug)]
pub struct Outputter<'g> {
    gateway: &'g Gateway,
    prompts: PromptBuilder,
}

impl<'g> Outputter<'g> {
    pub fn new(gateway: &'g Gateway, prompts: PromptBuilder) -> Self {
        Self { gateway, prompts }
    }

    /// Extract a JSON value shaped by `description` from the finished session.
    #[instrument(skip_all, fields(steps = memory.len()))]
    pub fn extract(
        &self,
        description: &str,
        memory: &SessionRecord,
        outcome: &SessionOutcome,
        state: Option<&DeviceState>,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Value, GatewayError> {
        let prompt = self
            .prompts
            .build_outputter(&OutputterInputs {
                goal: memory.goal().as_str(),
                description,
                outcome: outcome.to_string(),
                steps: memory.steps(),
                state,
            })
            .map_err(|err| GatewayError::Unconfigured(format!("outputter prompt: {err:#}")))?;
        let images = state.map(screenshot_of).unwrap_or_default();
        match self
            .gateway
            .invoke(Role::Outputter, &prompt, &images, timeout, cancel)?
        {
            StructuredResponse::Output(value) => {
                info!("structured output extracted");
                Ok(value)
            }
            other => Err(unexpected_variant(Role::Outputter, &other)),
        }
    }
}
