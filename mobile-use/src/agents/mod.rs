//! Loop stages that call the model or the device: planner, executor, verifier
//! and the optional structured-output extractor.

use std::sync::Arc;

use crate::core::types::DeviceState;
use crate::io::gateway::{GatewayError, Role, StructuredResponse};

pub mod executor;
pub mod outputter;
pub mod planner;
pub mod verifier;

/// Screenshot of `state` as a model attachment, when one was captured.
pub(crate) fn screenshot_of(state: &DeviceState) -> Vec<Arc<Vec<u8>>> {
    state
        .screenshot
        .as_ref()
        .filter(|shot| !shot.png.is_empty())
        .map(|shot| vec![Arc::clone(&shot.png)])
        .unwrap_or_default()
}

pub(crate) fn unexpected_variant(role: Role, response: &StructuredResponse) -> GatewayError {
    let got = match response {
        StructuredResponse::Proposal(_) => "proposal",
        StructuredResponse::Verdict(_) => "verdict",
        StructuredResponse::Output(_) => "output",
    };
    GatewayError::Malformed {
        role,
        detail: format!("expected a {role} response, got a {got}"),
    }
}
