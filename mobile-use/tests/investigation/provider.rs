//! Live checks of the configured model provider through the gateway.

use std::time::Duration;

use mobile_use::io::cancel::CancelToken;
use mobile_use::io::gateway::{Gateway, Role, StructuredResponse};
use mobile_use::io::providers::build_provider;

use crate::live_config;

const PROMPT: &str = r#"Reply with exactly this JSON and nothing else:
{"verdict": "confirmed", "rationale": "connectivity check"}"#;

/// Verifies the provider answers a trivial verifier prompt with a schema-valid verdict.
#[test]
#[ignore]
fn provider_returns_valid_verdict() {
    let config = live_config();
    let provider = build_provider(&config.provider).expect("provider");
    let gateway = Gateway::new(provider, config.provider.timeout()).expect("gateway");

    let response = gateway
        .invoke(
            Role::Verifier,
            PROMPT,
            &[],
            config.provider.timeout(),
            &CancelToken::new(),
        )
        .expect("invoke");
    let StructuredResponse::Verdict(verdict) = response else {
        panic!("expected a verdict, got {response:?}");
    };
    println!("verdict: {verdict:?}");
}

/// Verifies a cancelled token stops the call before the provider is reached.
#[test]
#[ignore]
fn cancelled_call_returns_immediately() {
    let config = live_config();
    let provider = build_provider(&config.provider).expect("provider");
    let gateway = Gateway::new(provider, config.provider.timeout()).expect("gateway");
    let cancel = CancelToken::new();
    cancel.cancel();

    let started = std::time::Instant::now();
    let result = gateway.invoke(
        Role::Verifier,
        PROMPT,
        &[],
        Duration::from_secs(30),
        &cancel,
    );
    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(1));
}
