//! Goal-driven agent loop for operating a mobile device.
//!
//! One natural-language goal drives one sequential session: snapshot the
//! device, ask the planner for a single action, dispatch it, snapshot again,
//! verify the expected effect and let the recovery controller decide what
//! follows. The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (normalization, verification
//!   rules, the recovery state machine, session memory). No I/O.
//! - **[`io`]**: Side-effecting operations (device drivers, model providers,
//!   configuration, traces). Behind traits so tests can script them.
//! - **[`agents`]**: Loop stages combining both (planner, executor, verifier).
//!
//! [`session::run_session`] ties the stages together.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
