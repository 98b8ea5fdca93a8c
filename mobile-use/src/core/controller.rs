//! Recovery controller: the state machine deciding what follows each step.
//!
//! The controller owns every counter that bounds a session (per-step retries,
//! re-plans, iterations and consecutive transient errors). It performs no I/O;
//! the session loop feeds it observations and acts on its decisions.

use crate::core::types::{
    Action, ActionProposal, ActionResult, DispatchStatus, FailureReason, Transition, Verdict,
    VerificationOutcome,
};
use crate::io::config::SessionConfig;

/// Phase the loop is in when an observation is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Planning,
    Executing,
    Verifying,
}

/// Origin of a transient error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Provider,
    Driver,
}

impl ErrorSource {
    fn failure(self) -> FailureReason {
        match self {
            ErrorSource::Provider => FailureReason::ProviderUnavailable,
            ErrorSource::Driver => FailureReason::DriverUnavailable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub per_step_retries: u32,
    pub max_replans: u32,
    pub max_iterations: u32,
    pub provider_error_ceiling: u32,
    pub driver_error_ceiling: u32,
}

impl From<&SessionConfig> for Limits {
    fn from(cfg: &SessionConfig) -> Self {
        Self {
            per_step_retries: cfg.per_step_retries,
            max_replans: cfg.max_replans,
            max_iterations: cfg.max_steps,
            provider_error_ceiling: cfg.provider_error_ceiling,
            driver_error_ceiling: cfg.driver_error_ceiling,
        }
    }
}

/// Decision taken after a step has been executed and verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Continue,
    RetryStep,
    /// Discard the proposal and plan again; `note` is shown to the planner.
    Replan { note: String },
    Succeed { summary: String },
    Fail { reason: FailureReason, detail: String },
}

impl Decision {
    pub fn transition(&self) -> Transition {
        match self {
            Decision::Continue => Transition::Continue,
            Decision::RetryStep => Transition::RetryStep,
            Decision::Replan { .. } => Transition::Replan,
            Decision::Succeed { .. } => Transition::TerminateSuccess,
            Decision::Fail { .. } => Transition::TerminateFailure,
        }
    }
}

/// Decision taken after a transient provider or driver error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDecision {
    /// Back off, then retry at the same state. `attempt` is 1-based.
    Retry { attempt: u32 },
    GiveUp { reason: FailureReason, detail: String },
}

#[derive(Debug, Clone)]
pub struct RecoveryController {
    limits: Limits,
    step: u32,
    attempt: u32,
    replans: u32,
    iterations: u32,
    provider_errors: u32,
    driver_errors: u32,
}

impl RecoveryController {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            step: 1,
            attempt: 0,
            replans: 0,
            iterations: 0,
            provider_errors: 0,
            driver_errors: 0,
        }
    }

    /// Current logical step (1-based).
    pub fn step(&self) -> u32 {
        self.step
    }

    /// Retry attempt of the current step (0 for the first try).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn replans(&self) -> u32 {
        self.replans
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Count one plan/execute/verify cycle, failing once the ceiling is reached.
    pub fn begin_iteration(&mut self) -> Result<(), Decision> {
        if self.iterations >= self.limits.max_iterations {
            return Err(Decision::Fail {
                reason: FailureReason::StepLimit,
                detail: format!(
                    "iteration ceiling of {} reached",
                    self.limits.max_iterations
                ),
            });
        }
        self.iterations += 1;
        Ok(())
    }

    /// Decide the transition for a completed step.
    ///
    /// `verification` is `None` when the dispatch was rejected or the planner
    /// declared stuck. `Inconclusive` is treated exactly like `Contradicted`.
    pub fn on_step(
        &mut self,
        proposal: &ActionProposal,
        result: &ActionResult,
        verification: Option<&VerificationOutcome>,
    ) -> Decision {
        if let Action::DeclareStuck { reason } = &proposal.action {
            return Decision::Fail {
                reason: FailureReason::NoPath,
                detail: reason.clone(),
            };
        }

        let failure = match (&result.dispatch, verification) {
            (DispatchStatus::Rejected { reason }, _) => format!("action rejected: {reason}"),
            (_, Some(v)) if v.verdict == Verdict::Confirmed => {
                return self.on_confirmed(proposal);
            }
            (_, Some(v)) => format!("verification {}: {}", v.verdict.as_str(), v.rationale),
            (_, None) => "step was not verified".to_string(),
        };
        self.on_falsified(proposal, failure)
    }

    fn on_confirmed(&mut self, proposal: &ActionProposal) -> Decision {
        if let Action::DeclareDone { summary } = &proposal.action {
            return Decision::Succeed {
                summary: summary.clone(),
            };
        }
        self.step += 1;
        self.attempt = 0;
        Decision::Continue
    }

    fn on_falsified(&mut self, proposal: &ActionProposal, failure: String) -> Decision {
        self.attempt += 1;
        if self.attempt <= self.limits.per_step_retries {
            return Decision::RetryStep;
        }
        if self.replans >= self.limits.max_replans {
            return Decision::Fail {
                reason: FailureReason::ReplanBudgetExhausted,
                detail: format!(
                    "step {} failed after {} retries and {} re-plans: {failure}",
                    self.step, self.limits.per_step_retries, self.replans
                ),
            };
        }
        self.replans += 1;
        self.step += 1;
        self.attempt = 0;
        Decision::Replan {
            note: format!(
                "`{}` failed {} times: {failure}",
                proposal.action,
                self.limits.per_step_retries + 1
            ),
        }
    }

    /// Record a transient error during `phase`.
    pub fn on_transient_error(
        &mut self,
        source: ErrorSource,
        phase: Phase,
        message: &str,
    ) -> ErrorDecision {
        let (count, ceiling) = match source {
            ErrorSource::Provider => {
                self.provider_errors += 1;
                (self.provider_errors, self.limits.provider_error_ceiling)
            }
            ErrorSource::Driver => {
                self.driver_errors += 1;
                (self.driver_errors, self.limits.driver_error_ceiling)
            }
        };
        if count > ceiling {
            return ErrorDecision::GiveUp {
                reason: source.failure(),
                detail: format!(
                    "{count} consecutive errors while {}: {message}",
                    phase_label(phase)
                ),
            };
        }
        ErrorDecision::Retry { attempt: count }
    }

    /// Reset the consecutive error counter for `source`.
    pub fn on_call_success(&mut self, source: ErrorSource) {
        match source {
            ErrorSource::Provider => self.provider_errors = 0,
            ErrorSource::Driver => self.driver_errors = 0,
        }
    }
}

fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::Planning => "planning",
        Phase::Executing => "executing",
        Phase::Verifying => "verifying",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ExpectedEffect, Target, VerificationSource};
    use crate::test_support::{dispatched, proposal, rejected};

    fn limits() -> Limits {
        Limits {
            per_step_retries: 2,
            max_replans: 1,
            max_iterations: 10,
            provider_error_ceiling: 2,
            driver_error_ceiling: 2,
        }
    }

    fn tap() -> ActionProposal {
        proposal(
            Action::Tap {
                target: Target::Element { index: 1 },
            },
            ExpectedEffect::default(),
        )
    }

    fn verdict(verdict: Verdict) -> VerificationOutcome {
        VerificationOutcome {
            verdict,
            rationale: "test".into(),
            source: VerificationSource::Rules,
        }
    }

    #[test]
    fn confirmed_advances_step() {
        let mut c = RecoveryController::new(limits());
        let d = c.on_step(&tap(), &dispatched(), Some(&verdict(Verdict::Confirmed)));
        assert_eq!(d, Decision::Continue);
        assert_eq!(c.step(), 2);
        assert_eq!(c.attempt(), 0);
    }

    #[test]
    fn confirmed_done_succeeds() {
        let mut c = RecoveryController::new(limits());
        let done = proposal(
            Action::DeclareDone {
                summary: "battery is 84%".into(),
            },
            ExpectedEffect::default(),
        );
        let d = c.on_step(&done, &dispatched(), Some(&verdict(Verdict::Confirmed)));
        assert_eq!(
            d,
            Decision::Succeed {
                summary: "battery is 84%".into()
            }
        );
    }

    #[test]
    fn unconfirmed_done_is_retried_not_succeeded() {
        let mut c = RecoveryController::new(limits());
        let done = proposal(
            Action::DeclareDone {
                summary: "done".into(),
            },
            ExpectedEffect::default(),
        );
        for v in [Verdict::Contradicted, Verdict::Inconclusive] {
            let d = c.on_step(&done, &dispatched(), Some(&verdict(v)));
            assert_eq!(d.transition(), Transition::RetryStep);
        }
    }

    #[test]
    fn rejections_retry_then_replan_then_fail() {
        let mut c = RecoveryController::new(limits());
        let p = tap();
        let r = rejected("element missing");
        assert_eq!(c.on_step(&p, &r, None), Decision::RetryStep);
        assert_eq!(c.on_step(&p, &r, None), Decision::RetryStep);
        assert!(matches!(c.on_step(&p, &r, None), Decision::Replan { .. }));
        assert_eq!(c.replans(), 1);
        assert_eq!(c.on_step(&p, &r, None), Decision::RetryStep);
        assert_eq!(c.on_step(&p, &r, None), Decision::RetryStep);
        assert!(matches!(
            c.on_step(&p, &r, None),
            Decision::Fail {
                reason: FailureReason::ReplanBudgetExhausted,
                ..
            }
        ));
    }

    #[test]
    fn inconclusive_counts_as_failure() {
        let mut c = RecoveryController::new(Limits {
            per_step_retries: 0,
            ..limits()
        });
        let d = c.on_step(&tap(), &dispatched(), Some(&verdict(Verdict::Inconclusive)));
        assert!(matches!(d, Decision::Replan { .. }));
    }

    #[test]
    fn declare_stuck_fails_immediately() {
        let mut c = RecoveryController::new(limits());
        let stuck = proposal(
            Action::DeclareStuck {
                reason: "no battery entry".into(),
            },
            ExpectedEffect::default(),
        );
        let d = c.on_step(&stuck, &dispatched(), None);
        assert_eq!(
            d,
            Decision::Fail {
                reason: FailureReason::NoPath,
                detail: "no battery entry".into()
            }
        );
        assert_eq!(c.attempt(), 0);
    }

    #[test]
    fn provider_ceiling_allows_exactly_ceiling_retries() {
        let mut c = RecoveryController::new(limits());
        let phase = Phase::Planning;
        assert_eq!(
            c.on_transient_error(ErrorSource::Provider, phase, "timeout"),
            ErrorDecision::Retry { attempt: 1 }
        );
        assert_eq!(
            c.on_transient_error(ErrorSource::Provider, phase, "timeout"),
            ErrorDecision::Retry { attempt: 2 }
        );
        assert!(matches!(
            c.on_transient_error(ErrorSource::Provider, phase, "timeout"),
            ErrorDecision::GiveUp {
                reason: FailureReason::ProviderUnavailable,
                ..
            }
        ));
    }

    #[test]
    fn success_resets_consecutive_errors() {
        let mut c = RecoveryController::new(limits());
        for _ in 0..2 {
            c.on_transient_error(ErrorSource::Driver, Phase::Executing, "offline");
        }
        c.on_call_success(ErrorSource::Driver);
        assert_eq!(
            c.on_transient_error(ErrorSource::Driver, Phase::Executing, "offline"),
            ErrorDecision::Retry { attempt: 1 }
        );
    }

    #[test]
    fn iteration_ceiling_is_enforced() {
        let mut c = RecoveryController::new(Limits {
            max_iterations: 2,
            ..limits()
        });
        assert!(c.begin_iteration().is_ok());
        assert!(c.begin_iteration().is_ok());
        let err = c.begin_iteration().expect_err("ceiling");
        assert!(matches!(
            err,
            Decision::Fail {
                reason: FailureReason::StepLimit,
                ..
            }
        ));
    }
}
