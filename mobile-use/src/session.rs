//! The orchestration loop: snapshot, plan, execute, snapshot, verify, decide.

use std::convert::Infallible;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::Value;
use tracing::{info, info_span, warn};

use crate::agents::executor::Executor;
use crate::agents::outputter::Outputter;
use crate::agents::planner::Planner;
use crate::agents::verifier::Verifier;
use crate::core::budget::Backoff;
use crate::core::controller::{
    Decision, ErrorDecision, ErrorSource, Limits, Phase, RecoveryController,
};
use crate::core::memory::SessionRecord;
use crate::core::types::{
    AbortReason, Action, DeviceState, DispatchStatus, FailureReason, Goal, SessionOutcome,
    StepRecord,
};
use crate::io::cancel::{CancelToken, sleep_cancellable};
use crate::io::config::AgentConfig;
use crate::io::driver::{DeviceDriver, DriverError};
use crate::io::gateway::{Gateway, GatewayError};
use crate::io::prompt::PromptBuilder;
use crate::io::snapshot::Snapshotter;
use crate::io::transcript::{SessionTranscript, TraceRecorder, new_session_id};

/// Per-run inputs beyond the shared configuration.
#[derive(Debug, Default)]
pub struct SessionOptions {
    pub cancel: CancelToken,
    /// When set, a structured output is extracted after the outcome.
    pub output_description: Option<String>,
    pub trace: Option<TraceRecorder>,
    /// Seed for backoff jitter; entropy when absent.
    pub seed: Option<u64>,
}

#[derive(Debug)]
pub struct SessionReport {
    pub transcript: SessionTranscript,
    pub trace_dir: Option<PathBuf>,
}

/// Why a guarded call did not return a value.
enum Fault {
    /// Retried with backoff up to the source's ceiling.
    Transient(String),
    Fatal(SessionOutcome),
}

fn driver_fault(err: DriverError) -> Fault {
    Fault::Transient(err.to_string())
}

fn gateway_fault(err: GatewayError) -> Fault {
    match err {
        GatewayError::Provider { .. } | GatewayError::Malformed { .. } => {
            Fault::Transient(err.to_string())
        }
        GatewayError::Unconfigured(detail) => Fault::Fatal(SessionOutcome::Failed {
            reason: FailureReason::ProviderUnconfigured,
            detail,
        }),
        GatewayError::Cancelled => Fault::Fatal(aborted(AbortReason::Cancelled)),
    }
}

fn aborted(reason: AbortReason) -> SessionOutcome {
    let detail = match reason {
        AbortReason::Cancelled => "session cancelled",
        AbortReason::DeadlineExceeded => "session wall-clock budget exhausted",
    };
    SessionOutcome::Aborted {
        reason,
        detail: detail.to_string(),
    }
}

/// Budget, cancellation and retry pacing shared by every phase.
struct Pacer<'c> {
    controller: RecoveryController,
    backoff: Backoff,
    rng: StdRng,
    deadline: Instant,
    cancel: &'c CancelToken,
}

impl Pacer<'_> {
    /// Remaining wall-clock budget, or the abort outcome.
    fn checkpoint(&self) -> Result<Duration, SessionOutcome> {
        if self.cancel.is_cancelled() {
            return Err(aborted(AbortReason::Cancelled));
        }
        self.deadline
            .checked_duration_since(Instant::now())
            .filter(|remaining| !remaining.is_zero())
            .ok_or_else(|| aborted(AbortReason::DeadlineExceeded))
    }

    /// Run `call` until it succeeds, backing off between transient faults.
    fn guarded<T>(
        &mut self,
        source: ErrorSource,
        phase: Phase,
        mut call: impl FnMut(Duration) -> Result<T, Fault>,
    ) -> Result<T, SessionOutcome> {
        loop {
            let remaining = self.checkpoint()?;
            let message = match call(remaining) {
                Ok(value) => {
                    self.controller.on_call_success(source);
                    return Ok(value);
                }
                Err(Fault::Fatal(outcome)) => return Err(outcome),
                Err(Fault::Transient(message)) => message,
            };
            match self.controller.on_transient_error(source, phase, &message) {
                ErrorDecision::GiveUp { reason, detail } => {
                    return Err(SessionOutcome::Failed { reason, detail });
                }
                ErrorDecision::Retry { attempt } => {
                    let delay = self.backoff.delay(attempt, &mut self.rng).min(remaining);
                    warn!(?source, ?phase, attempt, ?delay, %message, "transient error, backing off");
                    if !sleep_cancellable(delay, self.cancel) {
                        return Err(aborted(AbortReason::Cancelled));
                    }
                }
            }
        }
    }
}

/// Drive one session for `goal` until it reaches an outcome.
///
/// The outcome is produced exactly once; afterwards only the optional
/// structured-output extraction may call the model. `Err` is reserved for
/// failures outside the session itself (trace I/O).
pub fn run_session<D, F>(
    goal: Goal,
    driver: &D,
    gateway: &Gateway,
    config: &AgentConfig,
    options: SessionOptions,
    mut on_step: F,
) -> Result<SessionReport>
where
    D: DeviceDriver + ?Sized,
    F: FnMut(&StepRecord),
{
    let session_id = new_session_id();
    let span = info_span!("session", id = %session_id);
    let _entered = span.enter();
    let started_at = Utc::now();
    info!(goal = %goal, "session started");

    let SessionOptions {
        cancel,
        output_description,
        trace,
        seed,
    } = options;
    let prompts = PromptBuilder::new(config.prompt.budget_bytes);
    let mut run = Run {
        snapshotter: Snapshotter::new(
            driver,
            config.device.capture_timeout(),
            config.device.max_elements,
        ),
        planner: Planner::new(
            gateway,
            prompts.clone(),
            config.session.memory_window,
            config.prompt.attach_screenshot,
        ),
        executor: Executor::new(driver, config.device.dispatch_timeout()),
        verifier: Verifier::new(
            gateway,
            prompts.clone(),
            config.verification.model_fallback,
            config.prompt.attach_screenshot,
        ),
        pacer: Pacer {
            controller: RecoveryController::new(Limits::from(&config.session)),
            backoff: Backoff::new(
                Duration::from_millis(config.backoff.base_ms),
                Duration::from_millis(config.backoff.max_ms),
                config.backoff.jitter_pct,
            ),
            rng: seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64),
            deadline: Instant::now() + config.session.wall_clock(),
            cancel: &cancel,
        },
        memory: SessionRecord::new(goal),
        trace,
        resnapshot_before_retry: config.session.resnapshot_before_retry,
    };

    let outcome = match run.drive(&mut on_step) {
        Ok(infallible) => match infallible {},
        Err(outcome) => outcome,
    };
    let pacer = &run.pacer;
    info!(
        outcome = %outcome,
        steps = run.memory.len(),
        iterations = pacer.controller.iterations(),
        replans = pacer.controller.replans(),
        "session finished"
    );

    let mut transcript = SessionTranscript::new(session_id, started_at, &run.memory, outcome);
    if let Some(description) = output_description.as_deref() {
        transcript.structured_output = extract_output(
            &Outputter::new(gateway, prompts),
            description,
            &run.memory,
            &transcript.outcome,
            &cancel,
            gateway.timeout(),
        );
    }

    let trace_dir = match run.trace.take() {
        Some(recorder) => Some(recorder.finish(&transcript)?),
        None => None,
    };
    Ok(SessionReport {
        transcript,
        trace_dir,
    })
}

fn extract_output(
    outputter: &Outputter<'_>,
    description: &str,
    memory: &SessionRecord,
    outcome: &SessionOutcome,
    cancel: &CancelToken,
    timeout: Duration,
) -> Option<Value> {
    match outputter.extract(
        description,
        memory,
        outcome,
        memory.last_confirmed_state(),
        timeout,
        cancel,
    ) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(error = %err, "failed to extract structured output");
            None
        }
    }
}

struct Run<'a, D: DeviceDriver + ?Sized> {
    snapshotter: Snapshotter<'a, D>,
    planner: Planner<'a>,
    executor: Executor<'a, D>,
    verifier: Verifier<'a>,
    pacer: Pacer<'a>,
    memory: SessionRecord,
    trace: Option<TraceRecorder>,
    resnapshot_before_retry: bool,
}

impl<D: DeviceDriver + ?Sized> Run<'_, D> {
    /// Loop until an outcome; the loop only ever exits through `Err`.
    fn drive(&mut self, on_step: &mut dyn FnMut(&StepRecord)) -> Result<Infallible, SessionOutcome> {
        let mut current = self.capture(Phase::Planning)?;
        self.memory.observe_initial(&current);
        let mut pending = None;

        loop {
            self.pacer.checkpoint()?;
            self.pacer
                .controller
                .begin_iteration()
                .map_err(terminal_outcome)?;
            let step = self.pacer.controller.step();
            let attempt = self.pacer.controller.attempt();

            // A retried proposal keeps the state it was planned on.
            let (proposal, planned_on) = match pending.take() {
                Some((proposal, planned_on)) => (proposal, Some(planned_on)),
                None => {
                    let (planner, memory, state) = (&self.planner, &self.memory, &current);
                    let cancel = self.pacer.cancel;
                    let proposal = self
                        .pacer
                        .guarded(ErrorSource::Provider, Phase::Planning, |timeout| {
                            planner
                                .plan(state, memory, timeout, cancel)
                                .map_err(gateway_fault)
                        })?;
                    (proposal, None)
                }
            };

            let (executor, origin) = (&self.executor, planned_on.as_ref().unwrap_or(&current));
            let mut result = self
                .pacer
                .guarded(ErrorSource::Driver, Phase::Executing, |timeout| {
                    executor
                        .execute(&proposal, origin, &current, timeout)
                        .map_err(driver_fault)
                })?;

            let verifiable = !matches!(result.dispatch, DispatchStatus::Rejected { .. })
                && !matches!(proposal.action, Action::DeclareStuck { .. });
            let (post, verification) = if verifiable {
                let post = self.capture(Phase::Executing)?;
                result.post_state_seq = Some(post.seq);
                let (verifier, goal, pre) = (&self.verifier, self.memory.goal(), &current);
                let cancel = self.pacer.cancel;
                let outcome = self.pacer.guarded(
                    ErrorSource::Provider,
                    Phase::Verifying,
                    |timeout| {
                        verifier
                            .verify(goal, &proposal, pre, &post, timeout, cancel)
                            .map_err(gateway_fault)
                    },
                )?;
                (Some(post), Some(outcome))
            } else {
                (None, None)
            };

            let decision = self
                .pacer
                .controller
                .on_step(&proposal, &result, verification.as_ref());
            info!(
                step,
                attempt,
                action = %proposal.action,
                verdict = verification.as_ref().map(|v| v.verdict.as_str()),
                transition = ?decision.transition(),
                "step decided"
            );
            let record = StepRecord {
                step,
                attempt,
                pre_state: current.clone(),
                proposal: proposal.clone(),
                result,
                verification,
                transition: decision.transition(),
            };
            self.memory.append(record, post.as_ref());
            self.record_last(on_step);

            let stale = post.is_none();
            let retry_origin = matches!(decision, Decision::RetryStep)
                .then(|| planned_on.unwrap_or_else(|| current.clone()));
            if let Some(post) = post {
                current = post;
            }
            match decision {
                Decision::Continue => {}
                Decision::RetryStep => {
                    if stale && self.resnapshot_before_retry {
                        current = self.capture(Phase::Executing)?;
                    }
                    pending = retry_origin.map(|origin| (proposal, origin));
                }
                Decision::Replan { note } => {
                    warn!(step, %note, "re-planning");
                    self.memory.record_replan(step, note);
                }
                terminal => return Err(terminal_outcome(terminal)),
            }
        }
    }

    fn capture(&mut self, phase: Phase) -> Result<DeviceState, SessionOutcome> {
        let snapshotter = &mut self.snapshotter;
        let mut state = self
            .pacer
            .guarded(ErrorSource::Driver, phase, |timeout| {
                snapshotter.snapshot(timeout).map_err(driver_fault)
            })?;
        if let Some(trace) = &self.trace {
            match trace.record_screenshot(&state) {
                Ok(path) => {
                    if let Some(shot) = state.screenshot.as_mut() {
                        shot.path = path;
                    }
                }
                Err(err) => warn!(error = %format!("{err:#}"), "failed to record screenshot"),
            }
        }
        Ok(state)
    }

    fn record_last(&self, on_step: &mut dyn FnMut(&StepRecord)) {
        let Some(record) = self.memory.steps().last() else {
            return;
        };
        if let Some(trace) = &self.trace
            && let Err(err) = trace.record_step(self.memory.len(), record)
        {
            warn!(error = %format!("{err:#}"), "failed to record step");
        }
        on_step(record);
    }
}

fn terminal_outcome(decision: Decision) -> SessionOutcome {
    match decision {
        Decision::Succeed { summary } => SessionOutcome::Succeeded { summary },
        Decision::Fail { reason, detail } => SessionOutcome::Failed { reason, detail },
        Decision::Continue | Decision::RetryStep | Decision::Replan { .. } => {
            SessionOutcome::Failed {
                reason: FailureReason::StepLimit,
                detail: "loop exited without a terminal decision".to_string(),
            }
        }
    }
}
