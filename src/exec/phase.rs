//! Phase ordering enforcement
//!
//! A run moves strictly forward through
//!
//! Idle -> Initializing -> Configuring -> Operating -> Validating ->
//! CleaningUp -> Terminal
//!
//! Each step consumes the prior state and returns the next one, so a phase
//! cannot be skipped, repeated or entered out of order. Every path, including
//! an abort from any working phase, goes through `CleaningUp` exactly once;
//! only `Run<CleaningUp>` can reach `Terminal`.
//!
//! Skipping a phase does not compile:
//!
//! ```compile_fail
//! use seqbox::config::types::{Phase, RunOutcome};
//! use seqbox::exec::phase::{PhaseBody, PhaseResult, Run};
//!
//! struct Noop;
//! impl PhaseBody for Noop {
//!     fn run_phase(&mut self, _phase: Phase) -> PhaseResult { PhaseResult::Completed }
//!     fn run_cleanup(&mut self, _aborted: bool) -> RunOutcome { RunOutcome::Success }
//! }
//!
//! let run = Run::new(Noop).begin();
//! let _ = run.operate();
//! ```
//!
//! A consumed state cannot be reused:
//!
//! ```compile_fail
//! use seqbox::config::types::{Phase, RunOutcome};
//! use seqbox::exec::phase::{PhaseBody, PhaseResult, Run};
//!
//! struct Noop;
//! impl PhaseBody for Noop {
//!     fn run_phase(&mut self, _phase: Phase) -> PhaseResult { PhaseResult::Completed }
//!     fn run_cleanup(&mut self, _aborted: bool) -> RunOutcome { RunOutcome::Success }
//! }
//!
//! let run = Run::new(Noop).begin();
//! let _first = run.initialize();
//! let _second = run.initialize();
//! ```
//!
//! Cleanup runs once; a terminal run cannot be cleaned up again:
//!
//! ```compile_fail
//! use seqbox::config::types::{Phase, RunOutcome};
//! use seqbox::exec::phase::{PhaseBody, PhaseResult, Run};
//!
//! struct Noop;
//! impl PhaseBody for Noop {
//!     fn run_phase(&mut self, _phase: Phase) -> PhaseResult { PhaseResult::Completed }
//!     fn run_cleanup(&mut self, _aborted: bool) -> RunOutcome { RunOutcome::Success }
//! }
//!
//! let done = Run::new(Noop).begin().initialize().abandon().finish();
//! let _again = done.finish();
//! ```
//!
//! The legal chain:
//!
//! ```
//! use seqbox::config::types::{Phase, RunOutcome};
//! use seqbox::exec::phase::{PhaseBody, PhaseResult, Run};
//!
//! struct Noop;
//! impl PhaseBody for Noop {
//!     fn run_phase(&mut self, _phase: Phase) -> PhaseResult { PhaseResult::Completed }
//!     fn run_cleanup(&mut self, _aborted: bool) -> RunOutcome { RunOutcome::Success }
//! }
//!
//! let done = Run::new(Noop)
//!     .begin()
//!     .initialize()
//!     .and_then(Run::configure)
//!     .and_then(Run::operate)
//!     .and_then(Run::validate)
//!     .into_cleanup()
//!     .finish();
//! assert_eq!(done.outcome(), RunOutcome::Success);
//! ```

use crate::config::types::{Phase, PhaseState, RunOutcome};
use log::debug;
use std::marker::PhantomData;

/// Type-state marker: nothing has run yet
pub struct Idle;

/// Type-state marker: about to run the Initialize phase
pub struct Initializing;

/// Type-state marker: about to run the Configure phase
pub struct Configuring;

/// Type-state marker: about to run the Operate phase
pub struct Operating;

/// Type-state marker: about to run the Validate phase
pub struct Validating;

/// Type-state marker: cleanup pending (entered exactly once)
pub struct CleaningUp;

/// Type-state marker: run finished
pub struct Terminal;

/// Result of running one phase body
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseResult {
    Completed,
    /// Stop and go straight to cleanup
    Abort,
}

/// What a run does inside each phase
pub trait PhaseBody {
    /// Run the scripted operations of one working phase.
    fn run_phase(&mut self, phase: Phase) -> PhaseResult;

    /// Cleanup work (scripted cleanup, drain); decides the final outcome.
    fn run_cleanup(&mut self, aborted: bool) -> RunOutcome;

    /// Checked before each working phase starts.
    fn at_boundary(&mut self, _next: Phase) -> PhaseResult {
        PhaseResult::Completed
    }
}

/// A run in phase state `S`
pub struct Run<S, C> {
    body: C,
    state: PhaseState,
    aborted: bool,
    outcome: Option<RunOutcome>,
    _state: PhantomData<S>,
}

/// Outcome of a working phase: the next state, or straight to cleanup
pub enum Step<S, C> {
    Continue(Run<S, C>),
    Abort(Run<CleaningUp, C>),
}

impl<S, C> Step<S, C> {
    /// Run the next transition unless an earlier one aborted.
    pub fn and_then<N>(self, next: impl FnOnce(Run<S, C>) -> Step<N, C>) -> Step<N, C> {
        match self {
            Step::Continue(run) => next(run),
            Step::Abort(run) => Step::Abort(run),
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Step::Abort(_))
    }
}

impl<S, C: PhaseBody> Step<S, C> {
    /// Abandon the remaining working phases and go to cleanup.
    pub fn abandon(self) -> Run<CleaningUp, C> {
        match self {
            Step::Continue(run) => run.abort(),
            Step::Abort(run) => run,
        }
    }
}

impl<C: PhaseBody> Step<CleaningUp, C> {
    /// The cleanup state reached after validation, aborted or not.
    pub fn into_cleanup(self) -> Run<CleaningUp, C> {
        match self {
            Step::Continue(run) | Step::Abort(run) => run,
        }
    }
}

impl<S, C> Run<S, C> {
    fn into_state<N>(self, state: PhaseState) -> Run<N, C> {
        debug!("phase state {:?} -> {:?}", self.state, state);
        Run {
            body: self.body,
            state,
            aborted: self.aborted,
            outcome: self.outcome,
            _state: PhantomData,
        }
    }

    /// Runtime mirror of the type-state
    pub fn state(&self) -> PhaseState {
        self.state
    }

    pub fn body(&self) -> &C {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut C {
        &mut self.body
    }
}

impl<S, C: PhaseBody> Run<S, C> {
    fn abort(mut self) -> Run<CleaningUp, C> {
        self.aborted = true;
        self.into_state(PhaseState::CleaningUp)
    }

    fn step<N>(mut self, phase: Phase, next: PhaseState) -> Step<N, C> {
        if self.body.at_boundary(phase) == PhaseResult::Abort {
            return Step::Abort(self.abort());
        }
        match self.body.run_phase(phase) {
            PhaseResult::Completed => Step::Continue(self.into_state(next)),
            PhaseResult::Abort => Step::Abort(self.abort()),
        }
    }
}

impl<C: PhaseBody> Run<Idle, C> {
    pub fn new(body: C) -> Self {
        Self {
            body,
            state: PhaseState::Idle,
            aborted: false,
            outcome: None,
            _state: PhantomData,
        }
    }

    pub fn begin(self) -> Run<Initializing, C> {
        self.into_state(PhaseState::Initializing)
    }
}

impl<C: PhaseBody> Run<Initializing, C> {
    pub fn initialize(self) -> Step<Configuring, C> {
        self.step(Phase::Initialize, PhaseState::Configuring)
    }
}

impl<C: PhaseBody> Run<Configuring, C> {
    pub fn configure(self) -> Step<Operating, C> {
        self.step(Phase::Configure, PhaseState::Operating)
    }
}

impl<C: PhaseBody> Run<Operating, C> {
    pub fn operate(self) -> Step<Validating, C> {
        self.step(Phase::Operate, PhaseState::Validating)
    }
}

impl<C: PhaseBody> Run<Validating, C> {
    /// Validation always ends in cleanup; `Abort` marks it as failed.
    pub fn validate(self) -> Step<CleaningUp, C> {
        self.step(Phase::Validate, PhaseState::CleaningUp)
    }
}

impl<C: PhaseBody> Run<CleaningUp, C> {
    /// Whether a working phase aborted before cleanup.
    pub fn aborted(&self) -> bool {
        self.aborted
    }

    /// Run cleanup to completion and enter `Terminal`.
    pub fn finish(mut self) -> Run<Terminal, C> {
        let outcome = self.body.run_cleanup(self.aborted);
        self.outcome = Some(outcome);
        self.into_state(PhaseState::Terminal(outcome))
    }
}

impl<C> Run<Terminal, C> {
    pub fn outcome(&self) -> RunOutcome {
        self.outcome.unwrap_or(RunOutcome::Failure)
    }

    pub fn into_body(self) -> C {
        self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records the phases it ran; aborts at `fail_at`.
    #[derive(Default)]
    struct Trace {
        phases: Vec<Phase>,
        fail_at: Option<Phase>,
        interrupt_at: Option<Phase>,
        cleanups: Vec<bool>,
    }

    impl PhaseBody for Trace {
        fn run_phase(&mut self, phase: Phase) -> PhaseResult {
            self.phases.push(phase);
            if self.fail_at == Some(phase) {
                PhaseResult::Abort
            } else {
                PhaseResult::Completed
            }
        }

        fn run_cleanup(&mut self, aborted: bool) -> RunOutcome {
            self.phases.push(Phase::Cleanup);
            self.cleanups.push(aborted);
            if aborted {
                RunOutcome::Failure
            } else {
                RunOutcome::Success
            }
        }

        fn at_boundary(&mut self, next: Phase) -> PhaseResult {
            if self.interrupt_at == Some(next) {
                PhaseResult::Abort
            } else {
                PhaseResult::Completed
            }
        }
    }

    fn drive(trace: Trace) -> Run<Terminal, Trace> {
        Run::new(trace)
            .begin()
            .initialize()
            .and_then(Run::configure)
            .and_then(Run::operate)
            .and_then(Run::validate)
            .into_cleanup()
            .finish()
    }

    #[test]
    fn test_full_chain_visits_every_phase_once() {
        let done = drive(Trace::default());
        assert_eq!(done.state(), PhaseState::Terminal(RunOutcome::Success));
        let trace = done.into_body();
        assert_eq!(trace.phases, Phase::ORDER.to_vec());
        assert_eq!(trace.cleanups, vec![false]);
    }

    #[test]
    fn test_abort_skips_to_cleanup_once() {
        let done = drive(Trace {
            fail_at: Some(Phase::Configure),
            ..Trace::default()
        });
        assert_eq!(done.outcome(), RunOutcome::Failure);
        let trace = done.into_body();
        assert_eq!(
            trace.phases,
            vec![Phase::Initialize, Phase::Configure, Phase::Cleanup]
        );
        assert_eq!(trace.cleanups, vec![true]);
    }

    #[test]
    fn test_boundary_interrupt_stops_before_phase_body() {
        let done = drive(Trace {
            interrupt_at: Some(Phase::Operate),
            ..Trace::default()
        });
        let trace = done.into_body();
        assert_eq!(
            trace.phases,
            vec![Phase::Initialize, Phase::Configure, Phase::Cleanup]
        );
    }

    #[test]
    fn test_abandon_marks_run_aborted() {
        let cleaning = Run::new(Trace::default()).begin().initialize().abandon();
        assert!(cleaning.aborted());
        let trace = cleaning.finish().into_body();
        assert_eq!(trace.phases, vec![Phase::Initialize, Phase::Cleanup]);
    }

    #[test]
    fn test_validate_failure_still_cleans_up() {
        let step = Run::new(Trace {
            fail_at: Some(Phase::Validate),
            ..Trace::default()
        })
        .begin()
        .initialize()
        .and_then(Run::configure)
        .and_then(Run::operate)
        .and_then(Run::validate);
        assert!(step.is_abort());
        let cleaning = step.into_cleanup();
        assert!(cleaning.aborted());
        assert_eq!(cleaning.state(), PhaseState::CleaningUp);
        assert_eq!(cleaning.finish().outcome(), RunOutcome::Failure);
    }
}
