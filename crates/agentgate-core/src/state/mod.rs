//! Run State Machine (§4.8).
//!
//! `apply_transition` is a pure function of `(RunState, Event)` — no I/O, no
//! `&self`. It returns a new [`Run`] with its `state` (and, for `Building`,
//! its `iteration` counter) updated, or `InvalidTransition` for an
//! unmodelled edge. This differs from the teacher's `TaskStateMachine`,
//! which mixes the same edge-table idiom with a SQL side effect
//! (`sqlx::PgPool`); here the decision and the persistence are split so the
//! decision itself stays unit-testable without a database.

use chrono::Utc;

use crate::errors::OperationalError;
use crate::model::{Run, RunResult, RunState};

/// Closed set of events that can drive a run transition (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    WorkspaceAcquired,
    BuildStarted,
    BuildCompleted,
    BuildFailed,
    SnapshotCompleted,
    VerifyPassed,
    VerifyFailedRetryable,
    VerifyFailedTerminal,
    FeedbackGenerated,
    PrCreated,
    CiPollingStarted,
    CiPassed,
    CiFailed,
    CiTimeout,
    SystemError,
    UserCanceled,
}

/// Apply `event` to `run`, returning the run with its new state (and, where
/// relevant, result/iteration) or `InvalidTransition` if `(run.state, event)`
/// is not an edge in the graph.
///
/// Terminal states reject every event (§4.8 "terminal states reject all
/// events"), which is what makes `cancel_run` idempotent: canceling an
/// already-terminal run is simply an `Err` the caller ignores.
pub fn apply_transition(mut run: Run, event: Event) -> Result<Run, OperationalError> {
    use Event::*;
    use RunState::*;

    if run.state.is_terminal() {
        return Err(OperationalError::InvalidStateTransition);
    }

    let new_state = match (run.state, event) {
        (Created, WorkspaceAcquired) => Leased,
        (Created, SystemError) => FailedError,
        (Created, UserCanceled) => Canceled,

        (Leased, BuildStarted) => Building,
        (Leased, SystemError) => FailedError,
        (Leased, UserCanceled) => Canceled,

        // Entering Building from Feedback reuses the iteration counter;
        // entering from Created/Leased starts iteration 1. The executor
        // only emits `BuildStarted` when not already `Building` (§4.9 step
        // 3), so this edge also tolerates a no-op re-entry mid-iteration.
        (Building, BuildStarted) => Building,
        (Building, BuildCompleted) => Snapshotting,
        (Building, BuildFailed) => FailedBuild,
        (Building, SystemError) => FailedError,
        (Building, UserCanceled) => Canceled,

        (Snapshotting, SnapshotCompleted) => Verifying,
        (Snapshotting, SystemError) => FailedError,
        (Snapshotting, UserCanceled) => Canceled,

        (Verifying, VerifyPassed) => Succeeded,
        (Verifying, VerifyFailedRetryable) => Feedback,
        (Verifying, VerifyFailedTerminal) => FailedVerification,
        (Verifying, PrCreated) => PrCreated,
        (Verifying, SystemError) => FailedError,
        (Verifying, UserCanceled) => Canceled,

        (Feedback, FeedbackGenerated) => Building,
        (Feedback, SystemError) => FailedError,
        (Feedback, UserCanceled) => Canceled,

        (PrCreated, CiPollingStarted) => CiPolling,
        (PrCreated, SystemError) => FailedError,
        (PrCreated, UserCanceled) => Canceled,

        (CiPolling, CiPassed) => Succeeded,
        (CiPolling, CiFailed) => FailedVerification,
        (CiPolling, VerifyFailedRetryable) => Feedback,
        (CiPolling, CiTimeout) => FailedError,
        (CiPolling, SystemError) => FailedError,
        (CiPolling, UserCanceled) => Canceled,

        _ => return Err(OperationalError::InvalidStateTransition),
    };

    run.state = new_state;
    if new_state == Building && run.iteration == 0 {
        run.iteration = 1;
    }
    if let Some(result) = terminal_result(new_state) {
        run.result = result;
    }
    Ok(run)
}

fn terminal_result(state: RunState) -> Option<RunResult> {
    match state {
        RunState::Succeeded => Some(RunResult::Passed),
        RunState::FailedBuild => Some(RunResult::FailedBuild),
        RunState::FailedVerification => Some(RunResult::FailedVerification),
        RunState::FailedError => Some(RunResult::FailedError),
        RunState::Canceled => Some(RunResult::Canceled),
        _ => None,
    }
}

/// Cancel a run: fires `UserCanceled` and no-ops (returns the run unchanged)
/// if it is already terminal, matching §4.8's "used by `cancelRun` to
/// no-op."
pub fn cancel_run(run: Run) -> Run {
    if run.state.is_terminal() {
        return run;
    }
    apply_transition(run, Event::UserCanceled).expect("UserCanceled is valid from every non-terminal state")
}

/// Stamp `failed_at`-adjacent bookkeeping helper used by callers constructing
/// a fresh terminal run record outside of `apply_transition` (e.g. when a
/// lifecycle hook fails before any state exists yet). Exists so call sites
/// don't reach for `Utc::now()` directly and drift from the run's own clock
/// conventions.
pub fn now() -> chrono::DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkOrderId;

    fn fresh_run() -> Run {
        Run::new(WorkOrderId::new())
    }

    #[test]
    fn created_to_leased_to_building_starts_iteration_one() {
        let run = fresh_run();
        let run = apply_transition(run, Event::WorkspaceAcquired).unwrap();
        assert_eq!(run.state, RunState::Leased);
        let run = apply_transition(run, Event::BuildStarted).unwrap();
        assert_eq!(run.state, RunState::Building);
        assert_eq!(run.iteration, 1);
    }

    #[test]
    fn feedback_to_building_preserves_iteration_counter() {
        let mut run = fresh_run();
        run.state = RunState::Feedback;
        run.iteration = 3;
        let run = apply_transition(run, Event::FeedbackGenerated).unwrap();
        assert_eq!(run.state, RunState::Building);
        assert_eq!(run.iteration, 3, "iteration counter must not reset on feedback re-entry");
    }

    #[test]
    fn verify_passed_sets_succeeded_result() {
        let mut run = fresh_run();
        run.state = RunState::Verifying;
        let run = apply_transition(run, Event::VerifyPassed).unwrap();
        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.result, RunResult::Passed);
    }

    #[test]
    fn terminal_states_reject_all_events() {
        let mut run = fresh_run();
        run.state = RunState::Succeeded;
        let err = apply_transition(run, Event::BuildStarted).unwrap_err();
        assert_eq!(err, OperationalError::InvalidStateTransition);
    }

    #[test]
    fn invalid_edge_is_rejected() {
        let run = fresh_run();
        let err = apply_transition(run, Event::VerifyPassed).unwrap_err();
        assert_eq!(err, OperationalError::InvalidStateTransition);
    }

    #[test]
    fn cancel_run_is_idempotent_on_terminal_runs() {
        let mut run = fresh_run();
        run.state = RunState::FailedBuild;
        run.result = RunResult::FailedBuild;
        let canceled = cancel_run(run.clone());
        assert_eq!(canceled.state, run.state, "cancel must no-op on a terminal run");
    }

    #[test]
    fn cancel_run_from_active_state_transitions_to_canceled() {
        let mut run = fresh_run();
        run.state = RunState::Building;
        let canceled = cancel_run(run);
        assert_eq!(canceled.state, RunState::Canceled);
        assert_eq!(canceled.result, RunResult::Canceled);
    }

    #[test]
    fn ci_failed_with_retry_goes_to_feedback() {
        let mut run = fresh_run();
        run.state = RunState::CiPolling;
        run.iteration = 1;
        let run = apply_transition(run, Event::VerifyFailedRetryable).unwrap();
        assert_eq!(run.state, RunState::Feedback);
    }

    #[test]
    fn applying_same_event_twice_is_deterministic() {
        let run_a = fresh_run();
        let run_b = run_a.clone();
        let out_a = apply_transition(run_a, Event::WorkspaceAcquired).unwrap();
        let out_b = apply_transition(run_b, Event::WorkspaceAcquired).unwrap();
        assert_eq!(out_a.state, out_b.state);
    }
}
