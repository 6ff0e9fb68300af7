//! Loop Strategy (§4.7).
//!
//! A strategy observes loop lifecycle and decides, after each verification,
//! whether the Run Executor should continue iterating. Modeled as an
//! object-safe `#[async_trait]` trait with no-op default bodies for the
//! lifecycle hooks, the same "intentionally object-safe" shape the
//! teacher's `Harness` trait uses so `Box<dyn LoopStrategy>` is storable and
//! swappable at runtime.

pub mod fixed;
pub mod hybrid;
pub mod ralph;

use async_trait::async_trait;

use crate::model::{BuildError, ErrorType};

/// A minimal, cloneable view of a snapshot for strategies that need diff
/// text (Ralph's convergence check). Real snapshot content lives with the
/// `Workspace manager` collaborator (§6); the executor hands strategies
/// only this projection.
#[derive(Debug, Clone, Default)]
pub struct SnapshotView {
    pub snapshot_id: String,
    pub diff_text: String,
}

/// A minimal view of a verification outcome, enough for a strategy to
/// decide without depending on the full `Verifier` report shape.
#[derive(Debug, Clone)]
pub struct VerificationView {
    pub passed: bool,
    pub summary: Option<String>,
}

/// Trend of recent verification progress, computed by the executor from its
/// iteration history and handed to strategies that care (Hybrid).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressTrend {
    Improving,
    Flat,
    Regressing,
    Unknown,
}

/// Derive a [`ProgressTrend`] from the per-iteration count of failing
/// verification diagnostics, oldest first. Compares the two most recent
/// counts: fewer diagnostics than last time is `Improving`, more is
/// `Regressing`, equal is `Flat`. Fewer than two data points (nothing to
/// compare against yet) is `Unknown`.
pub fn compute_progress_trend(diagnostic_counts: &[usize]) -> ProgressTrend {
    match diagnostic_counts {
        [.., previous, current] => match current.cmp(previous) {
            std::cmp::Ordering::Less => ProgressTrend::Improving,
            std::cmp::Ordering::Greater => ProgressTrend::Regressing,
            std::cmp::Ordering::Equal => ProgressTrend::Flat,
        },
        _ => ProgressTrend::Unknown,
    }
}

/// Loop lifecycle state visible to a strategy (§4.7 `ctx.state`).
#[derive(Debug, Clone)]
pub struct LoopState {
    pub iteration: u32,
    pub max_iterations: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub progress: ProgressTrend,
    pub history: Vec<SnapshotView>,
}

/// Full context passed to every strategy hook (§4.7 `ctx`).
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub work_order_id: crate::model::WorkOrderId,
    pub run_id: crate::model::RunId,
    pub task_prompt: String,
    pub state: LoopState,
    pub current_snapshot: Option<SnapshotView>,
    pub current_verification: Option<VerificationView>,
}

/// The strategy's continue/stop verdict (§4.7 `Decision`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub should_continue: bool,
    pub action: DecisionAction,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    Continue,
    Stop,
}

impl Decision {
    pub fn stop(reason: impl Into<String>) -> Self {
        Self {
            should_continue: false,
            action: DecisionAction::Stop,
            reason: reason.into(),
        }
    }

    pub fn continue_with(reason: impl Into<String>) -> Self {
        Self {
            should_continue: true,
            action: DecisionAction::Continue,
            reason: reason.into(),
        }
    }
}

/// Policy object deciding when a run's BUILD-SNAPSHOT-VERIFY-FEEDBACK loop
/// should stop. Lifecycle hooks default to no-ops so a concrete strategy
/// only overrides `should_continue` plus whichever hooks it needs.
#[async_trait]
pub trait LoopStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn on_loop_start(&self, _ctx: &StrategyContext) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_loop_end(&self, _ctx: &StrategyContext, _last_decision: &Decision) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_iteration_start(&self, _ctx: &StrategyContext) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_iteration_end(&self, _ctx: &StrategyContext, _decision: &Decision) -> anyhow::Result<()> {
        Ok(())
    }

    async fn should_continue(&self, ctx: &StrategyContext) -> Decision;
}

const _: () = {
    fn _assert_object_safe(_: &dyn LoopStrategy) {}
};

/// The executor's hard-coded fallback when a strategy's lifecycle hook
/// itself fails (§4.7 "Strategy errors in lifecycle hooks are non-fatal —
/// log and fall back to 'stop at maxIterations, failed verification ->
/// stop'"). This is distinct from `fixed::FixedStrategy`: it exists so the
/// executor has something to call even when the configured strategy object
/// has just thrown.
pub fn fallback_decision(ctx: &StrategyContext) -> Decision {
    let verification_failed = ctx
        .current_verification
        .as_ref()
        .map(|v| !v.passed)
        .unwrap_or(true);
    if verification_failed && ctx.state.iteration < ctx.state.max_iterations {
        Decision::continue_with("fallback: retries available, verification failed")
    } else {
        Decision::stop("fallback: max iterations reached or verification passed")
    }
}

/// Build a `BuildError`-shaped explanation for a strategy hook failure, for
/// callers (the Run Executor) that want to log it through the same
/// structured path as other run failures without treating it as fatal.
pub fn hook_failure_error(strategy_name: &str, message: &str) -> BuildError {
    let mut err = BuildError::new(
        ErrorType::SystemError,
        format!("loop strategy '{strategy_name}' lifecycle hook failed: {message}"),
    );
    err.context
        .insert("strategy".to_string(), serde_json::json!(strategy_name));
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trend_is_unknown_with_fewer_than_two_samples() {
        assert_eq!(compute_progress_trend(&[]), ProgressTrend::Unknown);
        assert_eq!(compute_progress_trend(&[3]), ProgressTrend::Unknown);
    }

    #[test]
    fn trend_improving_when_diagnostics_decrease() {
        assert_eq!(compute_progress_trend(&[5, 2]), ProgressTrend::Improving);
    }

    #[test]
    fn trend_regressing_when_diagnostics_increase() {
        assert_eq!(compute_progress_trend(&[2, 5]), ProgressTrend::Regressing);
    }

    #[test]
    fn trend_flat_when_diagnostics_unchanged() {
        assert_eq!(compute_progress_trend(&[4, 4]), ProgressTrend::Flat);
    }
}
