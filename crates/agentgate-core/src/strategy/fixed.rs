//! Fixed loop strategy (§4.7): continue while `iteration < maxIterations`
//! and the last verification failed; otherwise stop. This is the bare
//! spec.md default — a caller who wants no strategy-driven bonus iterations
//! configures this explicitly (see the "strategy bonus-iteration
//! precedence" design note in SPEC_FULL.md §9).

use async_trait::async_trait;

use super::{Decision, LoopStrategy, StrategyContext};

#[derive(Debug, Default, Clone, Copy)]
pub struct FixedStrategy;

#[async_trait]
impl LoopStrategy for FixedStrategy {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn should_continue(&self, ctx: &StrategyContext) -> Decision {
        let verification_failed = ctx
            .current_verification
            .as_ref()
            .map(|v| !v.passed)
            .unwrap_or(true);

        if verification_failed && ctx.state.iteration < ctx.state.max_iterations {
            Decision::continue_with("verification failed, iterations remain")
        } else if !verification_failed {
            Decision::stop("verification passed")
        } else {
            Decision::stop("max iterations reached")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunId, WorkOrderId};
    use crate::strategy::{LoopState, ProgressTrend, VerificationView};

    fn ctx(iteration: u32, max_iterations: u32, passed: bool) -> StrategyContext {
        StrategyContext {
            work_order_id: WorkOrderId::new(),
            run_id: RunId::new(),
            task_prompt: "do the thing".to_string(),
            state: LoopState {
                iteration,
                max_iterations,
                started_at: chrono::Utc::now(),
                progress: ProgressTrend::Unknown,
                history: Vec::new(),
            },
            current_snapshot: None,
            current_verification: Some(VerificationView {
                passed,
                summary: None,
            }),
        }
    }

    #[tokio::test]
    async fn continues_while_failing_and_budget_remains() {
        let strategy = FixedStrategy;
        let decision = strategy.should_continue(&ctx(1, 3, false)).await;
        assert!(decision.should_continue);
    }

    #[tokio::test]
    async fn stops_when_verification_passes() {
        let strategy = FixedStrategy;
        let decision = strategy.should_continue(&ctx(1, 3, true)).await;
        assert!(!decision.should_continue);
    }

    #[tokio::test]
    async fn stops_at_max_iterations_even_if_failing() {
        let strategy = FixedStrategy;
        let decision = strategy.should_continue(&ctx(3, 3, false)).await;
        assert!(!decision.should_continue);
    }
}
