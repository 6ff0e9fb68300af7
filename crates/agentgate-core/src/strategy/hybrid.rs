//! Hybrid loop strategy (§4.7): behaves like [`super::fixed::FixedStrategy`]
//! for `base_iterations`, then allows up to `bonus_iterations` more iff
//! `progress.trend == improving`.

use async_trait::async_trait;

use super::{Decision, LoopStrategy, ProgressTrend, StrategyContext};

#[derive(Debug, Clone, Copy)]
pub struct HybridStrategy {
    pub base_iterations: u32,
    pub bonus_iterations: u32,
}

impl HybridStrategy {
    pub fn new(base_iterations: u32, bonus_iterations: u32) -> Self {
        Self {
            base_iterations,
            bonus_iterations,
        }
    }
}

#[async_trait]
impl LoopStrategy for HybridStrategy {
    fn name(&self) -> &str {
        "hybrid"
    }

    async fn should_continue(&self, ctx: &StrategyContext) -> Decision {
        let verification_failed = ctx
            .current_verification
            .as_ref()
            .map(|v| !v.passed)
            .unwrap_or(true);

        if !verification_failed {
            return Decision::stop("verification passed");
        }

        if ctx.state.iteration < self.base_iterations {
            return Decision::continue_with("within base iteration budget");
        }

        let bonus_ceiling = self.base_iterations + self.bonus_iterations;
        if ctx.state.iteration < bonus_ceiling && ctx.state.progress == ProgressTrend::Improving {
            return Decision::continue_with("progress improving, granting bonus iteration");
        }

        Decision::stop("base budget exhausted and no improving bonus available")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunId, WorkOrderId};
    use crate::strategy::{LoopState, VerificationView};

    fn ctx(iteration: u32, progress: ProgressTrend) -> StrategyContext {
        StrategyContext {
            work_order_id: WorkOrderId::new(),
            run_id: RunId::new(),
            task_prompt: "do the thing".to_string(),
            state: LoopState {
                iteration,
                max_iterations: 100,
                started_at: chrono::Utc::now(),
                progress,
                history: Vec::new(),
            },
            current_snapshot: None,
            current_verification: Some(VerificationView {
                passed: false,
                summary: None,
            }),
        }
    }

    #[tokio::test]
    async fn continues_within_base_budget_regardless_of_progress() {
        let strategy = HybridStrategy::new(3, 2);
        let decision = strategy.should_continue(&ctx(1, ProgressTrend::Regressing)).await;
        assert!(decision.should_continue);
    }

    #[tokio::test]
    async fn grants_bonus_iteration_when_improving() {
        let strategy = HybridStrategy::new(3, 2);
        let decision = strategy.should_continue(&ctx(3, ProgressTrend::Improving)).await;
        assert!(decision.should_continue);
    }

    #[tokio::test]
    async fn denies_bonus_iteration_when_not_improving() {
        let strategy = HybridStrategy::new(3, 2);
        let decision = strategy.should_continue(&ctx(3, ProgressTrend::Flat)).await;
        assert!(!decision.should_continue);
    }

    #[tokio::test]
    async fn stops_once_bonus_ceiling_reached_even_if_improving() {
        let strategy = HybridStrategy::new(3, 2);
        let decision = strategy.should_continue(&ctx(5, ProgressTrend::Improving)).await;
        assert!(!decision.should_continue);
    }
}
