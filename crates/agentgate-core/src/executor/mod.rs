//! Run Executor (§4.9).
//!
//! Drives one run end-to-end through BUILD → SNAPSHOT → VERIFY → FEEDBACK,
//! consuming a [`RunCallbacks`] bundle for every external effect. Every
//! collaborator is an `Arc<dyn ... + Send + Sync>` trait object, the same
//! shape the teacher stores its `Harness`/`Isolation` implementations in,
//! so the executor itself stays free of generics.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::collaborators::{
    AgentRequest, AgentResult, BeforeState, CiStatus, GatePlan, LeaseProvider, PersistenceStore,
    PullRequestHandle, Snapshot, VerificationReport, VerifyRequest, Workspace,
};
use crate::error_builder::{from_agent_result, from_exception, AgentResultView};
use crate::model::{
    BuildError, ErrorType, IterationData, Run, RunId, RunResult, WorkOrderId, WorkspaceId,
};
use crate::state::{apply_transition, Event};
use crate::streaming::{AgentEvent, EventSink, EventThrottle};
use crate::strategy::{
    compute_progress_trend, fallback_decision, hook_failure_error, Decision, LoopState,
    LoopStrategy, ProgressTrend, SnapshotView, StrategyContext, VerificationView,
};

// ---------------------------------------------------------------------------
// Per-run callback traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait OnRunStarted: Send + Sync {
    async fn call(&self, work_order_id: WorkOrderId, run_id: RunId);
}

#[async_trait]
pub trait OnCaptureBeforeState: Send + Sync {
    async fn call(&self, workspace: &Workspace) -> anyhow::Result<BeforeState>;
}

#[async_trait]
pub trait OnBuild: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn call(
        &self,
        request: AgentRequest,
        cancellation: CancellationToken,
        on_event: EventSink,
    ) -> anyhow::Result<AgentResult>;
}

#[async_trait]
pub trait OnPushIteration: Send + Sync {
    async fn call(&self, workspace: &Workspace, run_id: RunId, iteration: u32) -> anyhow::Result<()>;
}

#[async_trait]
pub trait OnSnapshot: Send + Sync {
    async fn call(
        &self,
        workspace: &Workspace,
        before: &BeforeState,
        run_id: RunId,
        iteration: u32,
        prompt: &str,
    ) -> anyhow::Result<Snapshot>;
}

#[async_trait]
pub trait OnVerify: Send + Sync {
    async fn call(&self, request: VerifyRequest) -> anyhow::Result<VerificationReport>;
}

#[async_trait]
pub trait OnFeedback: Send + Sync {
    async fn call(
        &self,
        snapshot: &Snapshot,
        report: &VerificationReport,
        gate_plan: &GatePlan,
    ) -> anyhow::Result<String>;
}

#[async_trait]
pub trait OnCreatePullRequest: Send + Sync {
    async fn call(&self, run: &Run) -> anyhow::Result<PullRequestHandle>;
}

#[async_trait]
pub trait OnPollCi: Send + Sync {
    async fn call(&self, pr: &PullRequestHandle) -> anyhow::Result<CiStatus>;
}

/// Every external effect the executor drives, grouped per spec.md §4.9's
/// callback list. The three trailing hooks are optional: their absence
/// means "no PR workflow for this run" rather than an error.
pub struct RunCallbacks {
    pub on_run_started: Arc<dyn OnRunStarted>,
    pub on_capture_before_state: Arc<dyn OnCaptureBeforeState>,
    pub on_build: Arc<dyn OnBuild>,
    pub on_push_iteration: Option<Arc<dyn OnPushIteration>>,
    pub on_snapshot: Arc<dyn OnSnapshot>,
    pub on_verify: Arc<dyn OnVerify>,
    pub on_feedback: Arc<dyn OnFeedback>,
    pub on_create_pull_request: Option<Arc<dyn OnCreatePullRequest>>,
    pub on_poll_ci: Option<Arc<dyn OnPollCi>>,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub lease_ttl_ms: u64,
    pub lease_renew_interval: Duration,
    /// Baseline retry policy used only when no [`LoopStrategy`] is
    /// configured; a configured strategy's `Decision` always wins (see
    /// the "strategy bonus-iteration precedence" design note).
    pub retries_enabled: bool,
    pub max_iterations: u32,
    pub max_wall_clock_ms: Option<u64>,
    pub gate_plan: GatePlan,
}

pub struct RunExecutor {
    callbacks: RunCallbacks,
    persistence: Arc<dyn PersistenceStore>,
    lease_provider: Arc<dyn LeaseProvider>,
    strategy: Option<Arc<dyn LoopStrategy>>,
    config: ExecutorConfig,
    telemetry_sink: EventSink,
}

impl RunExecutor {
    pub fn new(
        callbacks: RunCallbacks,
        persistence: Arc<dyn PersistenceStore>,
        lease_provider: Arc<dyn LeaseProvider>,
        strategy: Option<Arc<dyn LoopStrategy>>,
        config: ExecutorConfig,
        telemetry_sink: EventSink,
    ) -> Self {
        Self {
            callbacks,
            persistence,
            lease_provider,
            strategy,
            config,
            telemetry_sink,
        }
    }

    /// Drive one run end-to-end and return its terminal state. Never
    /// panics: every unmodeled failure is funneled through the Error
    /// Builder as `system_error` and the run ends `FailedError`.
    pub async fn execute(
        &self,
        work_order_id: WorkOrderId,
        task_prompt: String,
        workspace: Workspace,
        lease_id: crate::model::LeaseId,
        cancellation: CancellationToken,
    ) -> Run {
        let mut run = Run::new(work_order_id);
        run.workspace_id = Some(workspace.id.clone());

        if let Err(err) = self.persistence.save_run(&run).await {
            error!(run_id = %run.id, error = %err, "initial run persistence failed, aborting run");
            run.result = RunResult::FailedError;
            return run;
        }

        self.callbacks.on_run_started.call(work_order_id, run.id).await;

        run = match apply_transition(run, Event::WorkspaceAcquired) {
            Ok(r) => r,
            Err(err) => {
                error!(error = %err, "workspace-acquired transition rejected");
                return run;
            }
        };

        let before_state = match self.callbacks.on_capture_before_state.call(&workspace).await {
            Ok(state) => state,
            Err(err) => {
                return self
                    .fail_system_error(run, &format!("capture-before-state failed: {err}"))
                    .await;
            }
        };

        let mut loop_state = LoopState {
            iteration: 0,
            max_iterations: self.config.max_iterations,
            started_at: chrono::Utc::now(),
            progress: ProgressTrend::Unknown,
            history: Vec::new(),
        };

        if let Some(strategy) = &self.strategy {
            let ctx = self.strategy_context(work_order_id, run.id, &task_prompt, &loop_state, None, None);
            if let Err(err) = strategy.on_loop_start(&ctx).await {
                return self
                    .fail_system_error(run, &format!("loop strategy '{}' on_loop_start failed: {err}", strategy.name()))
                    .await;
            }
        }

        let lease_ticker = self.spawn_lease_renewal(lease_id);
        let run_start = Instant::now();
        let mut before_state = before_state;
        let current_gate_plan = self.config.gate_plan.clone();

        let mut last_decision = Decision::continue_with("starting");
        let mut last_feedback: Option<String> = None;
        let mut diagnostic_history: Vec<usize> = Vec::new();

        'iterations: loop {
            if run.state.is_terminal() {
                break;
            }

            if cancellation.is_cancelled() {
                run = crate::state::cancel_run(run);
                break;
            }

            if let Some(max_ms) = self.config.max_wall_clock_ms {
                if run_start.elapsed() >= Duration::from_millis(max_ms) {
                    let err = BuildError::new(
                        ErrorType::AgentTimeout,
                        format!("run exceeded max wall clock of {max_ms}ms"),
                    );
                    run = self.record_failure(run, err, Event::SystemError, RunResult::FailedError);
                    break;
                }
            }

            loop_state.iteration = run.iteration;
            let mut strategy_hook_failed = false;
            if let Some(strategy) = &self.strategy {
                let ctx = self.strategy_context(work_order_id, run.id, &task_prompt, &loop_state, None, None);
                if let Err(err) = strategy.on_iteration_start(&ctx).await {
                    let hook_err = hook_failure_error(strategy.name(), &err.to_string());
                    warn!(error = %hook_err.message, "on_iteration_start hook failed, falling back to default stop rule for this iteration");
                    strategy_hook_failed = true;
                }
            }

            // BUILD
            if run.state != crate::model::RunState::Building {
                run = match apply_transition(run, Event::BuildStarted) {
                    Ok(r) => r,
                    Err(err) => {
                        error!(error = %err, "build-started transition rejected");
                        break;
                    }
                };
            }
            run.iteration = run.iteration.max(1);
            if run.iterations.last().map(|d| d.iteration) != Some(run.iteration) {
                run.iterations.push(IterationData::new(run.iteration));
            }

            let throttle = Arc::new(EventThrottle::spawn(self.telemetry_sink.clone()));
            let on_event: EventSink = {
                let t = Arc::clone(&throttle);
                Arc::new(move |event: AgentEvent| t.emit(event))
            };
            let request = AgentRequest {
                workspace: workspace.clone(),
                task_prompt: task_prompt.clone(),
                feedback: last_feedback.clone(),
                iteration: run.iteration,
                session_id: run.session_id.clone(),
            };

            let build_outcome = self
                .callbacks
                .on_build
                .call(request, cancellation.clone(), on_event)
                .await;
            if let Ok(t) = Arc::try_unwrap(throttle) {
                t.shutdown().await;
            }

            let agent_result = match build_outcome {
                Ok(result) => result,
                Err(err) => {
                    let build_error = from_exception("BuildError", &err.to_string(), None);
                    run = self.record_failure(run, build_error, Event::BuildFailed, RunResult::FailedBuild);
                    break;
                }
            };

            if let Some(iter_data) = run.current_iteration_mut() {
                iter_data.agent_duration_ms = Some(agent_result.duration_ms);
                iter_data.agent_tokens = agent_result.tokens;
                iter_data.agent_cost_usd = agent_result.cost_usd;
                iter_data.agent_result_file = Some(format!("agents/{}.json", run.iteration));
            }
            if let Some(data) = run.iterations.last().cloned() {
                if let Err(err) = self.persistence.save_iteration(run.id, run.iteration, &data).await {
                    warn!(error = %err, "persisting agent result iteration artifact failed");
                }
            }

            if !agent_result.success {
                let build_error = from_agent_result(AgentResultView {
                    exit_code: agent_result.exit_code,
                    success: agent_result.success,
                    stdout: &agent_result.stdout,
                    stderr: &agent_result.stderr,
                });
                run = self.record_failure(run, build_error, Event::BuildFailed, RunResult::FailedBuild);
                break;
            }

            run.session_id = agent_result.session_id.clone();
            run = match apply_transition(run, Event::BuildCompleted) {
                Ok(r) => r,
                Err(err) => {
                    error!(error = %err, "build-completed transition rejected");
                    break;
                }
            };

            if let Some(push) = &self.callbacks.on_push_iteration {
                if let Err(err) = push.call(&workspace, run.id, run.iteration).await {
                    run.push_warning("push_iteration_failed", err.to_string());
                }
            }

            // SNAPSHOT
            let snapshot = match self
                .callbacks
                .on_snapshot
                .call(&workspace, &before_state, run.id, run.iteration, &task_prompt)
                .await
            {
                Ok(s) => s,
                Err(err) => {
                    let build_error = from_exception("SnapshotError", &err.to_string(), None);
                    run = self.record_failure(run, build_error, Event::SystemError, RunResult::FailedError);
                    break;
                }
            };
            run = match apply_transition(run, Event::SnapshotCompleted) {
                Ok(r) => r,
                Err(err) => {
                    error!(error = %err, "snapshot-completed transition rejected");
                    break;
                }
            };
            loop_state.history.push(snapshot.to_strategy_view());

            // VERIFY
            let verify_request = VerifyRequest {
                snapshot_path: snapshot.id.clone(),
                gate_plan: current_gate_plan.clone(),
                snapshot_id: snapshot.id.clone(),
                run_id: run.id,
                iteration: run.iteration,
                timeout_ms: self.config.max_wall_clock_ms.unwrap_or(u64::MAX),
                skip: false,
            };
            let report = match self.callbacks.on_verify.call(verify_request).await {
                Ok(r) => r,
                Err(err) => {
                    let build_error = from_exception("VerificationError", &err.to_string(), None);
                    run = self.record_failure(run, build_error, Event::SystemError, RunResult::FailedError);
                    break;
                }
            };
            if let Some(iter_data) = run.current_iteration_mut() {
                iter_data.verification_passed = Some(report.passed);
                iter_data.verification_file = Some(format!("verifications/{}.json", run.iteration));
            }

            let diagnostic_count: usize = report.levels.iter().map(|l| l.diagnostics.len()).sum();
            diagnostic_history.push(diagnostic_count);
            loop_state.progress = compute_progress_trend(&diagnostic_history);

            if report.passed {
                // `onCreatePullRequest` failures only warn (§7 propagation
                // policy); without a PR, there is nothing to poll CI on
                // regardless of whether `onPollCI` is configured.
                let mut created_pr = None;
                if let Some(create_pr) = &self.callbacks.on_create_pull_request {
                    match create_pr.call(&run).await {
                        Ok(pr) => {
                            run.pr_url = Some(pr.url.clone());
                            run.pr_number = Some(pr.number);
                            run.github_branch = Some(pr.branch.clone());
                            created_pr = Some(pr);
                        }
                        Err(err) => {
                            run.push_warning("create_pull_request_failed", err.to_string());
                        }
                    }
                }

                let Some((pr, poll_ci)) = created_pr.zip(self.callbacks.on_poll_ci.as_ref()) else {
                    run = match apply_transition(run, Event::VerifyPassed) {
                        Ok(r) => r,
                        Err(err) => {
                            error!(error = %err, "verify-passed transition rejected");
                            break;
                        }
                    };
                    run.result = RunResult::Passed;
                    break;
                };

                // Verifying -> PrCreated -> CiPolling, mirroring the state
                // table's dedicated edge for the PR+CI path (plain
                // VerifyPassed only applies when there's no CI to wait on).
                run = match apply_transition(run, Event::PrCreated) {
                    Ok(r) => r,
                    Err(err) => {
                        error!(error = %err, "pr-created transition rejected");
                        break;
                    }
                };
                run = match apply_transition(run, Event::CiPollingStarted) {
                    Ok(r) => r,
                    Err(err) => {
                        error!(error = %err, "ci-polling-started transition rejected");
                        break;
                    }
                };

                match poll_ci.call(&pr).await {
                    Ok(CiStatus::Passed) => {
                        run = match apply_transition(run, Event::CiPassed) {
                            Ok(r) => r,
                            Err(err) => {
                                error!(error = %err, "ci-passed transition rejected");
                                break;
                            }
                        };
                        run.result = RunResult::Passed;
                        break;
                    }
                    Ok(CiStatus::Failed) | Ok(CiStatus::Pending) => {
                        let retries_remain = run.iteration < self.config.max_iterations;
                        if retries_remain && self.config.retries_enabled {
                            run = match apply_transition(run, Event::VerifyFailedRetryable) {
                                Ok(r) => r,
                                Err(err) => {
                                    error!(error = %err, "ci-failed-retryable transition rejected");
                                    break;
                                }
                            };
                            run.iteration += 1;
                            continue 'iterations;
                        }
                        let build_error = BuildError::new(ErrorType::CiFailed, "CI failed with no remaining retries");
                        run = self.record_failure(run, build_error, Event::CiFailed, RunResult::FailedVerification);
                        break;
                    }
                    Err(err) => {
                        let build_error = from_exception("CITimeout", &err.to_string(), None);
                        run = self.record_failure(run, build_error, Event::CiTimeout, RunResult::FailedError);
                        break;
                    }
                }
            }

            // VERIFY failed: consult the loop strategy.
            let verification_view = VerificationView {
                passed: report.passed,
                summary: report.summary.clone(),
            };
            let ctx = self.strategy_context(
                work_order_id,
                run.id,
                &task_prompt,
                &loop_state,
                Some(snapshot.to_strategy_view()),
                Some(verification_view),
            );
            let mut decision = if strategy_hook_failed {
                fallback_decision(&ctx)
            } else {
                match &self.strategy {
                    Some(strategy) => strategy.should_continue(&ctx).await,
                    None => {
                        if self.config.retries_enabled && run.iteration < self.config.max_iterations {
                            Decision::continue_with("retries enabled, iterations remain")
                        } else {
                            Decision::stop("retries disabled or max iterations reached")
                        }
                    }
                }
            };
            last_decision = decision.clone();

            if let Some(strategy) = &self.strategy {
                let hook_ctx = self.strategy_context(work_order_id, run.id, &task_prompt, &loop_state, None, None);
                if let Err(err) = strategy.on_iteration_end(&hook_ctx, &decision).await {
                    let hook_err = hook_failure_error(strategy.name(), &err.to_string());
                    warn!(error = %hook_err.message, "on_iteration_end hook failed, falling back to default stop rule for this iteration");
                    decision = fallback_decision(&ctx);
                    last_decision = decision.clone();
                }
            }

            if !decision.should_continue {
                let mut build_error =
                    from_verification_report_or_default(&report.levels, &report.summary);
                build_error.verification_file = Some(format!("verifications/{}.json", run.iteration));
                run = self.record_failure(run, build_error, Event::VerifyFailedTerminal, RunResult::FailedVerification);
                break;
            }

            // Verifying -> Feedback before generating feedback text, so
            // `FeedbackGenerated` below lands on the edge the state table
            // actually defines.
            run = match apply_transition(run, Event::VerifyFailedRetryable) {
                Ok(r) => r,
                Err(err) => {
                    error!(error = %err, "verify-failed-retryable transition rejected");
                    break;
                }
            };

            // FEEDBACK
            let feedback = match self
                .callbacks
                .on_feedback
                .call(&snapshot, &report, &current_gate_plan)
                .await
            {
                Ok(text) => text,
                Err(err) => {
                    let build_error = from_exception("FeedbackError", &err.to_string(), None);
                    run = self.record_failure(run, build_error, Event::SystemError, RunResult::FailedError);
                    break;
                }
            };
            run.push_warning("feedback_generated", feedback.clone());
            last_feedback = Some(feedback);
            run = match apply_transition(run, Event::FeedbackGenerated) {
                Ok(r) => r,
                Err(err) => {
                    error!(error = %err, "feedback-generated transition rejected");
                    break;
                }
            };
            run.iteration += 1;
            before_state = BeforeState::new(snapshot.after_sha.clone(), before_state.branch.clone(), false);

            if let Some(iter_data) = run.current_iteration_mut() {
                iter_data.finish();
            }
        }

        if let Some(iter_data) = run.current_iteration_mut() {
            if iter_data.ended_at.is_none() {
                iter_data.finish();
            }
        }

        if let Some(strategy) = &self.strategy {
            let ctx = self.strategy_context(work_order_id, run.id, &task_prompt, &loop_state, None, None);
            if let Err(err) = strategy.on_loop_end(&ctx, &last_decision).await {
                warn!(error = %err, strategy = strategy.name(), "on_loop_end hook failed");
            }
        }

        lease_ticker.cancel();
        if let Err(err) = self.persistence.save_run(&run).await {
            warn!(run_id = %run.id, error = %err, "final run persistence failed");
        }

        run
    }

    fn strategy_context(
        &self,
        work_order_id: WorkOrderId,
        run_id: RunId,
        task_prompt: &str,
        loop_state: &LoopState,
        current_snapshot: Option<SnapshotView>,
        current_verification: Option<VerificationView>,
    ) -> StrategyContext {
        StrategyContext {
            work_order_id,
            run_id,
            task_prompt: task_prompt.to_string(),
            state: loop_state.clone(),
            current_snapshot,
            current_verification,
        }
    }

    fn record_failure(&self, run: Run, error: BuildError, event: Event, result: RunResult) -> Run {
        let mut run = run;
        if let Some(iter_data) = run.current_iteration_mut() {
            iter_data.error_type = Some(error.error_type);
            iter_data.error_details = Some(error.clone());
        }
        let mut run = match apply_transition(run, event) {
            Ok(r) => r,
            Err(err) => {
                error!(error = %err, "failure-path transition rejected, run left in prior state");
                return run;
            }
        };
        run.result = result;
        run
    }

    async fn fail_system_error(&self, run: Run, message: &str) -> Run {
        let error = BuildError::new(ErrorType::SystemError, message.to_string());
        self.record_failure(run, error, Event::SystemError, RunResult::FailedError)
    }

    fn spawn_lease_renewal(&self, lease_id: crate::model::LeaseId) -> CancellationToken {
        let cancel = CancellationToken::new();
        let lease_provider = Arc::clone(&self.lease_provider);
        let interval = self.config.lease_renew_interval;
        let child = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        if !lease_provider.renew(lease_id).await {
                            warn!(?lease_id, "lease renewal failed, lease may have expired");
                        }
                    }
                }
            }
        });
        cancel
    }
}

fn from_verification_report_or_default(
    levels: &[crate::error_builder::LevelResult],
    summary: &Option<String>,
) -> BuildError {
    crate::error_builder::from_verification_report(levels).unwrap_or_else(|| {
        BuildError::new(
            ErrorType::Unknown,
            summary.clone().unwrap_or_else(|| "verification failed with no detail".to_string()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{RunListFilter, StatusPatch};
    use crate::errors::OperationalError;
    use crate::model::{Lease, LeaseId};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NoopRunStarted;
    #[async_trait]
    impl OnRunStarted for NoopRunStarted {
        async fn call(&self, _work_order_id: WorkOrderId, _run_id: RunId) {}
    }

    struct FixedBeforeState;
    #[async_trait]
    impl OnCaptureBeforeState for FixedBeforeState {
        async fn call(&self, _workspace: &Workspace) -> anyhow::Result<BeforeState> {
            Ok(BeforeState::new("sha0", "main", false))
        }
    }

    struct ScriptedBuild {
        pass_on_iteration: u32,
        calls: AtomicU32,
        received_feedback: std::sync::Mutex<Vec<Option<String>>>,
    }
    impl ScriptedBuild {
        fn new(pass_on_iteration: u32) -> Self {
            Self {
                pass_on_iteration,
                calls: AtomicU32::new(0),
                received_feedback: std::sync::Mutex::new(Vec::new()),
            }
        }
    }
    #[async_trait]
    impl OnBuild for ScriptedBuild {
        async fn call(
            &self,
            request: AgentRequest,
            _cancellation: CancellationToken,
            on_event: EventSink,
        ) -> anyhow::Result<AgentResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.received_feedback.lock().expect("feedback log poisoned").push(request.feedback.clone());
            on_event(AgentEvent::ProgressUpdate { message: "building".into() });
            let success = request.iteration >= self.pass_on_iteration;
            Ok(AgentResult {
                exit_code: 0,
                success,
                stdout: String::new(),
                stderr: String::new(),
                session_id: Some("sess-1".to_string()),
                duration_ms: 10,
                tokens: Some(100),
                cost_usd: Some(0.01),
            })
        }
    }

    struct FixedSnapshot;
    #[async_trait]
    impl OnSnapshot for FixedSnapshot {
        async fn call(
            &self,
            _workspace: &Workspace,
            before: &BeforeState,
            _run_id: RunId,
            iteration: u32,
            _prompt: &str,
        ) -> anyhow::Result<Snapshot> {
            Ok(Snapshot {
                id: format!("snap-{iteration}"),
                before_sha: before.sha.clone(),
                after_sha: format!("sha{iteration}"),
                diff_text: format!("line-{iteration}"),
            })
        }
    }

    struct ScriptedVerify {
        pass_on_iteration: u32,
    }
    #[async_trait]
    impl OnVerify for ScriptedVerify {
        async fn call(&self, request: VerifyRequest) -> anyhow::Result<VerificationReport> {
            let passed = request.iteration >= self.pass_on_iteration;
            Ok(VerificationReport {
                passed,
                levels: vec![crate::error_builder::LevelResult {
                    level: crate::error_builder::VerificationLevel::L1,
                    passed,
                    check_name: None,
                    diagnostics: if passed { vec![] } else { vec!["assertion failed".into()] },
                }],
                summary: None,
            })
        }
    }

    struct FixedFeedback;
    #[async_trait]
    impl OnFeedback for FixedFeedback {
        async fn call(
            &self,
            _snapshot: &Snapshot,
            _report: &VerificationReport,
            _gate_plan: &GatePlan,
        ) -> anyhow::Result<String> {
            Ok("try again".to_string())
        }
    }

    /// Verification that fails with a shrinking diagnostic count on each
    /// iteration up to `pass_on_iteration`, for exercising the executor's
    /// progress-trend computation.
    struct DecreasingDiagnosticsVerify {
        pass_on_iteration: u32,
    }
    #[async_trait]
    impl OnVerify for DecreasingDiagnosticsVerify {
        async fn call(&self, request: VerifyRequest) -> anyhow::Result<VerificationReport> {
            let passed = request.iteration >= self.pass_on_iteration;
            let diagnostic_count = self.pass_on_iteration.saturating_sub(request.iteration) as usize;
            Ok(VerificationReport {
                passed,
                levels: vec![crate::error_builder::LevelResult {
                    level: crate::error_builder::VerificationLevel::L1,
                    passed,
                    check_name: None,
                    diagnostics: (0..diagnostic_count).map(|i| format!("issue-{i}")).collect(),
                }],
                summary: None,
            })
        }
    }

    /// A strategy whose `on_iteration_start` hook always fails, and whose
    /// `should_continue` always votes to continue — so a test can tell
    /// apart "the executor consulted the strategy" from "the executor fell
    /// back to the default stop rule because the hook failed".
    struct FailingHookStrategy;
    #[async_trait]
    impl LoopStrategy for FailingHookStrategy {
        fn name(&self) -> &str {
            "failing-hook"
        }
        async fn on_iteration_start(&self, _ctx: &StrategyContext) -> anyhow::Result<()> {
            anyhow::bail!("hook exploded")
        }
        async fn should_continue(&self, _ctx: &StrategyContext) -> Decision {
            Decision::continue_with("strategy always says continue")
        }
    }

    struct NoopPersistence;
    #[async_trait]
    impl PersistenceStore for NoopPersistence {
        async fn save_run(&self, _run: &Run) -> anyhow::Result<()> {
            Ok(())
        }
        async fn save_iteration(&self, _run_id: RunId, _iteration: u32, _data: &IterationData) -> anyhow::Result<()> {
            Ok(())
        }
        async fn load_run(&self, _id: RunId) -> anyhow::Result<Option<Run>> {
            Ok(None)
        }
        async fn list_runs(&self, _filter: RunListFilter) -> anyhow::Result<Vec<Run>> {
            Ok(Vec::new())
        }
        async fn update_status(
            &self,
            _id: WorkOrderId,
            _status: crate::model::WorkOrderStatus,
            _patch: StatusPatch,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct NoopLeaseProvider;
    #[async_trait]
    impl LeaseProvider for NoopLeaseProvider {
        async fn acquire(&self, workspace_id: WorkspaceId, holder_id: WorkOrderId, ttl_ms: u64) -> Result<Lease, OperationalError> {
            Ok(Lease {
                id: LeaseId::new(),
                workspace_id,
                holder_work_order_id: holder_id,
                expires_at: chrono::Utc::now() + chrono::Duration::milliseconds(ttl_ms as i64),
                ttl_ms,
            })
        }
        async fn renew(&self, _lease_id: LeaseId) -> bool {
            true
        }
        async fn release(&self, _workspace_id: &WorkspaceId) {}
    }

    fn callbacks(pass_on_iteration: u32) -> RunCallbacks {
        RunCallbacks {
            on_run_started: Arc::new(NoopRunStarted),
            on_capture_before_state: Arc::new(FixedBeforeState),
            on_build: Arc::new(ScriptedBuild::new(1)),
            on_push_iteration: None,
            on_snapshot: Arc::new(FixedSnapshot),
            on_verify: Arc::new(ScriptedVerify { pass_on_iteration }),
            on_feedback: Arc::new(FixedFeedback),
            on_create_pull_request: None,
            on_poll_ci: None,
        }
    }

    fn workspace() -> Workspace {
        Workspace {
            id: WorkspaceId::from("ws-1"),
            root_path: "/tmp/ws-1".to_string(),
        }
    }

    fn config(max_iterations: u32, retries_enabled: bool) -> ExecutorConfig {
        ExecutorConfig {
            lease_ttl_ms: 60_000,
            lease_renew_interval: Duration::from_secs(30),
            retries_enabled,
            max_iterations,
            max_wall_clock_ms: None,
            gate_plan: GatePlan {
                name: "default".to_string(),
                raw: serde_json::json!({}),
            },
        }
    }

    #[tokio::test]
    async fn succeeds_without_pr_hook_on_first_passing_verification() {
        let executor = RunExecutor::new(
            callbacks(1),
            Arc::new(NoopPersistence),
            Arc::new(NoopLeaseProvider),
            None,
            config(3, false),
            Arc::new(|_event| {}),
        );

        let run = executor
            .execute(
                WorkOrderId::new(),
                "do the thing".to_string(),
                workspace(),
                LeaseId::new(),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(run.result, RunResult::Passed);
        assert_eq!(run.iteration, 1);
    }

    #[tokio::test]
    async fn retries_enabled_allows_recovery_on_second_iteration() {
        let executor = RunExecutor::new(
            callbacks(2),
            Arc::new(NoopPersistence),
            Arc::new(NoopLeaseProvider),
            None,
            config(3, true),
            Arc::new(|_event| {}),
        );

        let run = executor
            .execute(
                WorkOrderId::new(),
                "do the thing".to_string(),
                workspace(),
                LeaseId::new(),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(run.result, RunResult::Passed);
        assert_eq!(run.iteration, 2);
    }

    #[tokio::test]
    async fn generated_feedback_is_carried_into_the_next_build_request() {
        let mut cb = callbacks(2);
        let build = Arc::new(ScriptedBuild::new(2));
        cb.on_build = build.clone();
        let executor = RunExecutor::new(
            cb,
            Arc::new(NoopPersistence),
            Arc::new(NoopLeaseProvider),
            None,
            config(3, true),
            Arc::new(|_event| {}),
        );

        let run = executor
            .execute(
                WorkOrderId::new(),
                "do the thing".to_string(),
                workspace(),
                LeaseId::new(),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(run.result, RunResult::Passed);
        let received = build.received_feedback.lock().expect("feedback log poisoned");
        assert_eq!(received.as_slice(), [None, Some("try again".to_string())]);
    }

    #[tokio::test]
    async fn hybrid_strategy_grants_bonus_iteration_on_improving_diagnostics() {
        let mut cb = callbacks(0);
        cb.on_verify = Arc::new(DecreasingDiagnosticsVerify { pass_on_iteration: 3 });
        let strategy: Arc<dyn LoopStrategy> =
            Arc::new(crate::strategy::hybrid::HybridStrategy::new(2, 1));
        let executor = RunExecutor::new(
            cb,
            Arc::new(NoopPersistence),
            Arc::new(NoopLeaseProvider),
            Some(strategy),
            config(5, false),
            Arc::new(|_event| {}),
        );

        let run = executor
            .execute(
                WorkOrderId::new(),
                "do the thing".to_string(),
                workspace(),
                LeaseId::new(),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(run.result, RunResult::Passed);
        assert_eq!(run.iteration, 3);
    }

    #[tokio::test]
    async fn strategy_hook_failure_falls_back_to_default_stop_rule() {
        let cb = callbacks(99);
        let strategy: Arc<dyn LoopStrategy> = Arc::new(FailingHookStrategy);
        let executor = RunExecutor::new(
            cb,
            Arc::new(NoopPersistence),
            Arc::new(NoopLeaseProvider),
            Some(strategy),
            config(2, true),
            Arc::new(|_event| {}),
        );

        let run = executor
            .execute(
                WorkOrderId::new(),
                "do the thing".to_string(),
                workspace(),
                LeaseId::new(),
                CancellationToken::new(),
            )
            .await;

        // The strategy itself always votes to continue; the executor must
        // fall back to the default stop rule instead of honoring that vote
        // once `on_iteration_start` starts failing.
        assert_eq!(run.result, RunResult::FailedVerification);
        assert_eq!(run.iteration, 2);
    }

    #[tokio::test]
    async fn retries_disabled_stops_after_first_failure() {
        let executor = RunExecutor::new(
            callbacks(2),
            Arc::new(NoopPersistence),
            Arc::new(NoopLeaseProvider),
            None,
            config(3, false),
            Arc::new(|_event| {}),
        );

        let run = executor
            .execute(
                WorkOrderId::new(),
                "do the thing".to_string(),
                workspace(),
                LeaseId::new(),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(run.result, RunResult::FailedVerification);
    }

    #[tokio::test]
    async fn build_failure_records_failed_build() {
        let mut cb = callbacks(1);
        cb.on_build = Arc::new(ScriptedBuild::new(99));
        let executor = RunExecutor::new(
            cb,
            Arc::new(NoopPersistence),
            Arc::new(NoopLeaseProvider),
            None,
            config(3, false),
            Arc::new(|_event| {}),
        );

        let run = executor
            .execute(
                WorkOrderId::new(),
                "do the thing".to_string(),
                workspace(),
                LeaseId::new(),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(run.result, RunResult::FailedBuild);
    }

    #[tokio::test]
    async fn pre_canceled_token_stops_the_run_before_any_iteration() {
        let mut cb = callbacks(1);
        let build = Arc::new(ScriptedBuild::new(1));
        cb.on_build = build.clone();
        let executor = RunExecutor::new(
            cb,
            Arc::new(NoopPersistence),
            Arc::new(NoopLeaseProvider),
            None,
            config(3, false),
            Arc::new(|_event| {}),
        );

        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let run = executor
            .execute(
                WorkOrderId::new(),
                "do the thing".to_string(),
                workspace(),
                LeaseId::new(),
                cancellation,
            )
            .await;

        assert_eq!(run.result, RunResult::Canceled);
        assert_eq!(build.calls.load(Ordering::SeqCst), 0, "build must not run once canceled");
    }
}
