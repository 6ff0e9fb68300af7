//! Orchestrator (§4.10).
//!
//! The public entry point: owns the `PriorityQueue` + `AdmissionController`
//! pair (the admission controller is the crate's sole authoritative
//! starter), an `AgentDriverRegistry`, and `Arc<dyn ...>` handles to every
//! other external collaborator from §6. `execute_now` and the admission-
//! driven queue path both converge on a single private `run_one`, which
//! guarantees lease release and `activeRuns` cleanup on every exit path via
//! a drop guard -- the same shape as the teacher's `LifecycleDone` +
//! `handle_lifecycle_result` pairing in `orchestrator/mod.rs`, generalized
//! from a DAG-of-tasks scheduler to a single-run-per-work-order scheduler
//! (this spec has no task DAG; concurrency is across work orders, not
//! within one).

mod callbacks;
mod registry;

pub use registry::AgentDriverRegistry;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::admission::{AdmissionConfig, AdmissionController, Starter};
use crate::clock::HostProbe;
use crate::collaborators::{
    FeedbackGenerator, GatePlanResolver, GitHubAdapter, LeaseProvider, PersistenceStore,
    StatusPatch, Verifier, Workspace, WorkspaceManager,
};
use crate::errors::OperationalError;
use crate::executor::{ExecutorConfig, OnCreatePullRequest, OnPollCi, RunCallbacks, RunExecutor};
use crate::lease::LeaseManager;
use crate::model::{Run, RunResult, WorkOrder, WorkOrderId, WorkOrderStatus, WorkspaceId};
use crate::process::ProcessTracker;
use crate::queue::{EnqueueOptions, MarkStartedOptions, PriorityQueue, QueueStats};
use crate::stale::{StaleDetector, StaleDetectorConfig};
use crate::strategy::LoopStrategy;
use crate::streaming::EventSink;

/// Tunables that are not themselves part of any one work order.
#[derive(Clone)]
pub struct OrchestratorConfig {
    pub max_concurrent_runs: usize,
    pub max_queue_size: usize,
    pub admission: AdmissionConfig,
    pub lease_renew_interval: Duration,
    /// Baseline retry policy handed to the Run Executor when no
    /// `LoopStrategy` is configured for a run.
    pub retries_enabled: bool,
    /// Grace period before `kill(force: false)` escalates to a forced
    /// signal (§4.4).
    pub default_kill_grace: Duration,
    /// Stale Detector sweep cadence and outer wall-clock safety net (§4.3).
    pub stale: StaleDetectorConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 4,
            max_queue_size: 100,
            admission: AdmissionConfig::default(),
            lease_renew_interval: Duration::from_secs(60),
            retries_enabled: true,
            default_kill_grace: Duration::from_secs(5),
            stale: StaleDetectorConfig::default(),
        }
    }
}

/// Queue health snapshot (§6 "Queue health snapshot").
#[derive(Debug, Clone)]
pub struct QueueHealth {
    pub status: String,
    pub stats: QueueStats,
    pub utilization: f64,
    pub indicators: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

pub struct Orchestrator {
    queue: Arc<PriorityQueue>,
    admission: Arc<AdmissionController>,
    stale_detector: Arc<StaleDetector>,
    process_tracker: Arc<ProcessTracker>,
    lease_manager: Arc<LeaseManager>,
    persistence: Arc<dyn PersistenceStore>,
    workspace_manager: Arc<dyn WorkspaceManager>,
    gate_plan_resolver: Arc<dyn GatePlanResolver>,
    drivers: AgentDriverRegistry,
    verifier: Arc<dyn Verifier>,
    feedback_generator: Arc<dyn FeedbackGenerator>,
    github_adapter: Option<Arc<dyn GitHubAdapter>>,
    strategy: Option<Arc<dyn LoopStrategy>>,
    telemetry_sink: EventSink,
    config: OrchestratorConfig,

    /// Every run currently executing, queue-driven or bypass, keyed by
    /// work order id. Doubles as the `ConcurrencyExceeded` gate's
    /// cardinality check and as the cancellation routing table `cancel`/
    /// `kill` use for bypass runs the queue never saw.
    active_runs: Mutex<HashMap<WorkOrderId, CancellationToken>>,
    /// Arena of submitted work orders (§9 "Cyclic references in
    /// tree-structured work orders": keyed by id, child lists as id
    /// slices, never back-pointers).
    work_orders: Mutex<HashMap<WorkOrderId, WorkOrder>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        host_probe: Arc<dyn HostProbe>,
        persistence: Arc<dyn PersistenceStore>,
        workspace_manager: Arc<dyn WorkspaceManager>,
        gate_plan_resolver: Arc<dyn GatePlanResolver>,
        drivers: AgentDriverRegistry,
        verifier: Arc<dyn Verifier>,
        feedback_generator: Arc<dyn FeedbackGenerator>,
        github_adapter: Option<Arc<dyn GitHubAdapter>>,
        strategy: Option<Arc<dyn LoopStrategy>>,
        telemetry_sink: EventSink,
    ) -> Arc<Self> {
        let queue = Arc::new(PriorityQueue::new(config.max_queue_size, config.max_concurrent_runs));
        let process_tracker = Arc::new(ProcessTracker::new());

        Arc::new_cyclic(|weak: &Weak<Orchestrator>| {
            let starter_weak = weak.clone();
            let starter: Starter = Arc::new(move |id| {
                let weak = starter_weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(orchestrator) => orchestrator.start_admitted(id).await,
                        None => Ok(()),
                    }
                })
            });

            let admission = Arc::new(AdmissionController::new(
                Arc::clone(&queue),
                host_probe,
                starter,
                config.admission.clone(),
            ));

            let stale_weak = weak.clone();
            let on_stale_handled: crate::stale::StaleHandler = Arc::new(move |id, killed| {
                let weak = stale_weak.clone();
                tokio::spawn(async move {
                    if let Some(orchestrator) = weak.upgrade() {
                        orchestrator.handle_stale_detected(id, killed).await;
                    }
                });
            });
            let stale_detector = Arc::new(StaleDetector::new(
                Arc::clone(&queue),
                Arc::clone(&process_tracker),
                config.stale.clone(),
                on_stale_handled,
            ));

            Orchestrator {
                queue,
                admission,
                stale_detector,
                process_tracker,
                lease_manager: Arc::new(LeaseManager::new()),
                persistence,
                workspace_manager,
                gate_plan_resolver,
                drivers,
                verifier,
                feedback_generator,
                github_adapter,
                strategy,
                telemetry_sink,
                config,
                active_runs: Mutex::new(HashMap::new()),
                work_orders: Mutex::new(HashMap::new()),
            }
        })
    }

    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.queue
    }

    pub fn process_tracker(&self) -> &Arc<ProcessTracker> {
        &self.process_tracker
    }

    /// Spawn the admission controller's periodic tick loop. The returned
    /// handle should be aborted at shutdown.
    pub fn spawn_admission_loop(&self) -> tokio::task::JoinHandle<()> {
        Arc::clone(&self.admission).spawn_loop()
    }

    /// Spawn the Stale Detector's periodic sweep loop (§4.3). Independent of
    /// the admission loop -- it cross-references the queue's running set
    /// with the Process Tracker on its own timer. The returned handle
    /// should be aborted at shutdown.
    pub fn spawn_stale_detector_loop(&self) -> tokio::task::JoinHandle<()> {
        Arc::clone(&self.stale_detector).spawn_loop()
    }

    /// `staleHandled` (§4.3): persist `Failed` with a description and drop
    /// the work order from the active-runs cancellation table. The run's own
    /// `ActiveRunGuard` still owns lease release -- killing the process is
    /// expected to unstick whatever callback the run was blocked in, which
    /// then exits `run_one` and releases the lease on its own.
    async fn handle_stale_detected(&self, id: WorkOrderId, killed: bool) {
        self.set_status(id, WorkOrderStatus::Failed);
        let mut patch = StatusPatch::default();
        patch.fields.insert(
            "error".to_string(),
            serde_json::json!(format!(
                "Stale detection terminated this work order (process {})",
                if killed { "was killed" } else { "could not be confirmed killed" }
            )),
        );
        if let Err(err) = self.persistence.update_status(id, WorkOrderStatus::Failed, patch).await {
            warn!(work_order_id = %id, error = %err, "persisting stale-detected status failed");
        }
    }

    // -----------------------------------------------------------------
    // Control plane (§6)
    // -----------------------------------------------------------------

    /// Submit a work order onto the queue. Returns its id immediately;
    /// admission happens asynchronously on the next tick (triggered right
    /// away in the background so a free slot is used promptly, per §5
    /// "invoked immediately after any event that may open capacity").
    pub fn submit(&self, work_order: WorkOrder) -> Result<WorkOrderId, OperationalError> {
        let id = work_order.id;
        self.work_orders
            .lock()
            .expect("work order arena poisoned")
            .insert(id, work_order);

        if let Err(err) = self.queue.enqueue(id, EnqueueOptions::default()) {
            self.work_orders.lock().expect("work order arena poisoned").remove(&id);
            return Err(err);
        }

        let admission = Arc::clone(&self.admission);
        tokio::spawn(async move {
            admission.tick().await;
        });
        Ok(id)
    }

    pub fn get(&self, id: WorkOrderId) -> Option<WorkOrder> {
        self.work_orders.lock().expect("work order arena poisoned").get(&id).cloned()
    }

    pub fn list(&self, status: Option<WorkOrderStatus>) -> Vec<WorkOrder> {
        self.work_orders
            .lock()
            .expect("work order arena poisoned")
            .values()
            .filter(|wo| status.is_none_or(|s| wo.status == s))
            .cloned()
            .collect()
    }

    /// Transitions waiting -> Canceled, or fires a running run's
    /// cancellation handle. `WorkOrderNotFound` if `id` is neither waiting,
    /// running, nor tracked as an active bypass run.
    pub fn cancel(&self, id: WorkOrderId) -> Result<(), OperationalError> {
        if self.queue.cancel(id) {
            self.set_status(id, WorkOrderStatus::Canceled);
            return Ok(());
        }
        if self.queue.cancel_running(id) {
            return Ok(());
        }
        let token = self.active_runs.lock().expect("active runs poisoned").get(&id).cloned();
        match token {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(OperationalError::WorkOrderNotFound),
        }
    }

    /// Kill a work order (§6 `{force: bool}`): fires cancellation the same
    /// way `cancel` does, then escalates through the Process Tracker --
    /// `force: true` skips the grace period.
    pub async fn kill(&self, id: WorkOrderId, force: bool) -> Result<(), OperationalError> {
        let was_waiting_or_running = self.queue.force_cancel(id);
        let bypass_token = self.active_runs.lock().expect("active runs poisoned").get(&id).cloned();
        if let Some(token) = &bypass_token {
            token.cancel();
        }
        if !was_waiting_or_running && bypass_token.is_none() {
            return Err(OperationalError::WorkOrderNotFound);
        }

        let grace = if force { Duration::ZERO } else { self.config.default_kill_grace };
        let outcome = self.process_tracker.force_kill(id, grace).await;
        if !outcome.success {
            warn!(work_order_id = %id, "kill could not confirm process exit");
        }
        Ok(())
    }

    /// Bulk-delete terminal work orders matching `statuses` and older than
    /// `older_than`. Returns the matched ids whether or not `dry_run`.
    pub fn purge(&self, statuses: &[WorkOrderStatus], older_than: DateTime<Utc>, dry_run: bool) -> Vec<WorkOrderId> {
        let mut orders = self.work_orders.lock().expect("work order arena poisoned");
        let matches: Vec<WorkOrderId> = orders
            .values()
            .filter(|wo| wo.status.is_terminal() && statuses.contains(&wo.status) && wo.created_at < older_than)
            .map(|wo| wo.id)
            .collect();
        if !dry_run {
            for id in &matches {
                orders.remove(id);
            }
        }
        matches
    }

    pub fn queue_health(&self) -> QueueHealth {
        let stats = self.queue.stats();
        let utilization = if stats.max_concurrent == 0 {
            0.0
        } else {
            stats.running as f64 / stats.max_concurrent as f64
        };
        let mut indicators = Vec::new();
        if stats.waiting >= stats.max_queue_size {
            indicators.push("queue_full".to_string());
        }
        if utilization >= 1.0 {
            indicators.push("at_capacity".to_string());
        }
        let status = if indicators.is_empty() { "healthy" } else { "degraded" }.to_string();
        QueueHealth {
            status,
            stats,
            utilization,
            indicators,
            timestamp: Utc::now(),
        }
    }

    /// Direct execute, bypassing the queue (the "exec now" CLI path).
    /// Rejects with `ConcurrencyExceeded` iff `|activeRuns| >=
    /// maxConcurrentRuns`; both this and the queue-driven path converge on
    /// `run_one`.
    pub async fn execute_now(self: &Arc<Self>, work_order: WorkOrder) -> Result<Run, OperationalError> {
        {
            let active = self.active_runs.lock().expect("active runs poisoned");
            if active.len() >= self.config.max_concurrent_runs {
                return Err(OperationalError::ConcurrencyExceeded);
            }
        }

        let id = work_order.id;
        self.work_orders.lock().expect("work order arena poisoned").insert(id, work_order.clone());
        self.set_status(id, WorkOrderStatus::Running);

        let cancellation = CancellationToken::new();
        self.active_runs.lock().expect("active runs poisoned").insert(id, cancellation.clone());

        Ok(self.run_one(work_order, cancellation).await)
    }

    /// The admission controller's `Starter` callback. Marks the work order
    /// started in the queue, registers its cancellation handle, and spawns
    /// `run_one` without waiting for it -- admission ticks must stay
    /// short-running (§5).
    async fn start_admitted(self: &Arc<Self>, id: WorkOrderId) -> anyhow::Result<()> {
        let work_order = {
            let orders = self.work_orders.lock().expect("work order arena poisoned");
            match orders.get(&id) {
                Some(wo) => wo.clone(),
                None => {
                    warn!(work_order_id = %id, "admission started an id with no known work order, skipping");
                    return Ok(());
                }
            }
        };

        self.set_status(id, WorkOrderStatus::Running);
        let max_wall_clock_ms = work_order.max_wall_clock_seconds.map(|s| s * 1000);
        let record = self.queue.mark_started(id, MarkStartedOptions { max_wall_clock_ms });
        self.active_runs
            .lock()
            .expect("active runs poisoned")
            .insert(id, record.cancellation.clone());

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run_one(work_order, record.cancellation).await;
        });
        Ok(())
    }

    fn set_status(&self, id: WorkOrderId, status: WorkOrderStatus) {
        if let Some(wo) = self.work_orders.lock().expect("work order arena poisoned").get_mut(&id) {
            wo.status = status;
        }
    }

    /// Drive one work order end to end: materialize its workspace, acquire
    /// a lease, wire the Run Executor's collaborators, run it, and release
    /// everything regardless of outcome.
    async fn run_one(self: &Arc<Self>, work_order: WorkOrder, cancellation: CancellationToken) -> Run {
        let workspace_id_holder: Arc<Mutex<Option<WorkspaceId>>> = Arc::new(Mutex::new(None));
        let _guard = ActiveRunGuard {
            orchestrator: Arc::clone(self),
            id: work_order.id,
            workspace_id: Arc::clone(&workspace_id_holder),
        };

        let workspace = match self.workspace_manager.create(&work_order.workspace_source).await {
            Ok(w) => w,
            Err(err) => {
                error!(work_order_id = %work_order.id, error = %err, "workspace materialization failed");
                return self.finish_without_workspace(&work_order).await;
            }
        };
        *workspace_id_holder.lock().expect("workspace id holder poisoned") = Some(workspace.id.clone());

        let run = self.run_one_with_workspace(&work_order, &workspace, cancellation).await;

        if let Err(err) = self.workspace_manager.release(&workspace.id).await {
            warn!(workspace_id = %workspace.id, error = %err, "workspace release failed");
        }
        self.finalize(&work_order, &run).await;
        run
    }

    async fn finish_without_workspace(&self, work_order: &WorkOrder) -> Run {
        let mut run = Run::new(work_order.id);
        run.result = RunResult::FailedError;
        self.finalize(work_order, &run).await;
        run
    }

    async fn finalize(&self, work_order: &WorkOrder, run: &Run) {
        let status = map_run_result_to_status(run.result);
        self.set_status(work_order.id, status);
        if let Err(err) = self
            .persistence
            .update_status(work_order.id, status, StatusPatch::default())
            .await
        {
            warn!(work_order_id = %work_order.id, error = %err, "persisting final status failed");
        }
    }

    async fn run_one_with_workspace(
        self: &Arc<Self>,
        work_order: &WorkOrder,
        workspace: &Workspace,
        cancellation: CancellationToken,
    ) -> Run {
        let gate_plan = match self
            .gate_plan_resolver
            .resolve_gate_plan(&workspace.root_path, &work_order.workspace_source)
            .await
        {
            Ok(plan) => plan,
            Err(err) => {
                error!(work_order_id = %work_order.id, error = %err, "gate plan resolution failed");
                let mut run = Run::new(work_order.id);
                run.workspace_id = Some(workspace.id.clone());
                run.result = RunResult::FailedError;
                return run;
            }
        };

        let ttl_ms = ((work_order.max_wall_clock_seconds.unwrap_or(3600)) * 1000).min(24 * 3600 * 1000);
        let lease = match self.lease_manager.acquire(
            workspace.id.clone(),
            work_order.id,
            Duration::from_millis(ttl_ms),
        ) {
            Ok(lease) => lease,
            Err(err) => {
                error!(work_order_id = %work_order.id, error = %err, "lease acquisition failed");
                let mut run = Run::new(work_order.id);
                run.workspace_id = Some(workspace.id.clone());
                run.result = RunResult::FailedError;
                return run;
            }
        };

        let driver = match self.drivers.get(&work_order.agent_type) {
            Some(driver) => driver,
            None => {
                error!(work_order_id = %work_order.id, agent_type = %work_order.agent_type, "no agent driver registered for this agent type");
                let mut run = Run::new(work_order.id);
                run.workspace_id = Some(workspace.id.clone());
                run.result = RunResult::FailedError;
                return run;
            }
        };

        let run_callbacks = RunCallbacks {
            on_run_started: Arc::new(callbacks::RunStartedLogger),
            on_capture_before_state: Arc::new(callbacks::GitBeforeState),
            on_build: Arc::new(callbacks::DriverBuild { driver }),
            on_push_iteration: None,
            on_snapshot: Arc::new(callbacks::GitSnapshot),
            on_verify: Arc::new(callbacks::DelegateVerify { verifier: Arc::clone(&self.verifier) }),
            on_feedback: Arc::new(callbacks::DelegateFeedback::new(Arc::clone(&self.feedback_generator))),
            on_create_pull_request: self.github_adapter.clone().map(|github| {
                Arc::new(callbacks::GitHubCreatePullRequest { github }) as Arc<dyn OnCreatePullRequest>
            }),
            on_poll_ci: self.github_adapter.clone().map(|github| {
                Arc::new(callbacks::GitHubPollCi { github }) as Arc<dyn OnPollCi>
            }),
        };

        let executor_config = ExecutorConfig {
            lease_ttl_ms: ttl_ms,
            lease_renew_interval: self.config.lease_renew_interval,
            retries_enabled: self.config.retries_enabled,
            max_iterations: work_order.max_iterations.max(1),
            max_wall_clock_ms: work_order.max_wall_clock_seconds.map(|s| s * 1000),
            gate_plan,
        };

        let executor = RunExecutor::new(
            run_callbacks,
            Arc::clone(&self.persistence),
            Arc::clone(&self.lease_manager) as Arc<dyn LeaseProvider>,
            self.strategy.clone(),
            executor_config,
            Arc::clone(&self.telemetry_sink),
        );

        executor
            .execute(
                work_order.id,
                work_order.task_prompt.clone(),
                workspace.clone(),
                lease.id,
                cancellation,
            )
            .await
    }
}

fn map_run_result_to_status(result: RunResult) -> WorkOrderStatus {
    match result {
        RunResult::Passed => WorkOrderStatus::Succeeded,
        RunResult::Canceled => WorkOrderStatus::Canceled,
        RunResult::FailedBuild | RunResult::FailedVerification | RunResult::FailedError | RunResult::None => {
            WorkOrderStatus::Failed
        }
    }
}

/// Guarantees `activeRuns`/queue/lease cleanup on every exit path out of
/// `run_one`, the same "cleanup runs no matter how the function returns"
/// guarantee the teacher gets from `handle_lifecycle_result` always being
/// reached in its select loop -- expressed here as genuine RAII since nothing
/// here is itself a background loop that could be skipped.
struct ActiveRunGuard {
    orchestrator: Arc<Orchestrator>,
    id: WorkOrderId,
    workspace_id: Arc<Mutex<Option<WorkspaceId>>>,
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.orchestrator.active_runs.lock().expect("active runs poisoned").remove(&self.id);
        self.orchestrator.queue.mark_completed(self.id);
        if let Some(workspace_id) = self.workspace_id.lock().expect("workspace id holder poisoned").clone() {
            self.orchestrator.lease_manager.release(&workspace_id);
        }
    }
}
