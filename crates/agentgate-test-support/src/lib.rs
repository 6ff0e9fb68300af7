//! Fakes for the external collaborator traits in `agentgate_core::collaborators`.
//!
//! Generalizes the fakes that started out inline in `agentgate-core`'s own
//! test modules (`orchestrator`, `executor`, `registry`) into a shared
//! crate any integration test can depend on, without the shared-container
//! plumbing a database-backed test suite would need, since nothing here
//! talks to a real database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use agentgate_core::clock::HostProbe;
use agentgate_core::collaborators::{
    AgentCapabilities, AgentDriver, AgentRequest, AgentResult, CiFailure, CiStatus,
    FeedbackGenerator, FreshWorkspaceSpec, GatePlan, GatePlanResolver, GitHubAdapter,
    PersistenceStore, PullRequestHandle, RunListFilter, StatusPatch, VerificationReport,
    VerifyRequest, Verifier, Workspace, WorkspaceManager,
};
use agentgate_core::model::{IterationData, Run, RunId, WorkOrderId, WorkOrderStatus, WorkspaceId, WorkspaceSource};
use agentgate_core::streaming::EventSink;

// ---------------------------------------------------------------------------
// Workspace manager
// ---------------------------------------------------------------------------

/// Materializes a real temp-dir git repo per `create` call, so callbacks
/// that shell out to `git` (before-state capture, snapshotting) work
/// unmodified against it. The directory is leaked for the fake's lifetime;
/// `release` is a no-op since cleanup of test tempdirs is the OS's problem.
pub struct FakeWorkspaceManager;

#[async_trait]
impl WorkspaceManager for FakeWorkspaceManager {
    async fn create(&self, _source: &WorkspaceSource) -> anyhow::Result<Workspace> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().to_str().expect("tempdir path is valid utf8").to_string();
        std::mem::forget(dir);

        let run = |args: &[&str]| std::process::Command::new("git").args(args).current_dir(&path).output();
        run(&["init", "-q"])?;
        run(&["config", "user.email", "test@example.com"])?;
        run(&["config", "user.name", "test"])?;
        std::fs::write(std::path::Path::new(&path).join("seed.txt"), "seed")?;
        run(&["add", "-A"])?;
        run(&["commit", "-q", "-m", "seed"])?;

        Ok(Workspace { id: WorkspaceId::from(path.clone()), root_path: path })
    }

    async fn create_from_git(&self, url: &str, git_ref: &str) -> anyhow::Result<Workspace> {
        anyhow::bail!("FakeWorkspaceManager::create_from_git not supported (url={url}, git_ref={git_ref})")
    }

    async fn create_from_github(&self, git_ref: &str) -> anyhow::Result<Workspace> {
        anyhow::bail!("FakeWorkspaceManager::create_from_github not supported (git_ref={git_ref})")
    }

    async fn create_fresh(&self, _spec: FreshWorkspaceSpec) -> anyhow::Result<Workspace> {
        self.create(&WorkspaceSource::FreshTemplate).await
    }

    async fn release(&self, _id: &WorkspaceId) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Gate plan resolver
// ---------------------------------------------------------------------------

/// Always resolves to an empty plan named `"default"`.
pub struct FakeGatePlanResolver;

#[async_trait]
impl GatePlanResolver for FakeGatePlanResolver {
    async fn resolve_gate_plan(&self, _root_path: &str, _source: &WorkspaceSource) -> anyhow::Result<GatePlan> {
        Ok(GatePlan { name: "default".to_string(), raw: serde_json::json!({}) })
    }
}

// ---------------------------------------------------------------------------
// Agent driver
// ---------------------------------------------------------------------------

/// Scripted agent driver: succeeds once `request.iteration >=
/// pass_on_iteration`, otherwise reports a non-zero exit. Counts calls so
/// tests can assert how many iterations actually ran.
pub struct FakeAgentDriver {
    pub driver_name: String,
    pub pass_on_iteration: u32,
    pub calls: AtomicU32,
}

impl FakeAgentDriver {
    pub fn new(driver_name: impl Into<String>, pass_on_iteration: u32) -> Self {
        Self {
            driver_name: driver_name.into(),
            pass_on_iteration,
            calls: AtomicU32::new(0),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentDriver for FakeAgentDriver {
    fn name(&self) -> &str {
        &self.driver_name
    }

    async fn execute(
        &self,
        request: AgentRequest,
        _cancellation: CancellationToken,
        on_event: EventSink,
    ) -> anyhow::Result<AgentResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        on_event(agentgate_core::streaming::AgentEvent::ProgressUpdate {
            message: format!("iteration {}", request.iteration),
        });

        let success = request.iteration >= self.pass_on_iteration;
        Ok(AgentResult {
            exit_code: if success { 0 } else { 1 },
            success,
            stdout: String::new(),
            stderr: if success { String::new() } else { "agent reported failure".to_string() },
            session_id: request.session_id.or_else(|| Some("fake-session".to_string())),
            duration_ms: 5,
            tokens: Some(100),
            cost_usd: Some(0.01),
        })
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn get_capabilities(&self) -> AgentCapabilities {
        AgentCapabilities::default()
    }
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

/// Scripted verifier: passes once `request.iteration >= pass_on_iteration`.
pub struct FakeVerifier {
    pub pass_on_iteration: u32,
}

impl FakeVerifier {
    pub fn new(pass_on_iteration: u32) -> Self {
        Self { pass_on_iteration }
    }

    pub fn always_pass() -> Self {
        Self { pass_on_iteration: 0 }
    }
}

#[async_trait]
impl Verifier for FakeVerifier {
    async fn verify(&self, request: VerifyRequest) -> anyhow::Result<VerificationReport> {
        let passed = request.iteration >= self.pass_on_iteration;
        Ok(VerificationReport {
            passed,
            levels: vec![agentgate_core::error_builder::LevelResult {
                level: agentgate_core::error_builder::VerificationLevel::L1,
                passed,
                check_name: None,
                diagnostics: if passed { Vec::new() } else { vec!["assertion failed".to_string()] },
            }],
            summary: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Feedback generator
// ---------------------------------------------------------------------------

/// Returns a fixed feedback string on every call, counting invocations.
pub struct FakeFeedbackGenerator {
    pub message: String,
    pub calls: AtomicU32,
}

impl FakeFeedbackGenerator {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), calls: AtomicU32::new(0) }
    }
}

impl Default for FakeFeedbackGenerator {
    fn default() -> Self {
        Self::new("try again")
    }
}

#[async_trait]
impl FeedbackGenerator for FakeFeedbackGenerator {
    async fn generate(&self, _report: &VerificationReport, _iteration: u32) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.message.clone())
    }
}

// ---------------------------------------------------------------------------
// GitHub adapter
// ---------------------------------------------------------------------------

/// In-memory GitHub adapter: hands back an incrementing PR number and a
/// scripted CI status, never touching the network.
pub struct FakeGitHubAdapter {
    next_pr_number: AtomicU64,
    pub ci_status: CiStatus,
}

impl FakeGitHubAdapter {
    pub fn new(ci_status: CiStatus) -> Self {
        Self { next_pr_number: AtomicU64::new(1), ci_status }
    }
}

impl Default for FakeGitHubAdapter {
    fn default() -> Self {
        Self::new(CiStatus::Passed)
    }
}

#[async_trait]
impl GitHubAdapter for FakeGitHubAdapter {
    async fn create_pull_request(&self, branch: &str, _title: &str, _body: &str) -> anyhow::Result<PullRequestHandle> {
        let number = self.next_pr_number.fetch_add(1, Ordering::SeqCst);
        Ok(PullRequestHandle {
            number,
            url: format!("https://github.com/example/repo/pull/{number}"),
            branch: branch.to_string(),
            draft: false,
        })
    }

    async fn convert_draft_to_ready(&self, _pr: &PullRequestHandle) -> anyhow::Result<()> {
        Ok(())
    }

    async fn poll_ci_status(&self, _pr: &PullRequestHandle) -> anyhow::Result<CiStatus> {
        Ok(self.ci_status)
    }

    async fn parse_ci_failures(&self, _pr: &PullRequestHandle) -> anyhow::Result<Vec<CiFailure>> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Persistence store
// ---------------------------------------------------------------------------

/// Thread-safe in-memory `PersistenceStore`, keyed by run id with a
/// secondary index from work order to its latest status. Good enough for
/// integration tests and the CLI's non-durable demo mode alike.
#[derive(Default)]
pub struct InMemoryPersistenceStore {
    runs: Mutex<HashMap<RunId, Run>>,
    statuses: Mutex<HashMap<WorkOrderId, WorkOrderStatus>>,
}

impl InMemoryPersistenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_of(&self, id: WorkOrderId) -> Option<WorkOrderStatus> {
        self.statuses.lock().expect("status map poisoned").get(&id).copied()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryPersistenceStore {
    async fn save_run(&self, run: &Run) -> anyhow::Result<()> {
        self.runs.lock().expect("run map poisoned").insert(run.id, run.clone());
        Ok(())
    }

    async fn save_iteration(&self, run_id: RunId, _iteration: u32, _data: &IterationData) -> anyhow::Result<()> {
        // Iteration history already lives on `Run::iterations`; `save_run`
        // carries it. A durable store would append to a separate table.
        let _ = run_id;
        Ok(())
    }

    async fn load_run(&self, id: RunId) -> anyhow::Result<Option<Run>> {
        Ok(self.runs.lock().expect("run map poisoned").get(&id).cloned())
    }

    async fn list_runs(&self, filter: RunListFilter) -> anyhow::Result<Vec<Run>> {
        let runs = self.runs.lock().expect("run map poisoned");
        Ok(runs
            .values()
            .filter(|r| filter.work_order_id.is_none_or(|id| id == r.work_order_id))
            .cloned()
            .collect())
    }

    async fn update_status(&self, id: WorkOrderId, status: WorkOrderStatus, _patch: StatusPatch) -> anyhow::Result<()> {
        self.statuses.lock().expect("status map poisoned").insert(id, status);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Host probe
// ---------------------------------------------------------------------------

/// Reports a fixed free-memory figure, for exercising the admission
/// controller's memory gate without depending on the host's real `/proc`.
pub struct FixedHostProbe(pub u64);

#[async_trait]
impl HostProbe for FixedHostProbe {
    async fn free_memory_mb(&self) -> u64 {
        self.0
    }

    fn monotonic_now(&self) -> std::time::Instant {
        std::time::Instant::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_agent_driver_counts_calls_and_scripts_pass_fail() {
        let driver = FakeAgentDriver::new("fake", 2);
        let workspace = Workspace { id: WorkspaceId::from("ws"), root_path: "/tmp".to_string() };

        let first = driver
            .execute(
                AgentRequest {
                    workspace: workspace.clone(),
                    task_prompt: "do it".to_string(),
                    feedback: None,
                    iteration: 1,
                    session_id: None,
                },
                CancellationToken::new(),
                std::sync::Arc::new(|_event| {}),
            )
            .await
            .expect("execute");
        assert!(!first.success);

        let second = driver
            .execute(
                AgentRequest { workspace, task_prompt: "do it".to_string(), feedback: None, iteration: 2, session_id: None },
                CancellationToken::new(),
                std::sync::Arc::new(|_event| {}),
            )
            .await
            .expect("execute");
        assert!(second.success);
        assert_eq!(driver.call_count(), 2);
    }

    #[tokio::test]
    async fn in_memory_persistence_round_trips_a_run() {
        let store = InMemoryPersistenceStore::new();
        let run = Run::new(WorkOrderId::new());
        let run_id = run.id;

        store.save_run(&run).await.expect("save_run");
        let loaded = store.load_run(run_id).await.expect("load_run");
        assert_eq!(loaded.map(|r| r.id), Some(run_id));
    }

    #[tokio::test]
    async fn fake_github_adapter_assigns_increasing_pr_numbers() {
        let adapter = FakeGitHubAdapter::default();
        let first = adapter.create_pull_request("b1", "t", "body").await.expect("pr1");
        let second = adapter.create_pull_request("b2", "t", "body").await.expect("pr2");
        assert_eq!(first.number, 1);
        assert_eq!(second.number, 2);
    }
}
