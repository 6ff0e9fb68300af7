//! External collaborator interfaces (§6).
//!
//! Everything in this module is a small, object-safe `#[async_trait]`
//! trait this crate consumes but does not implement against a real system
//! -- REST/workspace/git plumbing, gate-plan parsing, verification runners,
//! agent drivers, and GitHub integration all live outside this crate's
//! scope. `agentgate-test-support` carries fakes for integration tests; a
//! real deployment wires concrete adapters in from elsewhere.
//!
//! Two exceptions are core-owned despite appearing in the §6 table:
//! [`crate::clock::HostProbe`] (re-exported here) and [`LeaseProvider`],
//! whose only real implementation is [`crate::lease::LeaseManager`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::OperationalError;
use crate::model::{Lease, LeaseId, WorkOrderId, WorkOrderStatus, WorkspaceId, WorkspaceSource};

pub use crate::clock::HostProbe;

// ---------------------------------------------------------------------------
// Persistence store
// ---------------------------------------------------------------------------

/// A filter for `listRuns`-equivalent queries. Every field is an optional
/// narrowing predicate; `None` means "don't filter on this".
#[derive(Debug, Clone, Default)]
pub struct RunListFilter {
    pub work_order_id: Option<WorkOrderId>,
    pub status: Option<WorkOrderStatus>,
}

/// A partial update applied to a stored work order's status (§6
/// `updateStatus(id, status, patch)`). `patch` is a free-form bag since the
/// concrete patch shape is owned by whatever persistence layer implements
/// this trait, not by this crate.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub fields: HashMap<String, serde_json::Value>,
}

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn save_run(&self, run: &crate::model::Run) -> anyhow::Result<()>;
    async fn save_iteration(
        &self,
        run_id: crate::model::RunId,
        iteration: u32,
        data: &crate::model::IterationData,
    ) -> anyhow::Result<()>;
    async fn load_run(&self, id: crate::model::RunId) -> anyhow::Result<Option<crate::model::Run>>;
    async fn list_runs(&self, filter: RunListFilter) -> anyhow::Result<Vec<crate::model::Run>>;
    async fn update_status(
        &self,
        id: WorkOrderId,
        status: WorkOrderStatus,
        patch: StatusPatch,
    ) -> anyhow::Result<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn PersistenceStore) {}
};

// ---------------------------------------------------------------------------
// Workspace manager
// ---------------------------------------------------------------------------

/// A materialized working directory handed back by the workspace manager.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub root_path: String,
}

/// Inputs to `createFresh` (§6): a destination plus optional seed content.
#[derive(Debug, Clone, Default)]
pub struct FreshWorkspaceSpec {
    pub dest: String,
    pub seed_files: HashMap<String, String>,
    pub message: Option<String>,
}

#[async_trait]
pub trait WorkspaceManager: Send + Sync {
    async fn create(&self, source: &WorkspaceSource) -> anyhow::Result<Workspace>;
    async fn create_from_git(&self, url: &str, git_ref: &str) -> anyhow::Result<Workspace>;
    async fn create_from_github(&self, git_ref: &str) -> anyhow::Result<Workspace>;
    async fn create_fresh(&self, spec: FreshWorkspaceSpec) -> anyhow::Result<Workspace>;
    async fn release(&self, id: &WorkspaceId) -> anyhow::Result<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn WorkspaceManager) {}
};

// ---------------------------------------------------------------------------
// Lease provider
// ---------------------------------------------------------------------------

/// The subset of [`crate::lease::LeaseManager`] the Run Executor depends on
/// through a trait object, so it can be swapped for a fake in tests without
/// pulling in the full concrete type.
#[async_trait]
pub trait LeaseProvider: Send + Sync {
    async fn acquire(
        &self,
        workspace_id: WorkspaceId,
        holder_id: WorkOrderId,
        ttl_ms: u64,
    ) -> Result<Lease, OperationalError>;
    async fn renew(&self, lease_id: LeaseId) -> bool;
    async fn release(&self, workspace_id: &WorkspaceId);
}

const _: () = {
    fn _assert_object_safe(_: &dyn LeaseProvider) {}
};

#[async_trait]
impl LeaseProvider for crate::lease::LeaseManager {
    async fn acquire(
        &self,
        workspace_id: WorkspaceId,
        holder_id: WorkOrderId,
        ttl_ms: u64,
    ) -> Result<Lease, OperationalError> {
        crate::lease::LeaseManager::acquire(
            self,
            workspace_id,
            holder_id,
            std::time::Duration::from_millis(ttl_ms),
        )
    }

    async fn renew(&self, lease_id: LeaseId) -> bool {
        crate::lease::LeaseManager::renew(self, lease_id)
    }

    async fn release(&self, workspace_id: &WorkspaceId) {
        crate::lease::LeaseManager::release(self, workspace_id)
    }
}

// ---------------------------------------------------------------------------
// Gate plan resolver
// ---------------------------------------------------------------------------

/// Opaque resolved gate plan. The core treats the plan as a value it passes
/// through to the verifier unexamined, plus a name it can log.
#[derive(Debug, Clone)]
pub struct GatePlan {
    pub name: String,
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait GatePlanResolver: Send + Sync {
    async fn resolve_gate_plan(
        &self,
        root_path: &str,
        source: &WorkspaceSource,
    ) -> anyhow::Result<GatePlan>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn GatePlanResolver) {}
};

// ---------------------------------------------------------------------------
// Agent driver
// ---------------------------------------------------------------------------

/// What the Run Executor hands an agent driver for one iteration.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub workspace: Workspace,
    pub task_prompt: String,
    pub feedback: Option<String>,
    pub iteration: u32,
    pub session_id: Option<String>,
}

/// An agent driver's raw report of one run (§6 "Agent driver").
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub exit_code: i32,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub session_id: Option<String>,
    pub duration_ms: u64,
    pub tokens: Option<u64>,
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentCapabilities {
    pub supports_resume: bool,
    pub supports_streaming: bool,
}

#[async_trait]
pub trait AgentDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Drivers must observe `cancellation` and exit promptly once it's
    /// fired; the streaming callback receives `agent_*`-family events as
    /// they occur (see `crate::streaming::EventThrottle`).
    async fn execute(
        &self,
        request: AgentRequest,
        cancellation: tokio_util::sync::CancellationToken,
        on_event: crate::streaming::EventSink,
    ) -> anyhow::Result<AgentResult>;

    async fn is_available(&self) -> bool;
    fn get_capabilities(&self) -> AgentCapabilities;
}

const _: () = {
    fn _assert_object_safe(_: &dyn AgentDriver) {}
};

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub snapshot_path: String,
    pub gate_plan: GatePlan,
    pub snapshot_id: String,
    pub run_id: crate::model::RunId,
    pub iteration: u32,
    pub timeout_ms: u64,
    pub skip: bool,
}

/// Full verification report (§6): the per-level results the Error Builder
/// classifies via [`crate::error_builder::from_verification_report`].
#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub passed: bool,
    pub levels: Vec<crate::error_builder::LevelResult>,
    pub summary: Option<String>,
}

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, request: VerifyRequest) -> anyhow::Result<VerificationReport>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Verifier) {}
};

// ---------------------------------------------------------------------------
// Feedback generator
// ---------------------------------------------------------------------------

#[async_trait]
pub trait FeedbackGenerator: Send + Sync {
    async fn generate(&self, report: &VerificationReport, iteration: u32) -> anyhow::Result<String>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn FeedbackGenerator) {}
};

// ---------------------------------------------------------------------------
// GitHub adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PullRequestHandle {
    pub number: u64,
    pub url: String,
    pub branch: String,
    pub draft: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiStatus {
    Pending,
    Passed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CiFailure {
    pub check_name: String,
    pub summary: String,
}

#[async_trait]
pub trait GitHubAdapter: Send + Sync {
    async fn create_pull_request(
        &self,
        branch: &str,
        title: &str,
        body: &str,
    ) -> anyhow::Result<PullRequestHandle>;
    async fn convert_draft_to_ready(&self, pr: &PullRequestHandle) -> anyhow::Result<()>;
    async fn poll_ci_status(&self, pr: &PullRequestHandle) -> anyhow::Result<CiStatus>;
    async fn parse_ci_failures(&self, pr: &PullRequestHandle) -> anyhow::Result<Vec<CiFailure>>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn GitHubAdapter) {}
};

/// Snapshot of a workspace's state before an iteration's changes, handed
/// back by `onCaptureBeforeState` (§4.9 step 2).
#[derive(Debug, Clone)]
pub struct BeforeState {
    pub sha: String,
    pub branch: String,
    pub dirty: bool,
    pub captured_at: DateTime<Utc>,
}

impl BeforeState {
    pub fn new(sha: impl Into<String>, branch: impl Into<String>, dirty: bool) -> Self {
        Self {
            sha: sha.into(),
            branch: branch.into(),
            dirty,
            captured_at: Utc::now(),
        }
    }
}

/// A recorded snapshot of an iteration's diff (§6 "Workspace manager" /
/// onSnapshot output), enough for the strategy layer and for persisting
/// `afterSha` roll-forward between iterations.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: String,
    pub before_sha: String,
    pub after_sha: String,
    pub diff_text: String,
}

impl Snapshot {
    pub fn to_strategy_view(&self) -> crate::strategy::SnapshotView {
        crate::strategy::SnapshotView {
            snapshot_id: self.id.clone(),
            diff_text: self.diff_text.clone(),
        }
    }
}
