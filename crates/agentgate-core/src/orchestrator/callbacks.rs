//! Per-run `RunCallbacks` wiring and the git-shelling helpers that back the
//! before-state/snapshot steps.
//!
//! No collaborator trait in §6 exposes git sha/branch/diff capture -- the
//! `Workspace manager` hands back only `{id, rootPath}`. Before-state and
//! snapshot capture are therefore core-owned logic here, shelling out to
//! `git` the way the teacher's `isolation::worktree` module does
//! (`Command::new("git").args(..).current_dir(..)`), but via
//! `tokio::process::Command` since the orchestrator is async-native end to
//! end, matching the async-`Command` style `harness::claude_code` already
//! uses for its own subprocess.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::collaborators::{
    AgentDriver, AgentRequest, AgentResult, BeforeState, CiStatus, FeedbackGenerator, GatePlan,
    GitHubAdapter, PullRequestHandle, Snapshot, VerificationReport, Verifier, VerifyRequest,
    Workspace,
};
use crate::executor::{
    OnBuild, OnCaptureBeforeState, OnCreatePullRequest, OnFeedback, OnPollCi, OnRunStarted,
    OnSnapshot, OnVerify,
};
use crate::model::{Run, RunId, WorkOrderId};
use crate::streaming::EventSink;

// ---------------------------------------------------------------------------
// Git-shelling helpers
// ---------------------------------------------------------------------------

async fn git_output(root: &str, args: &[&str]) -> anyhow::Result<String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .await?;
    if !output.status.success() {
        anyhow::bail!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Capture `{sha, branch, dirty}` for a workspace before an iteration's
/// changes (§4.9 step 2 / §6 `BeforeState`).
pub async fn capture_before_state(root_path: &str) -> anyhow::Result<BeforeState> {
    let sha = git_output(root_path, &["rev-parse", "HEAD"]).await?;
    let branch = git_output(root_path, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    let status = git_output(root_path, &["status", "--porcelain"]).await?;
    Ok(BeforeState::new(sha, branch, !status.is_empty()))
}

/// Commit the workspace's current state and diff it against `before` (§6
/// `Snapshot`). The commit is allowed to be empty so `afterSha` always
/// advances even when an iteration produced no file changes.
pub async fn capture_snapshot(
    root_path: &str,
    before: &BeforeState,
    iteration: u32,
) -> anyhow::Result<Snapshot> {
    git_output(root_path, &["add", "-A"]).await?;
    let _ = git_output(
        root_path,
        &[
            "commit",
            "--allow-empty",
            "-m",
            &format!("agentgate iteration {iteration}"),
        ],
    )
    .await;
    let after_sha = git_output(root_path, &["rev-parse", "HEAD"]).await?;
    let diff_text = git_output(root_path, &["diff", &before.sha, &after_sha])
        .await
        .unwrap_or_default();
    Ok(Snapshot {
        id: format!("{after_sha}-{iteration}"),
        before_sha: before.sha.clone(),
        after_sha,
        diff_text,
    })
}

// ---------------------------------------------------------------------------
// RunCallbacks wrappers
// ---------------------------------------------------------------------------

pub struct RunStartedLogger;

#[async_trait]
impl OnRunStarted for RunStartedLogger {
    async fn call(&self, work_order_id: WorkOrderId, run_id: RunId) {
        info!(%work_order_id, %run_id, "run started");
    }
}

pub struct GitBeforeState;

#[async_trait]
impl OnCaptureBeforeState for GitBeforeState {
    async fn call(&self, workspace: &Workspace) -> anyhow::Result<BeforeState> {
        capture_before_state(&workspace.root_path).await
    }
}

pub struct DriverBuild {
    pub driver: Arc<dyn AgentDriver>,
}

#[async_trait]
impl OnBuild for DriverBuild {
    async fn call(
        &self,
        request: AgentRequest,
        cancellation: CancellationToken,
        on_event: EventSink,
    ) -> anyhow::Result<AgentResult> {
        self.driver.execute(request, cancellation, on_event).await
    }
}

pub struct GitSnapshot;

#[async_trait]
impl OnSnapshot for GitSnapshot {
    async fn call(
        &self,
        workspace: &Workspace,
        before: &BeforeState,
        _run_id: RunId,
        iteration: u32,
        _prompt: &str,
    ) -> anyhow::Result<Snapshot> {
        capture_snapshot(&workspace.root_path, before, iteration).await
    }
}

pub struct DelegateVerify {
    pub verifier: Arc<dyn Verifier>,
}

#[async_trait]
impl OnVerify for DelegateVerify {
    async fn call(&self, request: VerifyRequest) -> anyhow::Result<VerificationReport> {
        self.verifier.verify(request).await
    }
}

/// `OnFeedback::call` carries no `iteration` parameter, but
/// `FeedbackGenerator::generate` needs one (§6). The executor invokes this
/// hook exactly once per iteration in increasing order, so a simple
/// per-run counter reconstructs it without threading a new parameter
/// through the executor's trait.
pub struct DelegateFeedback {
    generator: Arc<dyn FeedbackGenerator>,
    next_iteration: AtomicU32,
}

impl DelegateFeedback {
    pub fn new(generator: Arc<dyn FeedbackGenerator>) -> Self {
        Self {
            generator,
            next_iteration: AtomicU32::new(1),
        }
    }
}

#[async_trait]
impl OnFeedback for DelegateFeedback {
    async fn call(
        &self,
        _snapshot: &Snapshot,
        report: &VerificationReport,
        _gate_plan: &GatePlan,
    ) -> anyhow::Result<String> {
        let iteration = self.next_iteration.fetch_add(1, Ordering::SeqCst);
        self.generator.generate(report, iteration).await
    }
}

pub struct GitHubCreatePullRequest {
    pub github: Arc<dyn GitHubAdapter>,
}

#[async_trait]
impl OnCreatePullRequest for GitHubCreatePullRequest {
    async fn call(&self, run: &Run) -> anyhow::Result<PullRequestHandle> {
        let branch = run
            .github_branch
            .clone()
            .unwrap_or_else(|| format!("agentgate/{}", run.id));
        let title = format!("AgentGate: work order {}", run.work_order_id);
        self.github
            .create_pull_request(&branch, &title, "Automated changes produced by AgentGate.")
            .await
    }
}

pub struct GitHubPollCi {
    pub github: Arc<dyn GitHubAdapter>,
}

#[async_trait]
impl OnPollCi for GitHubPollCi {
    async fn call(&self, pr: &PullRequestHandle) -> anyhow::Result<CiStatus> {
        self.github.poll_ci_status(pr).await
    }
}
