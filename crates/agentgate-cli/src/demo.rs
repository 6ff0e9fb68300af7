//! In-process collaborator stand-ins this binary wires the orchestrator
//! against, since REST/workspace/gate-plan/verification adapters are out
//! of this workspace's scope (§1). `DemoWorkspaceManager` is the one
//! exception that shells out for real (git), the same way
//! `agentgate-test-support`'s fake does; the rest are deliberately
//! trivial so the CLI's control-plane surface (submit/status/cancel/kill/
//! purge/queue-health) stays the point, not a fake agent harness.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use agentgate_core::collaborators::{
    AgentCapabilities, AgentDriver, AgentRequest, AgentResult, FreshWorkspaceSpec, GatePlan,
    GatePlanResolver, VerificationReport, VerifyRequest, Verifier, Workspace, WorkspaceManager,
};
use agentgate_core::error_builder::{LevelResult, VerificationLevel};
use agentgate_core::model::{WorkspaceId, WorkspaceSource};
use agentgate_core::streaming::EventSink;

/// Materializes a real temp-dir git repository so `GitBeforeState`/
/// `GitSnapshot` (which shell out to `git`) have something to operate on.
pub struct DemoWorkspaceManager;

#[async_trait]
impl WorkspaceManager for DemoWorkspaceManager {
    async fn create(&self, source: &WorkspaceSource) -> anyhow::Result<Workspace> {
        if let WorkspaceSource::LocalPath { path } = source {
            if std::path::Path::new(path).join(".git").is_dir() {
                return Ok(Workspace { id: WorkspaceId::from(path.clone()), root_path: path.clone() });
            }
        }

        let dir = tempfile::tempdir()?;
        let path = dir.path().to_str().ok_or_else(|| anyhow::anyhow!("tempdir path is not valid utf8"))?.to_string();
        std::mem::forget(dir);

        let run = |args: &[&str]| std::process::Command::new("git").args(args).current_dir(&path).output();
        run(&["init", "-q"])?;
        run(&["config", "user.email", "agentgate@example.com"])?;
        run(&["config", "user.name", "agentgate"])?;
        std::fs::write(std::path::Path::new(&path).join(".agentgate-seed"), "seed")?;
        run(&["add", "-A"])?;
        run(&["commit", "-q", "-m", "agentgate: seed workspace"])?;

        Ok(Workspace { id: WorkspaceId::from(path.clone()), root_path: path })
    }

    async fn create_from_git(&self, url: &str, git_ref: &str) -> anyhow::Result<Workspace> {
        anyhow::bail!("remote git workspaces are not supported by the demo binary (url={url}, git_ref={git_ref})")
    }

    async fn create_from_github(&self, git_ref: &str) -> anyhow::Result<Workspace> {
        anyhow::bail!("GitHub-backed workspaces are not supported by the demo binary (git_ref={git_ref})")
    }

    async fn create_fresh(&self, _spec: FreshWorkspaceSpec) -> anyhow::Result<Workspace> {
        self.create(&WorkspaceSource::FreshTemplate).await
    }

    async fn release(&self, _id: &WorkspaceId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Always resolves to an unconfigured, empty gate plan: gate-plan parsing
/// is out of scope (§1 Non-goals).
pub struct DemoGatePlanResolver;

#[async_trait]
impl GatePlanResolver for DemoGatePlanResolver {
    async fn resolve_gate_plan(&self, _root_path: &str, _source: &WorkspaceSource) -> anyhow::Result<GatePlan> {
        Ok(GatePlan { name: "demo".to_string(), raw: serde_json::json!({}) })
    }
}

/// An agent "driver" that performs no real work: it writes a marker file
/// into the workspace and reports success. Stands in for a real
/// `claude-code`-style driver, which is an external collaborator this
/// crate never implements (§1).
pub struct DemoAgentDriver;

#[async_trait]
impl AgentDriver for DemoAgentDriver {
    fn name(&self) -> &str {
        "demo"
    }

    async fn execute(
        &self,
        request: AgentRequest,
        _cancellation: CancellationToken,
        on_event: EventSink,
    ) -> anyhow::Result<AgentResult> {
        on_event(agentgate_core::streaming::AgentEvent::ProgressUpdate {
            message: format!("demo agent iteration {}", request.iteration),
        });
        let marker = std::path::Path::new(&request.workspace.root_path).join(".agentgate-run");
        std::fs::write(&marker, format!("iteration {}\n{}", request.iteration, request.task_prompt))?;

        Ok(AgentResult {
            exit_code: 0,
            success: true,
            stdout: format!("demo agent completed iteration {}", request.iteration),
            stderr: String::new(),
            session_id: request.session_id,
            duration_ms: 1,
            tokens: None,
            cost_usd: None,
        })
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn get_capabilities(&self) -> AgentCapabilities {
        AgentCapabilities { supports_resume: false, supports_streaming: true }
    }
}

/// Verification is out of scope for this binary (no gate plan runner is
/// wired in); it always passes so the loop terminates on iteration one.
pub struct DemoVerifier;

#[async_trait]
impl Verifier for DemoVerifier {
    async fn verify(&self, _request: VerifyRequest) -> anyhow::Result<VerificationReport> {
        Ok(VerificationReport {
            passed: true,
            levels: vec![LevelResult {
                level: VerificationLevel::L0,
                passed: true,
                check_name: None,
                diagnostics: Vec::new(),
            }],
            summary: Some("demo verifier: no gate plan configured, auto-pass".to_string()),
        })
    }
}

pub struct DemoFeedbackGenerator;

#[async_trait]
impl agentgate_core::collaborators::FeedbackGenerator for DemoFeedbackGenerator {
    async fn generate(&self, _report: &VerificationReport, iteration: u32) -> anyhow::Result<String> {
        Ok(format!("iteration {iteration}: no additional feedback (demo verifier always passes)"))
    }
}
