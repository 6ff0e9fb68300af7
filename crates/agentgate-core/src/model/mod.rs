//! Core data model: work orders, queue entries, runs and their telemetry.
//!
//! These types are plain data — no subsystem here owns I/O. Subsystems
//! (`queue`, `executor`, `state`, ...) operate on them.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(u: Uuid) -> Self {
                Self(u)
            }
        }
    };
}

uuid_id!(WorkOrderId);
uuid_id!(RunId);
uuid_id!(LeaseId);

/// Identifier for a materialized workspace. Workspace managers are external
/// collaborators (§6) and may hand back path-derived or forge-derived ids,
/// so this is a plain string rather than a UUID newtype.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(pub String);

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for WorkspaceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WorkspaceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// WorkOrder
// ---------------------------------------------------------------------------

/// Where a work order's workspace originates from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum WorkspaceSource {
    LocalPath { path: String },
    Git { url: String, git_ref: String },
    ForgeRepo { repo: String, git_ref: String },
    FreshTemplate,
}

/// Lifecycle status of a work order.
///
/// Monotone except that `Failed`/`Canceled` and `Succeeded` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrderStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl WorkOrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for WorkOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkOrderStatus {
    type Err = WorkOrderStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(WorkOrderStatusParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkOrderStatusParseError(pub String);

impl fmt::Display for WorkOrderStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid work order status: {:?}", self.0)
    }
}

impl std::error::Error for WorkOrderStatusParseError {}

/// Immutable user intent plus mutable status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrder {
    pub id: WorkOrderId,
    pub task_prompt: String,
    pub workspace_source: WorkspaceSource,
    pub agent_type: String,
    pub gate_plan_source: Option<String>,
    pub max_iterations: u32,
    pub max_wall_clock_seconds: Option<u64>,

    // Tree shape, for spawned children.
    pub parent_id: Option<WorkOrderId>,
    pub root_id: Option<WorkOrderId>,
    pub depth: u32,
    pub sibling_index: u32,
    pub child_ids: Vec<WorkOrderId>,

    pub status: WorkOrderStatus,
    pub created_at: DateTime<Utc>,
}

impl WorkOrder {
    /// Construct a new root work order (no parent).
    pub fn new_root(task_prompt: impl Into<String>, workspace_source: WorkspaceSource) -> Self {
        let id = WorkOrderId::new();
        Self {
            id,
            task_prompt: task_prompt.into(),
            workspace_source,
            agent_type: "default".to_string(),
            gate_plan_source: None,
            max_iterations: 1,
            max_wall_clock_seconds: None,
            parent_id: None,
            root_id: None,
            depth: 0,
            sibling_index: 0,
            child_ids: Vec::new(),
            status: WorkOrderStatus::Queued,
            created_at: Utc::now(),
        }
    }

    /// Construct a child work order under `parent`. Depth is always
    /// `parent.depth + 1`, so the arena of work orders can never contain a
    /// cycle: a child is only built once its parent already exists.
    pub fn new_child(
        parent: &WorkOrder,
        sibling_index: u32,
        task_prompt: impl Into<String>,
        workspace_source: WorkspaceSource,
    ) -> Self {
        let id = WorkOrderId::new();
        Self {
            id,
            task_prompt: task_prompt.into(),
            workspace_source,
            agent_type: parent.agent_type.clone(),
            gate_plan_source: parent.gate_plan_source.clone(),
            max_iterations: parent.max_iterations,
            max_wall_clock_seconds: parent.max_wall_clock_seconds,
            parent_id: Some(parent.id),
            root_id: Some(parent.root_id.unwrap_or(parent.id)),
            depth: parent.depth + 1,
            sibling_index,
            child_ids: Vec::new(),
            status: WorkOrderStatus::Queued,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue entry / running record / position
// ---------------------------------------------------------------------------

/// A callback invoked whenever a waiting entry's queue position changes.
pub type PositionObserver = Box<dyn Fn(QueuePosition) + Send + Sync>;

/// A work order admitted to the waiting set.
pub struct QueueEntry {
    pub work_order_id: WorkOrderId,
    pub priority: i64,
    pub enqueued_at: DateTime<Utc>,
    pub max_wait_ms: Option<u64>,
    pub on_position_change: Option<PositionObserver>,
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("work_order_id", &self.work_order_id)
            .field("priority", &self.priority)
            .field("enqueued_at", &self.enqueued_at)
            .field("max_wait_ms", &self.max_wait_ms)
            .field("on_position_change", &self.on_position_change.is_some())
            .finish()
    }
}

/// A work order currently under execution.
#[derive(Debug, Clone)]
pub struct RunningRecord {
    pub work_order_id: WorkOrderId,
    pub started_at: DateTime<Utc>,
    pub max_wall_clock_ms: Option<u64>,
    pub cancellation: CancellationToken,
}

/// Where an id sits in the queue right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePosition {
    pub position: u64,
    pub state: QueueEntryState,
    pub ahead: u64,
    pub eta_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEntryState {
    Waiting,
    Running,
}

// ---------------------------------------------------------------------------
// Run state machine types
// ---------------------------------------------------------------------------

/// States of the run state machine (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Leased,
    Building,
    Snapshotting,
    Verifying,
    Feedback,
    Succeeded,
    FailedBuild,
    FailedVerification,
    FailedError,
    Canceled,
    PrCreated,
    CiPolling,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::FailedBuild
                | Self::FailedVerification
                | Self::FailedError
                | Self::Canceled
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Leased => "leased",
            Self::Building => "building",
            Self::Snapshotting => "snapshotting",
            Self::Verifying => "verifying",
            Self::Feedback => "feedback",
            Self::Succeeded => "succeeded",
            Self::FailedBuild => "failed_build",
            Self::FailedVerification => "failed_verification",
            Self::FailedError => "failed_error",
            Self::Canceled => "canceled",
            Self::PrCreated => "pr_created",
            Self::CiPolling => "ci_polling",
        };
        f.write_str(s)
    }
}

/// Final disposition of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    None,
    Passed,
    FailedBuild,
    FailedVerification,
    FailedError,
    Canceled,
}

/// Closed taxonomy of failure kinds (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    AgentCrash,
    AgentTimeout,
    AgentTaskFailure,
    TypecheckFailed,
    LintFailed,
    TestFailed,
    BlackboxFailed,
    CiFailed,
    WorkspaceError,
    SnapshotError,
    GithubError,
    SystemError,
    Unknown,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AgentCrash => "agent_crash",
            Self::AgentTimeout => "agent_timeout",
            Self::AgentTaskFailure => "agent_task_failure",
            Self::TypecheckFailed => "typecheck_failed",
            Self::LintFailed => "lint_failed",
            Self::TestFailed => "test_failed",
            Self::BlackboxFailed => "blackbox_failed",
            Self::CiFailed => "ci_failed",
            Self::WorkspaceError => "workspace_error",
            Self::SnapshotError => "snapshot_error",
            Self::GithubError => "github_error",
            Self::SystemError => "system_error",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Structured classification of a run failure (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildError {
    pub error_type: ErrorType,
    pub message: String,
    pub failed_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub stdout_tail: Option<String>,
    pub stderr_tail: Option<String>,
    pub agent_result_file: Option<String>,
    pub verification_file: Option<String>,
    pub context: HashMap<String, serde_json::Value>,
}

impl BuildError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            failed_at: Utc::now(),
            exit_code: None,
            stdout_tail: None,
            stderr_tail: None,
            agent_result_file: None,
            verification_file: None,
            context: HashMap::new(),
        }
    }
}

/// A warning recorded against a run without failing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunWarning {
    pub warning_type: String,
    pub message: String,
    pub iteration: u32,
    pub at: DateTime<Utc>,
}

/// Per-iteration record (§3 IterationData).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationData {
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub verification_passed: Option<bool>,
    pub agent_duration_ms: Option<u64>,
    pub agent_tokens: Option<u64>,
    pub agent_cost_usd: Option<f64>,
    pub error_type: Option<ErrorType>,
    pub error_details: Option<BuildError>,
    pub agent_result_file: Option<String>,
    pub verification_file: Option<String>,
    pub snapshot_id: Option<String>,
    pub feedback_generated: bool,
}

impl IterationData {
    pub fn new(iteration: u32) -> Self {
        Self {
            iteration,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            verification_passed: None,
            agent_duration_ms: None,
            agent_tokens: None,
            agent_cost_usd: None,
            error_type: None,
            error_details: None,
            agent_result_file: None,
            verification_file: None,
            snapshot_id: None,
            feedback_generated: false,
        }
    }

    pub fn finish(&mut self) {
        let ended = Utc::now();
        self.duration_ms = Some((ended - self.started_at).num_milliseconds().max(0) as u64);
        self.ended_at = Some(ended);
    }
}

/// One execution attempt of a work order (§3 Run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub work_order_id: WorkOrderId,
    pub workspace_id: Option<WorkspaceId>,
    pub session_id: Option<String>,
    pub iteration: u32,
    pub state: RunState,
    pub result: RunResult,
    pub github_branch: Option<String>,
    pub pr_url: Option<String>,
    pub pr_number: Option<u64>,
    pub iterations: Vec<IterationData>,
    pub warnings: Vec<RunWarning>,
    pub created_at: DateTime<Utc>,
}

impl Run {
    pub fn new(work_order_id: WorkOrderId) -> Self {
        Self {
            id: RunId::new(),
            work_order_id,
            workspace_id: None,
            session_id: None,
            iteration: 0,
            state: RunState::Created,
            result: RunResult::None,
            github_branch: None,
            pr_url: None,
            pr_number: None,
            iterations: Vec::new(),
            warnings: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn current_iteration_mut(&mut self) -> Option<&mut IterationData> {
        self.iterations.last_mut()
    }

    pub fn push_warning(&mut self, warning_type: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(RunWarning {
            warning_type: warning_type.into(),
            message: message.into(),
            iteration: self.iteration,
            at: Utc::now(),
        });
    }
}

// ---------------------------------------------------------------------------
// Lease / process tracking
// ---------------------------------------------------------------------------

/// A scoped exclusive hold on a workspace (§3 Lease).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub workspace_id: WorkspaceId,
    pub holder_work_order_id: WorkOrderId,
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    pub ttl_ms: u64,
}

/// Bookkeeping for an agent's OS process (§3 TrackedProcess).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedProcess {
    pub pid: i32,
    pub started_at: DateTime<Utc>,
    pub has_exited: bool,
    pub exit_code: Option<i32>,
    pub kill_signal_sent: bool,
}

impl TrackedProcess {
    pub fn new(pid: i32) -> Self {
        Self {
            pid,
            started_at: Utc::now(),
            has_exited: false,
            exit_code: None,
            kill_signal_sent: false,
        }
    }
}
