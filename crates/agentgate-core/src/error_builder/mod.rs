//! Error Builder (§4.6).
//!
//! Classifies raw run failures into the closed [`ErrorType`] taxonomy.
//! `BuildError` stays a plain struct rather than a `thiserror` enum because
//! the spec treats the tag (`ErrorType`) and the human message as separate
//! fields, not as variant-per-message the way `thiserror` encourages. Each
//! entry point is a free function, unit-tested against literal fixtures for
//! every rule below — mirroring how the teacher tests `evaluate_verdict`
//! against constructed `GateVerdict` fixtures rather than live gate runs.

use crate::model::{BuildError, ErrorType};

const TAIL_BYTES: usize = 4096;

/// Minimal view of an agent driver's raw result, enough to classify a
/// build-phase failure (§4.6 "From a raw agent result").
#[derive(Debug, Clone)]
pub struct AgentResultView<'a> {
    pub exit_code: i32,
    pub success: bool,
    pub stdout: &'a str,
    pub stderr: &'a str,
}

/// Classify a failed agent run (§4.6):
/// - `exitCode != 0` -> `agent_crash`
/// - `exitCode == 0 && !success && stderr matches /timeout|terminated/i` -> `agent_timeout`
/// - `exitCode == 0 && !success` -> `agent_task_failure`
pub fn from_agent_result(view: AgentResultView<'_>) -> BuildError {
    let error_type = if view.exit_code != 0 {
        ErrorType::AgentCrash
    } else if matches_timeout_pattern(view.stderr) {
        ErrorType::AgentTimeout
    } else {
        ErrorType::AgentTaskFailure
    };

    let message = match error_type {
        ErrorType::AgentCrash => format!("agent process exited with code {}", view.exit_code),
        ErrorType::AgentTimeout => "agent run timed out or was terminated".to_string(),
        _ => "agent run did not complete the task".to_string(),
    };

    let mut err = BuildError::new(error_type, message);
    err.exit_code = Some(view.exit_code);
    err.stdout_tail = Some(tail(view.stdout));
    err.stderr_tail = Some(tail(view.stderr));
    err
}

/// `/timeout|terminated/i` from §4.6, without pulling in a regex dependency
/// for a single two-keyword case-insensitive match.
fn matches_timeout_pattern(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    lower.contains("timeout") || lower.contains("terminated")
}

/// One verification-level diagnostic, passed in from the `Verifier`
/// collaborator's report (§6). The core never parses the report itself —
/// it only classifies what is already structured.
#[derive(Debug, Clone)]
pub struct LevelResult {
    pub level: VerificationLevel,
    pub passed: bool,
    pub check_name: Option<String>,
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationLevel {
    L0,
    L1,
    L2,
    L3,
}

/// Classify a verification report (§4.6 "From a verification report"). The
/// earliest failing level (by enum order L0 < L1 < L2 < L3) determines the
/// kind; within L0, a check named `typecheck`/`tsc` yields `typecheck_failed`
/// and `lint`/`eslint` yields `lint_failed`. `context.failedLevels` carries
/// every failing level's name and the first 5 diagnostics from the
/// classifying level.
pub fn from_verification_report(levels: &[LevelResult]) -> Option<BuildError> {
    let failing: Vec<&LevelResult> = levels.iter().filter(|l| !l.passed).collect();
    let first = failing
        .iter()
        .min_by_key(|l| level_rank(l.level))
        .copied()?;

    let error_type = match first.level {
        VerificationLevel::L0 => match first.check_name.as_deref() {
            Some(name) if is_typecheck_name(name) => ErrorType::TypecheckFailed,
            Some(name) if is_lint_name(name) => ErrorType::LintFailed,
            _ => ErrorType::TypecheckFailed,
        },
        VerificationLevel::L1 => ErrorType::TestFailed,
        VerificationLevel::L2 => ErrorType::BlackboxFailed,
        VerificationLevel::L3 => ErrorType::CiFailed,
    };

    let message = format!(
        "verification failed at level {:?}{}",
        first.level,
        first
            .check_name
            .as_deref()
            .map(|n| format!(" ({n})"))
            .unwrap_or_default()
    );

    let mut err = BuildError::new(error_type, message);
    let failed_levels: Vec<String> = failing.iter().map(|l| format!("{:?}", l.level)).collect();
    err.context.insert(
        "failedLevels".to_string(),
        serde_json::json!(failed_levels),
    );
    let diagnostics: Vec<&String> = first.diagnostics.iter().take(5).collect();
    err.context
        .insert("diagnostics".to_string(), serde_json::json!(diagnostics));
    Some(err)
}

fn level_rank(level: VerificationLevel) -> u8 {
    match level {
        VerificationLevel::L0 => 0,
        VerificationLevel::L1 => 1,
        VerificationLevel::L2 => 2,
        VerificationLevel::L3 => 3,
    }
}

fn is_typecheck_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == "typecheck" || lower == "tsc"
}

fn is_lint_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == "lint" || lower == "eslint"
}

/// Classify an uncaught system exception by substring match on its message
/// (§4.6 "From a system exception").
pub fn from_exception(error_name: &str, message: &str, stack: Option<&str>) -> BuildError {
    let lower = message.to_ascii_lowercase();
    let error_type = if lower.contains("workspace") {
        ErrorType::WorkspaceError
    } else if lower.contains("snapshot") || lower.contains("git") {
        ErrorType::SnapshotError
    } else if lower.contains("github") || lower.contains("rate limit") {
        ErrorType::GithubError
    } else {
        ErrorType::SystemError
    };

    let mut err = BuildError::new(error_type, message.to_string());
    err.context
        .insert("errorName".to_string(), serde_json::json!(error_name));
    if let Some(stack) = stack {
        err.context.insert("stack".to_string(), serde_json::json!(stack));
    }
    err
}

fn tail(s: &str) -> String {
    if s.len() <= TAIL_BYTES {
        return s.to_string();
    }
    // Slice on a char boundary so we never split inside a multi-byte
    // character when trimming to the last TAIL_BYTES bytes.
    let start = s.len() - TAIL_BYTES;
    let boundary = (start..s.len()).find(|&i| s.is_char_boundary(i)).unwrap_or(start);
    s[boundary..].to_string()
}
