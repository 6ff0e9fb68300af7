//! File persistence for the Priority Queue (§4.1, §6 "Persisted queue file
//! layout").
//!
//! Writes go to a temp path in the same directory followed by a rename, the
//! same atomic-replace idiom the pack's file-backed stores use in place of
//! a database transaction.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::model::WorkOrderId;

const CURRENT_VERSION: &str = "1.0";

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    #[serde(rename = "workOrderId")]
    work_order_id: WorkOrderId,
    priority: i64,
    #[serde(rename = "enqueuedAt")]
    enqueued_at: DateTime<Utc>,
    #[serde(rename = "maxWaitMs")]
    max_wait_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    version: String,
    queue: Vec<PersistedEntry>,
    running: Vec<WorkOrderId>,
    #[serde(rename = "waitTimes")]
    wait_times: Vec<u64>,
    #[serde(rename = "savedAt")]
    saved_at: DateTime<Utc>,
}

/// What [`restore`] hands back to the caller. The running set is never
/// rehydrated (§4.1) — the orchestrator owner must resubmit runs that were
/// active at shutdown.
pub struct RestoredQueue {
    pub waiting: Vec<RestoredEntry>,
    pub wait_times: Vec<u64>,
}

pub struct RestoredEntry {
    pub work_order_id: WorkOrderId,
    pub priority: i64,
    pub enqueued_at: DateTime<Utc>,
    pub max_wait_ms: Option<u64>,
}

/// Serialize the given snapshot atomically to `path`. Persistence errors
/// are logged and swallowed — per §4.1, "failure semantics: persistence
/// errors are logged, never propagated."
pub fn persist(
    path: &Path,
    waiting: &[(WorkOrderId, i64, DateTime<Utc>, Option<u64>)],
    running: &[WorkOrderId],
    wait_times: &[u64],
) {
    let state = PersistedState {
        version: CURRENT_VERSION.to_string(),
        queue: waiting
            .iter()
            .map(|(id, priority, enqueued_at, max_wait_ms)| PersistedEntry {
                work_order_id: *id,
                priority: *priority,
                enqueued_at: *enqueued_at,
                max_wait_ms: *max_wait_ms,
            })
            .collect(),
        running: running.to_vec(),
        wait_times: wait_times.to_vec(),
        saved_at: Utc::now(),
    };

    if let Err(e) = write_atomic(path, &state) {
        error!(error = %e, path = %path.display(), "failed to persist queue state");
    }
}

fn write_atomic(path: &Path, state: &PersistedState) -> anyhow::Result<()> {
    let contents = serde_json::to_vec_pretty(state)?;
    let tmp_path = tmp_path_for(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&tmp_path, &contents)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Restore waiting entries and wait-time history from `path`. Unknown
/// version or unreadable/corrupt file: skip restore and return empty
/// state. Restamps waiting entries with their recorded `enqueuedAt` and
/// never rehydrates position-change observers (they cannot survive a
/// restart) or the running set.
pub fn restore(path: &Path) -> RestoredQueue {
    let empty = RestoredQueue {
        waiting: Vec::new(),
        wait_times: Vec::new(),
    };

    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return empty,
    };
    let state: PersistedState = match serde_json::from_str(&contents) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to parse persisted queue state, starting empty");
            return empty;
        }
    };
    if state.version != CURRENT_VERSION {
        error!(version = %state.version, "unknown persisted queue version, starting empty");
        return empty;
    }

    RestoredQueue {
        waiting: state
            .queue
            .into_iter()
            .map(|e| RestoredEntry {
                work_order_id: e.work_order_id,
                priority: e.priority,
                enqueued_at: e.enqueued_at,
                max_wait_ms: e.max_wait_ms,
            })
            .collect(),
        wait_times: state.wait_times,
    }
}
