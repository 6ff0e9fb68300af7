//! Process Tracker (§4.4).
//!
//! A process-wide map from work order id to the OS process running its
//! agent. Liveness is probed the `kill(pid, 0)` way on Unix; force-kill
//! escalates from a graceful signal to `SIGKILL` after a bounded deadline,
//! the same two-step shutdown the agent driver adapters use when tearing
//! down a spawned CLI process.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::warn;

use crate::model::{TrackedProcess, WorkOrderId};

/// Outcome of a [`ProcessTracker::force_kill`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForceKillOutcome {
    /// True if, after this call, no process attributable to the id is alive.
    pub success: bool,
    /// True if a forced (SIGKILL-equivalent) signal was actually sent.
    pub forced_kill: bool,
    pub duration_ms: u64,
}

/// Process-wide `workOrderId -> TrackedProcess` bookkeeping.
#[derive(Debug, Default)]
pub struct ProcessTracker {
    processes: Mutex<HashMap<WorkOrderId, TrackedProcess>>,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: WorkOrderId, pid: i32) {
        let mut guard = self.processes.lock().expect("process tracker poisoned");
        guard.insert(id, TrackedProcess::new(pid));
    }

    /// Idempotent: marks the tracked process exited with `code`.
    pub fn mark_exited(&self, id: WorkOrderId, code: Option<i32>) {
        let mut guard = self.processes.lock().expect("process tracker poisoned");
        if let Some(entry) = guard.get_mut(&id) {
            entry.has_exited = true;
            entry.exit_code = code;
        }
    }

    pub fn get(&self, id: WorkOrderId) -> Option<TrackedProcess> {
        let guard = self.processes.lock().expect("process tracker poisoned");
        guard.get(&id).cloned()
    }

    /// "not running" if there is no entry, the entry reports exited, or the
    /// liveness probe says the pid no longer exists.
    pub fn is_alive(&self, id: WorkOrderId) -> bool {
        let entry = match self.get(id) {
            Some(e) => e,
            None => return false,
        };
        if entry.has_exited {
            return false;
        }
        signal_zero(entry.pid)
    }

    /// Send a graceful termination signal; after `grace` elapses without the
    /// process exiting, escalate to a forced kill. Always returns an
    /// outcome, even if no process was ever registered for `id`.
    pub async fn force_kill(&self, id: WorkOrderId, grace: Duration) -> ForceKillOutcome {
        let started = std::time::Instant::now();

        let pid = match self.get(id) {
            Some(entry) if !entry.has_exited => entry.pid,
            _ => {
                return ForceKillOutcome {
                    success: true,
                    forced_kill: false,
                    duration_ms: started.elapsed().as_millis() as u64,
                };
            }
        };

        send_signal_term(pid);
        {
            let mut guard = self.processes.lock().expect("process tracker poisoned");
            if let Some(entry) = guard.get_mut(&id) {
                entry.kill_signal_sent = true;
            }
        }

        let deadline = std::time::Instant::now() + grace;
        let mut forced = false;
        loop {
            if !signal_zero(pid) {
                break;
            }
            if std::time::Instant::now() >= deadline {
                send_signal_kill(pid);
                forced = true;
                // Give the kernel a brief moment to reap the forced signal.
                tokio::time::sleep(Duration::from_millis(50)).await;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let success = !signal_zero(pid);
        if success {
            self.mark_exited(id, None);
        } else {
            warn!(work_order_id = %id, pid, "force_kill could not confirm process exit");
        }

        ForceKillOutcome {
            success,
            forced_kill: forced,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(unix)]
fn signal_zero(pid: i32) -> bool {
    // kill(pid, 0) performs no signal delivery, only existence/permission
    // checks; 0 means the process exists and is signalable.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(unix)]
fn send_signal_term(pid: i32) {
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(unix)]
fn send_signal_kill(pid: i32) {
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn signal_zero(_pid: i32) -> bool {
    false
}

#[cfg(not(unix))]
fn send_signal_term(_pid: i32) {}

#[cfg(not(unix))]
fn send_signal_kill(_pid: i32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_id_is_not_alive() {
        let tracker = ProcessTracker::new();
        assert!(!tracker.is_alive(WorkOrderId::new()));
    }

    #[test]
    fn registered_and_exited_is_not_alive() {
        let tracker = ProcessTracker::new();
        let id = WorkOrderId::new();
        tracker.register(id, std::process::id() as i32);
        tracker.mark_exited(id, Some(0));
        assert!(!tracker.is_alive(id));
        assert!(tracker.get(id).unwrap().has_exited);
    }

    #[test]
    fn registered_live_process_is_alive() {
        let tracker = ProcessTracker::new();
        let id = WorkOrderId::new();
        // Our own pid is always alive for the duration of this test.
        tracker.register(id, std::process::id() as i32);
        assert!(tracker.is_alive(id));
    }

    #[tokio::test]
    async fn force_kill_on_unregistered_id_reports_success() {
        let tracker = ProcessTracker::new();
        let outcome = tracker
            .force_kill(WorkOrderId::new(), Duration::from_millis(10))
            .await;
        assert!(outcome.success);
        assert!(!outcome.forced_kill);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn force_kill_terminates_child_process() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("failed to spawn sleep");
        let pid = child.id().expect("child has a pid") as i32;

        let tracker = ProcessTracker::new();
        let id = WorkOrderId::new();
        tracker.register(id, pid);

        let outcome = tracker.force_kill(id, Duration::from_millis(200)).await;
        assert!(outcome.success);

        let _ = child.wait().await;
    }
}
