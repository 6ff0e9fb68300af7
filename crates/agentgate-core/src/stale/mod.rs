//! Stale Detector (§4.3).
//!
//! Periodic sweep cross-referencing the Queue's running set with the
//! Process Tracker. Classification is a pure function so it is unit
//! testable without a timer, per SPEC_FULL.md's grounding note — the same
//! separation the teacher draws between `TaskStateMachine::is_valid_transition`
//! (pure) and `TaskStateMachine::transition` (I/O).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::model::{RunningRecord, WorkOrderId};
use crate::process::ProcessTracker;
use crate::queue::PriorityQueue;

/// Result of classifying one running work order (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Healthy,
    Dead,
    Stale,
}

/// Pure classification: no process entry, an exited entry, or a liveness
/// probe failure all mean `Dead`; otherwise a run older than
/// `max_running_time_ms` is `Stale`.
pub fn classify(
    now: DateTime<Utc>,
    record: &RunningRecord,
    is_alive: bool,
    max_running_time_ms: u64,
) -> SweepOutcome {
    if !is_alive {
        return SweepOutcome::Dead;
    }
    let age_ms = (now - record.started_at).num_milliseconds().max(0) as u64;
    if age_ms > max_running_time_ms {
        return SweepOutcome::Stale;
    }
    SweepOutcome::Healthy
}

/// Called once per stale-detected/stale-handled outcome so the owner
/// (normally the Orchestrator) can persist `Failed` status and release
/// resources held outside this module (lease, `activeRuns` bookkeeping).
pub type StaleHandler = Arc<dyn Fn(WorkOrderId, bool) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct StaleDetectorConfig {
    pub sweep_interval: Duration,
    pub max_running_time_ms: u64,
    pub kill_grace: Duration,
}

impl Default for StaleDetectorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            max_running_time_ms: 60 * 60 * 1000,
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Periodic sweep (§4.3). Forces a kill and evicts from the queue's running
/// set for every `dead`/`stale` outcome; store/queue errors inside the
/// handler are logged, never thrown, matching §4.3's failure semantics.
pub struct StaleDetector {
    queue: Arc<PriorityQueue>,
    process_tracker: Arc<ProcessTracker>,
    config: StaleDetectorConfig,
    on_handled: StaleHandler,
}

impl StaleDetector {
    pub fn new(
        queue: Arc<PriorityQueue>,
        process_tracker: Arc<ProcessTracker>,
        config: StaleDetectorConfig,
        on_handled: StaleHandler,
    ) -> Self {
        Self {
            queue,
            process_tracker,
            config,
            on_handled,
        }
    }

    /// Run a single sweep over every currently-running work order.
    pub async fn sweep_once(&self) {
        let now = Utc::now();
        for record in self.queue.running_entries() {
            let is_alive = self.process_tracker.is_alive(record.work_order_id);
            let outcome = classify(now, &record, is_alive, self.config.max_running_time_ms);
            if outcome == SweepOutcome::Healthy {
                continue;
            }

            info!(
                work_order_id = %record.work_order_id,
                outcome = ?outcome,
                "stale detected"
            );

            let kill_outcome = self
                .process_tracker
                .force_kill(record.work_order_id, self.config.kill_grace)
                .await;

            self.queue.force_cancel(record.work_order_id);

            warn!(
                work_order_id = %record.work_order_id,
                killed = kill_outcome.success,
                "stale detection terminated run"
            );

            (self.on_handled)(record.work_order_id, kill_outcome.success);
        }
    }

    /// Spawn a background task that sweeps on `config.sweep_interval` until
    /// aborted by the caller.
    pub fn spawn_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn record_started(ms_ago: i64) -> RunningRecord {
        RunningRecord {
            work_order_id: WorkOrderId::new(),
            started_at: Utc::now() - chrono::Duration::milliseconds(ms_ago),
            max_wall_clock_ms: None,
            cancellation: CancellationToken::new(),
        }
    }

    #[test]
    fn dead_when_not_alive_regardless_of_age() {
        let record = record_started(10);
        let outcome = classify(Utc::now(), &record, false, 60_000);
        assert_eq!(outcome, SweepOutcome::Dead);
    }

    #[test]
    fn stale_when_alive_but_over_max_running_time() {
        let record = record_started(120_000);
        let outcome = classify(Utc::now(), &record, true, 60_000);
        assert_eq!(outcome, SweepOutcome::Stale);
    }

    #[test]
    fn healthy_when_alive_and_within_budget() {
        let record = record_started(10);
        let outcome = classify(Utc::now(), &record, true, 60_000);
        assert_eq!(outcome, SweepOutcome::Healthy);
    }

    #[tokio::test]
    async fn sweep_kills_and_evicts_dead_run_and_invokes_handler() {
        use crate::queue::MarkStartedOptions;

        let queue = Arc::new(PriorityQueue::new(10, 10));
        let tracker = Arc::new(ProcessTracker::new());
        let id = WorkOrderId::new();
        queue
            .enqueue(id, crate::queue::EnqueueOptions::default())
            .unwrap();
        queue.mark_started(id, MarkStartedOptions::default());
        // No process ever registered for `id` => tracker reports not alive.

        let handled = Arc::new(std::sync::Mutex::new(Vec::new()));
        let handled_clone = handled.clone();
        let detector = StaleDetector::new(
            queue.clone(),
            tracker,
            StaleDetectorConfig {
                kill_grace: Duration::from_millis(10),
                ..Default::default()
            },
            Arc::new(move |wid, killed| handled_clone.lock().unwrap().push((wid, killed))),
        );

        detector.sweep_once().await;

        assert_eq!(queue.running_len(), 0, "dead run should be evicted from running");
        assert_eq!(handled.lock().unwrap().as_slice(), &[(id, true)]);
    }
}
