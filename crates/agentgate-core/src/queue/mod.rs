//! Priority Queue (§4.1).
//!
//! Maintains the ordered waiting set and a separate running set behind a
//! single internal mutex — per §5, "treat the queue as a single logical
//! mutex". `waiting` is kept as a sorted `Vec` rather than a `BinaryHeap`
//! because position queries need stable, indexable order, and `running` is
//! an `IndexMap` so iteration order matches insertion order for
//! deterministic tests, the same reasoning the pack's queue-shaped crates
//! reach for `indexmap` over a bare `HashMap`.

pub mod persistence;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use tracing::{debug, info};

use crate::errors::OperationalError;
use crate::model::{
    PositionObserver, QueueEntry, QueueEntryState, QueuePosition, RunningRecord, WorkOrderId,
};

const WAIT_TIME_RING_CAPACITY: usize = 50;

/// Events the queue emits for observability. The authoritative "start a
/// work order" signal is owned by the Admission Controller (see
/// `admission::AdmissionEvent`) — the queue itself never emits a `ready`
/// event, resolving the double-starter hazard named in the design notes.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    StateChange,
    Timeout(WorkOrderId),
    Canceled(WorkOrderId),
}

pub type QueueEventSink = Arc<dyn Fn(QueueEvent) + Send + Sync>;

/// Options accepted by [`PriorityQueue::enqueue`].
#[derive(Default)]
pub struct EnqueueOptions {
    pub priority: i64,
    pub max_wait_ms: Option<u64>,
    pub on_position_change: Option<PositionObserver>,
}

/// Options accepted by [`PriorityQueue::mark_started`].
#[derive(Default, Clone)]
pub struct MarkStartedOptions {
    pub max_wall_clock_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub waiting: usize,
    pub running: usize,
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub average_wait_ms: Option<u64>,
}

struct QueueState {
    waiting: Vec<QueueEntry>,
    running: IndexMap<WorkOrderId, RunningRecord>,
    wait_times: VecDeque<u64>,
}

/// Ordered waiting set plus running set, with position/ETA queries,
/// timeout eviction, and file persistence.
pub struct PriorityQueue {
    state: Mutex<QueueState>,
    max_queue_size: usize,
    max_concurrent: usize,
    event_sink: Option<QueueEventSink>,
}

impl PriorityQueue {
    pub fn new(max_queue_size: usize, max_concurrent: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                waiting: Vec::new(),
                running: IndexMap::new(),
                wait_times: VecDeque::with_capacity(WAIT_TIME_RING_CAPACITY),
            }),
            max_queue_size,
            max_concurrent,
            event_sink: None,
        }
    }

    pub fn with_event_sink(mut self, sink: QueueEventSink) -> Self {
        self.event_sink = Some(sink);
        self
    }

    fn emit(&self, event: QueueEvent) {
        if let Some(sink) = &self.event_sink {
            sink(event);
        }
    }

    /// §4.1: strictly higher `priority` sorts earlier; FIFO within equal
    /// priority. Finds the first entry with strictly lower priority and
    /// inserts before it; otherwise appends.
    pub fn enqueue(
        &self,
        id: WorkOrderId,
        opts: EnqueueOptions,
    ) -> Result<QueuePosition, OperationalError> {
        let mut guard = self.state.lock().expect("queue poisoned");

        let already_present = guard.waiting.iter().any(|e| e.work_order_id == id)
            || guard.running.contains_key(&id);
        if already_present {
            return Err(OperationalError::AlreadyQueued);
        }
        if guard.waiting.len() >= self.max_queue_size {
            return Err(OperationalError::QueueFull);
        }

        let entry = QueueEntry {
            work_order_id: id,
            priority: opts.priority,
            enqueued_at: Utc::now(),
            max_wait_ms: opts.max_wait_ms,
            on_position_change: opts.on_position_change,
        };

        let insert_at = guard
            .waiting
            .iter()
            .position(|e| e.priority < opts.priority)
            .unwrap_or(guard.waiting.len());
        guard.waiting.insert(insert_at, entry);

        let position = self.position_of_locked(&guard, insert_at);
        if let Some(obs) = &guard.waiting[insert_at].on_position_change {
            obs(position);
        }
        self.notify_all_positions_locked(&guard);
        drop(guard);

        self.emit(QueueEvent::StateChange);
        debug!(work_order_id = %id, position = position.position, "enqueued");
        Ok(position)
    }

    pub fn peek(&self) -> Option<WorkOrderId> {
        let guard = self.state.lock().expect("queue poisoned");
        guard.waiting.first().map(|e| e.work_order_id)
    }

    /// Moves the head from waiting to running iff capacity allows. Most
    /// callers should not invoke this directly -- the Admission Controller
    /// drives starts; this exists as the primitive it and tests build on.
    pub fn dequeue(&self) -> Option<WorkOrderId> {
        let mut guard = self.state.lock().expect("queue poisoned");
        if guard.running.len() >= self.max_concurrent || guard.waiting.is_empty() {
            return None;
        }
        let entry = guard.waiting.remove(0);
        let id = entry.work_order_id;
        let wait_ms = (Utc::now() - entry.enqueued_at).num_milliseconds().max(0) as u64;
        record_wait_time(&mut guard.wait_times, wait_ms);

        guard.running.insert(
            id,
            RunningRecord {
                work_order_id: id,
                started_at: Utc::now(),
                max_wall_clock_ms: None,
                cancellation: tokio_util::sync::CancellationToken::new(),
            },
        );
        self.notify_all_positions_locked(&guard);
        Some(id)
    }

    /// Remove `id` from waiting if present, insert into running with a
    /// fresh cancellation handle.
    pub fn mark_started(&self, id: WorkOrderId, opts: MarkStartedOptions) -> RunningRecord {
        let mut guard = self.state.lock().expect("queue poisoned");

        if let Some(idx) = guard.waiting.iter().position(|e| e.work_order_id == id) {
            let entry = guard.waiting.remove(idx);
            let wait_ms = (Utc::now() - entry.enqueued_at).num_milliseconds().max(0) as u64;
            record_wait_time(&mut guard.wait_times, wait_ms);
        }

        let record = RunningRecord {
            work_order_id: id,
            started_at: Utc::now(),
            max_wall_clock_ms: opts.max_wall_clock_ms,
            cancellation: tokio_util::sync::CancellationToken::new(),
        };
        guard.running.insert(id, record.clone());
        self.notify_all_positions_locked(&guard);
        record
    }

    /// Remove from running and re-notify waiting observers (capacity may
    /// have opened up). Does not itself trigger admission -- the caller
    /// (Admission Controller) is responsible for ticking again.
    pub fn mark_completed(&self, id: WorkOrderId) {
        let mut guard = self.state.lock().expect("queue poisoned");
        guard.running.shift_remove(&id);
        self.notify_all_positions_locked(&guard);
    }

    /// Removes from waiting only. Returns false if not present there.
    pub fn cancel(&self, id: WorkOrderId) -> bool {
        let mut guard = self.state.lock().expect("queue poisoned");
        let before = guard.waiting.len();
        guard.waiting.retain(|e| e.work_order_id != id);
        let removed = guard.waiting.len() != before;
        if removed {
            self.notify_all_positions_locked(&guard);
        }
        drop(guard);
        if removed {
            self.emit(QueueEvent::Canceled(id));
        }
        removed
    }

    /// Fires the cancellation handle and removes from running.
    pub fn cancel_running(&self, id: WorkOrderId) -> bool {
        let mut guard = self.state.lock().expect("queue poisoned");
        let removed = match guard.running.shift_remove(&id) {
            Some(record) => {
                record.cancellation.cancel();
                true
            }
            None => false,
        };
        drop(guard);
        if removed {
            self.emit(QueueEvent::Canceled(id));
        }
        removed
    }

    /// Removes `id` from either set, whichever it is in.
    pub fn force_cancel(&self, id: WorkOrderId) -> bool {
        let mut guard = self.state.lock().expect("queue poisoned");
        let in_waiting = guard.waiting.iter().any(|e| e.work_order_id == id);
        if in_waiting {
            guard.waiting.retain(|e| e.work_order_id != id);
            self.notify_all_positions_locked(&guard);
            return true;
        }
        if let Some(record) = guard.running.shift_remove(&id) {
            record.cancellation.cancel();
            return true;
        }
        false
    }

    pub fn get_position(&self, id: WorkOrderId) -> Option<QueuePosition> {
        let guard = self.state.lock().expect("queue poisoned");
        if guard.running.contains_key(&id) {
            return Some(QueuePosition {
                position: 0,
                state: QueueEntryState::Running,
                ahead: 0,
                eta_ms: Some(0),
            });
        }
        let idx = guard.waiting.iter().position(|e| e.work_order_id == id)?;
        Some(self.position_of_locked(&guard, idx))
    }

    pub fn stats(&self) -> QueueStats {
        let guard = self.state.lock().expect("queue poisoned");
        QueueStats {
            waiting: guard.waiting.len(),
            running: guard.running.len(),
            max_concurrent: self.max_concurrent,
            max_queue_size: self.max_queue_size,
            average_wait_ms: average_wait(&guard.wait_times),
        }
    }

    /// §4.1 queue-wait timeout: if the head's `maxWaitMs` has elapsed,
    /// evict it and emit `timeout`. Returns the evicted id, if any. Called
    /// by the Admission Controller on every tick before the other gates.
    pub fn evict_timed_out_head(&self) -> Option<WorkOrderId> {
        let mut guard = self.state.lock().expect("queue poisoned");
        let now = Utc::now();
        let should_evict = guard.waiting.first().is_some_and(|head| {
            head.max_wait_ms
                .is_some_and(|max| (now - head.enqueued_at).num_milliseconds() > max as i64)
        });
        if !should_evict {
            return None;
        }
        let entry = guard.waiting.remove(0);
        self.notify_all_positions_locked(&guard);
        drop(guard);
        self.emit(QueueEvent::Timeout(entry.work_order_id));
        info!(work_order_id = %entry.work_order_id, "queue wait timed out, evicted");
        Some(entry.work_order_id)
    }

    /// Persist the current snapshot to `path` (§4.1, §6 "Persisted queue
    /// file layout"). Errors are logged by [`persistence::persist`], never
    /// propagated.
    pub fn persist_to(&self, path: &std::path::Path) {
        let (waiting, running, wait_times) = self.persistence_snapshot();
        persistence::persist(path, &waiting, &running, &wait_times);
    }

    /// Spawn a background task that persists to `path` on `interval` until
    /// dropped. The returned handle should be aborted at shutdown, after a
    /// final synchronous [`PriorityQueue::persist_to`] call.
    pub fn spawn_persistence_loop(
        self: &Arc<Self>,
        path: std::path::PathBuf,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                queue.persist_to(&path);
            }
        })
    }

    pub fn has_capacity(&self) -> bool {
        let guard = self.state.lock().expect("queue poisoned");
        guard.running.len() < self.max_concurrent
    }

    pub fn waiting_len(&self) -> usize {
        self.state.lock().expect("queue poisoned").waiting.len()
    }

    pub fn running_len(&self) -> usize {
        self.state.lock().expect("queue poisoned").running.len()
    }

    /// Snapshot of every currently-running record, for the Stale Detector
    /// (§4.3) to cross-reference against the Process Tracker without
    /// holding the queue's lock while it does so.
    pub fn running_entries(&self) -> Vec<RunningRecord> {
        let guard = self.state.lock().expect("queue poisoned");
        guard.running.values().cloned().collect()
    }

    /// Snapshot of `{waiting, running, wait_times}` for persistence (§4.1).
    pub fn persistence_snapshot(
        &self,
    ) -> (
        Vec<(WorkOrderId, i64, chrono::DateTime<Utc>, Option<u64>)>,
        Vec<WorkOrderId>,
        Vec<u64>,
    ) {
        let guard = self.state.lock().expect("queue poisoned");
        let waiting = guard
            .waiting
            .iter()
            .map(|e| (e.work_order_id, e.priority, e.enqueued_at, e.max_wait_ms))
            .collect();
        let running = guard.running.keys().copied().collect();
        let wait_times = guard.wait_times.iter().copied().collect();
        (waiting, running, wait_times)
    }

    /// Re-enqueue entries restored from disk (§4.1 `restore`). Observers are
    /// never restored; the running set is never rehydrated by this call.
    pub fn restore_from(&self, restored: persistence::RestoredQueue) {
        let mut guard = self.state.lock().expect("queue poisoned");
        for entry in restored.waiting {
            guard.waiting.push(QueueEntry {
                work_order_id: entry.work_order_id,
                priority: entry.priority,
                enqueued_at: entry.enqueued_at,
                max_wait_ms: entry.max_wait_ms,
                on_position_change: None,
            });
        }
        guard.waiting.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
        });
        for wait_ms in restored.wait_times {
            record_wait_time(&mut guard.wait_times, wait_ms);
        }
    }

    fn position_of_locked(&self, guard: &QueueState, idx: usize) -> QueuePosition {
        let ahead = idx as u64;
        let eta_ms = estimate_wait(&guard.wait_times, ahead, self.max_concurrent, guard.running.len());
        QueuePosition {
            position: idx as u64 + 1,
            state: QueueEntryState::Waiting,
            ahead,
            eta_ms,
        }
    }

    fn notify_all_positions_locked(&self, guard: &QueueState) {
        for (idx, entry) in guard.waiting.iter().enumerate() {
            if let Some(obs) = &entry.on_position_change {
                obs(self.position_of_locked(guard, idx));
            }
        }
        self.emit(QueueEvent::StateChange);
    }
}

fn record_wait_time(ring: &mut VecDeque<u64>, wait_ms: u64) {
    if ring.len() >= WAIT_TIME_RING_CAPACITY {
        ring.pop_front();
    }
    ring.push_back(wait_ms);
}

fn average_wait(ring: &VecDeque<u64>) -> Option<u64> {
    if ring.is_empty() {
        return None;
    }
    let sum: u64 = ring.iter().sum();
    Some((sum as f64 / ring.len() as f64).round() as u64)
}

/// §4.1 wait-time estimation. `ahead` is the number of entries strictly in
/// front of the candidate position.
fn estimate_wait(
    ring: &VecDeque<u64>,
    ahead: u64,
    max_concurrent: usize,
    running_len: usize,
) -> Option<u64> {
    if ahead == 0 && running_len < max_concurrent {
        return Some(0);
    }
    let avg = average_wait(ring)?;
    if max_concurrent == 0 {
        return None;
    }
    let batches = (ahead + 1).div_ceil(max_concurrent as u64);
    Some(batches * avg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enqueue(q: &PriorityQueue, priority: i64) -> WorkOrderId {
        let id = WorkOrderId::new();
        q.enqueue(id, EnqueueOptions { priority, ..Default::default() })
            .unwrap();
        id
    }

    #[test]
    fn priority_overtake_seed_scenario() {
        // Seed test 1: A(0), B(0), C(5) -> order C, A, B.
        let q = PriorityQueue::new(100, 1);
        let a = enqueue(&q, 0);
        let b = enqueue(&q, 0);
        let c_pos = {
            let c = WorkOrderId::new();
            let pos = q
                .enqueue(c, EnqueueOptions { priority: 5, ..Default::default() })
                .unwrap();
            assert_eq!(pos.position, 1);
            c
        };

        assert_eq!(q.get_position(c_pos).unwrap().position, 1);
        assert_eq!(q.get_position(a).unwrap().position, 2);
        assert_eq!(q.get_position(b).unwrap().position, 3);
    }

    #[test]
    fn already_queued_rejected() {
        let q = PriorityQueue::new(100, 1);
        let id = WorkOrderId::new();
        q.enqueue(id, EnqueueOptions::default()).unwrap();
        let err = q.enqueue(id, EnqueueOptions::default()).unwrap_err();
        assert_eq!(err, OperationalError::AlreadyQueued);
    }

    #[test]
    fn queue_full_rejected() {
        let q = PriorityQueue::new(0, 1);
        let err = q
            .enqueue(WorkOrderId::new(), EnqueueOptions::default())
            .unwrap_err();
        assert_eq!(err, OperationalError::QueueFull);
    }

    #[test]
    fn mark_started_reports_running_at_position_zero() {
        let q = PriorityQueue::new(100, 1);
        let id = enqueue(&q, 0);
        q.mark_started(id, MarkStartedOptions::default());
        let pos = q.get_position(id).unwrap();
        assert_eq!(pos.position, 0);
        assert_eq!(pos.state, QueueEntryState::Running);
    }

    #[test]
    fn cancel_removes_from_waiting_only() {
        let q = PriorityQueue::new(100, 1);
        let id = enqueue(&q, 0);
        assert!(q.cancel(id));
        assert!(q.get_position(id).is_none());
        assert!(!q.cancel(id));
    }

    #[test]
    fn cancel_running_fires_cancellation_handle() {
        let q = PriorityQueue::new(100, 1);
        let id = enqueue(&q, 0);
        let record = q.mark_started(id, MarkStartedOptions::default());
        assert!(!record.cancellation.is_cancelled());
        assert!(q.cancel_running(id));
    }

    #[test]
    fn empty_history_estimate_is_null() {
        let q = PriorityQueue::new(100, 1);
        let _first = enqueue(&q, 0);
        let second = enqueue(&q, 0);
        // second is at ahead=1, running empty, no wait samples yet.
        assert_eq!(q.get_position(second).unwrap().eta_ms, None);
    }

    #[test]
    fn max_wait_zero_evicts_on_next_check() {
        let q = PriorityQueue::new(100, 1);
        let id = WorkOrderId::new();
        q.enqueue(
            id,
            EnqueueOptions {
                max_wait_ms: Some(0),
                ..Default::default()
            },
        )
        .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(q.evict_timed_out_head(), Some(id));
        assert!(q.get_position(id).is_none());
    }

    #[test]
    fn max_concurrent_zero_blocks_dequeue() {
        let q = PriorityQueue::new(100, 0);
        enqueue(&q, 0);
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn enqueue_cancel_commute_on_distinct_ids() {
        let q = PriorityQueue::new(100, 1);
        let a = enqueue(&q, 0);
        let b = enqueue(&q, 0);
        q.cancel(a);
        assert!(q.get_position(a).is_none());
        assert_eq!(q.get_position(b).unwrap().position, 1);
    }

    #[test]
    fn equal_priority_stable_under_unrelated_churn() {
        let q = PriorityQueue::new(100, 1);
        let a = enqueue(&q, 0);
        let noise = enqueue(&q, 0);
        let b = enqueue(&q, 0);
        q.cancel(noise);
        assert_eq!(q.get_position(a).unwrap().position, 1);
        assert_eq!(q.get_position(b).unwrap().position, 2);
    }
}
