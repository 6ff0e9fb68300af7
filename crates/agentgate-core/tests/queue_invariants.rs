//! Property tests for the Priority Queue's universal invariants (spec §8
//! U1-U4, U9, and the two ordering laws), run over randomized operation
//! sequences via `proptest` rather than hand-picked fixtures.

use agentgate_core::model::WorkOrderId;
use agentgate_core::queue::{EnqueueOptions, MarkStartedOptions, PriorityQueue};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Enqueue { priority: i64 },
    CancelRandom,
    StartHead,
    CompleteRandom,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (-3i64..=3).prop_map(|priority| Op::Enqueue { priority }),
        Just(Op::CancelRandom),
        Just(Op::StartHead),
        Just(Op::CompleteRandom),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// U1, U2: after any sequence of enqueue/start/complete/cancel
    /// operations, waiting and running never share an id, and running never
    /// exceeds `maxConcurrent`.
    #[test]
    fn u1_u2_hold_after_random_operation_sequences(ops in proptest::collection::vec(op_strategy(), 0..40)) {
        let max_concurrent = 2usize;
        let queue = PriorityQueue::new(1000, max_concurrent);
        let mut known_ids: Vec<WorkOrderId> = Vec::new();

        for op in ops {
            match op {
                Op::Enqueue { priority } => {
                    let id = WorkOrderId::new();
                    if queue.enqueue(id, EnqueueOptions { priority, ..Default::default() }).is_ok() {
                        known_ids.push(id);
                    }
                }
                Op::CancelRandom => {
                    if let Some(id) = known_ids.first().copied() {
                        queue.cancel(id);
                    }
                }
                Op::StartHead => {
                    queue.dequeue();
                }
                Op::CompleteRandom => {
                    if let Some(record) = queue.running_entries().first().cloned() {
                        queue.mark_completed(record.work_order_id);
                    }
                }
            }

            prop_assert!(queue.running_len() <= max_concurrent, "U2 violated: running exceeded maxConcurrent");

            let running_ids: Vec<WorkOrderId> = queue.running_entries().iter().map(|r| r.work_order_id).collect();
            for id in &known_ids {
                let waiting = queue.get_position(*id).map(|p| p.state == agentgate_core::model::QueueEntryState::Waiting).unwrap_or(false);
                let running = running_ids.contains(id);
                prop_assert!(!(waiting && running), "U1 violated: {id} counted as both waiting and running");
            }
        }
    }

    /// U3: waiting stays ordered by strictly-decreasing priority, FIFO
    /// within a tie, after any sequence of enqueues and cancels.
    #[test]
    fn u3_priority_order_holds_after_enqueue_cancel_churn(
        priorities in proptest::collection::vec(-3i64..=3, 1..20),
        cancel_every_third in any::<bool>(),
    ) {
        let queue = PriorityQueue::new(1000, 0);
        let mut enqueued: Vec<(WorkOrderId, i64, usize)> = Vec::new();

        for (seq, priority) in priorities.into_iter().enumerate() {
            let id = WorkOrderId::new();
            if queue.enqueue(id, EnqueueOptions { priority, ..Default::default() }).is_ok() {
                enqueued.push((id, priority, seq));
            }
            if cancel_every_third && seq % 3 == 0 {
                if let Some((cancel_id, _, _)) = enqueued.first().copied() {
                    queue.cancel(cancel_id);
                    enqueued.retain(|(id, _, _)| *id != cancel_id);
                }
            }
        }

        let mut positions: Vec<(i64, usize, u64)> = enqueued
            .iter()
            .filter_map(|(id, priority, seq)| {
                queue.get_position(*id).map(|p| (*priority, *seq, p.position))
            })
            .collect();
        positions.sort_by_key(|(_, _, position)| *position);

        for window in positions.windows(2) {
            let (priority_a, seq_a, _) = window[0];
            let (priority_b, seq_b, _) = window[1];
            prop_assert!(
                priority_a > priority_b || (priority_a == priority_b && seq_a <= seq_b),
                "U3 violated: entry ({priority_a}, seq {seq_a}) precedes ({priority_b}, seq {seq_b}) out of order"
            );
        }
    }

    /// U4: once `markStarted` returns, the id reports state=running and
    /// position=0.
    #[test]
    fn u4_mark_started_reports_running_at_position_zero(priority in -5i64..=5) {
        let queue = PriorityQueue::new(10, 5);
        let id = WorkOrderId::new();
        queue.enqueue(id, EnqueueOptions { priority, ..Default::default() }).unwrap();

        queue.mark_started(id, MarkStartedOptions::default());

        let position = queue.get_position(id).expect("started id must still report a position");
        prop_assert_eq!(position.state, agentgate_core::model::QueueEntryState::Running);
        prop_assert_eq!(position.position, 0);
    }

    /// U9: persist-then-restore round-trips waiting ids/priorities/
    /// enqueuedAt/maxWaitMs and the wait-time ring, but never the running
    /// set.
    #[test]
    fn u9_persist_restore_roundtrips_waiting_and_wait_times_not_running(
        priorities in proptest::collection::vec(-3i64..=3, 0..10),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let queue = PriorityQueue::new(1000, 1);
        let mut waiting_ids = Vec::new();
        for priority in &priorities {
            let id = WorkOrderId::new();
            queue.enqueue(id, EnqueueOptions { priority: *priority, ..Default::default() }).unwrap();
            waiting_ids.push(id);
        }
        // Put one id into the running set; it must not survive restore.
        queue.dequeue();

        queue.persist_to(&path);

        let restored = agentgate_core::queue::persistence::restore(&path);
        let restored_ids: Vec<WorkOrderId> = restored.waiting.iter().map(|e| e.work_order_id).collect();

        let waiting_after_dequeue: Vec<WorkOrderId> = waiting_ids
            .iter()
            .copied()
            .filter(|id| queue.get_position(*id).map(|p| p.state == agentgate_core::model::QueueEntryState::Waiting).unwrap_or(false))
            .collect();

        prop_assert_eq!(restored_ids.len(), waiting_after_dequeue.len());
        for id in &waiting_after_dequeue {
            prop_assert!(restored_ids.contains(id), "U9 violated: waiting id {id} missing after restore");
        }

        let fresh_queue = PriorityQueue::new(1000, 1);
        fresh_queue.restore_from(restored);
        prop_assert_eq!(fresh_queue.running_len(), 0, "U9 violated: restore must never rehydrate the running set");
    }
}

/// Law: enqueue/cancel commute on distinct ids -- canceling B before or
/// after enqueuing A leaves A's position unaffected.
#[test]
fn law_enqueue_cancel_commute_on_distinct_ids() {
    let queue_a = PriorityQueue::new(10, 5);
    let a = WorkOrderId::new();
    let b = WorkOrderId::new();
    queue_a.enqueue(b, EnqueueOptions { priority: 0, ..Default::default() }).unwrap();
    queue_a.enqueue(a, EnqueueOptions { priority: 0, ..Default::default() }).unwrap();
    queue_a.cancel(b);
    let position_a = queue_a.get_position(a).unwrap().position;

    let queue_b = PriorityQueue::new(10, 5);
    queue_b.enqueue(b, EnqueueOptions { priority: 0, ..Default::default() }).unwrap();
    queue_b.cancel(b);
    queue_b.enqueue(a, EnqueueOptions { priority: 0, ..Default::default() }).unwrap();
    let position_b = queue_b.get_position(a).unwrap().position;

    assert_eq!(position_a, position_b);
}
