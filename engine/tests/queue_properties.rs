//! Property tests for the sync queue.

use possync_engine::{DequeueRequest, Mutation, Operation, QueueState, SyncQueue};
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashSet;

#[derive(Debug, Clone)]
enum Step {
    Enqueue { record_id: i64, operation: Operation, priority: i32 },
    Dequeue { limit: usize },
    Succeed,
    Fail,
    Release,
}

fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        Just(Operation::Create),
        Just(Operation::Write),
        Just(Operation::Unlink),
    ]
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0i64..6, arb_operation(), -2i32..3).prop_map(|(record_id, operation, priority)| {
            Step::Enqueue { record_id, operation, priority }
        }),
        2 => (1usize..5).prop_map(|limit| Step::Dequeue { limit }),
        1 => Just(Step::Succeed),
        1 => Just(Step::Fail),
        1 => Just(Step::Release),
    ]
}

/// Runs a sequence of steps; the last dequeued batch is what the
/// succeed/fail/release steps act on.
fn run(steps: &[Step]) -> (SyncQueue, Vec<Vec<i64>>) {
    let mut queue = SyncQueue::new(2);
    let mut in_flight: Vec<i64> = Vec::new();
    let mut batches = Vec::new();
    let mut now = 1_000u64;

    for (i, step) in steps.iter().enumerate() {
        now += 10;
        match step {
            Step::Enqueue { record_id, operation, priority } => {
                let mutation = Mutation::new(
                    "res.partner",
                    *record_id,
                    *operation,
                    json!({"step": i}),
                    "WH1",
                )
                .with_priority(*priority);
                queue.enqueue(mutation, now);
            }
            Step::Dequeue { limit } => {
                let batch = queue.dequeue_batch(
                    &DequeueRequest::new(*limit, "WH1"),
                    &format!("cycle-{i}"),
                    now,
                );
                let ids: Vec<i64> = batch.iter().map(|e| e.id).collect();
                in_flight.extend(&ids);
                batches.push(ids);
            }
            Step::Succeed => {
                for id in in_flight.drain(..) {
                    let _ = queue.mark_done(id, now);
                }
            }
            Step::Fail => {
                for id in in_flight.drain(..) {
                    let _ = queue.mark_failed(id, "rejected", now);
                }
            }
            Step::Release => {
                let ids: Vec<i64> = in_flight.drain(..).collect();
                queue.release(&ids);
            }
        }
    }
    (queue, batches)
}

proptest! {
    #[test]
    fn prop_at_most_one_open_entry_per_record(steps in prop::collection::vec(arb_step(), 1..60)) {
        let (queue, _) = run(&steps);

        let mut seen = HashSet::new();
        for state in [QueueState::Pending, QueueState::Error] {
            for entry in queue.list(state) {
                prop_assert!(
                    seen.insert(entry.key()),
                    "two open entries for {:?}",
                    entry.key()
                );
            }
        }
    }

    #[test]
    fn prop_batches_never_overlap_while_locked(steps in prop::collection::vec(arb_step(), 1..60)) {
        let (queue, batches) = run(&steps);

        // Every id still locked appears in exactly one batch.
        for entry in queue.list(QueueState::Sent) {
            let holders = batches.iter().filter(|b| b.contains(&entry.id)).count();
            prop_assert!(holders >= 1);
            prop_assert!(entry.lock_token.is_some());
        }
        for batch in &batches {
            let unique: HashSet<_> = batch.iter().collect();
            prop_assert_eq!(unique.len(), batch.len());
        }
    }

    #[test]
    fn prop_retry_count_never_exceeds_budget(steps in prop::collection::vec(arb_step(), 1..60)) {
        let (queue, _) = run(&steps);

        for state in [QueueState::Pending, QueueState::Error, QueueState::Sent, QueueState::Dead] {
            for entry in queue.list(state) {
                prop_assert!(entry.retry_count <= entry.max_retries);
                prop_assert_eq!(entry.retry_count == entry.max_retries, state == QueueState::Dead);
            }
        }
    }

    #[test]
    fn prop_dequeue_respects_priority(priorities in prop::collection::vec(-5i32..5, 1..30)) {
        let mut queue = SyncQueue::new(3);
        for (i, priority) in priorities.iter().enumerate() {
            let mutation = Mutation::new("res.partner", i as i64, Operation::Write, json!({}), "WH1")
                .with_priority(*priority);
            queue.enqueue(mutation, 1_000 + i as u64);
        }

        let batch = queue.dequeue_batch(&DequeueRequest::new(priorities.len(), "WH1"), "c", 9_000);
        prop_assert_eq!(batch.len(), priorities.len());
        for pair in batch.windows(2) {
            prop_assert!(pair[0].priority >= pair[1].priority);
            if pair[0].priority == pair[1].priority {
                prop_assert!(pair[0].created_at <= pair[1].created_at);
            }
        }
    }
}
