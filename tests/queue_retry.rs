//! S4 / invariant 6: a message redelivered `retry_count + 1` times lands
//! in its queue's configured error queue with `origin` preserved and
//! `redelivered` reset, while the queue it dequeues from in between each
//! retry is the same source queue (the rollback swaps `queue_name`, not
//! `origin_queue`, as the backing store does it).

use casual_core::ids::{CorrelationId, IpcId, ProcessHandle, Trid};
use casual_core::queue::{DequeueOutcome, QueueGroup, Selector};
use std::time::{Duration, SystemTime};

fn caller() -> ProcessHandle {
    ProcessHandle::new(std::process::id(), IpcId::new())
}

#[test]
fn redeliveries_beyond_retry_count_move_the_row_to_the_error_queue() {
    let mut group = QueueGroup::open_in_memory().expect("open in-memory group");
    group
        .declare_queue("orders", 2, Duration::from_millis(0), Some("orders.dead"))
        .expect("declare source queue");
    group
        .declare_queue("orders.dead", 0, Duration::from_millis(0), None)
        .expect("declare error queue");

    let trid = Trid::new();
    let (id, woken) = group
        .enqueue("orders", &Trid::NULL, "order.v1", CorrelationId::new(), None, "{}", b"payload", SystemTime::now())
        .expect("enqueue under no transaction commits immediately");
    assert!(woken.is_empty());
    assert!(id >= 0);

    // Dequeue-under-transaction, then roll back, three times: with
    // retry_count = 2, the first two rollbacks redeliver on "orders";
    // the third crosses retry_count and moves the row to "orders.dead".
    for attempt in 1..=3 {
        let outcome = group
            .dequeue("orders", Selector::none(), trid, false, caller(), CorrelationId::new())
            .expect("dequeue under transaction");
        let row = match outcome {
            DequeueOutcome::Immediate(Some(row)) => row,
            DequeueOutcome::Immediate(None) => panic!("attempt {attempt}: expected a row, found none"),
            DequeueOutcome::Pending => panic!("attempt {attempt}: dequeue unexpectedly blocked"),
        };
        assert_eq!(row.queue, "orders", "row must still be read off the source queue before rollback {attempt}");
        assert_eq!(row.origin_queue, "orders");

        let woken = group.rollback(&trid).expect("rollback");
        assert!(woken.is_empty(), "no blocked dequeuer to wake in this scenario");
    }

    // Source queue is now empty; the row lives in the error queue with
    // its origin preserved and redelivery count reset.
    let source_backlog = group.peek("orders").expect("peek source queue");
    assert!(source_backlog.is_empty(), "row must have left the source queue after exceeding retry_count");

    let dead_letters = group.peek("orders.dead").expect("peek error queue");
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].origin_queue, "orders");
    assert_eq!(dead_letters[0].redelivered, 0);
    assert_eq!(dead_letters[0].payload, b"payload");
}

#[test]
fn commit_makes_an_enqueued_row_visible_and_rollback_makes_it_absent() {
    let mut group = QueueGroup::open_in_memory().expect("open in-memory group");
    group.declare_queue("events", 0, Duration::from_millis(0), None).expect("declare queue");

    let trid = Trid::new();
    group
        .enqueue("events", &trid, "event.v1", CorrelationId::new(), None, "{}", b"x", SystemTime::now())
        .expect("enqueue under transaction");

    // Not yet committed: nothing dequeue-eligible.
    let outcome = group
        .dequeue("events", Selector::none(), Trid::NULL, false, caller(), CorrelationId::new())
        .expect("dequeue before commit");
    assert!(matches!(outcome, DequeueOutcome::Immediate(None)));

    let woken = group.commit(&trid, &["events".to_string()]).expect("commit");
    assert!(woken.is_empty());

    let outcome = group
        .dequeue("events", Selector::none(), Trid::NULL, false, caller(), CorrelationId::new())
        .expect("dequeue after commit");
    assert!(matches!(outcome, DequeueOutcome::Immediate(Some(_))), "committed row must become visible");
}

#[test]
fn blocked_dequeue_wakes_on_a_later_commit() {
    let mut group = QueueGroup::open_in_memory().expect("open in-memory group");
    group.declare_queue("jobs", 0, Duration::from_millis(0), None).expect("declare queue");

    let waiter = caller();
    let correlation = CorrelationId::new();
    let outcome = group
        .dequeue("jobs", Selector::none(), Trid::NULL, true, waiter, correlation)
        .expect("blocking dequeue registers");
    assert!(matches!(outcome, DequeueOutcome::Pending));

    let (_id, woken) = group
        .enqueue("jobs", &Trid::NULL, "job.v1", CorrelationId::new(), None, "{}", b"work", SystemTime::now())
        .expect("enqueue wakes the waiter");
    assert_eq!(woken.len(), 1);
    assert_eq!(woken[0].0, waiter);
    assert_eq!(woken[0].1, correlation);
}
