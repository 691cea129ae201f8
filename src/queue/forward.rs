//! Forwards: long-running dequeuers living inside the queue group
//! process (§4.5). A *queue forward* relays messages between two
//! queues; a *service forward* invokes a service for each dequeued
//! message and optionally enqueues the reply.
//!
//! Grounded on `dispatch::handler::HandlerTable`'s "one callable per
//! concern, invoked by the pump" shape: each forward is driven the same
//! way, from the group process's own `on_idle` hook, rather than as a
//! separate OS thread — consistent with §5's single-threaded-event-loop
//! concurrency model. A service forward's call to the directory is
//! expressed as a trait so the forward logic is testable without a real
//! transport/service-manager round trip; `casual-queue`'s binary wires
//! a live implementation that sends `lookup.request`/service-call
//! frames over the process's own transport device.

use super::group::QueueGroup;
use super::store::Selector;
use crate::error::Result;
use crate::ids::Trid;
use std::time::{Duration, SystemTime};

/// What a service forward needs from the outside world: call the named
/// service with the dequeued payload, returning its reply payload (or
/// an error the forward treats as "roll back, retry later").
pub trait ServiceCaller: Send {
    fn call(&mut self, service: &str, payload: &[u8]) -> Result<Vec<u8>>;
}

/// `queue -> queue` forward: dequeue from `source`, enqueue onto
/// `target`, optionally delaying the target's availability. Runs under
/// its own transaction per message so a failure rolls back the source
/// dequeue rather than losing the message.
pub struct QueueForward {
    pub source: String,
    pub target: String,
    pub target_delay: Duration,
}

impl QueueForward {
    pub fn new(source: impl Into<String>, target: impl Into<String>, target_delay: Duration) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            target_delay,
        }
    }

    /// Attempt one forward step: dequeue one message from `source` and
    /// re-enqueue it onto `target` under a fresh transaction, committing
    /// both sides together. Returns `true` if a message was moved.
    pub fn step(&self, group: &mut QueueGroup) -> Result<bool> {
        let trid = Trid::new();
        let row = match group.dequeue(&self.source, Selector::none(), trid, false, forward_caller(), crate::ids::CorrelationId::new())? {
            super::group::DequeueOutcome::Immediate(Some(row)) => row,
            _ => return Ok(false),
        };

        group.enqueue(
            &self.target,
            &trid,
            &row.message_type,
            row.correlation,
            row.reply_queue.as_deref(),
            &row.properties,
            &row.payload,
            SystemTime::now() + self.target_delay,
        )?;
        group.commit(&trid, &[self.target.clone()])?;
        Ok(true)
    }
}

/// `queue -> service -> queue?` forward: dequeue from `source`, invoke
/// `target_service`, and optionally enqueue the reply onto
/// `reply_queue`. A service failure rolls the dequeue back so the
/// message is retried per the source queue's normal retry policy.
pub struct ServiceForward {
    pub source: String,
    pub target_service: String,
    pub reply_queue: Option<String>,
}

impl ServiceForward {
    pub fn new(source: impl Into<String>, target_service: impl Into<String>, reply_queue: Option<String>) -> Self {
        Self {
            source: source.into(),
            target_service: target_service.into(),
            reply_queue,
        }
    }

    /// Attempt one forward step. Returns `true` if a message was
    /// processed (successfully or not — a service failure still counts
    /// as "handled this step", since the row was rolled back rather
    /// than left untouched).
    pub fn step(&self, group: &mut QueueGroup, caller: &mut dyn ServiceCaller) -> Result<bool> {
        let trid = Trid::new();
        let row = match group.dequeue(&self.source, Selector::none(), trid, false, forward_caller(), crate::ids::CorrelationId::new())? {
            super::group::DequeueOutcome::Immediate(Some(row)) => row,
            _ => return Ok(false),
        };

        match caller.call(&self.target_service, &row.payload) {
            Ok(reply_payload) => {
                if let Some(reply_queue) = &self.reply_queue {
                    group.enqueue(
                        reply_queue,
                        &trid,
                        &row.message_type,
                        row.correlation,
                        None,
                        &row.properties,
                        &reply_payload,
                        SystemTime::now(),
                    )?;
                    group.commit(&trid, &[reply_queue.clone()])?;
                } else {
                    group.commit(&trid, &[])?;
                }
            }
            Err(_) => {
                group.rollback(&trid)?;
            }
        }
        Ok(true)
    }
}

/// Forwards act on behalf of the group process itself, not an external
/// caller; this placeholder handle identifies that origin in metrics
/// and in any woken waiter's `caller` field (which a forward's own
/// dequeue never populates, since `block = false`).
fn forward_caller() -> crate::ids::ProcessHandle {
    crate::ids::ProcessHandle::new(0, crate::ids::IpcId::nil())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;
    impl ServiceCaller for Echo {
        fn call(&mut self, _service: &str, payload: &[u8]) -> Result<Vec<u8>> {
            Ok(payload.to_vec())
        }
    }

    struct AlwaysFails;
    impl ServiceCaller for AlwaysFails {
        fn call(&mut self, _service: &str, _payload: &[u8]) -> Result<Vec<u8>> {
            Err(crate::error::Error::ServiceFail {
                service: "X".into(),
                reason: "boom".into(),
            })
        }
    }

    #[test]
    fn queue_forward_moves_a_message_between_queues() {
        let mut group = QueueGroup::open_in_memory().unwrap();
        group.declare_queue("A", 0, Duration::ZERO, None).unwrap();
        group.declare_queue("B", 0, Duration::ZERO, None).unwrap();
        group
            .enqueue("A", &Trid::NULL, "", crate::ids::CorrelationId::new(), None, "{}", b"hop", SystemTime::now())
            .unwrap();

        let forward = QueueForward::new("A", "B", Duration::ZERO);
        assert!(forward.step(&mut group).unwrap());

        assert!(group.peek("A").unwrap().is_empty());
        let on_b = group.peek("B").unwrap();
        assert_eq!(on_b.len(), 1);
        assert_eq!(on_b[0].payload, b"hop");
    }

    #[test]
    fn service_forward_enqueues_the_reply() {
        let mut group = QueueGroup::open_in_memory().unwrap();
        group.declare_queue("REQ", 0, Duration::ZERO, None).unwrap();
        group.declare_queue("REPLY", 0, Duration::ZERO, None).unwrap();
        group
            .enqueue("REQ", &Trid::NULL, "", crate::ids::CorrelationId::new(), None, "{}", b"call-me", SystemTime::now())
            .unwrap();

        let forward = ServiceForward::new("REQ", "ECHO", Some("REPLY".to_string()));
        let mut caller = Echo;
        assert!(forward.step(&mut group, &mut caller).unwrap());

        let replies = group.peek("REPLY").unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].payload, b"call-me");
    }

    #[test]
    fn service_forward_rolls_back_on_failure_leaving_message_redeliverable() {
        let mut group = QueueGroup::open_in_memory().unwrap();
        group.declare_queue("REQ", 3, Duration::ZERO, None).unwrap();
        group
            .enqueue("REQ", &Trid::NULL, "", crate::ids::CorrelationId::new(), None, "{}", b"retry-me", SystemTime::now())
            .unwrap();

        let forward = ServiceForward::new("REQ", "DOWN", None);
        let mut caller = AlwaysFails;
        assert!(forward.step(&mut group, &mut caller).unwrap());

        let remaining = group.peek("REQ").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].redelivered, 1);
    }
}
