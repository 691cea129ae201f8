//! The queue group process's in-memory layer above [`super::store`]:
//! blocking dequeue requests that cannot be satisfied immediately, and
//! waking them in FIFO order once a matching message becomes available
//! (§4.5, invariant "`dequeue(block=true)` ... wakes the earliest
//! waiter first").
//!
//! Grounded on `service::directory::ServiceDirectory`'s
//! pending-lookup/wake-on-advertise shape for the same "register now,
//! get told the answer later" pattern, here applied to dequeue instead
//! of lookup.

use super::store::{MessageRow, QueueDescriptor, QueueStore, Selector};
use crate::error::Result;
use crate::ids::{CorrelationId, ProcessHandle, Trid};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::time::SystemTime;

/// One registered blocking dequeue, waiting for a message to arrive on
/// its queue. Removed either by [`QueueGroup::drain_ready`] (a match
/// arrived) or [`QueueGroup::forget`] (the caller gave up).
struct PendingDequeue {
    caller: ProcessHandle,
    correlation: CorrelationId,
    selector: Selector,
    trid: Trid,
}

/// Removes its queue's pending-dequeue entry on drop unless explicitly
/// consumed by a matching reply, realizing the "scoped acquisition with
/// guaranteed cleanup" resource policy (§5) for the `pending` table —
/// a caller that panics or whose connection drops mid-registration
/// never leaves a phantom waiter behind.
pub struct PendingGuard<'a> {
    group: &'a mut QueueGroup,
    queue: String,
    correlation: CorrelationId,
    consumed: bool,
}

impl<'a> PendingGuard<'a> {
    /// Mark the registration as delivered so `Drop` does not also try
    /// to remove it (it is already gone, popped by `drain_ready`).
    pub fn consume(mut self) {
        self.consumed = true;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.consumed {
            self.group.forget(&self.queue, self.correlation);
        }
    }
}

/// Either an immediate answer or confirmation that the request is now
/// registered and waiting.
pub enum DequeueOutcome {
    Immediate(Option<MessageRow>),
    Pending,
}

/// One queue group's live state: the SQLite-backed store plus whichever
/// blocking dequeues have not yet been satisfied.
pub struct QueueGroup {
    store: QueueStore,
    pending: HashMap<String, VecDeque<PendingDequeue>>,
}

impl QueueGroup {
    pub fn open(queuebase: &Path) -> Result<Self> {
        Ok(Self {
            store: QueueStore::open(queuebase)?,
            pending: HashMap::new(),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            store: QueueStore::open_in_memory()?,
            pending: HashMap::new(),
        })
    }

    pub fn declare_queue(
        &self,
        name: &str,
        retry_count: u32,
        retry_delay: std::time::Duration,
        error_queue: Option<&str>,
    ) -> Result<QueueDescriptor> {
        self.store.declare_queue(name, retry_count, retry_delay, error_queue)
    }

    pub fn list_queues(&self) -> Result<Vec<QueueDescriptor>> {
        self.store.list_queues()
    }

    pub fn peek(&self, queue: &str) -> Result<Vec<MessageRow>> {
        self.store.peek(queue)
    }

    /// `enqueue.request`. Returns the new message's id plus every
    /// blocking dequeue this enqueue was able to satisfy (only possible
    /// when `trid` is null, since only a committed row is dequeue-
    /// eligible).
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue(
        &mut self,
        queue: &str,
        trid: &Trid,
        message_type: &str,
        correlation: CorrelationId,
        reply_queue: Option<&str>,
        properties: &str,
        payload: &[u8],
        available_at: SystemTime,
    ) -> Result<(i64, Vec<(ProcessHandle, CorrelationId, MessageRow)>)> {
        let id = self.store.enqueue(
            queue,
            trid,
            message_type,
            correlation,
            reply_queue,
            properties,
            payload,
            available_at,
        )?;
        let woken = if trid.is_null() { self.drain_ready(queue)? } else { Vec::new() };
        Ok((id, woken))
    }

    /// `dequeue.request { queue, selector, trid, block }`. On a miss
    /// with `block = true`, registers the request and returns
    /// [`DequeueOutcome::Pending`]; the caller must later call
    /// [`QueueGroup::forget`] (directly, or by dropping the
    /// [`PendingGuard`] obtained via [`QueueGroup::register_pending`])
    /// if it gives up waiting.
    pub fn dequeue(
        &mut self,
        queue: &str,
        selector: Selector,
        trid: Trid,
        block: bool,
        caller: ProcessHandle,
        correlation: CorrelationId,
    ) -> Result<DequeueOutcome> {
        if let Some(row) = self.store.try_dequeue(queue, &selector, &trid, SystemTime::now())? {
            return Ok(DequeueOutcome::Immediate(Some(row)));
        }
        if !block {
            return Ok(DequeueOutcome::Immediate(None));
        }
        self.pending.entry(queue.to_string()).or_default().push_back(PendingDequeue {
            caller,
            correlation,
            selector,
            trid,
        });
        Ok(DequeueOutcome::Pending)
    }

    /// Register a blocking dequeue and get back an RAII guard that
    /// removes it if dropped before [`PendingGuard::consume`] is
    /// called. Most callers use [`QueueGroup::dequeue`] directly and
    /// handle cleanup via [`QueueGroup::forget`] on `dequeue.forget`;
    /// this wrapper exists for callers (tests, the nested-pump XATMI
    /// path) that want the cleanup tied to a Rust scope instead.
    pub fn register_pending(
        &mut self,
        queue: &str,
        selector: Selector,
        trid: Trid,
        caller: ProcessHandle,
        correlation: CorrelationId,
    ) -> PendingGuard<'_> {
        self.pending.entry(queue.to_string()).or_default().push_back(PendingDequeue {
            caller,
            correlation,
            selector,
            trid,
        });
        PendingGuard {
            group: self,
            queue: queue.to_string(),
            correlation,
            consumed: false,
        }
    }

    /// `dequeue.forget`: the caller stopped waiting (timeout or
    /// explicit cancel). No-op if the correlation is not registered.
    pub fn forget(&mut self, queue: &str, correlation: CorrelationId) {
        if let Some(waiters) = self.pending.get_mut(queue) {
            waiters.retain(|w| w.correlation != correlation);
        }
    }

    /// Attempt to satisfy every queued waiter on `queue`, in FIFO
    /// order, stopping at the first one the store cannot currently
    /// satisfy (a later waiter with a looser selector must not jump
    /// ahead of an earlier one still blocked, preserving §8's
    /// "earliest waiter first").
    fn drain_ready(&mut self, queue: &str) -> Result<Vec<(ProcessHandle, CorrelationId, MessageRow)>> {
        let mut woken = Vec::new();
        let Some(waiters) = self.pending.get_mut(queue) else {
            return Ok(woken);
        };
        while let Some(front) = waiters.front() {
            match self.store.try_dequeue(queue, &front.selector, &front.trid, SystemTime::now())? {
                Some(row) => {
                    let waiter = waiters.pop_front().unwrap();
                    woken.push((waiter.caller, waiter.correlation, row));
                }
                None => break,
            }
        }
        if waiters.is_empty() {
            self.pending.remove(queue);
        }
        Ok(woken)
    }

    pub fn prepare(&self, trid: &Trid) -> Result<()> {
        self.store.prepare(trid)
    }

    /// `resource.commit`. Also wakes any blocking dequeuers on queues
    /// whose backlog just became visible (an enqueue committed under
    /// this `trid`).
    pub fn commit(&mut self, trid: &Trid, queues: &[String]) -> Result<Vec<(ProcessHandle, CorrelationId, MessageRow)>> {
        self.store.commit(trid)?;
        let mut woken = Vec::new();
        for queue in queues {
            woken.extend(self.drain_ready(queue)?);
        }
        Ok(woken)
    }

    /// `resource.rollback`. Wakes dequeuers on every queue the store
    /// reports as touched (a redelivered row became eligible again, or
    /// a message landed in an error queue).
    pub fn rollback(&mut self, trid: &Trid) -> Result<Vec<(ProcessHandle, CorrelationId, MessageRow)>> {
        let touched = self.store.rollback(trid)?;
        let mut woken = Vec::new();
        for queue in touched {
            woken.extend(self.drain_ready(&queue)?);
        }
        Ok(woken)
    }

    pub fn pending_count(&self, queue: &str) -> usize {
        self.pending.get(queue).map(VecDeque::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn handle(pid: u32) -> ProcessHandle {
        ProcessHandle::new(pid, crate::ids::IpcId::new())
    }

    #[test]
    fn blocking_dequeue_is_woken_by_later_enqueue() {
        let mut group = QueueGroup::open_in_memory().unwrap();
        group.declare_queue("Q", 0, Duration::ZERO, None).unwrap();

        let caller = handle(1);
        let correlation = CorrelationId::new();
        let outcome = group
            .dequeue("Q", Selector::none(), Trid::new(), true, caller, correlation)
            .unwrap();
        assert!(matches!(outcome, DequeueOutcome::Pending));
        assert_eq!(group.pending_count("Q"), 1);

        let (_, woken) = group
            .enqueue("Q", &Trid::NULL, "", CorrelationId::new(), None, "{}", b"payload", SystemTime::now())
            .unwrap();

        assert_eq!(woken.len(), 1);
        assert_eq!(woken[0].0, caller);
        assert_eq!(woken[0].1, correlation);
        assert_eq!(woken[0].2.payload, b"payload");
        assert_eq!(group.pending_count("Q"), 0);
    }

    #[test]
    fn two_waiters_are_woken_earliest_first() {
        let mut group = QueueGroup::open_in_memory().unwrap();
        group.declare_queue("Q", 0, Duration::ZERO, None).unwrap();

        let first = (handle(1), CorrelationId::new());
        let second = (handle(2), CorrelationId::new());
        group.dequeue("Q", Selector::none(), Trid::new(), true, first.0, first.1).unwrap();
        group.dequeue("Q", Selector::none(), Trid::new(), true, second.0, second.1).unwrap();

        let (_, woken) = group
            .enqueue("Q", &Trid::NULL, "", CorrelationId::new(), None, "{}", b"one", SystemTime::now())
            .unwrap();
        assert_eq!(woken.len(), 1);
        assert_eq!(woken[0].1, first.1);
        assert_eq!(group.pending_count("Q"), 1);
    }

    #[test]
    fn forget_removes_a_pending_waiter() {
        let mut group = QueueGroup::open_in_memory().unwrap();
        group.declare_queue("Q", 0, Duration::ZERO, None).unwrap();
        let correlation = CorrelationId::new();
        group.dequeue("Q", Selector::none(), Trid::new(), true, handle(1), correlation).unwrap();
        assert_eq!(group.pending_count("Q"), 1);
        group.forget("Q", correlation);
        assert_eq!(group.pending_count("Q"), 0);
    }

    #[test]
    fn pending_guard_forgets_on_drop_unless_consumed() {
        let mut group = QueueGroup::open_in_memory().unwrap();
        group.declare_queue("Q", 0, Duration::ZERO, None).unwrap();
        let correlation = CorrelationId::new();
        {
            let _guard = group.register_pending("Q", Selector::none(), Trid::new(), handle(1), correlation);
        }
        assert_eq!(group.pending_count("Q"), 0);
    }

    #[test]
    fn rollback_wakes_dequeuers_when_redelivered_row_becomes_eligible() {
        let mut group = QueueGroup::open_in_memory().unwrap();
        group.declare_queue("Q", 5, Duration::ZERO, None).unwrap();
        group
            .enqueue("Q", &Trid::NULL, "", CorrelationId::new(), None, "{}", b"m", SystemTime::now())
            .unwrap();

        let dequeue_trid = Trid::new();
        match group
            .dequeue("Q", Selector::none(), dequeue_trid, false, handle(1), CorrelationId::new())
            .unwrap()
        {
            DequeueOutcome::Immediate(Some(_)) => {}
            _ => panic!("expected immediate dequeue"),
        }

        let waiter_correlation = CorrelationId::new();
        group
            .dequeue("Q", Selector::none(), Trid::new(), true, handle(2), waiter_correlation)
            .unwrap();

        let woken = group.rollback(&dequeue_trid).unwrap();
        assert_eq!(woken.len(), 1);
        assert_eq!(woken[0].1, waiter_correlation);
    }
}
