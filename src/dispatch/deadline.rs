//! Min-heap of outstanding deadlines, drained from a pump's prelude hook.
//!
//! Grounded on the teacher crate's timeout handling in
//! `ipc/tcp_socket.rs` (`tokio::time::timeout` wrapping a single write),
//! generalized here into a standing registry so a service manager or
//! gateway can track many concurrent awaited replies at once rather than
//! one `timeout()` future per call. `Duration::ZERO` is the "no timeout"
//! sentinel carried over from the original's mixed-unit time handling
//! (§9, resolved); callers must check [`crate::error::is_no_timeout`]
//! before calling [`DeadlineWheel::add`].

use crate::ids::CorrelationId;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    when: Instant,
    correlation: CorrelationId,
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.when.cmp(&other.when)
    }
}

/// A min-heap of `(deadline, correlation-id)` pairs. `drain_expired`
/// pops everything due by `now`, including entries cancelled since
/// insertion (cancellation just removes the correlation from `live`, so
/// a stale heap entry is silently skipped when it surfaces).
#[derive(Default)]
pub struct DeadlineWheel {
    heap: BinaryHeap<Reverse<Entry>>,
    live: std::collections::HashSet<CorrelationId>,
}

impl DeadlineWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `correlation` to expire after `timeout` from now. Caller
    /// must have already checked `timeout` is not the no-timeout
    /// sentinel.
    pub fn add(&mut self, correlation: CorrelationId, timeout: Duration) {
        let when = Instant::now() + timeout;
        self.heap.push(Reverse(Entry { when, correlation }));
        self.live.insert(correlation);
    }

    /// Cancel a pending deadline, e.g. because the awaited reply
    /// arrived. No-op if `correlation` isn't scheduled.
    pub fn cancel(&mut self, correlation: CorrelationId) {
        self.live.remove(&correlation);
    }

    /// Pop every correlation whose deadline is at or before `now`,
    /// skipping entries cancelled in the meantime.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<CorrelationId> {
        let mut expired = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.when > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            if self.live.remove(&entry.correlation) {
                expired.push(entry.correlation);
            }
        }
        expired
    }

    /// The soonest still-live deadline, if any; a pump's poll timeout
    /// can be clamped to this instead of a fixed idle interval.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap
            .iter()
            .filter(|Reverse(e)| self.live.contains(&e.correlation))
            .map(|Reverse(e)| e.when)
            .min()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_only_entries_due_by_now() {
        let mut wheel = DeadlineWheel::new();
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        let now = Instant::now();

        wheel.add(a, Duration::from_millis(0));
        wheel.add(b, Duration::from_secs(60));

        let expired = wheel.drain_expired(now + Duration::from_millis(1));
        assert_eq!(expired, vec![a]);
        assert!(!wheel.is_empty());
    }

    #[test]
    fn cancelled_entry_never_expires() {
        let mut wheel = DeadlineWheel::new();
        let a = CorrelationId::new();
        wheel.add(a, Duration::from_millis(0));
        wheel.cancel(a);

        let expired = wheel.drain_expired(Instant::now() + Duration::from_secs(1));
        assert!(expired.is_empty());
        assert!(wheel.is_empty());
    }
}
