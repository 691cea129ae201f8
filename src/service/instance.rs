//! Service entries and their provider instances: sequential (local) and
//! concurrent (gateway-backed), per §3/§4.4.
//!
//! Grounded on the teacher crate's `HashMap<ConnectionId, UnixStream>`
//! connection table in `ipc/unix_domain_socket.rs` for the "own state by
//! a stable id in a map, never a back-pointer" shape the arena design
//! note (§9) calls for; sequential/concurrent ordering is new, grounded
//! directly on §3's descriptions since nothing in the pack models tiered
//! instance preference.

use crate::ids::{CorrelationId, ProcessHandle};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Idle,
    Busy,
}

/// A sequential instance's reservation: who holds it and for which
/// call, cleared on ACK.
#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    pub caller: ProcessHandle,
    pub correlation: CorrelationId,
}

/// An instance owned by a local server process (§3). Exactly one
/// reservation may be outstanding at a time.
pub struct SequentialInstance {
    pub process: ProcessHandle,
    pub alias: String,
    state: InstanceState,
    reservation: Option<Reservation>,
    /// Used to break ties among otherwise-equal idle instances: fewer
    /// recent invocations is preferred, per §4.4's tie-break rule.
    pub recent_invocations: u64,
    /// Set by `prepare-shutdown` when this instance was busy at the time:
    /// shutdown is honored only between calls, never mid-call (§9,
    /// resolved), so extraction is deferred until the in-flight call's ACK
    /// arrives instead of yanking the instance out from under a caller.
    shutdown_pending: bool,
}

impl SequentialInstance {
    pub fn new(process: ProcessHandle, alias: impl Into<String>) -> Self {
        Self {
            process,
            alias: alias.into(),
            state: InstanceState::Idle,
            reservation: None,
            recent_invocations: 0,
            shutdown_pending: false,
        }
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn reservation(&self) -> Option<Reservation> {
        self.reservation
    }

    pub fn is_shutdown_pending(&self) -> bool {
        self.shutdown_pending
    }

    pub fn mark_shutdown_pending(&mut self) {
        self.shutdown_pending = true;
    }

    /// Idle -> busy. Panics if already busy: callers must check
    /// `state()` first: the directory never double-reserves.
    pub fn reserve(&mut self, caller: ProcessHandle, correlation: CorrelationId) {
        assert_eq!(self.state, InstanceState::Idle, "reserving an already-busy instance");
        self.state = InstanceState::Busy;
        self.reservation = Some(Reservation { caller, correlation });
    }

    /// Busy -> idle, on ACK or on synthesized failure ACK for a dead
    /// process.
    pub fn acknowledge(&mut self) -> Option<Reservation> {
        self.state = InstanceState::Idle;
        self.recent_invocations += 1;
        self.reservation.take()
    }
}

/// The ordering key a concurrent instance advertises: smaller sorts
/// first, and `Configured` always strictly beats `Discovered`
/// regardless of `order`/`hops` (§3, scenario S3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OrderProperty {
    Configured,
    Discovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrentInstance {
    pub gateway: ProcessHandle,
    pub property: OrderProperty,
    pub order: u32,
    pub hops: u32,
}

impl ConcurrentInstance {
    fn sort_key(&self) -> (OrderProperty, u32, u32) {
        (self.property, self.order, self.hops)
    }
}

impl PartialOrd for ConcurrentInstance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ConcurrentInstance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPolicy {
    Auto,
    Join,
    Atomic,
    None,
    Branch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutContract {
    Linger,
    Kill,
    Terminate,
}

#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub category: String,
    pub transaction_policy: TransactionPolicy,
    pub timeout: Option<std::time::Duration>,
    pub contract: TimeoutContract,
}

impl PartialEq for ServiceDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
impl Eq for ServiceDescriptor {}

/// A service entry in the directory: one per distinct service name,
/// created on first advertise, destroyed once instance-less with no
/// routes and no pending lookups (§3).
pub struct ServiceEntry {
    pub descriptor: ServiceDescriptor,
    pub sequential: Vec<SequentialInstance>,
    pub concurrent: Vec<ConcurrentInstance>,
    pub routes: Vec<String>,
    pub metrics: super::metrics::ServiceMetrics,
}

impl ServiceEntry {
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Self {
            descriptor,
            sequential: Vec::new(),
            concurrent: Vec::new(),
            routes: Vec::new(),
            metrics: super::metrics::ServiceMetrics::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sequential.is_empty() && self.concurrent.is_empty()
    }

    /// Re-sort concurrent instances by their ordering key so the best
    /// candidate is always at the front, per §4.4.
    pub fn resort_concurrent(&mut self) {
        self.concurrent.sort();
    }

    pub fn idle_sequential_index(&self) -> Option<usize> {
        self.sequential
            .iter()
            .enumerate()
            .filter(|(_, instance)| instance.state() == InstanceState::Idle)
            .min_by_key(|(_, instance)| instance.recent_invocations)
            .map(|(index, _)| index)
    }

    pub fn any_busy(&self) -> bool {
        self.sequential
            .iter()
            .any(|instance| instance.state() == InstanceState::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(pid: u32) -> ProcessHandle {
        ProcessHandle::new(pid, crate::ids::IpcId::new())
    }

    #[test]
    fn configured_strictly_beats_discovered_regardless_of_order_and_hops() {
        let configured = ConcurrentInstance {
            gateway: handle(1),
            property: OrderProperty::Configured,
            order: 10,
            hops: 1,
        };
        let discovered = ConcurrentInstance {
            gateway: handle(2),
            property: OrderProperty::Discovered,
            order: 1,
            hops: 0,
        };
        assert!(configured < discovered);
    }

    #[test]
    fn reserve_then_acknowledge_round_trips_idle_state() {
        let mut instance = SequentialInstance::new(handle(1), "ECHO");
        assert_eq!(instance.state(), InstanceState::Idle);

        let caller = handle(2);
        let correlation = CorrelationId::new();
        instance.reserve(caller, correlation);
        assert_eq!(instance.state(), InstanceState::Busy);

        let reservation = instance.acknowledge().unwrap();
        assert_eq!(reservation.correlation, correlation);
        assert_eq!(instance.state(), InstanceState::Idle);
        assert_eq!(instance.recent_invocations, 1);
    }

    #[test]
    fn idle_sequential_prefers_fewest_recent_invocations() {
        let mut entry = ServiceEntry::new(ServiceDescriptor {
            name: "ECHO".into(),
            category: String::new(),
            transaction_policy: TransactionPolicy::Auto,
            timeout: None,
            contract: TimeoutContract::Linger,
        });
        let mut busy_before = SequentialInstance::new(handle(1), "ECHO");
        busy_before.recent_invocations = 5;
        entry.sequential.push(busy_before);
        entry.sequential.push(SequentialInstance::new(handle(2), "ECHO"));

        assert_eq!(entry.idle_sequential_index(), Some(1));
    }
}
