//! The per-domain service directory: advertise, lookup, reserve/ack,
//! routes, restrictions, and prepare-shutdown (§4.4).

use super::instance::{
    ConcurrentInstance, InstanceState, SequentialInstance, ServiceDescriptor, ServiceEntry,
};
use crate::ids::{CorrelationId, ProcessHandle};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupContext {
    Regular,
    NoBusyIntermediate,
    Wait,
    Forward,
}

/// Who ended up reserved for a lookup, distinguishing a local instance
/// (directly reserved, `busy` cleared on ACK) from a concurrent one
/// (no busy state to track; the gateway owns call accounting).
#[derive(Debug, Clone, Copy)]
pub enum Provider {
    Sequential(ProcessHandle),
    Concurrent(ProcessHandle),
}

#[derive(Debug, Clone, Copy)]
pub enum LookupReply {
    Idle(Provider),
    Busy,
    Absent,
    Timeout,
}

/// Either an immediate reply or a note that the lookup was queued and
/// will be answered later (by [`ServiceDirectory::drain_pending`] or a
/// deadline firing).
pub enum LookupOutcome {
    Immediate(LookupReply),
    Pending,
}

struct PendingLookup {
    caller: ProcessHandle,
    correlation: CorrelationId,
    context: LookupContext,
}

#[derive(Default)]
pub struct ServiceDirectory {
    entries: HashMap<String, ServiceEntry>,
    /// route name -> backing alias, per §4.4's routes.
    routes: HashMap<String, String>,
    pending: HashMap<String, Vec<PendingLookup>>,
    restrictions: HashMap<ProcessHandle, Vec<String>>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record which service names `process` is permitted to advertise.
    /// An advertise for any other name is silently dropped.
    pub fn set_restriction(&mut self, process: ProcessHandle, allowed: Vec<String>) {
        self.restrictions.insert(process, allowed);
    }

    fn is_permitted(&self, process: ProcessHandle, name: &str) -> bool {
        match self.restrictions.get(&process) {
            Some(allowed) => allowed.iter().any(|allowed_name| allowed_name == name),
            None => true,
        }
    }

    pub fn add_route(&mut self, route: impl Into<String>, alias: impl Into<String>) {
        self.routes.insert(route.into(), alias.into());
    }

    fn canonical_name<'a>(&'a self, requested: &'a str) -> &'a str {
        self.routes
            .get(requested)
            .map(String::as_str)
            .unwrap_or(requested)
    }

    /// `service.advertise { alias, add, remove }` from a local server.
    /// Returns the names dropped by a restriction plus any pending
    /// `Wait`/`NoBusyIntermediate` lookups this advertise just satisfied,
    /// so the caller can deliver their replies.
    pub fn advertise(
        &mut self,
        process: ProcessHandle,
        alias: &str,
        add: &[String],
        remove: &[String],
    ) -> (Vec<String>, Vec<(ProcessHandle, CorrelationId, LookupReply)>) {
        let mut dropped = Vec::new();
        let mut woken = Vec::new();
        for name in add {
            if !self.is_permitted(process, name) {
                dropped.push(name.clone());
                continue;
            }
            let entry = self.entries.entry(name.clone()).or_insert_with(|| {
                ServiceEntry::new(ServiceDescriptor {
                    name: name.clone(),
                    category: String::new(),
                    transaction_policy: super::instance::TransactionPolicy::Auto,
                    timeout: None,
                    contract: super::instance::TimeoutContract::Linger,
                })
            });
            entry.sequential.push(SequentialInstance::new(process, alias));
            woken.extend(self.wake_pending(name));
        }
        for name in remove {
            self.detach_sequential(name, process);
        }
        (dropped, woken)
    }

    /// `service.concurrent.advertise { alias, order, add, remove, reset }`
    /// from a gateway outbound.
    pub fn concurrent_advertise(
        &mut self,
        gateway: ProcessHandle,
        add: &[(String, ConcurrentInstance)],
        remove: &[String],
        reset: bool,
    ) -> Vec<(ProcessHandle, CorrelationId, LookupReply)> {
        if reset {
            for entry in self.entries.values_mut() {
                entry.concurrent.retain(|instance| instance.gateway != gateway);
            }
        }
        let mut woken = Vec::new();
        for (name, instance) in add {
            let entry = self.entries.entry(name.clone()).or_insert_with(|| {
                ServiceEntry::new(ServiceDescriptor {
                    name: name.clone(),
                    category: String::new(),
                    transaction_policy: super::instance::TransactionPolicy::Auto,
                    timeout: None,
                    contract: super::instance::TimeoutContract::Linger,
                })
            });
            entry.concurrent.push(*instance);
            entry.resort_concurrent();
            woken.extend(self.wake_pending(name));
        }
        for name in remove {
            if let Some(entry) = self.entries.get_mut(name) {
                entry.concurrent.retain(|instance| instance.gateway != gateway);
                self.remove_if_empty(name);
            }
        }
        woken
    }

    fn detach_sequential(&mut self, name: &str, process: ProcessHandle) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.sequential.retain(|instance| instance.process != process);
            self.remove_if_empty(name);
        }
    }

    fn remove_if_empty(&mut self, name: &str) {
        let should_remove = self
            .entries
            .get(name)
            .map(|entry| entry.is_empty() && entry.routes.is_empty())
            .unwrap_or(false)
            && !self.pending.get(name).map(|p| !p.is_empty()).unwrap_or(false);
        if should_remove {
            self.entries.remove(name);
        }
    }

    /// `lookup.request { requested, context, deadline? }`, per the
    /// context table in §4.4.
    pub fn lookup(
        &mut self,
        requested: &str,
        caller: ProcessHandle,
        correlation: CorrelationId,
        context: LookupContext,
    ) -> LookupOutcome {
        let name = self.canonical_name(requested).to_string();

        let reply = match self.entries.get_mut(&name) {
            None => None,
            Some(entry) => {
                if let Some(index) = entry.idle_sequential_index() {
                    entry.sequential[index].reserve(caller, correlation);
                    Some(LookupReply::Idle(Provider::Sequential(
                        entry.sequential[index].process,
                    )))
                } else if let Some(best) = entry.concurrent.first() {
                    Some(LookupReply::Idle(Provider::Concurrent(best.gateway)))
                } else if entry.any_busy() {
                    Some(LookupReply::Busy)
                } else {
                    None
                }
            }
        };

        match (context, reply) {
            (_, Some(LookupReply::Idle(provider))) => LookupOutcome::Immediate(LookupReply::Idle(provider)),
            (LookupContext::Regular, Some(LookupReply::Busy)) => LookupOutcome::Immediate(LookupReply::Busy),
            (LookupContext::Forward, Some(LookupReply::Busy)) => {
                // Forward tolerates reserving a busy sequential instance;
                // there is nothing idle or concurrent, so surface busy
                // rather than block, since forwards never wait.
                LookupOutcome::Immediate(LookupReply::Busy)
            }
            (LookupContext::Regular, None) | (LookupContext::Forward, None) => {
                LookupOutcome::Immediate(LookupReply::Absent)
            }
            (LookupContext::NoBusyIntermediate, None) => LookupOutcome::Immediate(LookupReply::Absent),
            (LookupContext::NoBusyIntermediate, Some(LookupReply::Busy)) | (LookupContext::Wait, _) => {
                self.pending.entry(name).or_default().push(PendingLookup {
                    caller,
                    correlation,
                    context,
                });
                LookupOutcome::Pending
            }
        }
    }

    /// Drain one pending lookup for `name`, called after an advertise or
    /// an ACK frees an instance. Returns the reply to deliver, if a
    /// waiter could be satisfied.
    fn wake_pending(&mut self, name: &str) -> Option<(ProcessHandle, CorrelationId, LookupReply)> {
        let waiters = self.pending.get_mut(name)?;
        if waiters.is_empty() {
            return None;
        }
        let entry = self.entries.get_mut(name)?;
        let provider = if let Some(index) = entry.idle_sequential_index() {
            let waiter = waiters.remove(0);
            entry.sequential[index].reserve(waiter.caller, waiter.correlation);
            Some((waiter.caller, waiter.correlation, Provider::Sequential(entry.sequential[index].process)))
        } else {
            entry.concurrent.first().map(|best| {
                let waiter = waiters.remove(0);
                (waiter.caller, waiter.correlation, Provider::Concurrent(best.gateway))
            })
        };
        provider.map(|(caller, correlation, provider)| (caller, correlation, LookupReply::Idle(provider)))
    }

    /// `service.acknowledge { metric }`: the server completed its call.
    /// Transitions the instance back to idle, updates metrics, and
    /// drains one pending lookup if any is queued. If the instance was
    /// marked shutdown-pending while busy, it is extracted now instead of
    /// being offered to the next lookup, and
    /// [`AcknowledgeOutcome::shutdown_ready`] reports it so the caller can
    /// finally let that process exit.
    pub fn acknowledge(&mut self, process: ProcessHandle, pending_wait: Duration) -> AcknowledgeOutcome {
        let mut name_found = None;
        let mut shutdown_ready = None;
        for (name, entry) in self.entries.iter_mut() {
            if let Some(index) = entry
                .sequential
                .iter()
                .position(|instance| instance.process == process && instance.state() == InstanceState::Busy)
            {
                entry.sequential[index].acknowledge();
                entry.metrics.record_call(pending_wait, false);
                if entry.sequential[index].is_shutdown_pending() {
                    entry.sequential.remove(index);
                    shutdown_ready = Some(process);
                }
                name_found = Some(name.clone());
                break;
            }
        }
        let woken = name_found.and_then(|name| {
            let woken = self.wake_pending(&name);
            self.remove_if_empty(&name);
            woken
        });
        AcknowledgeOutcome { woken, shutdown_ready }
    }

    /// Synthesize a failure ACK for every reservation held by a process
    /// that just died, per §4.4's "directory synthesizes an ACK with a
    /// failure metric" behavior.
    pub fn fail_process(&mut self, process: ProcessHandle) -> Vec<(ProcessHandle, CorrelationId)> {
        let mut surfaced = Vec::new();
        for entry in self.entries.values_mut() {
            for instance in &mut entry.sequential {
                if instance.process == process {
                    if let Some(reservation) = instance.acknowledge() {
                        surfaced.push((reservation.caller, reservation.correlation));
                    }
                }
            }
        }
        surfaced
    }

    /// `prepare-shutdown(processes)`: extract every idle instance owned by
    /// `processes` immediately; a busy one is only marked
    /// shutdown-pending (§9, resolved — shutdown is honored only between
    /// calls) and extracted later, when its in-flight call is
    /// acknowledged (see [`ServiceDirectory::acknowledge`]).
    pub fn prepare_shutdown(&mut self, processes: &[ProcessHandle]) -> PrepareShutdownResult {
        let mut result = PrepareShutdownResult::default();
        let known: std::collections::HashSet<ProcessHandle> = self
            .entries
            .values()
            .flat_map(|entry| entry.sequential.iter().map(|instance| instance.process))
            .collect();

        for process in processes {
            if !known.contains(process) {
                result.unknown.push(*process);
            }
        }

        let names: Vec<String> = self.entries.keys().cloned().collect();
        for name in names {
            let mut extracted_here = Vec::new();
            if let Some(entry) = self.entries.get_mut(&name) {
                for instance in &mut entry.sequential {
                    if !processes.contains(&instance.process) {
                        continue;
                    }
                    if instance.state() == InstanceState::Idle {
                        extracted_here.push(instance.process);
                    } else {
                        instance.mark_shutdown_pending();
                        result.deferred_sequential.push(instance.process);
                    }
                }
                entry.sequential.retain(|instance| !extracted_here.contains(&instance.process));
            }
            result.extracted_sequential.extend(extracted_here);
            let gone_empty = self
                .entries
                .get(&name)
                .map(|entry| entry.is_empty())
                .unwrap_or(false);
            if gone_empty {
                self.entries.remove(&name);
                result.services_gone_empty.push(name);
            }
        }
        result
    }

    pub fn entry_exists(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn pending_count(&self, name: &str) -> usize {
        self.pending.get(name).map(Vec::len).unwrap_or(0)
    }

    /// A `lookup.request`'s `deadline?` fired before it could be
    /// satisfied (driven by `dispatch::DeadlineWheel::drain_expired` in
    /// the owning process's pump). Removes the waiter and returns who to
    /// reply `LookupReply::Timeout` to, if `correlation` was still
    /// pending.
    pub fn expire(&mut self, correlation: CorrelationId) -> Option<ProcessHandle> {
        let mut found = None;
        let mut emptied_name = None;
        for (name, waiters) in self.pending.iter_mut() {
            if let Some(index) = waiters.iter().position(|w| w.correlation == correlation) {
                found = Some(waiters.remove(index).caller);
                if waiters.is_empty() {
                    emptied_name = Some(name.clone());
                }
                break;
            }
        }
        if let Some(name) = emptied_name {
            self.pending.remove(&name);
            self.remove_if_empty(&name);
        }
        found
    }
}

#[derive(Debug, Default)]
pub struct PrepareShutdownResult {
    pub services_gone_empty: Vec<String>,
    pub extracted_sequential: Vec<ProcessHandle>,
    /// Busy instances marked shutdown-pending rather than extracted
    /// immediately; each reappears in a later [`AcknowledgeOutcome`]
    /// once its in-flight call completes.
    pub deferred_sequential: Vec<ProcessHandle>,
    pub unknown: Vec<ProcessHandle>,
}

/// Result of [`ServiceDirectory::acknowledge`]: a pending lookup it was
/// able to satisfy, plus whether this ACK also completed a deferred
/// shutdown extraction.
#[derive(Debug, Default)]
pub struct AcknowledgeOutcome {
    pub woken: Option<(ProcessHandle, CorrelationId, LookupReply)>,
    pub shutdown_ready: Option<ProcessHandle>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(pid: u32) -> ProcessHandle {
        ProcessHandle::new(pid, crate::ids::IpcId::new())
    }

    #[test]
    fn s2_sequential_lookup_scenario() {
        let mut directory = ServiceDirectory::new();
        let p1 = handle(1);
        directory.advertise(p1, "ECHO", &["ECHO".to_string()], &[]);

        let caller = handle(2);
        let c1 = CorrelationId::new();
        let outcome = directory.lookup("ECHO", caller, c1, LookupContext::Regular);
        assert!(matches!(
            outcome,
            LookupOutcome::Immediate(LookupReply::Idle(Provider::Sequential(_)))
        ));

        let c2 = CorrelationId::new();
        let outcome = directory.lookup("ECHO", caller, c2, LookupContext::Regular);
        assert!(matches!(outcome, LookupOutcome::Immediate(LookupReply::Busy)));

        directory.acknowledge(p1, Duration::from_millis(1));

        let c3 = CorrelationId::new();
        let outcome = directory.lookup("ECHO", caller, c3, LookupContext::Regular);
        assert!(matches!(
            outcome,
            LookupOutcome::Immediate(LookupReply::Idle(Provider::Sequential(_)))
        ));
    }

    #[test]
    fn s3_concurrent_tie_break_scenario() {
        use super::super::instance::OrderProperty;
        let mut directory = ServiceDirectory::new();
        let g1 = handle(10);
        let g2 = handle(20);

        directory.concurrent_advertise(
            g1,
            &[(
                "ECHO".to_string(),
                ConcurrentInstance {
                    gateway: g1,
                    property: OrderProperty::Configured,
                    order: 10,
                    hops: 1,
                },
            )],
            &[],
            false,
        );
        directory.concurrent_advertise(
            g2,
            &[(
                "ECHO".to_string(),
                ConcurrentInstance {
                    gateway: g2,
                    property: OrderProperty::Discovered,
                    order: 1,
                    hops: 0,
                },
            )],
            &[],
            false,
        );

        let caller = handle(2);
        let outcome = directory.lookup("ECHO", caller, CorrelationId::new(), LookupContext::Regular);
        match outcome {
            LookupOutcome::Immediate(LookupReply::Idle(Provider::Concurrent(gateway))) => {
                assert_eq!(gateway, g1);
            }
            _ => panic!("expected concurrent idle reply favoring configured g1"),
        }
    }

    #[test]
    fn shutdown_mid_call_is_deferred_until_acknowledge() {
        let mut directory = ServiceDirectory::new();
        let p1 = handle(1);
        directory.advertise(p1, "ECHO", &["ECHO".to_string()], &[]);

        let caller = handle(2);
        directory.lookup("ECHO", caller, CorrelationId::new(), LookupContext::Regular);

        let result = directory.prepare_shutdown(&[p1]);
        assert!(result.extracted_sequential.is_empty());
        assert_eq!(result.deferred_sequential, vec![p1]);
        assert!(directory.entry_exists("ECHO"));

        let outcome = directory.acknowledge(p1, Duration::from_millis(1));
        assert_eq!(outcome.shutdown_ready, Some(p1));
        assert!(!directory.entry_exists("ECHO"));
    }

    #[test]
    fn lookup_for_unknown_service_is_absent() {
        let mut directory = ServiceDirectory::new();
        let outcome = directory.lookup("MISSING", handle(1), CorrelationId::new(), LookupContext::Regular);
        assert!(matches!(outcome, LookupOutcome::Immediate(LookupReply::Absent)));
    }

    #[test]
    fn wait_context_queues_when_service_is_absent() {
        let mut directory = ServiceDirectory::new();
        let outcome = directory.lookup("ECHO", handle(1), CorrelationId::new(), LookupContext::Wait);
        assert!(matches!(outcome, LookupOutcome::Pending));
        assert_eq!(directory.pending_count("ECHO"), 1);
    }

    #[test]
    fn restricted_advertise_is_dropped() {
        let mut directory = ServiceDirectory::new();
        let p1 = handle(1);
        directory.set_restriction(p1, vec!["ALLOWED".to_string()]);
        let (dropped, woken) = directory.advertise(p1, "ECHO", &["FORBIDDEN".to_string()], &[]);
        assert_eq!(dropped, vec!["FORBIDDEN".to_string()]);
        assert!(woken.is_empty());
        assert!(!directory.entry_exists("FORBIDDEN"));
    }

    #[test]
    fn s6_expire_removes_a_pending_wait_lookup() {
        let mut directory = ServiceDirectory::new();
        let caller = handle(1);
        let correlation = CorrelationId::new();
        let outcome = directory.lookup("ECHO", caller, correlation, LookupContext::Wait);
        assert!(matches!(outcome, LookupOutcome::Pending));

        let expired_caller = directory.expire(correlation);
        assert_eq!(expired_caller, Some(caller));
        assert_eq!(directory.pending_count("ECHO"), 0);
        assert!(!directory.entry_exists("ECHO"));
    }

    #[test]
    fn prepare_shutdown_extracts_instances_and_reports_gone_empty() {
        let mut directory = ServiceDirectory::new();
        let p1 = handle(1);
        directory.advertise(p1, "ECHO", &["ECHO".to_string()], &[]);

        let result = directory.prepare_shutdown(&[p1]);
        assert_eq!(result.extracted_sequential, vec![p1]);
        assert_eq!(result.services_gone_empty, vec!["ECHO".to_string()]);
    }
}
