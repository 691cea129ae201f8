//! Cross-scenario coverage for the service directory (§4.4) that the
//! colocated unit tests don't already exercise: FIFO ordering among
//! multiple queued waiters, and a reservation holder dying mid-call
//! (§8 invariant 3 — the caller observes a failure, not a hang).

use casual_core::ids::{CorrelationId, IpcId, ProcessHandle};
use casual_core::service::directory::{LookupContext, LookupOutcome, LookupReply, Provider, ServiceDirectory};
use std::time::Duration;

fn handle(pid: u32) -> ProcessHandle {
    ProcessHandle::new(pid, IpcId::new())
}

#[test]
fn multiple_waiters_are_woken_in_fifo_order() {
    let mut directory = ServiceDirectory::new();
    let server = handle(1);
    directory.advertise(server, "ECHO", &["ECHO".to_string()], &[]);

    // Reserve the only instance, then queue three more callers behind it.
    let first_caller = handle(2);
    let outcome = directory.lookup("ECHO", first_caller, CorrelationId::new(), LookupContext::Regular);
    assert!(matches!(outcome, LookupOutcome::Immediate(LookupReply::Idle(_))));

    let waiters: Vec<(ProcessHandle, CorrelationId)> = (10..13).map(|pid| (handle(pid), CorrelationId::new())).collect();
    for (caller, correlation) in &waiters {
        let outcome = directory.lookup("ECHO", *caller, *correlation, LookupContext::Wait);
        assert!(matches!(outcome, LookupOutcome::Pending));
    }
    assert_eq!(directory.pending_count("ECHO"), 3);

    // Each acknowledge frees the instance and should wake exactly the
    // earliest still-queued waiter, never a later one out of turn.
    for (expected_caller, expected_correlation) in &waiters {
        let outcome = directory.acknowledge(server, Duration::from_millis(1));
        let (woken_caller, woken_correlation, reply) = outcome.woken.expect("a waiter should have been woken");
        assert_eq!(woken_caller, *expected_caller);
        assert_eq!(woken_correlation, *expected_correlation);
        assert!(matches!(reply, LookupReply::Idle(Provider::Sequential(p)) if p == server));
    }
    assert_eq!(directory.pending_count("ECHO"), 0);
}

#[test]
fn reservation_holder_dying_surfaces_a_failure_for_its_caller() {
    let mut directory = ServiceDirectory::new();
    let server = handle(1);
    directory.advertise(server, "ECHO", &["ECHO".to_string()], &[]);

    let caller = handle(2);
    let correlation = CorrelationId::new();
    let outcome = directory.lookup("ECHO", caller, correlation, LookupContext::Regular);
    assert!(matches!(outcome, LookupOutcome::Immediate(LookupReply::Idle(Provider::Sequential(_)))));

    // The server dies while the reservation is still outstanding; the
    // directory must surface a failure to exactly the caller holding it.
    let surfaced = directory.fail_process(server);
    assert_eq!(surfaced, vec![(caller, correlation)]);

    // A second death report for the same (now-cleared) process surfaces
    // nothing further — it is not still holding anything.
    assert!(directory.fail_process(server).is_empty());
}

#[test]
fn concurrent_instance_removed_on_gateway_withdrawal_falls_back_to_absent() {
    use casual_core::service::instance::{ConcurrentInstance, OrderProperty};

    let mut directory = ServiceDirectory::new();
    let gateway = handle(100);
    directory.concurrent_advertise(
        gateway,
        &[(
            "REMOTE".to_string(),
            ConcurrentInstance { gateway, property: OrderProperty::Configured, order: 0, hops: 1 },
        )],
        &[],
        false,
    );

    let caller = handle(2);
    let outcome = directory.lookup("REMOTE", caller, CorrelationId::new(), LookupContext::Regular);
    assert!(matches!(outcome, LookupOutcome::Immediate(LookupReply::Idle(Provider::Concurrent(g))) if g == gateway));

    // Gateway withdraws everything it advertised (e.g. the peer connection dropped).
    directory.concurrent_advertise(gateway, &[], &["REMOTE".to_string()], false);
    let outcome = directory.lookup("REMOTE", caller, CorrelationId::new(), LookupContext::Regular);
    assert!(matches!(outcome, LookupOutcome::Immediate(LookupReply::Absent)));
}
