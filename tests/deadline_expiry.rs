//! S6: a `lookup.request`'s deadline firing is driven by
//! `dispatch::DeadlineWheel::drain_expired` in the owning process's pump,
//! which then calls `service::directory::ServiceDirectory::expire` for
//! each expired correlation — exactly the cross-component wiring
//! `ServiceDirectory::expire`'s own doc comment describes. This exercises
//! both sides together rather than either module's expiry logic alone.

use casual_core::dispatch::deadline::DeadlineWheel;
use casual_core::ids::{CorrelationId, IpcId, ProcessHandle};
use casual_core::service::directory::{LookupContext, LookupOutcome, ServiceDirectory};
use std::time::{Duration, Instant};

fn handle(pid: u32) -> ProcessHandle {
    ProcessHandle::new(pid, IpcId::new())
}

#[test]
fn an_expired_wait_lookup_is_torn_down_end_to_end() {
    let mut directory = ServiceDirectory::new();
    let mut deadlines = DeadlineWheel::new();

    let caller = handle(1);
    let correlation = CorrelationId::new();

    let outcome = directory.lookup("SLOW", caller, correlation, LookupContext::Wait);
    assert!(matches!(outcome, LookupOutcome::Pending));
    deadlines.add(correlation, Duration::from_millis(0));
    assert_eq!(directory.pending_count("SLOW"), 1);

    // Advance past the deadline and drain it from the pump's side.
    let expired = deadlines.drain_expired(Instant::now() + Duration::from_millis(5));
    assert_eq!(expired, vec![correlation]);

    // Hand each expired correlation to the directory; it should find
    // and remove exactly the waiter that owned it.
    for expired_correlation in expired {
        let timed_out_caller = directory.expire(expired_correlation);
        assert_eq!(timed_out_caller, Some(caller));
    }
    assert_eq!(directory.pending_count("SLOW"), 0);
    assert!(!directory.entry_exists("SLOW"), "an empty service entry with no waiters must be cleaned up");
}

#[test]
fn a_reply_that_beats_the_deadline_cancels_it_cleanly() {
    let mut directory = ServiceDirectory::new();
    let mut deadlines = DeadlineWheel::new();

    let server = handle(1);
    directory.advertise(server, "FAST", &["FAST".to_string()], &[]);

    let caller = handle(2);
    let correlation = CorrelationId::new();
    deadlines.add(correlation, Duration::from_secs(30));

    // The lookup resolves immediately (an idle instance exists), so the
    // caller side cancels the deadline it had armed rather than waiting
    // for it to fire.
    let outcome = directory.lookup("FAST", caller, correlation, LookupContext::Regular);
    assert!(matches!(outcome, LookupOutcome::Immediate(_)));
    deadlines.cancel(correlation);

    let expired = deadlines.drain_expired(Instant::now() + Duration::from_secs(60));
    assert!(expired.is_empty(), "a cancelled deadline must never fire, even long after its original due time");
    assert!(deadlines.is_empty());
}

#[test]
fn multiple_waiters_expire_independently_by_their_own_deadline() {
    let mut directory = ServiceDirectory::new();
    let mut deadlines = DeadlineWheel::new();

    let soon_caller = handle(1);
    let soon_correlation = CorrelationId::new();
    directory.lookup("SHARED", soon_caller, soon_correlation, LookupContext::Wait);
    deadlines.add(soon_correlation, Duration::from_millis(0));

    let later_caller = handle(2);
    let later_correlation = CorrelationId::new();
    directory.lookup("SHARED", later_caller, later_correlation, LookupContext::Wait);
    deadlines.add(later_correlation, Duration::from_secs(60));

    assert_eq!(directory.pending_count("SHARED"), 2);

    let expired = deadlines.drain_expired(Instant::now() + Duration::from_millis(5));
    assert_eq!(expired, vec![soon_correlation]);
    assert_eq!(directory.expire(soon_correlation), Some(soon_caller));

    // The later waiter is untouched — still registered, not yet due.
    assert_eq!(directory.pending_count("SHARED"), 1);
    assert!(directory.entry_exists("SHARED"));
}
