//! S5 / invariant 7: for a fan-out over N targets, the round completes
//! exactly once and reports exactly one outcome per target, whether it
//! resolved normally or failed along with a whole peer going away.

use casual_core::dispatch::coordinate::{Coordinate, Outcome};
use casual_core::ids::CorrelationId;

#[test]
fn partial_failure_still_yields_exactly_one_outcome_per_target() {
    let domain_a_1 = CorrelationId::new();
    let domain_a_2 = CorrelationId::new();
    let domain_b = CorrelationId::new();
    let domain_c = CorrelationId::new();

    let mut coordinate: Coordinate<&'static str, u32> = Coordinate::new(vec![
        ("domain-a", domain_a_1),
        ("domain-a", domain_a_2),
        ("domain-b", domain_b),
        ("domain-c", domain_c),
    ]);

    // domain-b answers normally.
    assert!(!coordinate.resolve(domain_b, 7));
    // domain-a's whole connection drops before either of its two
    // outstanding correlations replied — both fail together.
    assert!(!coordinate.fail_by_id(&"domain-a"));
    // domain-c answers last, completing the round.
    assert!(coordinate.resolve(domain_c, 9));

    let outcomes = coordinate.into_outcomes();
    assert_eq!(outcomes.len(), 4, "exactly one outcome per fanned-out target");

    let mut by_id: std::collections::HashMap<&str, Vec<&Outcome<u32>>> = std::collections::HashMap::new();
    for (id, outcome) in &outcomes {
        by_id.entry(id).or_default().push(outcome);
    }
    assert_eq!(by_id["domain-a"].len(), 2);
    assert!(by_id["domain-a"].iter().all(|o| matches!(o, Outcome::Failed)));
    assert!(matches!(by_id["domain-b"][0], Outcome::Received(7)));
    assert!(matches!(by_id["domain-c"][0], Outcome::Received(9)));
}

#[test]
fn round_completes_exactly_once_even_with_redundant_signals() {
    let a = CorrelationId::new();
    let b = CorrelationId::new();
    let mut coordinate: Coordinate<&'static str, u32> = Coordinate::new(vec![("gw-1", a), ("gw-2", b)]);

    let mut completions = 0;
    if coordinate.resolve(a, 1) {
        completions += 1;
    }
    // A duplicate reply for an already-resolved participant must not
    // cause the round to "complete" a second time from the caller's
    // perspective — it stays incomplete until gw-2 answers.
    if coordinate.resolve(a, 2) {
        completions += 1;
    }
    if coordinate.fail(b) {
        completions += 1;
    }
    // Anything after the round is already complete is a no-op.
    if coordinate.resolve(b, 99) {
        completions += 1;
    }

    assert_eq!(completions, 1, "the round must report completion exactly once");
    let outcomes = coordinate.into_outcomes();
    assert!(matches!(outcomes.iter().find(|(id, _)| *id == "gw-1").unwrap().1, Outcome::Received(1)));
    assert!(matches!(outcomes.iter().find(|(id, _)| *id == "gw-2").unwrap().1, Outcome::Failed));
}

#[test]
fn unresolved_participant_defaults_to_failed_if_consumed_early() {
    // A round that's abandoned before every participant answers still
    // yields one outcome per target when consumed — unanswered
    // participants surface as Failed rather than being silently dropped.
    let a = CorrelationId::new();
    let b = CorrelationId::new();
    let mut coordinate: Coordinate<&'static str, u32> = Coordinate::new(vec![("gw-1", a), ("gw-2", b)]);
    coordinate.resolve(a, 1);

    let outcomes = coordinate.into_outcomes();
    assert_eq!(outcomes.len(), 2);
    assert!(matches!(outcomes.iter().find(|(id, _)| *id == "gw-2").unwrap().1, Outcome::Failed));
}
