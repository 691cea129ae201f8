//! Fan-out coordinator: wait for a set of pending `(id, correlation)`
//! pairs to all resolve before firing a single completion callback.
//!
//! Grounded directly on the original source's
//! `middleware/common/include/common/message/coordinate.h`
//! (`fan::Out<M, ID>`'s `Pending{state, id, correlation}` plus
//! `operator()(pending, callback)`), and on the teacher crate's
//! `coordination::ResultAggregator` (`src/coordination.rs`) for the
//! Rust-side shape of "accumulate results behind a lock, read them back
//! once everyone's in". `Coordinate` generalizes both: service lookup
//! fan-out across gateways, queue-group two-phase-commit fan-out across
//! resources, and discovery fan-out all instantiate this with their own
//! `Id` and `Reply` types.

use crate::ids::CorrelationId;
use std::collections::HashMap;

/// Per-participant outcome once `Coordinate` has heard back (or given
/// up on) it.
#[derive(Debug, Clone)]
pub enum Outcome<Reply> {
    Received(Reply),
    Failed,
}

#[derive(Debug)]
enum State<Reply> {
    Pending,
    Resolved(Outcome<Reply>),
}

struct Pending<Id, Reply> {
    id: Id,
    correlation: CorrelationId,
    state: State<Reply>,
}

/// Tracks a single fan-out round: one correlation handed out per `Id`,
/// waiting for every one of them to come back received or failed.
pub struct Coordinate<Id, Reply> {
    pending: Vec<Pending<Id, Reply>>,
    by_correlation: HashMap<CorrelationId, usize>,
}

impl<Id: Clone + Eq, Reply> Coordinate<Id, Reply> {
    /// Start a round across `participants`, each paired with the
    /// correlation-id used to address its request.
    pub fn new(participants: Vec<(Id, CorrelationId)>) -> Self {
        let mut by_correlation = HashMap::with_capacity(participants.len());
        let pending = participants
            .into_iter()
            .enumerate()
            .map(|(index, (id, correlation))| {
                by_correlation.insert(correlation, index);
                Pending {
                    id,
                    correlation,
                    state: State::Pending,
                }
            })
            .collect();
        Self {
            pending,
            by_correlation,
        }
    }

    /// Record a reply for `correlation`. Returns `true` once this
    /// resolution made the whole round complete. Replies for an unknown
    /// or already-resolved correlation are silently ignored — a
    /// duplicate or late reply after the round completed is not an
    /// error, just a no-op.
    pub fn resolve(&mut self, correlation: CorrelationId, reply: Reply) -> bool {
        self.settle(correlation, Outcome::Received(reply))
    }

    /// Fail a single participant by correlation (its process died, its
    /// connection dropped, ...).
    pub fn fail(&mut self, correlation: CorrelationId) -> bool {
        self.settle(correlation, Outcome::Failed)
    }

    /// Fail every participant matching `id` still pending — used when a
    /// whole peer domain goes away and every outstanding correlation
    /// routed through it must be given up on at once.
    pub fn fail_by_id(&mut self, id: &Id) -> bool {
        let mut any = false;
        for entry in &mut self.pending {
            if &entry.id == id && matches!(entry.state, State::Pending) {
                entry.state = State::Resolved(Outcome::Failed);
                any = true;
            }
        }
        if any {
            self.is_complete()
        } else {
            false
        }
    }

    fn settle(&mut self, correlation: CorrelationId, outcome: Outcome<Reply>) -> bool {
        if let Some(&index) = self.by_correlation.get(&correlation) {
            if matches!(self.pending[index].state, State::Pending) {
                self.pending[index].state = State::Resolved(outcome);
            }
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.pending
            .iter()
            .all(|entry| !matches!(entry.state, State::Pending))
    }

    /// Consume the coordinator once complete, handing back every
    /// participant's id and outcome in fan-out order.
    pub fn into_outcomes(self) -> Vec<(Id, Outcome<Reply>)> {
        self.pending
            .into_iter()
            .map(|entry| {
                let outcome = match entry.state {
                    State::Resolved(outcome) => outcome,
                    State::Pending => Outcome::Failed,
                };
                (entry.id, outcome)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_once_every_participant_resolves() {
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        let mut coordinate: Coordinate<&'static str, u32> =
            Coordinate::new(vec![("gw-1", a), ("gw-2", b)]);

        assert!(!coordinate.resolve(a, 1));
        assert!(coordinate.resolve(b, 2));

        let outcomes = coordinate.into_outcomes();
        assert_eq!(outcomes.len(), 2);
    }

    #[test]
    fn fail_by_id_resolves_all_matching_participants() {
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        let mut coordinate: Coordinate<&'static str, u32> =
            Coordinate::new(vec![("gw-1", a), ("gw-1", b)]);

        assert!(coordinate.fail_by_id(&"gw-1"));
        let outcomes = coordinate.into_outcomes();
        assert!(outcomes
            .iter()
            .all(|(_, outcome)| matches!(outcome, Outcome::Failed)));
    }

    #[test]
    fn late_reply_after_completion_is_ignored() {
        let a = CorrelationId::new();
        let mut coordinate: Coordinate<&'static str, u32> = Coordinate::new(vec![("gw-1", a)]);
        assert!(coordinate.resolve(a, 1));
        // Resolving again must not panic and must not change the outcome.
        assert!(coordinate.resolve(a, 2));
        let outcomes = coordinate.into_outcomes();
        assert!(matches!(outcomes[0].1, Outcome::Received(1)));
    }
}
