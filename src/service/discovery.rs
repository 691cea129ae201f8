//! Cross-domain discovery: fan a `discovery.request` out to every
//! configured gateway, merge `discovery.reply` replies into the
//! directory's concurrent instance table, per §4.4/§9.
//!
//! Grounded on `dispatch::coordinate::Coordinate` for the fan-out/merge
//! shape; the explicit visit-set below resolves the Open Question in
//! §9 ("how to avoid discovery loops without the original's fragile
//! process-id trick") by carrying the list of domains already visited
//! in the request itself, rather than inferring loops from process
//! identity.

use crate::dispatch::coordinate::{Coordinate, Outcome};
use crate::ids::{CorrelationId, DomainId, ProcessHandle};
use super::instance::{ConcurrentInstance, OrderProperty};

/// One `discovery.request` in flight: which services are being asked
/// about, and the domains already on the path so a gateway receiving
/// this request knows not to forward it back the way it came.
#[derive(Debug, Clone)]
pub struct DiscoveryRequest {
    pub correlation: CorrelationId,
    pub services: Vec<String>,
    pub visited: Vec<DomainId>,
}

impl DiscoveryRequest {
    pub fn new(services: Vec<String>, origin: DomainId) -> Self {
        Self {
            correlation: CorrelationId::new(),
            services,
            visited: vec![origin],
        }
    }

    /// True if `domain` is already on the path; a gateway must not
    /// forward a request back to a domain that has already seen it.
    pub fn has_visited(&self, domain: DomainId) -> bool {
        self.visited.contains(&domain)
    }

    /// Build the request to forward onward, extending the visit-set
    /// with this hop's own domain id.
    pub fn advance(&self, this_domain: DomainId) -> Self {
        let mut visited = self.visited.clone();
        visited.push(this_domain);
        Self {
            correlation: self.correlation,
            services: self.services.clone(),
            visited,
        }
    }
}

/// One gateway's answer: which of the requested services it (or a
/// domain further out) can provide, and at what order/hop count.
#[derive(Debug, Clone)]
pub struct DiscoveryReply {
    pub gateway: ProcessHandle,
    pub offers: Vec<(String, u32)>,
}

/// Drives one discovery round across a set of gateways, resolving once
/// every gateway has replied or failed.
pub struct DiscoveryRound {
    coordinate: Coordinate<ProcessHandle, DiscoveryReply>,
}

impl DiscoveryRound {
    /// `gateways` pairs each participating gateway with the correlation
    /// its own request was sent under (a discovery round reuses one
    /// correlation for every gateway since they're all answering the
    /// same logical question).
    pub fn new(gateways: Vec<(ProcessHandle, CorrelationId)>) -> Self {
        Self {
            coordinate: Coordinate::new(gateways),
        }
    }

    pub fn reply(&mut self, correlation: CorrelationId, reply: DiscoveryReply) -> bool {
        self.coordinate.resolve(correlation, reply)
    }

    pub fn gateway_unreachable(&mut self, gateway: &ProcessHandle) -> bool {
        self.coordinate.fail_by_id(gateway)
    }

    pub fn is_complete(&self) -> bool {
        self.coordinate.is_complete()
    }

    /// Consume the round, producing the concurrent instances to merge
    /// into the directory for each offered service. A gateway that
    /// failed or never replied contributes nothing, per §4.4 ("a
    /// discovery participant that cannot be reached is simply absent
    /// from the result, not an error").
    pub fn into_instances(self, hops_from_here: u32) -> Vec<(String, ConcurrentInstance)> {
        let mut merged = Vec::new();
        for (gateway, outcome) in self.coordinate.into_outcomes() {
            if let Outcome::Received(reply) = outcome {
                for (service, remote_order) in reply.offers {
                    merged.push((
                        service,
                        ConcurrentInstance {
                            gateway,
                            property: OrderProperty::Discovered,
                            order: remote_order,
                            hops: hops_from_here,
                        },
                    ));
                }
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(pid: u32) -> ProcessHandle {
        ProcessHandle::new(pid, crate::ids::IpcId::new())
    }

    #[test]
    fn advance_extends_visit_set_without_mutating_original() {
        let origin = DomainId::new();
        let request = DiscoveryRequest::new(vec!["ECHO".into()], origin);
        assert!(request.has_visited(origin));

        let hop = DomainId::new();
        let advanced = request.advance(hop);
        assert!(advanced.has_visited(origin));
        assert!(advanced.has_visited(hop));
        assert!(!request.has_visited(hop));
    }

    #[test]
    fn merges_only_replies_that_arrived() {
        let g1 = handle(1);
        let g2 = handle(2);
        let c1 = CorrelationId::new();
        let c2 = CorrelationId::new();
        let mut round = DiscoveryRound::new(vec![(g1, c1), (g2, c2)]);

        round.reply(
            c1,
            DiscoveryReply {
                gateway: g1,
                offers: vec![("ECHO".to_string(), 3)],
            },
        );
        round.gateway_unreachable(&g2);

        assert!(round.is_complete());
        let instances = round.into_instances(1);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].0, "ECHO");
        assert_eq!(instances[0].1.gateway, g1);
        assert_eq!(instances[0].1.property, OrderProperty::Discovered);
    }
}
