//! The service directory (C4): service entries, provider instances,
//! lookup/reserve/ack, cross-domain discovery, and rolling metrics.

pub mod directory;
pub mod discovery;
pub mod instance;
pub mod metrics;

pub use directory::{
    AcknowledgeOutcome, LookupContext, LookupOutcome, LookupReply, PrepareShutdownResult, ServiceDirectory,
};
pub use discovery::{DiscoveryReply, DiscoveryRequest, DiscoveryRound};
pub use instance::{
    ConcurrentInstance, InstanceState, OrderProperty, Reservation, SequentialInstance,
    ServiceDescriptor, ServiceEntry, TimeoutContract, TransactionPolicy,
};
pub use metrics::ServiceMetrics;
