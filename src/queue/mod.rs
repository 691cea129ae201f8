//! Queue group (C5): a per-group SQLite queuebase, transactional
//! enqueue/dequeue with blocking waiters, two-phase commit as a
//! resource, and forwards (§4.5).

pub mod forward;
pub mod group;
pub mod store;

pub use forward::{QueueForward, ServiceCaller, ServiceForward};
pub use group::{DequeueOutcome, PendingGuard, QueueGroup};
pub use store::{MessageRow, QueueDescriptor, QueueStore, RowState, Selector};
