//! Dispatch (C2): handler tables, the deadline wheel, and the fan-out
//! coordinator built on top of [`crate::transport`]'s framing.
//!
//! `dispatch::Pump` (the condition pump itself) lives at
//! [`crate::transport::pump`] since it operates directly on [`Device`]s;
//! this module hosts the pieces that sit above it once an [`Envelope`]
//! has already been received: routing it to the right handler, tracking
//! outstanding deadlines, and coordinating fan-out replies.

pub mod coordinate;
pub mod deadline;
pub mod handler;

pub use coordinate::Coordinate;
pub use deadline::DeadlineWheel;
pub use handler::HandlerTable;
