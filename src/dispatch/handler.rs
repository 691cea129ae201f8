//! Type-indexed dispatch table: routes a received [`Envelope`] to the
//! handler registered for its `message_type`.
//!
//! Grounded on the teacher crate's `TransportFactory`/mechanism-keyed
//! dispatch in `src/ipc/mod.rs` (a `HashMap` keyed by an enum picking
//! which concrete transport handles a request), generalized here to key
//! a `HashMap` by the wire `MessageType` discriminant instead, the way
//! the original's `common::message::dispatch::Handler` routes by message
//! type.

use crate::error::{Error, Result};
use crate::transport::{Envelope, MessageType};
use std::collections::HashMap;

/// A handler takes ownership of the envelope; it returns `Err` only for
/// conditions the caller should treat as process-fatal (an
/// `Error::InternalUnexpected`), not for ordinary rejects like "service
/// busy", which handlers report by sending their own reply envelope.
pub type HandlerFn = Box<dyn FnMut(Envelope) -> Result<()> + Send>;

/// Maps each [`MessageType`] this process understands to the handler
/// that processes it. A [`crate::transport::pump::Pump`] handler closure
/// typically does nothing but look up and invoke into one of these.
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<MessageType, HandlerFn>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, message_type: MessageType, handler: HandlerFn) -> &mut Self {
        self.handlers.insert(message_type, handler);
        self
    }

    /// Dispatch one envelope. An unregistered `message_type` is an
    /// internal error: every message this process can receive must have
    /// a registered handler by the time the pump starts.
    pub fn dispatch(&mut self, envelope: Envelope) -> Result<()> {
        match self.handlers.get_mut(&envelope.message_type) {
            Some(handler) => handler(envelope),
            None => Err(Error::InternalUnexpected(format!(
                "no handler registered for message_type {}",
                envelope.message_type
            ))),
        }
    }

    pub fn is_registered(&self, message_type: MessageType) -> bool {
        self.handlers.contains_key(&message_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ExecutionId;
    use std::sync::{Arc, Mutex};

    #[test]
    fn dispatches_to_the_registered_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let mut table = HandlerTable::new();
        table.on(
            1,
            Box::new(move |envelope| {
                seen_clone.lock().unwrap().push(envelope.payload);
                Ok(())
            }),
        );

        let envelope = Envelope::new(1, ExecutionId::new(), b"x".to_vec());
        table.dispatch(envelope).unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[b"x".to_vec()]);
    }

    #[test]
    fn unregistered_message_type_is_an_internal_error() {
        let mut table = HandlerTable::new();
        let envelope = Envelope::new(99, ExecutionId::new(), Vec::new());
        let err = table.dispatch(envelope).unwrap_err();
        assert!(matches!(err, Error::InternalUnexpected(_)));
    }
}
