//! Crate-wide error taxonomy.
//!
//! Every fallible boundary in `casual-core` — transport syscalls, dispatch
//! handlers, the service directory, the queue group — returns `Result<T,
//! Error>` rather than `anyhow::Result`, so that callers can match on the
//! taxonomy and decide whether to retry, surface, or roll back. `anyhow`
//! remains the error type at the thin binary entry points (`src/bin/*.rs`),
//! where a process simply wants to log-and-exit.

use crate::ids::{CorrelationId, ProcessHandle};
use std::time::Duration;
use thiserror::Error;

/// The taxonomy from the middleware's error handling design.
///
/// Variant names mirror the spec's informal kind names; callers are
/// expected to match on the variant rather than parse the message.
#[derive(Debug, Error)]
pub enum Error {
    /// Input violates a contract. Always a programming error; never
    /// expected to occur in a correctly operating domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Declarative configuration failed validation (duplicate alias,
    /// unresolved dependency, unknown group reference, ...).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The peer's FIFO or socket is gone. The peer should be treated as
    /// dead by the caller.
    #[error("communication unavailable with {peer:?}: {reason}")]
    CommunicationUnavailable {
        peer: Option<ProcessHandle>,
        reason: String,
    },

    /// A TCP connect attempt was refused by the remote domain.
    #[error("communication refused connecting to {address}: {reason}")]
    CommunicationRefused { address: String, reason: String },

    /// A non-blocking receive found nothing waiting. Expected, not fatal.
    #[error("no message available")]
    NoMessage,

    /// A deadline expired before the awaited reply arrived.
    #[error("timeout waiting for correlation {correlation:?}")]
    Timeout { correlation: CorrelationId },

    /// No provider is registered for the requested service.
    #[error("service absent: {0}")]
    ServiceAbsent(String),

    /// Every provider for the requested service is currently busy.
    #[error("service busy: {0}")]
    ServiceBusy(String),

    /// The callee reported a runtime failure (maps to tpreturn(TPFAIL)).
    #[error("service error invoking {service}: {reason}")]
    ServiceError { service: String, reason: String },

    /// The callee could not be reached at all (process died, reservation
    /// orphaned); distinct from `ServiceError`, which is a callee-reported
    /// failure.
    #[error("service fail invoking {service}: {reason}")]
    ServiceFail { service: String, reason: String },

    /// An XA/transaction-manager outcome that must be surfaced to the
    /// caller rather than retried transparently.
    #[error("transaction outcome: {0}")]
    Tx(#[from] TxOutcome),

    /// An invariant was violated. These are process-fatal: log with full
    /// context, emit a best-effort event, then abort. Never swallow.
    #[error("internal invariant violated: {0}")]
    InternalUnexpected(String),
}

/// XA-flavored transaction outcomes, reported through `Error::Tx`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    #[error("transaction rolled back")]
    Rollback,
    #[error("transaction outcome mixed across resources")]
    Mixed,
    #[error("transaction hazard")]
    Hazard,
    #[error("transaction protocol violation")]
    Protocol,
}

impl Error {
    /// Map a raw `errno` observed at a transport syscall site to the
    /// taxonomy, per §4.1's failure mapping table.
    pub fn from_errno(errno: nix::errno::Errno, peer: Option<ProcessHandle>) -> Self {
        use nix::errno::Errno;
        match errno {
            Errno::EPIPE | Errno::EBADF | Errno::ENOENT | Errno::ENODEV => {
                Error::CommunicationUnavailable {
                    peer,
                    reason: errno.to_string(),
                }
            }
            Errno::EINVAL => Error::InvalidArgument(errno.to_string()),
            Errno::EAGAIN => Error::NoMessage,
            other => Error::InternalUnexpected(format!("unmapped errno: {other}")),
        }
    }

    /// `true` for errors that mean "the peer is gone", used by components
    /// that must drop their bookkeeping about a dead process.
    pub fn is_peer_dead(&self) -> bool {
        matches!(self, Error::CommunicationUnavailable { .. })
    }
}

/// `timeout = Duration::ZERO` is the historical "no timeout" sentinel,
/// preserved from the mixed-unit original. Checked at the one call site
/// that schedules a deadline-wheel entry (`dispatch::DeadlineWheel::add`).
pub fn is_no_timeout(d: Duration) -> bool {
    d.is_zero()
}

pub type Result<T> = std::result::Result<T, Error>;
