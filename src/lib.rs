//! # casual-core
//!
//! Core subsystems of `casual`, a distributed XATMI/X-Open
//! transaction-processing middleware: the framed inter-process
//! transport, the dispatch/coordination primitives built on top of it,
//! the domain orchestrator, the per-domain service directory, and the
//! SQLite-backed queue group.
//!
//! Binary entry points under `src/bin/` are thin process wrappers that
//! parse configuration, initialize logging, construct the relevant
//! component, and run its pump; the logic they call into lives entirely
//! in this crate's modules.

pub mod cli;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod ids;
pub mod logging;
pub mod queue;
pub mod service;
pub mod transport;
pub mod wire;

pub use error::{Error, Result};
pub use ids::{CorrelationId, DomainId, ExecutionId, IpcId, ProcessHandle, Trid};
