//! Wire-level message types: the `bincode`-serialized payloads carried
//! inside a [`crate::transport::Envelope`], and the `message_type`
//! discriminants a [`crate::dispatch::HandlerTable`] dispatches on.
//!
//! Grounded on §6's "native binary form (length-prefixed fields, UTF-8
//! strings, arrays prefixed by element count, fixed-width integers)":
//! `bincode` already produces exactly that layout for `serde`-derived
//! types, so these structs are plain data with no custom codec, the way
//! the teacher's `tcp_socket.rs` serializes its own message envelope.
//! Internal component types (`service::LookupContext`,
//! `queue::Selector`, ...) are kept free of `serde` so their shape can
//! evolve independently of the wire; the `From`/`TryFrom` impls here are
//! the seam between the two.

use crate::domain::config::ConnectDirection;
use crate::error::{Error, Result};
use crate::ids::{CorrelationId, DomainId, ExecutionId, IpcId, ProcessHandle, Trid};
use crate::queue::{MessageRow, RowState, Selector};
use crate::service::{LookupContext, LookupReply as DirectoryLookupReply};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Discriminants for every message type a `casual-*` process can
/// receive. Grouped by owning component; gaps are left between groups
/// so new message types can be slotted in without renumbering.
pub mod message_type {
    use crate::transport::MessageType;

    pub const CONNECT: MessageType = 1;
    pub const SHUTDOWN_REQUEST: MessageType = 2;

    pub const SERVICE_ADVERTISE: MessageType = 100;
    pub const SERVICE_CONCURRENT_ADVERTISE: MessageType = 101;
    pub const SERVICE_LOOKUP_REQUEST: MessageType = 102;
    pub const SERVICE_LOOKUP_REPLY: MessageType = 103;
    pub const SERVICE_ACKNOWLEDGE: MessageType = 104;
    pub const SERVICE_CALL: MessageType = 105;
    pub const SERVICE_REPLY: MessageType = 106;
    pub const SERVICE_PREPARE_SHUTDOWN: MessageType = 107;

    pub const DISCOVERY_REQUEST: MessageType = 120;
    pub const DISCOVERY_REPLY: MessageType = 121;

    pub const QUEUE_ENQUEUE_REQUEST: MessageType = 200;
    pub const QUEUE_ENQUEUE_REPLY: MessageType = 201;
    pub const QUEUE_DEQUEUE_REQUEST: MessageType = 202;
    pub const QUEUE_DEQUEUE_REPLY: MessageType = 203;
    pub const QUEUE_FORGET: MessageType = 204;
    pub const QUEUE_PEEK_REQUEST: MessageType = 205;
    pub const QUEUE_PEEK_REPLY: MessageType = 206;

    pub const RESOURCE_PREPARE: MessageType = 220;
    pub const RESOURCE_COMMIT: MessageType = 221;
    pub const RESOURCE_ROLLBACK: MessageType = 222;
    pub const RESOURCE_VOTE: MessageType = 223;
}

/// Encode a wire payload, keeping the `bincode`-error-to-taxonomy
/// mapping in one place rather than repeated at every call site.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::InternalUnexpected(format!("encoding wire message: {e}")))
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::InternalUnexpected(format!("decoding wire message: {e}")))
}

/// `connect`: a freshly spawned process announcing its `ipc-id` to the
/// orchestrator, per §4.3's boot protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connect {
    pub alias: String,
    pub ipc_id: IpcId,
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownRequest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAdvertise {
    pub alias: String,
    pub process: ProcessHandle,
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum WireOrderProperty {
    Configured,
    Discovered,
}

impl From<WireOrderProperty> for crate::service::OrderProperty {
    fn from(value: WireOrderProperty) -> Self {
        match value {
            WireOrderProperty::Configured => crate::service::OrderProperty::Configured,
            WireOrderProperty::Discovered => crate::service::OrderProperty::Discovered,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrentAdvertiseEntry {
    pub name: String,
    pub order: u32,
    pub hops: u32,
    pub property: WireOrderProperty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConcurrentAdvertise {
    pub gateway: ProcessHandle,
    pub add: Vec<ConcurrentAdvertiseEntry>,
    pub remove: Vec<String>,
    pub reset: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum WireLookupContext {
    Regular,
    NoBusyIntermediate,
    Wait,
    Forward,
}

impl From<WireLookupContext> for LookupContext {
    fn from(value: WireLookupContext) -> Self {
        match value {
            WireLookupContext::Regular => LookupContext::Regular,
            WireLookupContext::NoBusyIntermediate => LookupContext::NoBusyIntermediate,
            WireLookupContext::Wait => LookupContext::Wait,
            WireLookupContext::Forward => LookupContext::Forward,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupRequest {
    pub requested: String,
    pub caller: ProcessHandle,
    pub correlation: CorrelationId,
    pub context: WireLookupContext,
    /// `Duration::ZERO` means no deadline, per the crate-wide no-timeout
    /// sentinel (§9, resolved).
    pub deadline_after: Duration,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum WireProvider {
    Sequential(ProcessHandle),
    Concurrent(ProcessHandle),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum WireLookupReply {
    Idle(WireProvider),
    Busy,
    Absent,
    Timeout,
}

impl From<DirectoryLookupReply> for WireLookupReply {
    fn from(value: DirectoryLookupReply) -> Self {
        use crate::service::directory::Provider;
        match value {
            DirectoryLookupReply::Idle(Provider::Sequential(handle)) => {
                WireLookupReply::Idle(WireProvider::Sequential(handle))
            }
            DirectoryLookupReply::Idle(Provider::Concurrent(handle)) => {
                WireLookupReply::Idle(WireProvider::Concurrent(handle))
            }
            DirectoryLookupReply::Busy => WireLookupReply::Busy,
            DirectoryLookupReply::Absent => WireLookupReply::Absent,
            DirectoryLookupReply::Timeout => WireLookupReply::Timeout,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupReplyMessage {
    pub correlation: CorrelationId,
    pub reply: WireLookupReply,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAcknowledge {
    pub process: ProcessHandle,
    pub correlation: CorrelationId,
    pub pending_wait: Duration,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCall {
    pub service: String,
    pub execution: ExecutionId,
    pub trid: Trid,
    pub payload: Vec<u8>,
    /// Who to send the eventual `service.reply` to, once the callee
    /// acknowledges.
    pub caller: ProcessHandle,
    /// Echoed back in the callee's `service.acknowledge` so the
    /// directory can match it to the reservation it made for this call.
    pub correlation: CorrelationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceReply {
    pub correlation: CorrelationId,
    pub success: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareShutdown {
    pub processes: Vec<ProcessHandle>,
    /// Who to send the [`PrepareShutdownReply`] to.
    pub caller: ProcessHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareShutdownReply {
    pub services_gone_empty: Vec<String>,
    pub extracted_sequential: Vec<ProcessHandle>,
    pub deferred_sequential: Vec<ProcessHandle>,
    pub unknown: Vec<ProcessHandle>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub correlation: CorrelationId,
    pub services: Vec<String>,
    pub visited: Vec<DomainId>,
    /// Who a servicemanager receiving this directly from a CLI
    /// invocation should reply to; gateway-to-gateway forwarding routes
    /// replies through its own `DiscoveryRound` instead and ignores this.
    pub caller: ProcessHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryReply {
    pub correlation: CorrelationId,
    pub gateway: ProcessHandle,
    pub offers: Vec<(String, u32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireSelector {
    pub required: Vec<(String, String)>,
}

impl From<WireSelector> for Selector {
    fn from(value: WireSelector) -> Self {
        Selector { required: value.required }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub queue: String,
    pub trid: Trid,
    pub message_type: String,
    pub correlation: CorrelationId,
    pub reply_queue: Option<String>,
    pub properties: String,
    pub payload: Vec<u8>,
    pub available_at: SystemTime,
    pub caller: ProcessHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueReply {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DequeueRequest {
    pub queue: String,
    pub selector: WireSelector,
    pub trid: Trid,
    pub block: bool,
    pub caller: ProcessHandle,
    pub correlation: CorrelationId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum WireRowState {
    Enqueued,
    Dequeued,
    Committed,
}

impl From<RowState> for WireRowState {
    fn from(value: RowState) -> Self {
        match value {
            RowState::Enqueued => WireRowState::Enqueued,
            RowState::Dequeued => WireRowState::Dequeued,
            RowState::Committed => WireRowState::Committed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessageRow {
    pub id: i64,
    pub queue: String,
    pub origin_queue: String,
    pub message_type: String,
    pub correlation: CorrelationId,
    pub reply_queue: Option<String>,
    pub available_at: SystemTime,
    pub timestamp: SystemTime,
    pub state: WireRowState,
    pub redelivered: u32,
    pub properties: String,
    pub payload: Vec<u8>,
}

impl From<&MessageRow> for WireMessageRow {
    fn from(row: &MessageRow) -> Self {
        Self {
            id: row.id,
            queue: row.queue.clone(),
            origin_queue: row.origin_queue.clone(),
            message_type: row.message_type.clone(),
            correlation: row.correlation,
            reply_queue: row.reply_queue.clone(),
            available_at: row.available_at,
            timestamp: row.timestamp,
            state: row.state.into(),
            redelivered: row.redelivered,
            properties: row.properties.clone(),
            payload: row.payload.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DequeueReply {
    pub correlation: CorrelationId,
    pub row: Option<WireMessageRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forget {
    pub queue: String,
    pub correlation: CorrelationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeekRequest {
    pub queue: String,
    pub caller: ProcessHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeekReply {
    pub rows: Vec<WireMessageRow>,
}

/// `resource.prepare/commit/rollback`, sent to a queue group (or any
/// other XA-style resource) by the coordinating component (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub trid: Trid,
    /// Queues whose backlog may have changed as a side effect, so the
    /// receiver knows which blocking dequeuers to reconsider (commit
    /// only — empty for prepare/rollback, which compute this from the
    /// store directly).
    pub affected_queues: Vec<String>,
    /// Who to send the [`ResourceVoteMessage`] to, once `prepare` has
    /// decided.
    pub caller: ProcessHandle,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ResourceVote {
    Ok,
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceVoteMessage {
    pub trid: Trid,
    pub vote: ResourceVote,
}

/// `gateway` connect-direction, mirrored from `domain::config` so
/// gateway handshake payloads do not need to depend on the full
/// configuration model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum WireConnectDirection {
    Regular,
    Reversed,
}

impl From<ConnectDirection> for WireConnectDirection {
    fn from(value: ConnectDirection) -> Self {
        match value {
            ConnectDirection::Regular => WireConnectDirection::Regular,
            ConnectDirection::Reversed => WireConnectDirection::Reversed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_lookup_request() {
        let request = LookupRequest {
            requested: "ECHO".into(),
            caller: ProcessHandle::new(1, IpcId::new()),
            correlation: CorrelationId::new(),
            context: WireLookupContext::Wait,
            deadline_after: Duration::from_millis(50),
        };
        let bytes = encode(&request).unwrap();
        let decoded: LookupRequest = decode(&bytes).unwrap();
        assert_eq!(decoded.requested, "ECHO");
        assert_eq!(decoded.correlation, request.correlation);
    }

    #[test]
    fn round_trips_a_dequeue_reply_with_row() {
        let reply = DequeueReply {
            correlation: CorrelationId::new(),
            row: Some(WireMessageRow {
                id: 1,
                queue: "Q".into(),
                origin_queue: "Q".into(),
                message_type: "".into(),
                correlation: CorrelationId::new(),
                reply_queue: None,
                available_at: SystemTime::now(),
                timestamp: SystemTime::now(),
                state: WireRowState::Committed,
                redelivered: 0,
                properties: "{}".into(),
                payload: b"hi".to_vec(),
            }),
        };
        let bytes = encode(&reply).unwrap();
        let decoded: DequeueReply = decode(&bytes).unwrap();
        assert_eq!(decoded.row.unwrap().payload, b"hi");
    }
}
