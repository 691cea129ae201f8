//! # Transport (C1): framed local IPC and the TCP inter-domain device
//!
//! This module defines the wire-level building blocks every process's
//! message pump runs on: the fixed-size [`FrameHeader`], the
//! [`MessageAssembler`] that reconstructs a complete [`Envelope`] from one
//! or more frames, and the [`Device`] trait implemented by the local
//! [`fifo`] transport and the inter-domain [`tcp`] transport. [`pump`]
//! hosts the `select`-style multiplexed event loop (C2's condition pump
//! is built on top of it).
//!
//! ## Design
//!
//! Grounded on the teacher crate's `ipc::IpcTransport` trait
//! (`src/ipc/mod.rs`) and `Message` type, generalized from a single
//! opaque benchmark payload to the spec's `{type, correlation, offset,
//! count, size}` frame header (§6) with multi-frame assembly (§4.1).

pub mod fifo;
pub mod pump;
pub mod tcp;

use crate::error::{Error, Result};
use crate::ids::CorrelationId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Size of the on-wire frame header in bytes: `type(8) + correlation(16)
/// + offset(8) + count(8) + size(8)`.
pub const HEADER_SIZE: usize = 48;

/// The physical transport unit size a conformant local FIFO peer honors.
/// Chosen to respect `PIPE_BUF` so a single frame's `write` is atomic on
/// Linux; callers needing larger logical payloads rely on multi-frame
/// assembly, never on a bigger atomic write.
pub const TRANSPORT_SIZE: usize = 4096;

/// Maximum payload bytes one frame can carry.
pub const PAYLOAD_MAX: usize = TRANSPORT_SIZE - HEADER_SIZE;

/// Discriminator for the logical message carried by an [`Envelope`].
///
/// Component modules each own a slice of this space; the dispatch
/// handler table (`dispatch::HandlerTable`) is keyed by this type.
pub type MessageType = u64;

/// One physical frame: header plus up to `PAYLOAD_MAX` bytes of payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub correlation: CorrelationId,
    pub offset: u64,
    pub size: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Split a logical payload into the frames needed to carry it,
    /// honoring [`PAYLOAD_MAX`]. A payload of exactly `PAYLOAD_MAX` bytes
    /// (or less) produces exactly one frame.
    pub fn split(message_type: MessageType, correlation: CorrelationId, payload: &[u8]) -> Vec<Frame> {
        let size = payload.len() as u64;
        if payload.is_empty() {
            return vec![Frame {
                message_type,
                correlation,
                offset: 0,
                size,
                payload: Vec::new(),
            }];
        }
        payload
            .chunks(PAYLOAD_MAX)
            .enumerate()
            .map(|(i, chunk)| Frame {
                message_type,
                correlation,
                offset: (i * PAYLOAD_MAX) as u64,
                size,
                payload: chunk.to_vec(),
            })
            .collect()
    }

    /// Encode this frame's header + payload as bytes ready for a single
    /// `writev`-equivalent send.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.message_type.to_le_bytes());
        buf.extend_from_slice(self.correlation.0.as_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u64).to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a header from exactly [`HEADER_SIZE`] bytes. Does not read
    /// the payload; callers read `count` further bytes separately.
    pub fn decode_header(bytes: &[u8]) -> Result<DecodedHeader> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InternalUnexpected(format!(
                "short frame header: {} bytes, need {}",
                bytes.len(),
                HEADER_SIZE
            )));
        }
        let message_type = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let correlation = Uuid::from_slice(&bytes[8..24])
            .map_err(|e| Error::InternalUnexpected(format!("bad correlation bytes: {e}")))?;
        let offset = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
        let count = u64::from_le_bytes(bytes[32..40].try_into().unwrap());
        let size = u64::from_le_bytes(bytes[40..48].try_into().unwrap());
        if offset + count > size {
            return Err(Error::InternalUnexpected(format!(
                "frame invariant violated: offset {offset} + count {count} > size {size}"
            )));
        }
        Ok(DecodedHeader {
            message_type,
            correlation: CorrelationId(correlation),
            offset,
            count,
            size,
        })
    }
}

/// A decoded header prior to reading its payload bytes.
#[derive(Debug, Clone, Copy)]
pub struct DecodedHeader {
    pub message_type: MessageType,
    pub correlation: CorrelationId,
    pub offset: u64,
    pub count: u64,
    pub size: u64,
}

/// A complete, reassembled logical message: immutable once framed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_type: MessageType,
    pub correlation: CorrelationId,
    pub execution: crate::ids::ExecutionId,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(message_type: MessageType, execution: crate::ids::ExecutionId, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            correlation: CorrelationId::new(),
            execution,
            payload,
        }
    }

    /// Split into wire frames for transmission.
    ///
    /// The execution-id rides along as the first 16 bytes of the framed
    /// payload (invisible to `Frame`/`MessageAssembler`, which only know
    /// about opaque bytes); [`Envelope::from_assembled`] strips it back
    /// off on the receiving side.
    pub fn to_frames(&self) -> Vec<Frame> {
        let mut wire = Vec::with_capacity(16 + self.payload.len());
        wire.extend_from_slice(self.execution.0.as_bytes());
        wire.extend_from_slice(&self.payload);
        Frame::split(self.message_type, self.correlation, &wire)
    }

    /// Reconstruct an envelope from a fully assembled frame stream: the
    /// counterpart to [`Envelope::to_frames`].
    pub fn from_assembled(
        message_type: MessageType,
        correlation: CorrelationId,
        assembled: Vec<u8>,
    ) -> Result<Self> {
        if assembled.len() < 16 {
            return Err(Error::InternalUnexpected(format!(
                "assembled message too short to carry an execution id: {} bytes",
                assembled.len()
            )));
        }
        let execution = crate::ids::ExecutionId(
            Uuid::from_slice(&assembled[0..16])
                .map_err(|e| Error::InternalUnexpected(format!("bad execution bytes: {e}")))?,
        );
        Ok(Self {
            message_type,
            correlation,
            execution,
            payload: assembled[16..].to_vec(),
        })
    }
}

/// Per-correlation partial-message state held by a receiver while
/// frames are still arriving. Frames of different correlations may
/// interleave arbitrarily on the same connection (§4.1).
struct Partial {
    message_type: MessageType,
    size: u64,
    received: u64,
    buffer: Vec<u8>,
}

/// Reassembles frames (possibly interleaved across correlations) into
/// complete envelopes.
///
/// The assembly invariant (§8, invariant 1) is enforced here: a
/// conformant peer never sends out-of-order or overlapping offsets for a
/// single correlation; any violation is a fatal protocol error for that
/// connection, not merely a dropped frame.
#[derive(Default)]
pub struct MessageAssembler {
    partials: HashMap<CorrelationId, Partial>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame in. Returns `Some(payload bytes)` once the frame
    /// completes its correlation's message; the caller is responsible
    /// for attaching `execution`/other envelope metadata carried
    /// out-of-band by the first frame (see `fifo`/`tcp` for how that
    /// metadata rides along).
    pub fn feed(&mut self, header: DecodedHeader, payload: Vec<u8>) -> Result<Option<Vec<u8>>> {
        if header.size as usize <= PAYLOAD_MAX {
            // Single-frame fast path; still go through the map to detect
            // a conformant peer never re-using a correlation mid-flight.
            if header.offset != 0 || header.count != header.size {
                return Err(Error::InternalUnexpected(format!(
                    "single-frame message with non-trivial framing: {header:?}"
                )));
            }
            return Ok(Some(payload));
        }

        let partial = self.partials.entry(header.correlation).or_insert_with(|| Partial {
            message_type: header.message_type,
            size: header.size,
            received: 0,
            buffer: vec![0u8; header.size as usize],
        });

        if partial.size != header.size || partial.message_type != header.message_type {
            self.partials.remove(&header.correlation);
            return Err(Error::InternalUnexpected(format!(
                "correlation {} reused with inconsistent framing",
                header.correlation
            )));
        }

        let start = header.offset as usize;
        let end = start + header.count as usize;
        // A conformant peer sends frames for one correlation in strictly
        // increasing, contiguous order: the next frame's offset must equal
        // exactly how much has been received so far. Anything else — a
        // gap, a re-send, an overlap — is a fatal protocol error.
        if header.offset != partial.received || end > partial.buffer.len() {
            self.partials.remove(&header.correlation);
            return Err(Error::InternalUnexpected(format!(
                "out-of-order or overlapping frame for correlation {}: offset {} count {}",
                header.correlation, header.offset, header.count
            )));
        }
        partial.buffer[start..end].copy_from_slice(&payload);
        partial.received = end as u64;

        if partial.received == partial.size {
            let partial = self.partials.remove(&header.correlation).unwrap();
            Ok(Some(partial.buffer))
        } else {
            Ok(None)
        }
    }
}

/// Transport-level send/receive device, implemented per mechanism.
///
/// Both variants of every operation exist: `send`/`receive` block
/// (clearing `O_NONBLOCK`, `select`-ing for readiness so pending signals
/// can be delivered before the syscall), `try_send`/`try_receive` never
/// block and map `EAGAIN` to [`Error::NoMessage`].
#[async_trait::async_trait]
pub trait Device: Send {
    /// Block until the envelope has been fully written.
    async fn send(&mut self, envelope: &Envelope) -> Result<()>;

    /// Block until one complete envelope has been read.
    async fn receive(&mut self) -> Result<Envelope>;

    /// Attempt one non-blocking step of send; `Err(Error::NoMessage)` if
    /// the device would block.
    async fn try_send(&mut self, envelope: &Envelope) -> Result<()>;

    /// Attempt one non-blocking step of receive; `Err(Error::NoMessage)`
    /// if nothing is ready yet.
    async fn try_receive(&mut self) -> Result<Envelope>;

    /// The raw fd this device will `select` on, for registration with
    /// [`pump::Pump`].
    fn raw_fd(&self) -> std::os::unix::io::RawFd;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_payload_fits_exactly() {
        let correlation = CorrelationId::new();
        let payload = vec![7u8; PAYLOAD_MAX];
        let frames = Frame::split(1, correlation, &payload);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].offset, 0);
        assert_eq!(frames[0].payload.len(), PAYLOAD_MAX);
    }

    #[test]
    fn split_payload_produces_k_frames_with_final_offset_plus_count_eq_size() {
        let correlation = CorrelationId::new();
        let payload = vec![9u8; PAYLOAD_MAX * 3];
        let frames = Frame::split(1, correlation, &payload);
        assert_eq!(frames.len(), 3);
        let last = frames.last().unwrap();
        assert_eq!(last.offset + last.payload.len() as u64, last.size);
    }

    #[test]
    fn s1_framed_split_4100_over_2000() {
        // S1: payload_max = 2000, payload = 4100 bytes -> frames of 2000, 2000, 100.
        let payload_max = 2000usize;
        let correlation = CorrelationId::new();
        let payload = vec![1u8; 4100];
        let frames: Vec<Vec<u8>> = payload
            .chunks(payload_max)
            .map(|c| c.to_vec())
            .collect();
        assert_eq!(frames.iter().map(|f| f.len()).collect::<Vec<_>>(), vec![2000, 2000, 100]);

        let mut assembler = MessageAssembler::new();
        let mut offset = 0u64;
        let mut result = None;
        for chunk in &frames {
            let header = DecodedHeader {
                message_type: 1,
                correlation,
                offset,
                count: chunk.len() as u64,
                size: 4100,
            };
            result = assembler.feed(header, chunk.clone()).unwrap();
            offset += chunk.len() as u64;
        }
        let assembled = result.expect("message should be complete after final frame");
        assert_eq!(assembled.len(), 4100);
        assert_eq!(assembled, payload);
    }

    #[test]
    fn interleaved_correlations_assemble_independently() {
        let mut assembler = MessageAssembler::new();
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        let payload_a = vec![1u8; PAYLOAD_MAX * 2];
        let payload_b = vec![2u8; PAYLOAD_MAX * 2];
        let frames_a = Frame::split(1, a, &payload_a);
        let frames_b = Frame::split(2, b, &payload_b);

        // Interleave: a0, b0, a1, b1
        let h = |f: &Frame| DecodedHeader {
            message_type: f.message_type,
            correlation: f.correlation,
            offset: f.offset,
            count: f.payload.len() as u64,
            size: f.size,
        };

        assert!(assembler.feed(h(&frames_a[0]), frames_a[0].payload.clone()).unwrap().is_none());
        assert!(assembler.feed(h(&frames_b[0]), frames_b[0].payload.clone()).unwrap().is_none());
        let done_a = assembler.feed(h(&frames_a[1]), frames_a[1].payload.clone()).unwrap();
        let done_b = assembler.feed(h(&frames_b[1]), frames_b[1].payload.clone()).unwrap();

        assert_eq!(done_a.unwrap(), payload_a);
        assert_eq!(done_b.unwrap(), payload_b);
    }

    #[test]
    fn overlapping_offset_is_a_fatal_protocol_error() {
        let mut assembler = MessageAssembler::new();
        let c = CorrelationId::new();
        let payload = vec![5u8; PAYLOAD_MAX * 2];
        let frames = Frame::split(1, c, &payload);
        let h = |f: &Frame| DecodedHeader {
            message_type: f.message_type,
            correlation: f.correlation,
            offset: f.offset,
            count: f.payload.len() as u64,
            size: f.size,
        };
        assembler.feed(h(&frames[0]), frames[0].payload.clone()).unwrap();
        // Re-send the first frame again: overlap with already-received bytes.
        let overlap = assembler.feed(h(&frames[0]), frames[0].payload.clone());
        assert!(overlap.is_err());
    }
}
