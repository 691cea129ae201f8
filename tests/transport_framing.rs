//! Cross-module coverage for the framing invariant (§8, invariant 1) and
//! the boundary behaviors around `TRANSPORT_SIZE`/`PAYLOAD_MAX`: that
//! splitting a logical payload into frames and reassembling them always
//! reproduces the original bytes exactly, for payloads that fall on
//! either side of a single-frame boundary.

use casual_core::ids::{CorrelationId, ExecutionId};
use casual_core::transport::{Envelope, Frame, MessageAssembler, PAYLOAD_MAX};

fn roundtrip_payload(message_type: u64, payload: &[u8]) -> Vec<u8> {
    let correlation = CorrelationId::new();
    let frames = Frame::split(message_type, correlation, payload);
    let mut assembler = MessageAssembler::new();
    let mut out = None;
    for frame in frames {
        let encoded = frame.encode();
        let header = Frame::decode_header(&encoded).expect("valid header");
        let body = encoded[casual_core::transport::HEADER_SIZE..].to_vec();
        if let Some(assembled) = assembler.feed(header, body).expect("feed succeeds") {
            assert!(out.is_none(), "assembler yielded a message twice");
            out = Some(assembled);
        }
    }
    out.expect("message never completed assembly")
}

#[test]
fn single_frame_boundary_exact_payload_max() {
    let payload = vec![0xABu8; PAYLOAD_MAX];
    let frames = Frame::split(1, CorrelationId::new(), &payload);
    assert_eq!(frames.len(), 1, "a payload of exactly PAYLOAD_MAX must fit one frame");
    assert_eq!(roundtrip_payload(1, &payload), payload);
}

#[test]
fn multi_frame_exact_multiple_of_payload_max() {
    let k = 3;
    let payload: Vec<u8> = (0..k * PAYLOAD_MAX).map(|i| (i % 251) as u8).collect();
    let frames = Frame::split(7, CorrelationId::new(), &payload);
    assert_eq!(frames.len(), k, "k * PAYLOAD_MAX bytes must split into exactly k frames");
    let last = frames.last().unwrap();
    assert_eq!(last.offset + last.payload.len() as u64, last.size);
    assert_eq!(roundtrip_payload(7, &payload), payload);
}

#[test]
fn multi_frame_uneven_remainder() {
    let payload: Vec<u8> = (0..(2 * PAYLOAD_MAX + 37)).map(|i| (i % 199) as u8).collect();
    assert_eq!(roundtrip_payload(42, &payload), payload);
}

#[test]
fn empty_payload_round_trips() {
    assert_eq!(roundtrip_payload(9, &[]), Vec::<u8>::new());
}

#[test]
fn out_of_order_frame_is_rejected() {
    let payload: Vec<u8> = (0..(2 * PAYLOAD_MAX)).map(|i| i as u8).collect();
    let correlation = CorrelationId::new();
    let frames = Frame::split(1, correlation, &payload);
    let mut assembler = MessageAssembler::new();

    // Feed the second frame first: its offset won't match what the
    // assembler expects to have received so far.
    let encoded = frames[1].encode();
    let header = Frame::decode_header(&encoded).unwrap();
    let body = encoded[casual_core::transport::HEADER_SIZE..].to_vec();
    let result = assembler.feed(header, body);
    assert!(result.is_err(), "out-of-order frame must be a fatal protocol error, not silently dropped");
}

#[test]
fn envelope_round_trip_preserves_execution_and_payload() {
    let execution = ExecutionId::new();
    let envelope = Envelope::new(100, execution, b"hello casual".to_vec());
    let frames = envelope.to_frames();
    let mut assembler = MessageAssembler::new();
    let mut assembled = None;
    for frame in &frames {
        let encoded = frame.encode();
        let header = Frame::decode_header(&encoded).unwrap();
        let body = encoded[casual_core::transport::HEADER_SIZE..].to_vec();
        if let Some(bytes) = assembler.feed(header, body).unwrap() {
            assembled = Some(bytes);
        }
    }
    let rebuilt = Envelope::from_assembled(envelope.message_type, envelope.correlation, assembled.unwrap()).unwrap();
    assert_eq!(rebuilt.execution, execution);
    assert_eq!(rebuilt.payload, b"hello casual");
    assert_eq!(rebuilt.message_type, 100);
}
