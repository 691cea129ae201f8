//! Inter-domain TCP transport: the [`Device`](super::Device) two gateways
//! speak to each other over.
//!
//! Grounded on the teacher crate's `ipc::tcp_socket` (length-prefixed
//! framing over `tokio::net::TcpStream`, a write timeout guarding against
//! an unresponsive peer), generalized from a flat `u32` length prefix to
//! the shared `{type, correlation, offset, count, size}` header so one
//! socket can multiplex many correlations the same way a local FIFO does
//! (§6). One socket is held per peer domain; [`connect`] and [`accept`]
//! both perform the handshake that exchanges domain identity before
//! handing back a device ready to carry framed traffic.

use super::{DecodedHeader, Device, Envelope, Frame, MessageAssembler, HEADER_SIZE};
use crate::error::{Error, Result};
use crate::ids::DomainId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::debug;

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Reserved message type carrying the connect handshake; never dispatched
/// to a `dispatch::HandlerTable`.
const HANDSHAKE_MESSAGE_TYPE: u64 = 0;
/// Socket buffer size tuned for batches of framed requests rather than
/// single small datagrams; `tokio::net::TcpStream` doesn't expose
/// `SO_RCVBUF`/`SO_SNDBUF` directly, so this drops to `socket2` the same
/// way the teacher crate's `ipc::tcp_socket` does.
const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

/// Widen the kernel socket buffers on a connected stream. `nodelay` is
/// already set by the caller via tokio; this only covers what tokio's
/// `TcpStream` has no setter for.
fn tune_buffers(stream: &TcpStream) -> Result<()> {
    let raw = stream.as_raw_fd();
    let socket = unsafe { socket2::Socket::from_raw_fd(libc::dup(raw)) };
    socket
        .set_recv_buffer_size(SOCKET_BUFFER_SIZE)
        .map_err(|e| Error::InternalUnexpected(format!("set_recv_buffer_size: {e}")))?;
    socket
        .set_send_buffer_size(SOCKET_BUFFER_SIZE)
        .map_err(|e| Error::InternalUnexpected(format!("set_send_buffer_size: {e}")))?;
    // `socket` owns the duplicated fd; let it close that copy on drop,
    // leaving the tokio stream's own fd untouched.
    Ok(())
}

/// What a peer domain announces itself as on connect, before either side
/// sends a single application frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub domain_id: DomainId,
    pub domain_name: String,
    pub protocol_version: u32,
}

impl PeerIdentity {
    pub const PROTOCOL_VERSION: u32 = 1;

    pub fn this_domain(domain_id: DomainId, domain_name: impl Into<String>) -> Self {
        Self {
            domain_id,
            domain_name: domain_name.into(),
            protocol_version: Self::PROTOCOL_VERSION,
        }
    }
}

pub struct TcpDevice {
    stream: TcpStream,
    assembler: MessageAssembler,
    peer: PeerIdentity,
}

impl TcpDevice {
    /// Connect to `addr` and exchange identity with the listening domain.
    /// Retries per the caller's own backoff schedule; this function makes
    /// exactly one attempt.
    pub async fn connect(addr: std::net::SocketAddr, own: &PeerIdentity) -> Result<Self> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| Error::CommunicationRefused {
            address: addr.to_string(),
            reason: e.to_string(),
        })?;
        let mut stream = socket
            .connect(addr)
            .await
            .map_err(|e| Error::CommunicationRefused {
                address: addr.to_string(),
                reason: e.to_string(),
            })?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::InternalUnexpected(format!("set_nodelay: {e}")))?;
        tune_buffers(&stream)?;

        Self::write_handshake(&mut stream, own).await?;
        let peer = Self::read_handshake(&mut stream).await?;
        debug!(peer = %peer.domain_name, %addr, "connected to peer domain");

        Ok(Self {
            stream,
            assembler: MessageAssembler::new(),
            peer,
        })
    }

    /// Accept an already-connected socket from a `TcpListener` and
    /// complete the same handshake from the listening side.
    pub async fn accept(mut stream: TcpStream, own: &PeerIdentity) -> Result<Self> {
        stream
            .set_nodelay(true)
            .map_err(|e| Error::InternalUnexpected(format!("set_nodelay: {e}")))?;
        tune_buffers(&stream)?;
        let peer = Self::read_handshake(&mut stream).await?;
        Self::write_handshake(&mut stream, own).await?;
        debug!(peer = %peer.domain_name, "accepted peer domain connection");

        Ok(Self {
            stream,
            assembler: MessageAssembler::new(),
            peer,
        })
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    async fn write_handshake(stream: &mut TcpStream, own: &PeerIdentity) -> Result<()> {
        let payload = bincode::serialize(own)
            .map_err(|e| Error::InternalUnexpected(format!("encoding handshake: {e}")))?;
        let frame = Frame {
            message_type: HANDSHAKE_MESSAGE_TYPE,
            correlation: crate::ids::CorrelationId::new(),
            offset: 0,
            size: payload.len() as u64,
            payload,
        };
        Self::write_frame(stream, &frame).await
    }

    async fn read_handshake(stream: &mut TcpStream) -> Result<PeerIdentity> {
        let (header, payload) = Self::read_frame(stream).await?;
        if header.message_type != HANDSHAKE_MESSAGE_TYPE {
            return Err(Error::InternalUnexpected(format!(
                "expected handshake frame, got message_type {}",
                header.message_type
            )));
        }
        bincode::deserialize(&payload)
            .map_err(|e| Error::InternalUnexpected(format!("decoding handshake: {e}")))
    }

    async fn write_frame(stream: &mut TcpStream, frame: &Frame) -> Result<()> {
        let bytes = frame.encode();
        let write = async {
            stream.write_all(&bytes).await?;
            stream.flush().await
        };
        match timeout(WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::CommunicationUnavailable {
                peer: None,
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::Timeout {
                correlation: frame.correlation,
            }),
        }
    }

    async fn read_frame(stream: &mut TcpStream) -> Result<(DecodedHeader, Vec<u8>)> {
        let mut header_buf = [0u8; HEADER_SIZE];
        stream
            .read_exact(&mut header_buf)
            .await
            .map_err(|e| Error::CommunicationUnavailable {
                peer: None,
                reason: e.to_string(),
            })?;
        let header = Frame::decode_header(&header_buf)?;
        let mut payload = vec![0u8; header.count as usize];
        stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| Error::CommunicationUnavailable {
                peer: None,
                reason: e.to_string(),
            })?;
        Ok((header, payload))
    }
}

#[async_trait]
impl Device for TcpDevice {
    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        for frame in envelope.to_frames() {
            Self::write_frame(&mut self.stream, &frame).await?;
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Envelope> {
        loop {
            let (header, payload) = Self::read_frame(&mut self.stream).await?;
            let message_type = header.message_type;
            let correlation = header.correlation;
            if let Some(assembled) = self.assembler.feed(header, payload)? {
                return Envelope::from_assembled(message_type, correlation, assembled);
            }
        }
    }

    async fn try_send(&mut self, envelope: &Envelope) -> Result<()> {
        for frame in envelope.to_frames() {
            let bytes = frame.encode();
            let mut written = 0usize;
            while written < bytes.len() {
                self.stream
                    .writable()
                    .await
                    .map_err(|e| Error::InternalUnexpected(format!("awaiting writable: {e}")))?;
                match self.stream.try_write(&bytes[written..]) {
                    Ok(n) => written += n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => {
                        return Err(Error::CommunicationUnavailable {
                            peer: None,
                            reason: e.to_string(),
                        })
                    }
                }
            }
        }
        Ok(())
    }

    async fn try_receive(&mut self) -> Result<Envelope> {
        let mut header_buf = [0u8; HEADER_SIZE];
        match self.stream.try_read(&mut header_buf) {
            Ok(0) => {
                return Err(Error::CommunicationUnavailable {
                    peer: None,
                    reason: "peer closed the connection".into(),
                })
            }
            Ok(n) if n < HEADER_SIZE => {
                self.stream
                    .read_exact(&mut header_buf[n..])
                    .await
                    .map_err(|e| Error::CommunicationUnavailable {
                        peer: None,
                        reason: e.to_string(),
                    })?;
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Err(Error::NoMessage),
            Err(e) => {
                return Err(Error::CommunicationUnavailable {
                    peer: None,
                    reason: e.to_string(),
                })
            }
        }
        let header = Frame::decode_header(&header_buf)?;
        let mut payload = vec![0u8; header.count as usize];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| Error::CommunicationUnavailable {
                peer: None,
                reason: e.to_string(),
            })?;
        let message_type = header.message_type;
        let correlation = header.correlation;
        if let Some(assembled) = self.assembler.feed(header, payload)? {
            Envelope::from_assembled(message_type, correlation, assembled)
        } else {
            Err(Error::NoMessage)
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ExecutionId;
    use tokio::net::TcpListener;

    async fn handshake_pair() -> (TcpDevice, TcpDevice) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_identity = PeerIdentity::this_domain(DomainId::new(), "server-domain");
        let client_identity = PeerIdentity::this_domain(DomainId::new(), "client-domain");

        let server_identity_clone = server_identity.clone();
        let accept_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            TcpDevice::accept(stream, &server_identity_clone).await.unwrap()
        });

        let client = TcpDevice::connect(addr, &client_identity).await.unwrap();
        let server = accept_task.await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn handshake_exchanges_domain_identity() {
        let (client, server) = handshake_pair().await;
        assert_eq!(client.peer().domain_name, "server-domain");
        assert_eq!(server.peer().domain_name, "client-domain");
    }

    #[tokio::test]
    async fn round_trip_message_after_handshake() {
        let (mut client, mut server) = handshake_pair().await;
        let envelope = Envelope::new(99, ExecutionId::new(), b"gateway traffic".to_vec());
        client.send(&envelope).await.unwrap();
        let received = server.receive().await.unwrap();
        assert_eq!(received.payload, b"gateway traffic");
        assert_eq!(received.message_type, 99);
    }

    #[tokio::test]
    async fn round_trip_multi_frame_message_after_handshake() {
        let (mut client, mut server) = handshake_pair().await;
        let payload = vec![8u8; super::super::PAYLOAD_MAX * 3 + 17];
        let envelope = Envelope::new(5, ExecutionId::new(), payload.clone());
        client.send(&envelope).await.unwrap();
        let received = server.receive().await.unwrap();
        assert_eq!(received.payload, payload);
    }
}
