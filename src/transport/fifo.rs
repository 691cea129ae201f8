//! Local FIFO transport: the intra-domain [`Device`](super::Device).
//!
//! Grounded on the teacher crate's `ipc::posix_message_queue` (raw-fd /
//! `nix`-based endpoint lifecycle, creator-gated cleanup) and
//! `ipc::unix_domain_socket` (the `Drop`-based unlink-on-cleanup pattern,
//! generalized here into [`OwnedFifo`]). Unlike a POSIX message queue, a
//! named pipe preserves no message boundaries, so every read goes
//! through [`MessageAssembler`](super::MessageAssembler) the same way a
//! stream socket would.
//!
//! Each process owns exactly one inbound FIFO, named by its [`IpcId`]
//! under `${CASUAL_DOMAIN_HOME}/ipc/`. Senders open the receiver's
//! inbound FIFO for writing; a [`FifoDevice`] therefore pairs one
//! self-owned inbound endpoint with a lazily-opened outbound endpoint to
//! a single peer, mirroring the old transport's per-peer `_c2s`/`_s2c`
//! queue pairing but as two named pipes instead of two message queues.

use super::{DecodedHeader, Device, Envelope, Frame, MessageAssembler, HEADER_SIZE};
use crate::error::{Error, Result};
use crate::ids::{IpcId, ProcessHandle};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{close, mkfifo, read, unlink, write};
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

/// A FIFO special file on disk, removed on drop by whichever side created
/// it. Opening processes that merely connect to an existing peer's inbox
/// never own it and must not unlink it out from under the peer.
struct OwnedFifo {
    path: PathBuf,
    owner: bool,
}

impl OwnedFifo {
    fn create(path: PathBuf) -> Result<Self> {
        match mkfifo(&path, Mode::from_bits_truncate(0o660)) {
            Ok(()) => {}
            Err(Errno::EEXIST) => {
                debug!(path = %path.display(), "stale fifo present, reusing");
            }
            Err(e) => return Err(Error::from_errno(e, None)),
        }
        Ok(Self { path, owner: true })
    }
}

impl Drop for OwnedFifo {
    fn drop(&mut self) {
        if self.owner {
            if let Err(e) = unlink(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to unlink fifo on drop");
            }
        }
    }
}

/// A raw fd closed on drop; holds the self-write handle that keeps an
/// inbound FIFO's read side from ever observing EOF, and any lazily
/// opened outbound handle.
struct OwnedFd(RawFd);

impl Drop for OwnedFd {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

fn open_raw(path: &Path, flags: OFlag) -> Result<RawFd> {
    open(path, flags, Mode::from_bits_truncate(0o660)).map_err(|e| Error::from_errno(e, None))
}

/// Point-to-point FIFO channel: a self-owned inbound endpoint paired
/// with an outbound endpoint opened lazily against a named peer.
pub struct FifoDevice {
    ipc_dir: PathBuf,
    _inbound_fifo: OwnedFifo,
    _inbound_keepalive: OwnedFd,
    inbound: AsyncFd<RawFd>,
    outbound_ipc_id: IpcId,
    outbound: Option<AsyncFd<RawFd>>,
    assembler: MessageAssembler,
    peer: Option<ProcessHandle>,
}

impl FifoDevice {
    fn inbox_path(ipc_dir: &Path, id: &IpcId) -> PathBuf {
        ipc_dir.join(id.to_string())
    }

    /// Bind this process's own inbound FIFO and prepare to exchange
    /// frames with `peer_ipc_id`. The outbound side is opened lazily on
    /// first send, since the peer's FIFO may not exist yet at bind time.
    pub fn bind(ipc_dir: &Path, own_ipc_id: IpcId, outbound_ipc_id: IpcId) -> Result<Self> {
        std::fs::create_dir_all(ipc_dir)
            .map_err(|e| Error::InternalUnexpected(format!("creating ipc dir: {e}")))?;

        let path = Self::inbox_path(ipc_dir, &own_ipc_id);
        let fifo = OwnedFifo::create(path.clone())?;

        let read_fd = open_raw(&path, OFlag::O_RDONLY | OFlag::O_NONBLOCK)?;
        // Hold a write end open ourselves so the read side never sees
        // EOF between peers closing and reopening their write handle.
        let keepalive_fd = open_raw(&path, OFlag::O_WRONLY | OFlag::O_NONBLOCK)?;

        let inbound = AsyncFd::new(read_fd)
            .map_err(|e| Error::InternalUnexpected(format!("registering inbound fd: {e}")))?;

        Ok(Self {
            ipc_dir: ipc_dir.to_path_buf(),
            _inbound_fifo: fifo,
            _inbound_keepalive: OwnedFd(keepalive_fd),
            inbound,
            outbound_ipc_id,
            outbound: None,
            assembler: MessageAssembler::new(),
            peer: None,
        })
    }

    pub fn with_peer(mut self, peer: ProcessHandle) -> Self {
        self.peer = Some(peer);
        self
    }

    fn ensure_outbound(&mut self) -> Result<()> {
        if self.outbound.is_some() {
            return Ok(());
        }
        let path = Self::inbox_path(&self.ipc_dir, &self.outbound_ipc_id);
        let fd = open_raw(&path, OFlag::O_WRONLY | OFlag::O_NONBLOCK).map_err(|e| {
            if let Error::InternalUnexpected(_) = e {
                e
            } else {
                Error::CommunicationUnavailable {
                    peer: self.peer,
                    reason: format!("peer fifo {} not reachable: {e}", path.display()),
                }
            }
        })?;
        self.outbound = Some(
            AsyncFd::new(fd)
                .map_err(|e| Error::InternalUnexpected(format!("registering outbound fd: {e}")))?,
        );
        Ok(())
    }

    async fn write_all_blocking(&mut self, buf: &[u8]) -> Result<()> {
        self.ensure_outbound()?;
        let mut written = 0usize;
        while written < buf.len() {
            let outbound = self.outbound.as_mut().expect("ensured above");
            let mut guard = outbound
                .writable()
                .await
                .map_err(|e| Error::InternalUnexpected(format!("awaiting writable: {e}")))?;
            match write(unsafe { BorrowedFd::borrow_raw(*guard.get_inner()) }, &buf[written..]) {
                Ok(n) => written += n,
                Err(Errno::EAGAIN) => {
                    guard.clear_ready();
                    continue;
                }
                Err(e) => return Err(Error::from_errno(e, self.peer)),
            }
        }
        Ok(())
    }

    fn try_write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.ensure_outbound()?;
        let outbound = self.outbound.as_ref().expect("ensured above");
        let mut written = 0usize;
        while written < buf.len() {
            match write(unsafe { BorrowedFd::borrow_raw(*outbound.get_ref()) }, &buf[written..]) {
                Ok(n) => written += n,
                Err(Errno::EAGAIN) if written == 0 => return Err(Error::NoMessage),
                Err(Errno::EAGAIN) => continue,
                Err(e) => return Err(Error::from_errno(e, self.peer)),
            }
        }
        Ok(())
    }

    async fn read_exact_blocking(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut got = 0usize;
        while got < buf.len() {
            let mut guard = self
                .inbound
                .readable()
                .await
                .map_err(|e| Error::InternalUnexpected(format!("awaiting readable: {e}")))?;
            match read(unsafe { BorrowedFd::borrow_raw(*guard.get_inner()) }, &mut buf[got..]) {
                Ok(0) => {
                    return Err(Error::CommunicationUnavailable {
                        peer: self.peer,
                        reason: "inbound fifo reached EOF".into(),
                    })
                }
                Ok(n) => got += n,
                Err(Errno::EAGAIN) => {
                    guard.clear_ready();
                    continue;
                }
                Err(e) => return Err(Error::from_errno(e, self.peer)),
            }
        }
        Ok(())
    }

    fn try_read_exact(&mut self, buf: &mut [u8], allow_empty_start: bool) -> Result<bool> {
        let mut got = 0usize;
        while got < buf.len() {
            match read(unsafe { BorrowedFd::borrow_raw(*self.inbound.get_ref()) }, &mut buf[got..]) {
                Ok(0) => {
                    return Err(Error::CommunicationUnavailable {
                        peer: self.peer,
                        reason: "inbound fifo reached EOF".into(),
                    })
                }
                Ok(n) => got += n,
                Err(Errno::EAGAIN) if got == 0 && allow_empty_start => return Ok(false),
                Err(Errno::EAGAIN) => continue,
                Err(e) => return Err(Error::from_errno(e, self.peer)),
            }
        }
        Ok(true)
    }

    async fn receive_frame_blocking(&mut self) -> Result<(DecodedHeader, Vec<u8>)> {
        let mut header_buf = [0u8; HEADER_SIZE];
        self.read_exact_blocking(&mut header_buf).await?;
        let header = Frame::decode_header(&header_buf)?;
        let mut payload = vec![0u8; header.count as usize];
        self.read_exact_blocking(&mut payload).await?;
        Ok((header, payload))
    }
}

#[async_trait]
impl Device for FifoDevice {
    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        for frame in envelope.to_frames() {
            self.write_all_blocking(&frame.encode()).await?;
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Envelope> {
        loop {
            let (header, payload) = self.receive_frame_blocking().await?;
            let message_type = header.message_type;
            let correlation = header.correlation;
            if let Some(assembled) = self.assembler.feed(header, payload)? {
                return Envelope::from_assembled(message_type, correlation, assembled);
            }
        }
    }

    async fn try_send(&mut self, envelope: &Envelope) -> Result<()> {
        for frame in envelope.to_frames() {
            self.try_write_all(&frame.encode())?;
        }
        Ok(())
    }

    async fn try_receive(&mut self) -> Result<Envelope> {
        loop {
            let mut header_buf = [0u8; HEADER_SIZE];
            if !self.try_read_exact(&mut header_buf, true)? {
                return Err(Error::NoMessage);
            }
            let header = Frame::decode_header(&header_buf)?;
            let mut payload = vec![0u8; header.count as usize];
            self.try_read_exact(&mut payload, false)?;
            let message_type = header.message_type;
            let correlation = header.correlation;
            if let Some(assembled) = self.assembler.feed(header, payload)? {
                return Envelope::from_assembled(message_type, correlation, assembled);
            }
        }
    }

    fn raw_fd(&self) -> RawFd {
        *self.inbound.get_ref()
    }
}

/// Bind a throwaway inbound endpoint, send one envelope to `peer`, and
/// let it drop. For a server process replying to whichever caller a
/// request's payload names (`LookupRequest.caller`, `DequeueRequest.
/// caller`, ...): holding one long-lived [`FifoDevice`] per distinct
/// caller would mean an unbounded connection table, so each reply pays
/// the (cheap, `mkfifo`-then-`unlink`) cost of its own endpoint instead.
pub async fn send_once(ipc_dir: &Path, peer: IpcId, envelope: &Envelope) -> Result<()> {
    let mut device = FifoDevice::bind(ipc_dir, IpcId::new(), peer)?;
    device.send(envelope).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ExecutionId;

    fn temp_ipc_dir() -> tempfile::TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    #[tokio::test]
    async fn round_trip_small_message() {
        let dir = temp_ipc_dir();
        let a_id = IpcId::new();
        let b_id = IpcId::new();

        let mut a = FifoDevice::bind(dir.path(), a_id, b_id).expect("bind a");
        let mut b = FifoDevice::bind(dir.path(), b_id, a_id).expect("bind b");

        let envelope = Envelope::new(42, ExecutionId::new(), b"hello casual".to_vec());
        a.send(&envelope).await.expect("send");
        let received = b.receive().await.expect("receive");

        assert_eq!(received.message_type, 42);
        assert_eq!(received.payload, b"hello casual");
        assert_eq!(received.correlation, envelope.correlation);
    }

    #[tokio::test]
    async fn round_trip_multi_frame_message() {
        let dir = temp_ipc_dir();
        let a_id = IpcId::new();
        let b_id = IpcId::new();

        let mut a = FifoDevice::bind(dir.path(), a_id, b_id).expect("bind a");
        let mut b = FifoDevice::bind(dir.path(), b_id, a_id).expect("bind b");

        let payload = vec![3u8; super::super::PAYLOAD_MAX * 2 + 500];
        let envelope = Envelope::new(7, ExecutionId::new(), payload.clone());
        a.send(&envelope).await.expect("send");
        let received = b.receive().await.expect("receive");

        assert_eq!(received.payload, payload);
    }

    #[tokio::test]
    async fn try_receive_reports_no_message_when_empty() {
        let dir = temp_ipc_dir();
        let a_id = IpcId::new();
        let b_id = IpcId::new();
        let mut b = FifoDevice::bind(dir.path(), b_id, a_id).expect("bind b");

        let err = b.try_receive().await.unwrap_err();
        assert!(matches!(err, Error::NoMessage));
    }

    #[test]
    fn dropping_owner_unlinks_the_fifo() {
        let dir = temp_ipc_dir();
        let id = IpcId::new();
        let path = dir.path().join(id.to_string());
        {
            let fifo = OwnedFifo::create(path.clone()).expect("create");
            assert!(path.exists());
            drop(fifo);
        }
        assert!(!path.exists());
    }
}
