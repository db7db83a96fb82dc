//! Per-fiber state and user-facing handles.
//!
//! A fiber is a logical bidirectional byte stream identified by its
//! (local port, remote port) pair. The demux owns all fiber state in its
//! tables; the handles here carry the key and validate it on every
//! operation, so closing a fiber (or the whole demux) from anywhere wakes
//! and fails every pending operation instead of leaving dangling owners.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::demux::queue::FiberKey;
use crate::demux::Shared;
use crate::error::DemuxError;

/// Receive window and initial send credit per direction, in bytes.
pub const FIBER_WINDOW: u32 = 64 * 1024;

/// Fiber lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Open request sent, no answer yet
    Connecting,
    /// Established in both directions
    Open,
    /// One direction closed (local shutdown or peer FIN)
    HalfClosed,
    /// Both directions closed or reset; entry lingers briefly
    Closed,
}

/// Demux-side fiber record.
#[derive(Debug)]
pub(crate) struct FiberEntry {
    pub(crate) state: FiberState,
    /// Bytes we may still send before the peer returns credits
    pub(crate) send_credits: u32,
    pub(crate) send_notify: Arc<Notify>,
    /// Reassembled inbound data, in arrival order
    pub(crate) recv: VecDeque<Bytes>,
    pub(crate) recv_len: usize,
    pub(crate) recv_notify: Arc<Notify>,
    /// Peer sent FIN: no more data will arrive
    pub(crate) peer_fin: bool,
    /// We sent FIN (or the handle was dropped)
    pub(crate) local_fin: bool,
    /// Terminal error; set by RST or demux teardown
    pub(crate) error: Option<DemuxError>,
    /// Both user halves have been dropped; no one will read this entry
    pub(crate) released: bool,
    /// Completes the initiator's `connect` on SYN_ACK or RST
    pub(crate) open_tx: Option<oneshot::Sender<Result<(), DemuxError>>>,
}

impl FiberEntry {
    pub(crate) fn connecting(open_tx: oneshot::Sender<Result<(), DemuxError>>) -> Self {
        Self {
            state: FiberState::Connecting,
            send_credits: FIBER_WINDOW,
            send_notify: Arc::new(Notify::new()),
            recv: VecDeque::new(),
            recv_len: 0,
            recv_notify: Arc::new(Notify::new()),
            peer_fin: false,
            local_fin: false,
            error: None,
            released: false,
            open_tx: Some(open_tx),
        }
    }

    pub(crate) fn accepted() -> Self {
        Self {
            state: FiberState::Open,
            send_credits: FIBER_WINDOW,
            send_notify: Arc::new(Notify::new()),
            recv: VecDeque::new(),
            recv_len: 0,
            recv_notify: Arc::new(Notify::new()),
            peer_fin: false,
            local_fin: false,
            error: None,
            released: false,
            open_tx: None,
        }
    }

    /// Recompute the lifecycle state from the close flags.
    pub(crate) fn update_state(&mut self) {
        if self.error.is_some() || (self.peer_fin && self.local_fin) {
            self.state = FiberState::Closed;
        } else if self.peer_fin || self.local_fin {
            if self.state == FiberState::Open {
                self.state = FiberState::HalfClosed;
            }
        }
    }

    /// Fail the entry, completing a pending connect and waking waiters.
    pub(crate) fn fail(&mut self, error: DemuxError) {
        if self.error.is_none() {
            self.error = Some(error.clone());
        }
        self.state = FiberState::Closed;
        if let Some(tx) = self.open_tx.take() {
            let _ = tx.send(Err(error));
        }
        self.send_notify.notify_one();
        self.recv_notify.notify_one();
    }
}

/// Shared by the read/write halves; the last clone to drop closes the
/// fiber gracefully.
#[derive(Debug)]
pub(crate) struct FiberGuard {
    pub(crate) shared: Arc<Shared>,
    pub(crate) key: FiberKey,
}

impl Drop for FiberGuard {
    fn drop(&mut self) {
        self.shared.release_fiber(self.key);
    }
}

/// An established fiber: a flow-controlled bidirectional byte stream.
///
/// Reads and writes are independent; [`Fiber::split`] hands out the two
/// halves for concurrent use (an echoing peer with both windows full needs
/// the local side to read while it writes).
#[derive(Debug)]
pub struct Fiber {
    reader: FiberReader,
    writer: FiberWriter,
}

impl Fiber {
    pub(crate) fn new(shared: Arc<Shared>, key: FiberKey) -> Self {
        let guard = Arc::new(FiberGuard { shared, key });
        Self {
            reader: FiberReader { guard: Arc::clone(&guard) },
            writer: FiberWriter { guard },
        }
    }

    /// Local fiber port.
    #[must_use]
    pub fn local_port(&self) -> u32 {
        self.reader.guard.key.0
    }

    /// Remote fiber port.
    #[must_use]
    pub fn peer_port(&self) -> u32 {
        self.reader.guard.key.1
    }

    /// Read up to `buf.len()` bytes; `Ok(0)` means the peer half-closed.
    ///
    /// # Errors
    ///
    /// The fiber's terminal error (reset, teardown, abort).
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, DemuxError> {
        self.reader.read(buf).await
    }

    /// Read exactly `buf.len()` bytes.
    ///
    /// # Errors
    ///
    /// [`DemuxError::Reset`] if the peer half-closes mid-buffer, or the
    /// fiber's terminal error.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DemuxError> {
        self.reader.read_exact(buf).await
    }

    /// Write the whole buffer, suspending while the credit window is empty.
    ///
    /// # Errors
    ///
    /// The fiber's terminal error, or [`DemuxError::AlreadyClosed`] after a
    /// local shutdown.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), DemuxError> {
        self.writer.write_all(buf).await
    }

    /// Half-close the write direction (sends FIN).
    pub fn shutdown(&mut self) {
        self.writer.shutdown();
    }

    /// Split into independently usable read and write halves.
    #[must_use]
    pub fn split(self) -> (FiberReader, FiberWriter) {
        (self.reader, self.writer)
    }
}

/// Read half of a [`Fiber`].
#[derive(Debug)]
pub struct FiberReader {
    guard: Arc<FiberGuard>,
}

impl FiberReader {
    /// See [`Fiber::read`].
    ///
    /// # Errors
    ///
    /// The fiber's terminal error.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, DemuxError> {
        self.guard.shared.read_fiber(self.guard.key, buf).await
    }

    /// Read exactly `buf.len()` bytes.
    ///
    /// # Errors
    ///
    /// [`DemuxError::Reset`] if the peer half-closes mid-buffer, or the
    /// fiber's terminal error.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DemuxError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(DemuxError::Reset);
            }
            filled += n;
        }
        Ok(())
    }
}

/// Write half of a [`Fiber`].
#[derive(Debug)]
pub struct FiberWriter {
    guard: Arc<FiberGuard>,
}

impl FiberWriter {
    /// See [`Fiber::write_all`].
    ///
    /// # Errors
    ///
    /// The fiber's terminal error, or [`DemuxError::AlreadyClosed`] after a
    /// local shutdown.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), DemuxError> {
        self.guard.shared.write_fiber(self.guard.key, buf).await
    }

    /// Half-close the write direction (sends FIN).
    pub fn shutdown(&mut self) {
        self.guard.shared.shutdown_fiber(self.guard.key);
    }
}

/// Accepts inbound fibers on one listening port.
pub struct FiberListener {
    pub(crate) shared: Arc<Shared>,
    pub(crate) port: u32,
    pub(crate) rx: mpsc::Receiver<Fiber>,
}

impl FiberListener {
    /// The listening fiber port.
    #[must_use]
    pub fn port(&self) -> u32 {
        self.port
    }

    /// Wait for the next established inbound fiber.
    ///
    /// # Errors
    ///
    /// [`DemuxError::Aborted`] once the demux is closed.
    pub async fn accept(&mut self) -> Result<Fiber, DemuxError> {
        self.rx.recv().await.ok_or(DemuxError::Aborted)
    }
}

impl Drop for FiberListener {
    fn drop(&mut self) {
        self.shared.remove_acceptor(self.port);
    }
}

/// A datagram endpoint bound to one fiber port.
///
/// Datagrams are unreliable and uncredited: a datagram for a port nobody
/// bound, or one arriving faster than the receiver drains, is dropped.
pub struct DgramSocket {
    pub(crate) shared: Arc<Shared>,
    pub(crate) port: u32,
    pub(crate) rx: mpsc::Receiver<(u32, Bytes)>,
}

impl DgramSocket {
    /// The bound fiber port.
    #[must_use]
    pub fn port(&self) -> u32 {
        self.port
    }

    /// Send a datagram to `dst_port` on the peer.
    ///
    /// # Errors
    ///
    /// [`DemuxError::ProtocolViolation`] for payloads over the MTU,
    /// [`DemuxError::AlreadyClosed`] once the demux is closed.
    pub fn send_to(&self, dst_port: u32, payload: Bytes) -> Result<(), DemuxError> {
        self.shared.send_dgram(self.port, dst_port, payload)
    }

    /// Receive the next datagram as `(source port, payload)`.
    ///
    /// # Errors
    ///
    /// [`DemuxError::Aborted`] once the demux is closed.
    pub async fn recv_from(&mut self) -> Result<(u32, Bytes), DemuxError> {
        self.rx.recv().await.ok_or(DemuxError::Aborted)
    }
}

impl Drop for DgramSocket {
    fn drop(&mut self) {
        self.shared.remove_dgram(self.port);
    }
}
