//! Fiber demultiplexer.
//!
//! Presents many independent, flow-controlled byte streams (fibers) and
//! unreliable datagram endpoints over one underlying stream socket. Runs
//! over any established layer stack.
//!
//! # Wire behavior
//!
//! Frames are [`ssf_proto::FiberFrame`]s. Stream frames drive per-fiber
//! state machines; `StreamAck` frames carry a 4-byte little-endian credit
//! grant; `Dgram` frames are connectionless; `Keepalive` frames only
//! refresh link liveness.
//!
//! # Tasks
//!
//! One **reader** task parses inbound frames and dispatches them into the
//! fiber tables; one **writer** task drains the outbound scheduler
//! (control > acks > data, data round-robin). User handles never touch the
//! socket: they operate on the shared tables and wake the writer.
//!
//! # Flow control
//!
//! Each direction of each fiber starts with a 64 KiB credit window.
//! Senders spend credits per payload byte and suspend at zero; receivers
//! return credits as the application consumes from the receive buffer, so
//! credits returned never exceed bytes consumed.

mod fiber;
mod queue;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, Bytes};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;

use ssf_proto::{FiberFrame, FrameHeader, FrameType};

pub use fiber::{
    DgramSocket, Fiber, FiberListener, FiberReader, FiberState, FiberWriter, FIBER_WINDOW,
};
use fiber::FiberEntry;
use queue::{FiberKey, Outbound};

use crate::error::DemuxError;

/// Ephemeral port range for locally initiated fibers.
const EPHEMERAL_RANGE: std::ops::RangeInclusive<u32> = 49152..=65535;
/// Attempts at drawing an unused ephemeral port before giving up.
const PORT_ATTEMPTS: usize = 1024;
/// How long a closed fiber's entry lingers before removal.
const CLOSE_LINGER: Duration = Duration::from_millis(500);
/// Pending-accept backlog per listening port. Bursts of opens land faster
/// than acceptors drain them; a SYN beyond this bound is answered with a
/// reset rather than queued without limit.
const ACCEPT_BACKLOG: usize = 256;
/// Inbound datagrams buffered per bound port; excess is dropped.
const DGRAM_BACKLOG: usize = 64;

/// The demultiplexer over one connection.
///
/// Dropping (or [`close`](FiberDemux::close)-ing) it cancels every pending
/// operation on every fiber with [`DemuxError::Aborted`].
#[derive(Debug)]
pub struct FiberDemux {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

#[derive(Debug)]
pub(crate) struct Shared {
    mtu: usize,
    tables: Mutex<Tables>,
    outbound: Mutex<Outbound>,
    outbound_ready: Notify,
    closed_tx: watch::Sender<Option<DemuxError>>,
}

#[derive(Default, Debug)]
struct Tables {
    fibers: HashMap<FiberKey, FiberEntry>,
    acceptors: HashMap<u32, mpsc::Sender<Fiber>>,
    dgrams: HashMap<u32, mpsc::Sender<(u32, Bytes)>>,
    closed: bool,
    close_reason: Option<DemuxError>,
}

impl Tables {
    fn port_in_use(&self, port: u32) -> bool {
        self.acceptors.contains_key(&port)
            || self.dgrams.contains_key(&port)
            || self.fibers.keys().any(|(local, _)| *local == port)
    }
}

impl FiberDemux {
    /// Start the demux over an established stream.
    ///
    /// `stack_mtu` is the enclosing stack's MTU; frame payloads are capped
    /// at `stack_mtu - 16` (the frame header).
    pub fn new<S>(stream: S, stack_mtu: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mtu = stack_mtu
            .saturating_sub(FrameHeader::SIZE)
            .min(FrameHeader::MAX_PAYLOAD_LEN)
            .max(1);

        let (closed_tx, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            mtu,
            tables: Mutex::new(Tables::default()),
            outbound: Mutex::new(Outbound::default()),
            outbound_ready: Notify::new(),
            closed_tx,
        });

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = tokio::spawn(run_reader(read_half, Arc::clone(&shared)));
        let writer = tokio::spawn(run_writer(write_half, Arc::clone(&shared)));

        Self { shared, reader, writer }
    }

    /// Largest stream chunk or datagram payload this demux will frame.
    #[must_use]
    pub fn mtu(&self) -> usize {
        self.shared.mtu
    }

    /// Open a fiber to `dst_port` on the peer.
    ///
    /// Picks an unused random ephemeral source port, sends `StreamSyn` and
    /// waits for the answer.
    ///
    /// # Errors
    ///
    /// [`DemuxError::Refused`] when no acceptor is listening on the peer,
    /// [`DemuxError::PortsExhausted`] when the ephemeral range is full,
    /// [`DemuxError::Aborted`] on teardown.
    pub async fn connect(&self, dst_port: u32) -> Result<Fiber, DemuxError> {
        self.shared.connect(dst_port).await
    }

    /// Listen for inbound fibers on `port`.
    ///
    /// # Errors
    ///
    /// [`DemuxError::PortInUse`] when the port already has a binding,
    /// [`DemuxError::AlreadyClosed`] after teardown.
    pub fn listen(&self, port: u32) -> Result<FiberListener, DemuxError> {
        self.shared.listen(port)
    }

    /// Bind a datagram socket on `port`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`listen`](Self::listen).
    pub fn bind_dgram(&self, port: u32) -> Result<DgramSocket, DemuxError> {
        self.shared.bind_dgram(port)
    }

    /// Number of live fiber entries (includes lingering closed entries).
    #[must_use]
    pub fn fiber_count(&self) -> usize {
        self.shared.tables.lock().expect("demux lock").fibers.len()
    }

    /// Send a link keep-alive frame.
    pub fn send_keepalive(&self) {
        self.shared
            .enqueue_control(FiberFrame::control(FrameType::Keepalive, 0, 0));
    }

    /// Tear the demux down: every fiber, listener and datagram socket
    /// completes with [`DemuxError::Aborted`].
    pub fn close(&self) {
        self.shared.teardown(DemuxError::Aborted);
        self.reader.abort();
    }

    /// Tear down with a specific reason (used by the control plane when
    /// the peer times out).
    pub fn close_with(&self, reason: DemuxError) {
        self.shared.teardown(reason);
        self.reader.abort();
    }

    /// Wait until the demux is torn down, returning the reason.
    pub async fn until_closed(&self) -> DemuxError {
        let mut rx = self.shared.closed_tx.subscribe();
        loop {
            let current = rx.borrow().as_ref().cloned();
            if let Some(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                return DemuxError::Aborted;
            }
        }
    }
}

impl Drop for FiberDemux {
    fn drop(&mut self) {
        self.shared.teardown(DemuxError::Aborted);
        self.reader.abort();
        self.writer.abort();
    }
}

// ---------------------------------------------------------------- tasks

async fn run_reader<S>(mut read: ReadHalf<S>, shared: Arc<Shared>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let reason = match read_loop(&mut read, &shared).await {
        Ok(()) => DemuxError::Reset,
        Err(reason) => reason,
    };
    tracing::debug!(%reason, "demux reader stopped");
    shared.teardown(reason);
}

async fn read_loop<S>(read: &mut ReadHalf<S>, shared: &Arc<Shared>) -> Result<(), DemuxError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut header_buf = [0u8; FrameHeader::SIZE];
    loop {
        read.read_exact(&mut header_buf).await.map_err(map_read_err)?;
        let header = *FrameHeader::from_bytes(&header_buf)?;

        let payload_len = header.payload_len() as usize;
        if payload_len > shared.mtu {
            return Err(DemuxError::ProtocolViolation(format!(
                "frame payload {payload_len} exceeds mtu {}",
                shared.mtu
            )));
        }

        let payload = if payload_len == 0 {
            Bytes::new()
        } else {
            let mut buf = vec![0u8; payload_len];
            read.read_exact(&mut buf).await.map_err(map_read_err)?;
            Bytes::from(buf)
        };

        shared.dispatch(header, payload)?;
    }
}

fn map_read_err(err: std::io::Error) -> DemuxError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        DemuxError::Reset
    } else {
        DemuxError::Transport(err.to_string())
    }
}

async fn run_writer<S>(mut write: WriteHalf<S>, shared: Arc<Shared>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut buf = Vec::with_capacity(4096);
    loop {
        let (frame, drained) = {
            let mut outbound = shared.outbound.lock().expect("demux lock");
            let frame = outbound.pop();
            let drained = outbound.is_empty();
            (frame, drained)
        };

        match frame {
            Some(frame) => {
                buf.clear();
                frame.encode(&mut buf);
                if let Err(err) = write.write_all(&buf).await {
                    shared.teardown(DemuxError::Transport(err.to_string()));
                    return;
                }
                if drained {
                    if let Err(err) = write.flush().await {
                        shared.teardown(DemuxError::Transport(err.to_string()));
                        return;
                    }
                }
            }
            None => {
                if shared.outbound.lock().expect("demux lock").closed {
                    let _ = write.shutdown().await;
                    return;
                }
                shared.outbound_ready.notified().await;
            }
        }
    }
}

// ----------------------------------------------------------- dispatch

impl Shared {
    fn dispatch(self: &Arc<Self>, header: FrameHeader, payload: Bytes) -> Result<(), DemuxError> {
        let frame_type = header
            .frame_type()
            .expect("validated by FrameHeader::from_bytes");
        let src = header.src_port();
        let dst = header.dst_port();
        // The fiber a frame addresses is keyed (our port, their port).
        let key: FiberKey = (dst, src);

        match frame_type {
            FrameType::StreamSyn => self.on_syn(key),
            FrameType::StreamSynAck => {
                self.on_syn_ack(key);
                Ok(())
            }
            FrameType::StreamRst => {
                self.on_rst(key);
                Ok(())
            }
            FrameType::StreamFin => {
                self.on_fin(key);
                Ok(())
            }
            FrameType::StreamData => self.on_data(key, payload),
            FrameType::StreamAck => self.on_ack(key, &payload),
            FrameType::Dgram => {
                self.on_dgram(src, dst, payload);
                Ok(())
            }
            FrameType::Keepalive => Ok(()),
        }
    }

    fn on_syn(self: &Arc<Self>, key: FiberKey) -> Result<(), DemuxError> {
        let (local, remote) = key;
        let mut tables = self.tables.lock().expect("demux lock");

        if let Some(entry) = tables.fibers.get_mut(&key) {
            match entry.state {
                // Duplicate SYN on an established fiber: ignore.
                FiberState::Open | FiberState::HalfClosed | FiberState::Closed => return Ok(()),
                FiberState::Connecting => {
                    // Simultaneous open on a mirrored port pair. The SYN
                    // with the lower source port wins; the loser's SYN is
                    // answered with a reset.
                    if remote < local {
                        // Their SYN wins: sacrifice our connect, then fall
                        // through to normal SYN handling.
                        entry.fail(DemuxError::Refused);
                        tables.fibers.remove(&key);
                    } else {
                        drop(tables);
                        self.enqueue_control(FiberFrame::control(
                            FrameType::StreamRst,
                            local,
                            remote,
                        ));
                        return Ok(());
                    }
                }
            }
        }

        let Some(acceptor) = tables.acceptors.get(&local).cloned() else {
            drop(tables);
            tracing::debug!(port = local, "syn for port with no acceptor");
            self.enqueue_control(FiberFrame::control(FrameType::StreamRst, local, remote));
            return Ok(());
        };

        tables.fibers.insert(key, FiberEntry::accepted());
        drop(tables);

        let handle = Fiber::new(Arc::clone(self), key);
        match acceptor.try_send(handle) {
            Ok(()) => {
                self.enqueue_control(FiberFrame::control(FrameType::StreamSynAck, local, remote));
            }
            Err(_) => {
                // Backlog full or listener just dropped.
                let mut tables = self.tables.lock().expect("demux lock");
                if let Some(mut entry) = tables.fibers.remove(&key) {
                    entry.fail(DemuxError::Aborted);
                }
                drop(tables);
                self.enqueue_control(FiberFrame::control(FrameType::StreamRst, local, remote));
            }
        }
        Ok(())
    }

    fn on_syn_ack(self: &Arc<Self>, key: FiberKey) {
        let mut tables = self.tables.lock().expect("demux lock");
        match tables.fibers.get_mut(&key) {
            Some(entry) if entry.state == FiberState::Connecting => {
                entry.state = FiberState::Open;
                if let Some(tx) = entry.open_tx.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Some(_) => {} // duplicate, ignore
            None => {
                drop(tables);
                self.enqueue_control(FiberFrame::control(FrameType::StreamRst, key.0, key.1));
            }
        }
    }

    fn on_rst(self: &Arc<Self>, key: FiberKey) {
        let mut tables = self.tables.lock().expect("demux lock");
        let Some(entry) = tables.fibers.get_mut(&key) else {
            return; // reset for a port we no longer know: ignore
        };
        let was_connecting = entry.state == FiberState::Connecting;
        entry.fail(if was_connecting { DemuxError::Refused } else { DemuxError::Reset });

        if was_connecting || entry.released {
            // No handle will ever look at this entry again.
            tables.fibers.remove(&key);
        } else {
            // Keep it for the linger window so late reads observe the
            // reset instead of a missing fiber.
            drop(tables);
            self.schedule_linger(key);
        }
    }

    fn on_fin(self: &Arc<Self>, key: FiberKey) {
        let mut tables = self.tables.lock().expect("demux lock");
        let Some(entry) = tables.fibers.get_mut(&key) else {
            return;
        };
        if entry.peer_fin {
            return;
        }
        entry.peer_fin = true;
        entry.update_state();
        entry.recv_notify.notify_one();
        let closed = entry.state == FiberState::Closed;
        drop(tables);
        if closed {
            self.schedule_linger(key);
        }
    }

    fn on_data(self: &Arc<Self>, key: FiberKey, payload: Bytes) -> Result<(), DemuxError> {
        let mut tables = self.tables.lock().expect("demux lock");
        let Some(entry) = tables.fibers.get_mut(&key) else {
            drop(tables);
            tracing::debug!(port = key.0, "data frame for unknown port");
            self.enqueue_control(FiberFrame::control(FrameType::StreamRst, key.0, key.1));
            return Ok(());
        };

        if entry.state == FiberState::Connecting {
            return Err(DemuxError::ProtocolViolation(
                "data frame before open acknowledgment".to_string(),
            ));
        }
        if entry.peer_fin {
            return Err(DemuxError::ProtocolViolation(
                "data frame after fin".to_string(),
            ));
        }
        if entry.error.is_some() {
            return Ok(()); // draining toward removal
        }
        if entry.recv_len + payload.len() > FIBER_WINDOW as usize {
            return Err(DemuxError::ProtocolViolation(format!(
                "receive window overrun: {} + {} > {}",
                entry.recv_len,
                payload.len(),
                FIBER_WINDOW
            )));
        }

        entry.recv_len += payload.len();
        entry.recv.push_back(payload);
        entry.recv_notify.notify_one();
        Ok(())
    }

    fn on_ack(self: &Arc<Self>, key: FiberKey, payload: &Bytes) -> Result<(), DemuxError> {
        if payload.len() != 4 {
            return Err(DemuxError::ProtocolViolation(format!(
                "credit ack with {}-byte payload",
                payload.len()
            )));
        }
        let granted = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);

        let mut tables = self.tables.lock().expect("demux lock");
        let Some(entry) = tables.fibers.get_mut(&key) else {
            return Ok(()); // late ack for a removed fiber
        };
        let credits = entry.send_credits.checked_add(granted);
        match credits {
            Some(total) if total <= FIBER_WINDOW => {
                entry.send_credits = total;
                entry.send_notify.notify_one();
                Ok(())
            }
            _ => Err(DemuxError::ProtocolViolation(format!(
                "credit grant overflows window: {} + {granted}",
                entry.send_credits
            ))),
        }
    }

    fn on_dgram(&self, src: u32, dst: u32, payload: Bytes) {
        let tables = self.tables.lock().expect("demux lock");
        if let Some(tx) = tables.dgrams.get(&dst) {
            // Unreliable: a full receiver drops the datagram.
            let _ = tx.try_send((src, payload));
        } else {
            tracing::trace!(port = dst, "datagram for unbound port dropped");
        }
    }
}

// ------------------------------------------------------------- handle ops

impl Shared {
    async fn connect(self: &Arc<Self>, dst_port: u32) -> Result<Fiber, DemuxError> {
        let (tx, rx) = oneshot::channel();

        let key = {
            let mut tables = self.tables.lock().expect("demux lock");
            if tables.closed {
                return Err(tables.close_reason.clone().unwrap_or(DemuxError::AlreadyClosed));
            }

            let mut rng = rand::thread_rng();
            let mut picked = None;
            for _ in 0..PORT_ATTEMPTS {
                let port = rng.gen_range(EPHEMERAL_RANGE);
                if !tables.port_in_use(port) {
                    picked = Some(port);
                    break;
                }
            }
            let local = picked.ok_or(DemuxError::PortsExhausted)?;
            let key = (local, dst_port);
            tables.fibers.insert(key, FiberEntry::connecting(tx));
            key
        };

        self.enqueue_control(FiberFrame::control(FrameType::StreamSyn, key.0, key.1));
        tracing::debug!(src = key.0, dst = key.1, "fiber connect");

        match rx.await {
            Ok(Ok(())) => Ok(Fiber::new(Arc::clone(self), key)),
            Ok(Err(error)) => {
                self.tables.lock().expect("demux lock").fibers.remove(&key);
                Err(error)
            }
            Err(_) => Err(DemuxError::Aborted),
        }
    }

    fn listen(self: &Arc<Self>, port: u32) -> Result<FiberListener, DemuxError> {
        let mut tables = self.tables.lock().expect("demux lock");
        if tables.closed {
            return Err(tables.close_reason.clone().unwrap_or(DemuxError::AlreadyClosed));
        }
        if tables.port_in_use(port) {
            return Err(DemuxError::PortInUse(port));
        }
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        tables.acceptors.insert(port, tx);
        tracing::debug!(port, "fiber listen");
        Ok(FiberListener { shared: Arc::clone(self), port, rx })
    }

    fn bind_dgram(self: &Arc<Self>, port: u32) -> Result<DgramSocket, DemuxError> {
        let mut tables = self.tables.lock().expect("demux lock");
        if tables.closed {
            return Err(tables.close_reason.clone().unwrap_or(DemuxError::AlreadyClosed));
        }
        if tables.port_in_use(port) {
            return Err(DemuxError::PortInUse(port));
        }
        let (tx, rx) = mpsc::channel(DGRAM_BACKLOG);
        tables.dgrams.insert(port, tx);
        Ok(DgramSocket { shared: Arc::clone(self), port, rx })
    }

    pub(crate) fn send_dgram(
        &self,
        src_port: u32,
        dst_port: u32,
        payload: Bytes,
    ) -> Result<(), DemuxError> {
        if payload.len() > self.mtu {
            return Err(DemuxError::ProtocolViolation(format!(
                "datagram of {} bytes exceeds mtu {}",
                payload.len(),
                self.mtu
            )));
        }
        if self.tables.lock().expect("demux lock").closed {
            return Err(DemuxError::AlreadyClosed);
        }
        let frame = FiberFrame::new(
            FrameHeader::new(FrameType::Dgram, src_port, dst_port),
            payload,
        );
        let mut outbound = self.outbound.lock().expect("demux lock");
        outbound.push_dgram((src_port, dst_port), frame);
        drop(outbound);
        self.outbound_ready.notify_one();
        Ok(())
    }

    pub(crate) async fn read_fiber(
        self: &Arc<Self>,
        key: FiberKey,
        buf: &mut [u8],
    ) -> Result<usize, DemuxError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let notify = {
                let mut tables = self.tables.lock().expect("demux lock");
                let Some(entry) = tables.fibers.get_mut(&key) else {
                    return Err(tables.close_reason.clone().unwrap_or(DemuxError::AlreadyClosed));
                };

                if entry.recv_len > 0 {
                    let mut copied = 0;
                    while copied < buf.len() {
                        let Some(mut front) = entry.recv.pop_front() else { break };
                        let take = front.len().min(buf.len() - copied);
                        buf[copied..copied + take].copy_from_slice(&front[..take]);
                        front.advance(take);
                        if !front.is_empty() {
                            entry.recv.push_front(front);
                        }
                        copied += take;
                    }
                    entry.recv_len -= copied;
                    drop(tables);

                    // Return credits for exactly what was consumed.
                    #[allow(clippy::cast_possible_truncation)]
                    self.enqueue_ack(key, copied as u32);
                    return Ok(copied);
                }

                if let Some(error) = &entry.error {
                    return Err(error.clone());
                }
                if entry.peer_fin {
                    return Ok(0);
                }
                Arc::clone(&entry.recv_notify)
            };
            notify.notified().await;
        }
    }

    pub(crate) async fn write_fiber(
        self: &Arc<Self>,
        key: FiberKey,
        buf: &[u8],
    ) -> Result<(), DemuxError> {
        let mut offset = 0;
        while offset < buf.len() {
            let notify = {
                let mut tables = self.tables.lock().expect("demux lock");
                let Some(entry) = tables.fibers.get_mut(&key) else {
                    return Err(tables.close_reason.clone().unwrap_or(DemuxError::AlreadyClosed));
                };
                if let Some(error) = &entry.error {
                    return Err(error.clone());
                }
                if entry.local_fin {
                    return Err(DemuxError::AlreadyClosed);
                }

                #[allow(clippy::cast_possible_truncation)]
                let remaining = (buf.len() - offset).min(u32::MAX as usize) as u32;
                #[allow(clippy::cast_possible_truncation)]
                let take = entry.send_credits.min(remaining).min(self.mtu as u32);
                if take > 0 {
                    entry.send_credits -= take;
                    drop(tables);

                    let chunk = Bytes::copy_from_slice(&buf[offset..offset + take as usize]);
                    let frame =
                        FiberFrame::new(FrameHeader::new(FrameType::StreamData, key.0, key.1), chunk);
                    {
                        let mut outbound = self.outbound.lock().expect("demux lock");
                        outbound.push_data(key, frame);
                    }
                    self.outbound_ready.notify_one();
                    offset += take as usize;
                    continue;
                }
                Arc::clone(&entry.send_notify)
            };
            notify.notified().await;
        }
        Ok(())
    }

    pub(crate) fn shutdown_fiber(self: &Arc<Self>, key: FiberKey) {
        let closed = {
            let mut tables = self.tables.lock().expect("demux lock");
            let Some(entry) = tables.fibers.get_mut(&key) else { return };
            if entry.local_fin || entry.error.is_some() {
                return;
            }
            entry.local_fin = true;
            entry.update_state();
            entry.state == FiberState::Closed
        };

        self.enqueue_fin(key);
        if closed {
            self.schedule_linger(key);
        }
    }

    /// Both user halves dropped: half-close our direction and let the
    /// normal close path reclaim the entry.
    pub(crate) fn release_fiber(self: &Arc<Self>, key: FiberKey) {
        let (send_fin, closed) = {
            let mut tables = self.tables.lock().expect("demux lock");
            let Some(entry) = tables.fibers.get_mut(&key) else { return };
            entry.released = true;
            if entry.error.is_some() {
                tables.fibers.remove(&key);
                return;
            }
            let send_fin = !entry.local_fin;
            entry.local_fin = true;
            entry.update_state();
            (send_fin, entry.state == FiberState::Closed)
        };

        if send_fin {
            self.enqueue_fin(key);
        }
        if closed {
            self.schedule_linger(key);
        }
    }

    pub(crate) fn remove_acceptor(&self, port: u32) {
        self.tables.lock().expect("demux lock").acceptors.remove(&port);
    }

    pub(crate) fn remove_dgram(&self, port: u32) {
        self.tables.lock().expect("demux lock").dgrams.remove(&port);
    }

    fn schedule_linger(self: &Arc<Self>, key: FiberKey) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(CLOSE_LINGER).await;
            let mut tables = shared.tables.lock().expect("demux lock");
            let remove = tables
                .fibers
                .get(&key)
                .is_some_and(|entry| entry.state == FiberState::Closed);
            if remove {
                tables.fibers.remove(&key);
                drop(tables);
                shared.outbound.lock().expect("demux lock").drop_fiber(key);
            }
        });
    }

    fn enqueue_control(&self, frame: FiberFrame) {
        {
            let mut outbound = self.outbound.lock().expect("demux lock");
            outbound.push_control(frame);
        }
        self.outbound_ready.notify_one();
    }

    /// FIN must not overtake data still queued for the fiber, so it rides
    /// the fiber's data queue instead of the control queue.
    fn enqueue_fin(&self, key: FiberKey) {
        let frame = FiberFrame::control(FrameType::StreamFin, key.0, key.1);
        {
            let mut outbound = self.outbound.lock().expect("demux lock");
            outbound.push_data(key, frame);
        }
        self.outbound_ready.notify_one();
    }

    fn enqueue_ack(&self, key: FiberKey, credits: u32) {
        if credits == 0 {
            return;
        }
        let frame = FiberFrame::new(
            FrameHeader::new(FrameType::StreamAck, key.0, key.1),
            Bytes::copy_from_slice(&credits.to_le_bytes()),
        );
        {
            let mut outbound = self.outbound.lock().expect("demux lock");
            outbound.push_ack(frame);
        }
        self.outbound_ready.notify_one();
    }

    pub(crate) fn teardown(&self, reason: DemuxError) {
        {
            let mut tables = self.tables.lock().expect("demux lock");
            if tables.closed {
                return;
            }
            tables.closed = true;
            tables.close_reason = Some(reason.clone());
            for entry in tables.fibers.values_mut() {
                entry.fail(reason.clone());
            }
            tables.fibers.clear();
            tables.acceptors.clear();
            tables.dgrams.clear();
        }
        self.outbound.lock().expect("demux lock").closed = true;
        self.outbound_ready.notify_one();
        let _ = self.closed_tx.send(Some(reason.clone()));
        tracing::debug!(%reason, "demux teardown");
    }
}
