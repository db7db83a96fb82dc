//! Read-ahead pump for TLS streams.
//!
//! TLS records are large and expensive to decrypt; an application issuing
//! small reads would otherwise round-trip into the TLS machinery per call.
//! The pump decouples the two: a background **puller** task owns exclusive
//! read access to the decrypted stream, pre-reads it in 50 KiB chunks into
//! a byte queue, and application reads are served from that queue.
//!
//! # Invariants
//!
//! - At most one outstanding underlying read (the puller's current one).
//! - Pulling is suspended once the queue reaches the high watermark
//!   (16 MiB) and resumes when it drops below the low watermark (1 MiB)
//!   with a user read pending; the queue therefore never exceeds the high
//!   watermark by more than one chunk.
//! - Once a terminal error is stored, the queue is dropped and every
//!   subsequent read completes with that error and 0 bytes. A clean EOF
//!   drains buffered bytes first.
//! - [`PumpedStream::cancel`] clears the queue, completes pending reads
//!   with an aborted error, and stops the puller.
//!
//! Writes bypass the pump entirely and go to the write half; the split
//! halves serialize access to the TLS state, so no two handlers touch it
//! concurrently.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Size of one puller read.
pub const PUMP_CHUNK: usize = 50 * 1024;
/// Queue level below which pulling resumes.
pub const PUMP_LOW_WATERMARK: usize = 1024 * 1024;
/// Queue level at which pulling suspends.
pub const PUMP_HIGH_WATERMARK: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
enum Terminal {
    /// Clean end of stream (close-notify)
    Eof,
    /// I/O or TLS failure
    Error(io::ErrorKind, String),
    /// Local cancel
    Aborted,
}

#[derive(Default)]
struct PumpState {
    queue: VecDeque<Bytes>,
    queued: usize,
    /// Read operations waiting for bytes, FIFO; only the head is woken
    /// when data arrives.
    readers: VecDeque<Waker>,
    terminal: Option<Terminal>,
    paused: bool,
}

struct PumpShared {
    state: Mutex<PumpState>,
    puller_wake: Notify,
}

impl PumpShared {
    fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut state = self.state.lock().expect("pump lock");

        if state.queued > 0 {
            while buf.remaining() > 0 {
                let Some(mut front) = state.queue.pop_front() else { break };
                let take = front.len().min(buf.remaining());
                buf.put_slice(&front.split_to(take));
                state.queued -= take;
                if !front.is_empty() {
                    state.queue.push_front(front);
                }
            }

            // This read counts as the pending read the resume rule wants.
            if state.paused && state.queued < PUMP_LOW_WATERMARK {
                state.paused = false;
                self.puller_wake.notify_one();
            }

            // More bytes left and another read already queued behind us.
            if state.queued > 0 {
                if let Some(next) = state.readers.pop_front() {
                    next.wake();
                }
            }

            return Poll::Ready(Ok(()));
        }

        match &state.terminal {
            Some(Terminal::Eof) => Poll::Ready(Ok(())),
            Some(Terminal::Error(kind, message)) => {
                Poll::Ready(Err(io::Error::new(*kind, message.clone())))
            }
            Some(Terminal::Aborted) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "read cancelled",
            ))),
            None => {
                if !state.readers.iter().any(|w| w.will_wake(cx.waker())) {
                    state.readers.push_back(cx.waker().clone());
                }
                // A pending read allows a paused puller to resume early.
                if state.paused && state.queued < PUMP_LOW_WATERMARK {
                    state.paused = false;
                    self.puller_wake.notify_one();
                }
                Poll::Pending
            }
        }
    }

    fn push(&self, chunk: Bytes) {
        let mut state = self.state.lock().expect("pump lock");
        state.queued += chunk.len();
        state.queue.push_back(chunk);
        if let Some(head) = state.readers.pop_front() {
            head.wake();
        }
    }

    fn finish(&self, terminal: Terminal) {
        let mut state = self.state.lock().expect("pump lock");
        if state.terminal.is_none() {
            if !matches!(terminal, Terminal::Eof) {
                state.queue.clear();
                state.queued = 0;
            }
            state.terminal = Some(terminal);
        }
        for waker in state.readers.drain(..) {
            waker.wake();
        }
    }

    /// Whether the puller should pause, updating the flag.
    fn should_pause(&self) -> bool {
        let mut state = self.state.lock().expect("pump lock");
        if state.terminal.is_some() {
            return false; // let the puller observe and exit
        }
        if state.queued >= PUMP_HIGH_WATERMARK {
            state.paused = true;
        }
        state.paused
    }

    fn is_finished(&self) -> bool {
        self.state.lock().expect("pump lock").terminal.is_some()
    }
}

/// A stream whose read side is served by a read-ahead pump.
///
/// Created by the TLS layer around the split halves of a TLS stream;
/// generic so tests can drive it with in-memory pipes.
pub struct PumpedStream<W> {
    shared: Arc<PumpShared>,
    write: W,
    puller: JoinHandle<()>,
}

impl<W> PumpedStream<W> {
    /// Wrap split stream halves, spawning the puller task.
    pub fn new<R>(read: R, write: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let shared = Arc::new(PumpShared {
            state: Mutex::new(PumpState::default()),
            puller_wake: Notify::new(),
        });

        let puller = tokio::spawn(run_puller(read, Arc::clone(&shared)));

        Self { shared, write, puller }
    }

    /// Cancel the pump: drop buffered bytes, complete pending reads with an
    /// aborted error, stop the puller. Idempotent.
    pub fn cancel(&self) {
        self.puller.abort();
        self.shared.finish(Terminal::Aborted);
    }

    /// Bytes currently buffered (test and introspection hook).
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().expect("pump lock").queued
    }
}

async fn run_puller<R>(mut read: R, shared: Arc<PumpShared>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    loop {
        while shared.should_pause() {
            shared.puller_wake.notified().await;
        }
        if shared.is_finished() {
            return;
        }

        let mut chunk = BytesMut::with_capacity(PUMP_CHUNK);
        match read.read_buf(&mut chunk).await {
            Ok(0) => {
                shared.finish(Terminal::Eof);
                return;
            }
            Ok(_) => shared.push(chunk.freeze()),
            Err(err) => {
                shared.finish(Terminal::Error(err.kind(), err.to_string()));
                return;
            }
        }
    }
}

impl<W> Drop for PumpedStream<W> {
    fn drop(&mut self) {
        self.puller.abort();
    }
}

impl<W: Unpin> AsyncRead for PumpedStream<W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.shared.poll_read(cx, buf)
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for PumpedStream<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.write).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.write).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.write).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn small_reads_are_served_from_the_buffer() {
        let (mut far, near) = duplex(512 * 1024);
        let (read, write) = tokio::io::split(near);
        let mut pumped = PumpedStream::new(read, write);

        // One large record-sized burst from the peer.
        let record = vec![0xABu8; 200 * 1024];
        far.write_all(&record).await.expect("write");

        let mut total = 0usize;
        let mut byte = [0u8; 1];
        while total < record.len() {
            let n = pumped.read(&mut byte).await.expect("read");
            assert_eq!(n, 1, "every 1-byte call returns exactly 1 byte");
            assert_eq!(byte[0], 0xAB);
            total += n;
        }
        assert_eq!(total, 204_800);
    }

    #[tokio::test]
    async fn eof_drains_buffer_before_reporting() {
        let (mut far, near) = duplex(64 * 1024);
        let (read, write) = tokio::io::split(near);
        let mut pumped = PumpedStream::new(read, write);

        far.write_all(b"last words").await.expect("write");
        drop(far);

        let mut buf = vec![0u8; 32];
        let n = pumped.read(&mut buf).await.expect("read");
        assert_eq!(&buf[..n], b"last words");

        let n = pumped.read(&mut buf).await.expect("eof");
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn cancel_completes_reads_with_abort() {
        let (_far, near) = duplex(1024);
        let (read, write) = tokio::io::split(near);
        let pumped = Arc::new(PumpedStream::new(read, write));

        let reader = Arc::clone(&pumped);
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            // Pin through a mutable local: Arc gives shared access, so use
            // the shared poll path directly.
            std::future::poll_fn(|cx| {
                let mut read_buf = ReadBuf::new(&mut buf);
                reader.shared.poll_read(cx, &mut read_buf).map(|r| r.map(|()| read_buf.filled().len()))
            })
            .await
        });

        tokio::task::yield_now().await;
        pumped.cancel();

        let err = pending.await.expect("join").expect_err("aborted");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);

        // Subsequent reads keep failing the same way.
        let err = std::future::poll_fn(|cx| {
            let mut buf = [0u8; 8];
            let mut read_buf = ReadBuf::new(&mut buf);
            pumped.shared.poll_read(cx, &mut read_buf).map(|r| r.map(|()| ()))
        })
        .await
        .expect_err("still aborted");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn writes_bypass_the_pump() {
        let (mut far, near) = duplex(1024);
        let (read, write) = tokio::io::split(near);
        let mut pumped = PumpedStream::new(read, write);

        pumped.write_all(b"outbound").await.expect("write");
        pumped.flush().await.expect("flush");

        let mut buf = [0u8; 8];
        far.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"outbound");
        assert_eq!(pumped.buffered(), 0);
    }

    /// The puller never reads more than one chunk past the high watermark.
    /// Exercised with shrunk watermarks via the state machinery directly:
    /// fill the queue beyond high, verify `should_pause`, drain below low
    /// with a pending read, verify resume.
    #[tokio::test]
    async fn watermarks_pause_and_resume_pulling() {
        let shared = Arc::new(PumpShared {
            state: Mutex::new(PumpState::default()),
            puller_wake: Notify::new(),
        });

        // Fill to the high watermark.
        let chunk = Bytes::from(vec![0u8; PUMP_CHUNK]);
        while shared.state.lock().expect("lock").queued < PUMP_HIGH_WATERMARK {
            shared.push(chunk.clone());
        }
        assert!(shared.should_pause(), "puller pauses at high watermark");

        // Drain until just below the low watermark.
        let mut scratch = vec![0u8; PUMP_CHUNK];
        while shared.state.lock().expect("lock").queued >= PUMP_LOW_WATERMARK {
            let n = std::future::poll_fn(|cx| {
                let mut read_buf = ReadBuf::new(&mut scratch);
                shared.poll_read(cx, &mut read_buf).map(|r| r.map(|()| read_buf.filled().len()))
            })
            .await
            .expect("read");
            assert!(n > 0);
        }

        // The drain itself resumes the puller.
        assert!(!shared.state.lock().expect("lock").paused);
        assert!(!shared.should_pause());
    }
}
