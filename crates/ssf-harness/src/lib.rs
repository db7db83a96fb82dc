//! Deterministic simulation harness.
//!
//! Runs the funnel's wire protocols over [turmoil]'s simulated TCP:
//! virtual time, deterministic delivery, fault injection. The protocol
//! logic under test lives in `ssf-proto`/`ssf-core`; the simulation swaps
//! only the byte transport underneath it, which provides the same
//! reliable-ordered-stream guarantees as the production stack.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use turmoil::net::{TcpListener, TcpStream};

use ssf_proto::admin::AdminHeader;
use ssf_proto::{AdminMessage, FiberFrame, FrameHeader};

/// Simulation transport over turmoil's deterministic TCP.
pub struct SimTransport {
    listener: TcpListener,
}

impl SimTransport {
    /// Bind inside the current simulated host.
    ///
    /// # Errors
    ///
    /// Propagates turmoil bind failures (address in use, bad address).
    pub async fn bind(address: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener })
    }

    /// Accept one simulated connection.
    ///
    /// # Errors
    ///
    /// Propagates turmoil accept failures.
    pub async fn accept(&self) -> io::Result<TcpStream> {
        let (stream, _peer) = self.listener.accept().await?;
        Ok(stream)
    }

    /// Connect to a simulated host (e.g. `"server:8011"`).
    ///
    /// # Errors
    ///
    /// Propagates turmoil connect failures (host down, partitioned).
    pub async fn connect_to(address: &str) -> io::Result<TcpStream> {
        TcpStream::connect(address).await
    }
}

fn to_io(err: ssf_proto::ProtocolError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Write one fiber frame to a stream.
///
/// # Errors
///
/// I/O failures from the simulated transport.
pub async fn write_frame<W>(writer: &mut W, frame: &FiberFrame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(frame.encoded_len());
    frame.encode(&mut buf);
    writer.write_all(&buf).await
}

/// Read one fiber frame from a stream.
///
/// # Errors
///
/// I/O failures, or `InvalidData` wrapping the protocol error for
/// malformed or corrupted frames.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<FiberFrame>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_buf).await?;
    let header = *FrameHeader::from_bytes(&header_buf).map_err(to_io)?;

    let mut payload = vec![0u8; header.payload_len() as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await?;
    }
    Ok(FiberFrame { header, payload: Bytes::from(payload) })
}

/// Write one admin message to a stream.
///
/// # Errors
///
/// I/O failures, or `InvalidData` for oversized payloads.
pub async fn write_admin<W>(writer: &mut W, message: &AdminMessage) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(AdminHeader::SIZE + message.payload.len());
    message.encode(&mut buf).map_err(to_io)?;
    writer.write_all(&buf).await
}

/// Read one admin message from a stream.
///
/// # Errors
///
/// I/O failures, or `InvalidData` for malformed headers.
pub async fn read_admin<R>(reader: &mut R) -> io::Result<AdminMessage>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; AdminHeader::SIZE];
    reader.read_exact(&mut header_buf).await?;
    let header = *AdminHeader::from_bytes(&header_buf).map_err(to_io)?;

    let mut payload = vec![0u8; header.payload_len() as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await?;
    }
    Ok(AdminMessage {
        serial: header.serial(),
        command_id: header.command_id(),
        payload: Bytes::from(payload),
    })
}
