//! Framed byte-stream connections over loopback TCP.
//!
//! Each message travels as a 4-byte big-endian length followed by the
//! payload. Reads are buffered, so a frame split across segments or several
//! frames coalesced into one segment are both reassembled correctly, and a
//! receive that times out keeps whatever partial frame it already buffered.

use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Instant};
use tracing::{debug, trace};

pub const FRAME_HEADER_LEN: usize = 4;
const READ_BUFFER_SIZE: usize = 4096;
// Stand-in deadline for timeouts too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection is not active")]
    Inactive,
    #[error("operation timed out")]
    Timeout,
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-connection limits fixed at accept/connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkOptions {
    pub max_frame_size: usize,
    pub send_timeout: Duration,
}

/// The instant `timeout` from now. Timeouts that overflow the clock, such as
/// `Duration::MAX`, mean "wait indefinitely".
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Prefixes `payload` with its length.
pub fn encode_frame(payload: &[u8], max_frame_size: usize) -> Result<Vec<u8>, TransportError> {
    if payload.len() > max_frame_size || u32::try_from(payload.len()).is_err() {
        return Err(TransportError::FrameTooLarge {
            len: payload.len(),
            max: max_frame_size,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

#[derive(Debug)]
pub struct ListenHandle {
    listener: TcpListener,
    local_addr: SocketAddr,
    options: LinkOptions,
}

impl ListenHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Binds a listening socket. Must be called from within a tokio runtime.
pub fn server_setup(addr: SocketAddr, backlog: u32, options: LinkOptions) -> Result<ListenHandle, TransportError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(backlog)?;
    let local_addr = listener.local_addr()?;

    debug!(%local_addr, backlog, "listener bound");

    Ok(ListenHandle {
        listener,
        local_addr,
        options,
    })
}

/// Waits up to `timeout` for one inbound connection. Failures only concern
/// this attempt; the listener stays usable.
pub async fn server_accept(handle: &ListenHandle, timeout: Duration) -> Result<Connection, TransportError> {
    let (stream, peer) = time::timeout(timeout, handle.listener.accept())
        .await
        .map_err(|_| TransportError::Timeout)??;

    trace!(%peer, "accepted connection");
    Ok(Connection::from_stream(stream, peer, handle.options))
}

pub async fn client_connect(
    addr: SocketAddr,
    timeout: Duration,
    options: LinkOptions,
) -> Result<Connection, TransportError> {
    let stream = time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)??;

    Ok(Connection::from_stream(stream, addr, options))
}

/// Both directions of one framed TCP stream.
#[derive(Debug)]
pub struct Connection {
    reader: FrameReader,
    writer: FrameWriter,
    peer: SocketAddr,
}

impl Connection {
    pub fn from_stream(stream: TcpStream, peer: SocketAddr, options: LinkOptions) -> Self {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        Self {
            reader: FrameReader {
                half: read_half,
                buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
                max_frame_size: options.max_frame_size,
                active: true,
            },
            writer: FrameWriter {
                half: write_half,
                max_frame_size: options.max_frame_size,
                send_timeout: options.send_timeout,
                active: true,
            },
            peer,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_active(&self) -> bool {
        self.reader.active && self.writer.active
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.writer.send(payload).await
    }

    pub async fn recv(&mut self, timeout: Duration) -> Result<Option<Bytes>, TransportError> {
        self.reader.recv(timeout).await
    }

    /// Closes both directions. Closing an inactive connection is a no-op.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.reader.active = false;
        self.writer.close().await
    }

    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

/// Receiving side of a connection.
#[derive(Debug)]
pub struct FrameReader {
    half: OwnedReadHalf,
    buffer: BytesMut,
    max_frame_size: usize,
    active: bool,
}

impl FrameReader {
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Next complete frame, `Ok(None)` on orderly end of stream.
    ///
    /// An oversized length prefix leaves the stream unrecoverable, so it
    /// deactivates the reader as well as failing the call.
    pub async fn recv(&mut self, timeout: Duration) -> Result<Option<Bytes>, TransportError> {
        if !self.active {
            return Err(TransportError::Inactive);
        }

        let deadline = deadline_after(timeout);
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(Some(frame));
            }

            match time::timeout_at(deadline, self.half.read_buf(&mut self.buffer)).await {
                Err(_) => return Err(TransportError::Timeout),
                Ok(Ok(0)) => {
                    self.active = false;
                    if !self.buffer.is_empty() {
                        debug!(pending = self.buffer.len(), "stream ended inside a frame");
                    }
                    return Ok(None);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    self.active = false;
                    return Err(e.into());
                }
            }
        }
    }

    fn take_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let header = [self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]];
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame_size {
            self.active = false;
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }

        let total = FRAME_HEADER_LEN + len;
        if self.buffer.len() < total {
            self.buffer.reserve(total - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(FRAME_HEADER_LEN);
        Ok(Some(self.buffer.split_to(len).freeze()))
    }
}

/// Sending side of a connection.
#[derive(Debug)]
pub struct FrameWriter {
    half: OwnedWriteHalf,
    max_frame_size: usize,
    send_timeout: Duration,
    active: bool,
}

impl FrameWriter {
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Writes one frame. A timed-out or failed write may have left a partial
    /// frame on the wire, so either deactivates the writer.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if !self.active {
            return Err(TransportError::Inactive);
        }

        let frame = encode_frame(payload, self.max_frame_size)?;
        match time::timeout(self.send_timeout, self.half.write_all(&frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.active = false;
                Err(e.into())
            }
            Err(_) => {
                self.active = false;
                Err(TransportError::Timeout)
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        self.half.shutdown().await?;
        Ok(())
    }
}
