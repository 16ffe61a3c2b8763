//! Length-prefixed frames over a non-blocking mio TCP stream.
//!
//! ## Wire Format
//!
//! `[kind:1][len:4][payload:len]`, length little-endian.
//!
//! Writes are queued and drained opportunistically; reads pull everything the
//! socket has and hand back complete frames. Neither side ever blocks, so a
//! peer that is busy inside a handler cannot stall this rank.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};

use mio::event::Source;
use mio::net::TcpStream as MioTcpStream;
use mio::{Interest, Registry, Token};

/// Frame header size.
pub const FRAME_HEADER_LEN: usize = 5;

const READ_CHUNK: usize = 64 * 1024;

/// A complete frame read from the stream.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub payload: Vec<u8>,
}

/// A non-blocking TCP stream carrying length-prefixed frames.
pub struct FramedStream {
    inner: MioTcpStream,
    outgoing: VecDeque<Vec<u8>>,
    /// Bytes of `outgoing.front()` already written.
    written: usize,
    incoming: Vec<u8>,
    /// Peer closed its write side.
    closed: bool,
}

impl FramedStream {
    /// Wraps a connected std stream, switching it to non-blocking mode.
    ///
    /// # Errors
    /// Returns an error if socket options cannot be applied.
    pub fn from_std(stream: std::net::TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        rustix::net::sockopt::set_tcp_nodelay(stream.as_fd(), true)?;
        Ok(Self {
            inner: MioTcpStream::from_std(stream),
            outgoing: VecDeque::new(),
            written: 0,
            incoming: Vec::new(),
            closed: false,
        })
    }

    /// Returns true once the peer has closed the connection.
    #[inline]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns true if queued bytes are waiting for the socket.
    #[inline]
    pub fn has_pending_writes(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Queues a frame. Call [`Self::flush_writes`] to push it to the socket.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the payload exceeds the 32-bit length field.
    pub fn queue_frame(&mut self, kind: u8, payload: &[u8]) -> io::Result<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "frame too large"))?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.push(kind);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(payload);
        self.outgoing.push_back(frame);
        Ok(())
    }

    /// Writes queued frames until the socket would block.
    ///
    /// Returns `true` when the queue is empty.
    ///
    /// # Errors
    /// Returns an error on I/O failure other than `WouldBlock`.
    pub fn flush_writes(&mut self) -> io::Result<bool> {
        while let Some(front) = self.outgoing.front() {
            match self.inner.write(&front[self.written..]) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.written += n;
                    if self.written == front.len() {
                        self.outgoing.pop_front();
                        self.written = 0;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Reads everything currently available on the socket.
    ///
    /// # Errors
    /// Returns an error on I/O failure other than `WouldBlock`.
    pub fn fill(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        while !self.closed {
            match self.inner.read(&mut chunk) {
                Ok(0) => self.closed = true,
                Ok(n) => self.incoming.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::ConnectionReset => self.closed = true,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Pops the next complete frame out of the read buffer.
    #[must_use]
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.incoming.len() < FRAME_HEADER_LEN {
            return None;
        }
        let kind = self.incoming[0];
        let len = u32::from_le_bytes([
            self.incoming[1],
            self.incoming[2],
            self.incoming[3],
            self.incoming[4],
        ]) as usize;
        if self.incoming.len() < FRAME_HEADER_LEN + len {
            return None;
        }
        let payload = self.incoming[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
        self.incoming.drain(..FRAME_HEADER_LEN + len);
        Some(Frame { kind, payload })
    }

    /// Bytes of a partial frame left over after the peer closed.
    #[must_use]
    pub fn leftover(&self) -> usize {
        self.incoming.len()
    }
}

impl AsFd for FramedStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Source for FramedStream {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}
