//! Framed connection: byte-level framing and socket mechanics.
//!
//! A [`FramedConnection`] owns one socket and is oblivious to protocol
//! semantics. It accumulates inbound bytes until the current terminator
//! matches, hands each framed chunk up to the node, and applies the
//! returned action (queue bytes, re-terminate, close after drain).

use crate::automaton::Terminator;
use crate::node::registry::ConnectionId;
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::Interest;
use std::io::{self, Read, Write};
use std::time::Instant;

/// Connection lifecycle phase, driven by the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Outbound socket waiting for the non-blocking connect to complete.
    Connecting,
    /// Established; framing and dispatch are active.
    Open,
    /// The automaton returned `done` without `close`. The identity is no
    /// longer dispatchable, so inbound bytes are discarded until the peer
    /// closes or a pending close drains.
    Finished,
    /// Shutdown requested; draining the write queue.
    Closing,
    /// Fully torn down; the node reclaims the entry.
    Closed,
}

/// Accumulation buffer plus the current terminator.
///
/// Separated from the socket so the framing discipline is testable without
/// I/O: append bytes, pull frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
    terminator: Option<Terminator>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        FrameBuffer::default()
    }

    pub fn set_terminator(&mut self, terminator: Terminator) {
        self.terminator = Some(terminator);
    }

    pub fn terminator(&self) -> Option<&Terminator> {
        self.terminator.as_ref()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pull the next complete frame, terminator excluded, consuming it and
    /// the terminator from the buffer. Returns `None` until a match exists;
    /// with no terminator configured, nothing is ever delivered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        match self.terminator.as_ref()? {
            Terminator::Bytes(seq) => {
                debug_assert!(!seq.is_empty());
                let at = find(&self.buf, seq)?;
                let chunk = self.buf[..at].to_vec();
                self.buf.advance(at + seq.len());
                Some(chunk)
            }
            Terminator::Length(n) => {
                let n = *n;
                if self.buf.len() < n {
                    return None;
                }
                let chunk = self.buf[..n].to_vec();
                self.buf.advance(n);
                Some(chunk)
            }
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// First occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| &haystack[i..i + needle.len()] == needle)
}

/// Result of draining readable data from the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// More data may arrive later.
    Continue,
    /// The peer closed its write side.
    Eof,
}

pub struct FramedConnection {
    id: ConnectionId,
    stream: TcpStream,
    phase: Phase,
    frames: FrameBuffer,
    outbuf: BytesMut,
    close_after_drain: bool,
    last_activity: Instant,
}

impl FramedConnection {
    pub fn inbound(id: ConnectionId, stream: TcpStream) -> Self {
        FramedConnection::new(id, stream, Phase::Open)
    }

    pub fn outbound(id: ConnectionId, stream: TcpStream) -> Self {
        FramedConnection::new(id, stream, Phase::Connecting)
    }

    fn new(id: ConnectionId, stream: TcpStream, phase: Phase) -> Self {
        FramedConnection {
            id,
            stream,
            phase,
            frames: FrameBuffer::new(),
            outbuf: BytesMut::new(),
            close_after_drain: false,
            last_activity: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn set_terminator(&mut self, terminator: Terminator) {
        self.frames.set_terminator(terminator);
    }

    /// Readiness interests for the current phase and queue state.
    pub fn interests(&self) -> Interest {
        match self.phase {
            Phase::Connecting => Interest::READABLE | Interest::WRITABLE,
            Phase::Open | Phase::Finished => {
                if self.outbuf.is_empty() {
                    Interest::READABLE
                } else {
                    Interest::READABLE | Interest::WRITABLE
                }
            }
            Phase::Closing | Phase::Closed => Interest::WRITABLE,
        }
    }

    /// Check whether a non-blocking connect has completed. On success the
    /// phase moves to `Open`; a pending connect leaves it unchanged.
    pub fn try_finish_connect(&mut self) -> io::Result<bool> {
        debug_assert_eq!(self.phase, Phase::Connecting);
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.phase = Phase::Open;
                self.touch();
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drain readable data into the accumulation buffer.
    ///
    /// `max_buffer` bounds unterminated input: exceeding it is reported as
    /// an error and the node closes the connection through the transport
    /// error path.
    pub fn fill(&mut self, max_buffer: usize) -> io::Result<ReadOutcome> {
        let mut scratch = [0u8; 4096];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => {
                    self.touch();
                    if self.phase == Phase::Finished {
                        // Identity already finalized; nothing to dispatch to.
                        continue;
                    }
                    self.frames.extend(&scratch[..n]);
                    if self.frames.len() > max_buffer {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("unterminated input exceeds {max_buffer} bytes"),
                        ));
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::Continue)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Next framed chunk, if the connection is still dispatchable.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.phase != Phase::Open {
            return None;
        }
        self.frames.next_frame()
    }

    /// Queue outbound bytes. Transmission happens from [`Self::flush`] on
    /// writable readiness, never as a blocking write.
    pub fn queue(&mut self, data: &[u8]) {
        self.outbuf.extend_from_slice(data);
    }

    pub fn pending_write(&self) -> usize {
        self.outbuf.len()
    }

    /// Request a graceful shutdown once the write queue drains.
    pub fn request_close(&mut self) {
        self.close_after_drain = true;
        if self.phase != Phase::Connecting {
            self.phase = Phase::Closing;
        }
    }

    /// Mark the automaton's life as over. A pending close still wins.
    pub fn finish(&mut self) {
        if self.phase == Phase::Open {
            self.phase = Phase::Finished;
        }
    }

    /// Write as much of the queue as the socket accepts. Moves the phase to
    /// `Closed` when a requested close has fully drained.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.phase == Phase::Connecting {
            return Ok(());
        }
        while !self.outbuf.is_empty() {
            match self.stream.write(&self.outbuf) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"))
                }
                Ok(n) => {
                    self.touch();
                    self.outbuf.advance(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if self.close_after_drain {
            self.phase = Phase::Closed;
        }
        Ok(())
    }
}
